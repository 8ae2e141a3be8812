//! The session: identity, state machine, the network worker, and the
//! application-facing facade.
//!
//! Every session runs exactly one network worker task. The worker owns the
//! [`MessageQueue`], the [`SessionPipeline`], and the transport; nothing else
//! touches them. Application threads reach the worker only by sending a
//! [`NetMsg`] over its channel, so the worker's state needs no locks at all.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tether_core::{
    BoxTransport, FrameCodec, Guid, ProtocolCodec, ResultCode, RpcResponse, SessionError,
    SessionId, TransportError,
};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::event::{CommitItem, SessionEvents};
use crate::handlers::ReliabilityHandler;
use crate::handshake::{ClientHandshakeHandler, ServerHandshakeHandler, TokenValidator};
use crate::message::{UncommittedMessage, UnsentMessage};
use crate::pipeline::{PipelineAction, PipelineCtx, SessionHandler, SessionPipeline, WriteItem};
use crate::promise::{RpcCompletion, RpcPromiseInfo};
use crate::queue::MessageQueue;
use crate::registry::SessionRegistry;
use crate::sender::Sender;
use crate::timer::TimerSystem;

/// Session identity. Assigned by the caller at build time, immutable after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub local_guid: Guid,
    pub remote_guid: Guid,
}

/// Lifecycle phase. Transitions are monotonic: BOUND -> CONNECTED -> CLOSED,
/// and CLOSED is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionPhase {
    Bound = 0,
    Connected = 1,
    Closed = 2,
}

/// Shared, lock-free view of a session's phase.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    phase: Arc<AtomicU8>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> SessionPhase {
        match self.phase.load(Ordering::Acquire) {
            0 => SessionPhase::Bound,
            1 => SessionPhase::Connected,
            _ => SessionPhase::Closed,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase() == SessionPhase::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == SessionPhase::Closed
    }

    /// BOUND -> CONNECTED, exactly once. Returns whether this call won the
    /// transition.
    pub fn try_active(&self) -> bool {
        self.phase
            .compare_exchange(
                SessionPhase::Bound as u8,
                SessionPhase::Connected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Transition to CLOSED. Returns the prior phase for the single caller
    /// that wins the race; everyone else gets `None` and must not run
    /// teardown.
    pub fn try_close(&self) -> Option<SessionPhase> {
        let prior = self
            .phase
            .swap(SessionPhase::Closed as u8, Ordering::AcqRel);
        match prior {
            0 => Some(SessionPhase::Bound),
            1 => Some(SessionPhase::Connected),
            _ => None,
        }
    }
}

/// One unit of outgoing work handed to the network worker.
#[derive(Debug)]
pub(crate) enum SubmitItem {
    OneWay {
        body: Bytes,
    },
    Rpc {
        body: Bytes,
        sync: bool,
        completion: RpcCompletion,
        timeout: std::time::Duration,
    },
    Response {
        request_id: u64,
        code: ResultCode,
        body: Option<Bytes>,
    },
}

impl SubmitItem {
    /// The cancellation path: resolve rather than drop, so no caller is left
    /// waiting on work that will never run.
    pub(crate) fn cancel(self) {
        if let SubmitItem::Rpc { completion, .. } = self {
            completion.complete(RpcResponse::session_closed());
        }
    }
}

/// Messages into the network worker.
pub(crate) enum NetMsg {
    Submit(SubmitItem),
    SubmitBatch(Vec<SubmitItem>),
    BindTransport(BoxTransport),
    Close,
}

impl std::fmt::Debug for NetMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submit(item) => f.debug_tuple("Submit").field(item).finish(),
            Self::SubmitBatch(batch) => f.debug_tuple("SubmitBatch").field(batch).finish(),
            Self::BindTransport(_) => f.write_str("BindTransport"),
            Self::Close => f.write_str("Close"),
        }
    }
}

/// Builder for a session and its network worker.
pub struct SessionBuilder {
    info: SessionInfo,
    config: SessionConfig,
    codec: Arc<dyn ProtocolCodec>,
    role: Role,
    extra_handlers: Vec<Box<dyn SessionHandler>>,
    registry: Option<SessionRegistry>,
}

enum Role {
    /// Connecting side; presents this token on every bind.
    Connect { token: Bytes },
    /// Accepting side; validates presented tokens.
    Accept { validator: Box<dyn TokenValidator> },
}

impl SessionBuilder {
    pub fn new(session_id: SessionId, local_guid: Guid, remote_guid: Guid) -> Self {
        Self {
            info: SessionInfo {
                session_id,
                local_guid,
                remote_guid,
            },
            config: SessionConfig::default(),
            codec: Arc::new(FrameCodec::new()),
            role: Role::Connect { token: Bytes::new() },
            extra_handlers: Vec::new(),
            registry: None,
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn codec(mut self, codec: Arc<dyn ProtocolCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Build the connecting side of the handshake.
    pub fn connect(mut self, token: Bytes) -> Self {
        self.role = Role::Connect { token };
        self
    }

    /// Build the accepting side of the handshake.
    pub fn accept(mut self, validator: impl TokenValidator) -> Self {
        self.role = Role::Accept {
            validator: Box::new(validator),
        };
        self
    }

    /// Insert a custom handler between the reliability stage and the
    /// handshake stage, in add order.
    pub fn handler(mut self, handler: Box<dyn SessionHandler>) -> Self {
        self.extra_handlers.push(handler);
        self
    }

    pub fn registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Spawn the network worker on the current tokio runtime and return the
    /// application-facing handle plus the committed-event receiver.
    pub fn spawn(self, transport: BoxTransport) -> (Session, SessionEvents) {
        let state = SessionState::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (commit_tx, commit_rx) = mpsc::channel(self.config.commit_capacity);

        let sender = Arc::new(Sender::new(&self.config, tx.clone(), state.clone()));
        let session = Session {
            info: self.info,
            state: state.clone(),
            tx: tx.clone(),
            sender: Arc::clone(&sender),
        };
        if let Some(registry) = &self.registry {
            if let Some(stale) = registry.register(session.clone()) {
                warn!(
                    session_id = self.info.session_id,
                    "replacing a still-registered session, closing the old one"
                );
                stale.close();
            }
        }

        let mut pipeline = SessionPipeline::new();
        pipeline.add_last(Box::new(ReliabilityHandler::new()));
        for handler in self.extra_handlers {
            pipeline.add_last(handler);
        }
        match self.role {
            Role::Connect { token } => {
                pipeline.add_last(Box::new(ClientHandshakeHandler::new(token)))
            }
            Role::Accept { validator } => {
                pipeline.add_last(Box::new(ServerHandshakeHandler::new(validator)))
            }
        }

        let mut core = SessionCore {
            info: self.info,
            config: self.config,
            state,
            queue: MessageQueue::new(),
            pipeline,
            codec: self.codec,
            transport: Some(transport),
            rx,
            commit_tx,
            sender,
            registry: self.registry,
            timer: TimerSystem::new(),
            outgoing: Vec::new(),
            actions: Vec::new(),
            last_read: Instant::now(),
            last_write: Instant::now(),
        };
        core.install_housekeeping();
        tokio::spawn(core.run());

        let events = SessionEvents::new(commit_rx, tx, self.info.session_id);
        (session, events)
    }
}

/// Application-facing handle. Cheap to clone; all clones drive the same
/// worker.
#[derive(Clone)]
pub struct Session {
    info: SessionInfo,
    state: SessionState,
    tx: mpsc::UnboundedSender<NetMsg>,
    sender: Arc<Sender>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.info.session_id
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Queue a one-way message, per the configured sender mode.
    pub fn send(&self, body: Bytes) -> Result<(), SessionError> {
        self.sender.send(body)
    }

    /// Issue an asynchronous RPC call. The callback runs on the thread that
    /// drains this session's [`SessionEvents`].
    pub fn call(
        &self,
        body: Bytes,
        timeout: Option<std::time::Duration>,
        callback: impl FnOnce(RpcResponse) + Send + 'static,
    ) -> Result<(), SessionError> {
        self.sender.call(body, timeout, callback)
    }

    /// Issue a synchronous RPC call, blocking up to the deadline. Must not
    /// be called from a tokio runtime thread.
    pub fn sync(&self, body: Bytes, timeout: Option<std::time::Duration>) -> RpcResponse {
        self.sender.sync(body, timeout)
    }

    /// Force buffered sends out to the network worker.
    pub fn flush(&self) {
        self.sender.flush()
    }

    /// Bind a replacement transport after a reconnect.
    pub fn bind_transport(&self, transport: BoxTransport) -> Result<(), SessionError> {
        self.tx
            .send(NetMsg::BindTransport(transport))
            .map_err(|_| SessionError::Closed)
    }

    /// Close the session. Buffered calls are cancelled to SESSION_CLOSED on
    /// this thread; worker-side teardown follows asynchronously. Idempotent.
    pub fn close(&self) {
        self.sender.clear_buffer();
        let _ = self.tx.send(NetMsg::Close);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("info", &self.info)
            .field("phase", &self.state.phase())
            .finish()
    }
}

/// The network worker. Single owner of all per-session protocol state.
struct SessionCore {
    info: SessionInfo,
    config: SessionConfig,
    state: SessionState,
    queue: MessageQueue,
    pipeline: SessionPipeline,
    codec: Arc<dyn ProtocolCodec>,
    transport: Option<BoxTransport>,
    rx: mpsc::UnboundedReceiver<NetMsg>,
    commit_tx: mpsc::Sender<CommitItem>,
    sender: Arc<Sender>,
    registry: Option<SessionRegistry>,
    timer: TimerSystem<SessionCore>,
    /// Encoded frames staged for the transport, in write order.
    outgoing: Vec<Bytes>,
    /// Pipeline actions staged for the drain loop.
    actions: Vec<PipelineAction>,
    last_read: Instant,
    last_write: Instant,
}

async fn recv_or_pending(transport: Option<BoxTransport>) -> Result<Bytes, TransportError> {
    match transport {
        Some(transport) => transport.recv_frame().await,
        None => futures::future::pending().await,
    }
}

impl SessionCore {
    /// Periodic housekeeping, run from the tick after due timers.
    fn install_housekeeping(&mut self) {
        self.timer.add_tick_hook(|core: &mut SessionCore| {
            core.scan_rpc_timeouts(Instant::now());
        });
        self.timer.add_tick_hook(|core: &mut SessionCore| {
            core.check_ack_deadline(Instant::now());
        });
        self.timer.add_tick_hook(|core: &mut SessionCore| {
            core.heartbeat(Instant::now());
        });
        self.timer.add_tick_hook(|core: &mut SessionCore| {
            core.check_session_timeout(Instant::now());
        });
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(session_id = self.info.session_id, "session worker started");
        self.fire(|pipeline, ctx| pipeline.fire_bound(ctx));
        self.settle().await;

        while !self.state.is_closed() {
            let transport = self.transport.clone();
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle_msg(msg),
                    // Every handle dropped; nothing can reach this session
                    // again.
                    None => self.begin_close(),
                },
                frame = recv_or_pending(transport) => self.handle_frame(frame),
                _ = tick.tick() => self.handle_tick(Instant::now()),
            }
            self.settle().await;
        }

        self.drain_channel();
        // Frames staged during teardown (a handshake rejection, close-time
        // writes) still go out before the transport is dropped.
        self.settle().await;
        if let Some(transport) = &self.transport {
            transport.close();
        }
        debug!(session_id = self.info.session_id, "session worker stopped");
    }

    fn handle_msg(&mut self, msg: NetMsg) {
        match msg {
            NetMsg::Submit(item) => self.submit(item),
            NetMsg::SubmitBatch(batch) => {
                for item in batch {
                    self.submit(item);
                }
            }
            NetMsg::BindTransport(transport) => {
                info!(session_id = self.info.session_id, "transport bound");
                self.transport = Some(transport);
                self.last_read = Instant::now();
                self.fire(|pipeline, ctx| pipeline.fire_bound(ctx));
            }
            NetMsg::Close => self.begin_close(),
        }
    }

    fn submit(&mut self, item: SubmitItem) {
        if self.state.is_closed() {
            item.cancel();
            return;
        }
        match item {
            SubmitItem::OneWay { body } => {
                self.queue.push_unsent(UnsentMessage::OneWay { body });
            }
            SubmitItem::Rpc {
                body,
                sync,
                completion,
                timeout,
            } => {
                let pending = self.queue.rpc_pending();
                if pending >= self.config.max_pending_rpc {
                    completion.complete(RpcResponse::local_exception(SessionError::PendingLimit {
                        pending,
                        max: self.config.max_pending_rpc,
                    }));
                    return;
                }
                let request_id = self.queue.next_request_id();
                let deadline = Instant::now() + timeout;
                self.queue
                    .register_rpc(request_id, RpcPromiseInfo::new(completion, deadline));
                self.queue.push_unsent(UnsentMessage::Rpc {
                    request_id,
                    sync,
                    body,
                });
            }
            SubmitItem::Response {
                request_id,
                code,
                body,
            } => {
                self.queue.push_unsent(UnsentMessage::Response {
                    request_id,
                    code,
                    body,
                });
            }
        }
    }

    fn handle_frame(&mut self, frame: Result<Bytes, TransportError>) {
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => {
                // The link is gone, the session is not: it stays up awaiting
                // a rebind until its own timeout expires.
                warn!(
                    session_id = self.info.session_id,
                    %error,
                    "transport lost, awaiting rebind"
                );
                self.transport = None;
                return;
            }
        };
        self.last_read = Instant::now();
        match self.codec.decode(frame) {
            Ok(packet) => self.fire(move |pipeline, ctx| pipeline.fire_read(ctx, packet)),
            Err(error) => {
                self.fire(move |pipeline, ctx| pipeline.fire_exception(ctx, error.into()))
            }
        }
    }

    fn handle_tick(&mut self, now: Instant) {
        for callback in self.timer.take_due(now) {
            callback(self);
        }
        let mut hooks = self.timer.take_hooks();
        for hook in &mut hooks {
            hook(self);
        }
        self.timer.restore_hooks(hooks);
    }

    fn scan_rpc_timeouts(&mut self, now: Instant) {
        for completion in self.queue.drain_expired_rpc(now) {
            self.finish_rpc(completion, RpcResponse::timeout());
        }
    }

    /// Resolve an RPC completion. Promise completions unblock a caller
    /// parked on its own thread and are completed right here on the worker;
    /// only callback completions go through the commit channel, so a caller
    /// that owns the event receiver and is blocked in `sync` still gets its
    /// result without anyone draining events.
    fn finish_rpc(&mut self, completion: RpcCompletion, response: RpcResponse) {
        if completion.is_promise() {
            completion.complete(response);
        } else {
            self.queue.push_uncommitted(UncommittedMessage::RpcCallback {
                completion,
                response,
            });
        }
    }

    fn check_ack_deadline(&mut self, now: Instant) {
        let Some(deadline) = self.queue.oldest_sent_deadline() else {
            return;
        };
        if deadline > now {
            return;
        }
        warn!(
            session_id = self.info.session_id,
            outstanding = self.queue.sent_len(),
            "oldest unacked message passed its deadline"
        );
        if self.config.close_on_ack_timeout {
            self.begin_close();
        }
    }

    fn heartbeat(&mut self, now: Instant) {
        if self.state.is_active()
            && self.transport.is_some()
            && now.duration_since(self.last_write) >= self.config.heartbeat_interval
        {
            self.queue.push_unsent(UnsentMessage::AckPing);
        }
    }

    fn check_session_timeout(&mut self, now: Instant) {
        if now.duration_since(self.last_read) >= self.config.session_timeout {
            warn!(
                session_id = self.info.session_id,
                "nothing read within the session timeout, closing"
            );
            self.begin_close();
        }
    }

    /// Run one pipeline fire with a context borrowed from the worker state.
    fn fire(&mut self, f: impl FnOnce(&mut SessionPipeline, &mut PipelineCtx<'_>)) {
        let Self {
            info,
            config,
            state,
            queue,
            pipeline,
            codec,
            outgoing,
            actions,
            ..
        } = self;
        let mut ctx = PipelineCtx {
            info,
            config,
            state,
            queue,
            codec: &**codec,
            outgoing,
            actions,
            now: Instant::now(),
        };
        f(pipeline, &mut ctx);
    }

    /// Bring the worker to a quiescent state after an event: drain pipeline
    /// actions, pump queued messages into writes, commit inbound batches,
    /// and push staged frames to the transport.
    async fn settle(&mut self) {
        loop {
            self.drain_actions();
            self.pump();
            if self.actions.is_empty() {
                break;
            }
        }
        self.commit();
        self.flush_outgoing().await;
    }

    fn drain_actions(&mut self) {
        while !self.actions.is_empty() {
            let actions = std::mem::take(&mut self.actions);
            for action in actions {
                match action {
                    PipelineAction::WriteMessage(message) => {
                        self.queue.push_unsent(message);
                    }
                    PipelineAction::WritePacket(packet) => {
                        self.fire(move |pipeline, ctx| {
                            pipeline.fire_write(ctx, WriteItem::Packet(packet))
                        });
                    }
                    PipelineAction::Activate => {
                        if self.state.try_active() {
                            info!(session_id = self.info.session_id, "session active");
                            self.fire(|pipeline, ctx| pipeline.fire_active(ctx));
                        }
                    }
                    PipelineAction::CompleteRpc {
                        completion,
                        response,
                    } => self.finish_rpc(completion, response),
                    PipelineAction::Close => self.begin_close(),
                }
            }
        }
    }

    /// Move queued ordered messages through the outbound chain. Only once
    /// the handshake completed: before that the queue holds traffic for
    /// replay.
    fn pump(&mut self) {
        if !self.state.is_active() || self.transport.is_none() {
            return;
        }
        while let Some(message) = self.queue.pop_unsent() {
            self.fire(move |pipeline, ctx| {
                pipeline.fire_write(ctx, WriteItem::Message(message))
            });
        }
        self.fire(|pipeline, ctx| pipeline.fire_flush(ctx));
    }

    /// Hand the uncommitted batch to the application thread.
    fn commit(&mut self) {
        if !self.queue.has_uncommitted() {
            return;
        }
        for message in self.queue.exchange_uncommitted() {
            let item = match message {
                UncommittedMessage::OneWay { body } => CommitItem::Message(body),
                UncommittedMessage::RpcRequest {
                    request_id, body, ..
                } => CommitItem::Rpc { request_id, body },
                UncommittedMessage::RpcCallback {
                    completion,
                    response,
                } => CommitItem::Callback {
                    completion,
                    response,
                },
            };
            if let Err(error) = self.commit_tx.try_send(item) {
                self.reject_commit(error.into_inner());
            }
        }
    }

    /// The commit channel refused the hand-off. RPC requests synthesize a
    /// COMMIT_FAILED response so the peer is not left waiting; callbacks run
    /// here rather than never.
    fn reject_commit(&mut self, item: CommitItem) {
        match item {
            CommitItem::Message(_) => {
                warn!(
                    session_id = self.info.session_id,
                    "dropping inbound message, commit channel unavailable"
                );
            }
            CommitItem::Rpc { request_id, .. } => {
                warn!(
                    session_id = self.info.session_id,
                    request_id, "commit channel unavailable, answering COMMIT_FAILED"
                );
                self.queue.push_unsent(UnsentMessage::Response {
                    request_id,
                    code: ResultCode::CommitFailed,
                    body: None,
                });
            }
            CommitItem::Callback {
                completion,
                response,
            } => completion.complete(response),
        }
    }

    async fn flush_outgoing(&mut self) {
        if self.outgoing.is_empty() {
            return;
        }
        let Some(transport) = self.transport.clone() else {
            // No link; leave ordered traffic in the sent queue for the
            // post-rebind replay and drop the staged frames.
            self.outgoing.clear();
            return;
        };
        let frames = std::mem::take(&mut self.outgoing);
        for frame in frames {
            if let Err(error) = transport.send_frame(frame).await {
                warn!(
                    session_id = self.info.session_id,
                    %error,
                    "transport write failed, awaiting rebind"
                );
                self.transport = None;
                break;
            }
        }
        self.last_write = Instant::now();
    }

    /// Terminal transition. Only the winning caller runs teardown.
    fn begin_close(&mut self) {
        let Some(prior) = self.state.try_close() else {
            return;
        };
        info!(session_id = self.info.session_id, ?prior, "closing session");

        self.fire(|pipeline, ctx| pipeline.fire_close(ctx));
        if prior == SessionPhase::Connected {
            self.fire(|pipeline, ctx| pipeline.fire_inactive(ctx));
        }

        // Outstanding and queued calls resolve to SESSION_CLOSED instead of
        // waiting out their own deadlines.
        for completion in self.queue.take_all_rpc() {
            self.finish_rpc(completion, MessageQueue::closed_response());
        }
        self.queue.exchange_unsent();
        self.sender.clear_buffer();

        if let Some(registry) = &self.registry {
            registry.remove(self.info.session_id);
        }
    }

    /// After close: cancel whatever was still in flight to the worker.
    fn drain_channel(&mut self) {
        self.rx.close();
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                NetMsg::Submit(item) => item.cancel(),
                NetMsg::SubmitBatch(batch) => {
                    for item in batch {
                        item.cancel();
                    }
                }
                NetMsg::BindTransport(transport) => transport.close(),
                NetMsg::Close => {}
            }
        }
    }
}
