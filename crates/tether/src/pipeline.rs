//! The per-session handler chain.
//!
//! A [`SessionPipeline`] is an explicit ordered list of handlers between two
//! sentinels: the head is the terminal *outbound* handler (codec encode, ready
//! for the transport write) and the tail is the terminal *inbound* handler
//! (commit to application dispatch, or log unhandled). Handlers advertise
//! their capabilities through [`SessionHandler::as_inbound`] /
//! [`SessionHandler::as_outbound`]; every `fire_*` is a linear scan that
//! visits only the handlers with the matching capability, so composition is
//! order-preserving but role-filtered.
//!
//! Errors raised inside a handler are routed to the nearest inbound handler's
//! exception hook (toward the tail) rather than propagated to the caller; the
//! tail's hook closes the session, so an unclaimed error fails fast.

use std::ops::ControlFlow;
use std::time::Instant;

use bytes::Bytes;
use tether_core::{Packet, ProtocolCodec, RpcResponse, SessionError};
use tracing::{debug, error, warn};

use crate::config::SessionConfig;
use crate::message::{UncommittedMessage, UnsentMessage};
use crate::promise::RpcCompletion;
use crate::queue::MessageQueue;
use crate::session::{SessionInfo, SessionState};

/// What flows toward the tail. Packets enter at the head and protocol
/// handlers strip them down to application-level messages for the tail to
/// commit.
#[derive(Debug)]
pub enum ReadItem {
    Packet(Packet),
    Message(UncommittedMessage),
}

/// What flows toward the head. Logical messages enter at the tail side and
/// are materialized into wire packets on the way down.
#[derive(Debug)]
pub enum WriteItem {
    Message(UnsentMessage),
    Packet(Packet),
}

/// Deferred effects a handler requests while a scan is in progress. The
/// network worker drains these after the scan returns, which keeps the chain
/// walk free of re-entrancy.
#[derive(Debug)]
pub enum PipelineAction {
    /// Queue a logical message for ordered transmission.
    WriteMessage(UnsentMessage),
    /// Write a packet that sits outside the ordered stream (handshake,
    /// reconnect replay).
    WritePacket(Packet),
    /// The session just won its BOUND -> CONNECTED transition.
    Activate,
    /// Deliver an RPC completion.
    CompleteRpc {
        completion: RpcCompletion,
        response: RpcResponse,
    },
    /// Tear the session down.
    Close,
}

/// Everything a handler may touch while the chain is being walked.
///
/// Built fresh by the network worker around each fire; all fields are that
/// worker's own state, which is what makes the lock-free access safe.
pub struct PipelineCtx<'a> {
    pub info: &'a SessionInfo,
    pub config: &'a SessionConfig,
    pub state: &'a SessionState,
    pub queue: &'a mut MessageQueue,
    pub codec: &'a dyn ProtocolCodec,
    /// Encoded frames for the transport, in write order.
    pub outgoing: &'a mut Vec<Bytes>,
    /// Deferred effects, drained after the scan.
    pub actions: &'a mut Vec<PipelineAction>,
    pub now: Instant,
}

/// Inbound capability: reacts to lifecycle events, inbound reads, and
/// exceptions.
pub trait InboundHandler: Send {
    /// A transport was (re)bound to the session.
    fn on_bound(&mut self, _ctx: &mut PipelineCtx<'_>) -> Result<(), SessionError> {
        Ok(())
    }

    fn on_active(&mut self, _ctx: &mut PipelineCtx<'_>) -> Result<(), SessionError> {
        Ok(())
    }

    fn on_inactive(&mut self, _ctx: &mut PipelineCtx<'_>) -> Result<(), SessionError> {
        Ok(())
    }

    /// Transform or consume an inbound item. `Continue` passes the (possibly
    /// transformed) item to the next inbound handler; `Break` consumes it.
    fn on_read(
        &mut self,
        _ctx: &mut PipelineCtx<'_>,
        item: ReadItem,
    ) -> Result<ControlFlow<(), ReadItem>, SessionError> {
        Ok(ControlFlow::Continue(item))
    }

    /// Claim an error raised earlier in the chain. Return `true` when
    /// handled; an unclaimed error reaches the tail, which closes the
    /// session.
    fn on_exception(&mut self, _ctx: &mut PipelineCtx<'_>, _error: &SessionError) -> bool {
        false
    }
}

/// Outbound capability: reacts to writes, flushes, and close requests.
pub trait OutboundHandler: Send {
    fn on_write(
        &mut self,
        _ctx: &mut PipelineCtx<'_>,
        item: WriteItem,
    ) -> Result<ControlFlow<(), WriteItem>, SessionError> {
        Ok(ControlFlow::Continue(item))
    }

    fn on_flush(&mut self, _ctx: &mut PipelineCtx<'_>) -> Result<(), SessionError> {
        Ok(())
    }

    fn on_close(&mut self, _ctx: &mut PipelineCtx<'_>) -> Result<(), SessionError> {
        Ok(())
    }
}

/// A pipeline entry. Implementations expose one or both capabilities.
pub trait SessionHandler: Send + 'static {
    fn name(&self) -> &'static str;

    fn as_inbound(&mut self) -> Option<&mut dyn InboundHandler> {
        None
    }

    fn as_outbound(&mut self) -> Option<&mut dyn OutboundHandler> {
        None
    }
}

/// The ordered handler chain. Index 0 is the head sentinel, the last index
/// is the tail sentinel; `add_last` inserts just before the tail.
pub struct SessionPipeline {
    handlers: Vec<Box<dyn SessionHandler>>,
}

impl SessionPipeline {
    pub fn new() -> Self {
        Self {
            handlers: vec![Box::new(HeadHandler), Box::new(TailHandler)],
        }
    }

    pub fn add_last(&mut self, handler: Box<dyn SessionHandler>) {
        let tail = self.handlers.len() - 1;
        self.handlers.insert(tail, handler);
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn fire_bound(&mut self, ctx: &mut PipelineCtx<'_>) {
        self.fire_inbound_event(ctx, |handler, ctx| handler.on_bound(ctx));
    }

    pub fn fire_active(&mut self, ctx: &mut PipelineCtx<'_>) {
        self.fire_inbound_event(ctx, |handler, ctx| handler.on_active(ctx));
    }

    pub fn fire_inactive(&mut self, ctx: &mut PipelineCtx<'_>) {
        self.fire_inbound_event(ctx, |handler, ctx| handler.on_inactive(ctx));
    }

    /// Walk the chain head -> tail, visiting inbound-capable handlers in add
    /// order.
    pub fn fire_read(&mut self, ctx: &mut PipelineCtx<'_>, packet: Packet) {
        let mut item = Some(ReadItem::Packet(packet));
        let mut failure = None;
        for index in 0..self.handlers.len() {
            let Some(handler) = self.handlers[index].as_inbound() else {
                continue;
            };
            let current = match item.take() {
                Some(current) => current,
                None => break,
            };
            match handler.on_read(ctx, current) {
                Ok(ControlFlow::Continue(next)) => item = Some(next),
                Ok(ControlFlow::Break(())) => break,
                Err(error) => {
                    failure = Some((index + 1, error));
                    break;
                }
            }
        }
        if let Some((from, error)) = failure {
            self.route_exception(ctx, from, error);
        }
    }

    /// Walk the chain tail -> head, visiting outbound-capable handlers in
    /// reverse-add order.
    pub fn fire_write(&mut self, ctx: &mut PipelineCtx<'_>, item: WriteItem) {
        let mut item = Some(item);
        let mut failure = None;
        for index in (0..self.handlers.len()).rev() {
            let Some(handler) = self.handlers[index].as_outbound() else {
                continue;
            };
            let current = match item.take() {
                Some(current) => current,
                None => break,
            };
            match handler.on_write(ctx, current) {
                Ok(ControlFlow::Continue(next)) => item = Some(next),
                Ok(ControlFlow::Break(())) => break,
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }
        if let Some(error) = failure {
            // Outbound handlers have no exception hook; the inbound chain
            // claims the error starting from the head.
            self.route_exception(ctx, 0, error);
        }
    }

    pub fn fire_flush(&mut self, ctx: &mut PipelineCtx<'_>) {
        self.fire_outbound_event(ctx, |handler, ctx| handler.on_flush(ctx));
    }

    pub fn fire_close(&mut self, ctx: &mut PipelineCtx<'_>) {
        self.fire_outbound_event(ctx, |handler, ctx| handler.on_close(ctx));
    }

    /// Route an error through the inbound exception hooks, starting at the
    /// head.
    pub fn fire_exception(&mut self, ctx: &mut PipelineCtx<'_>, error: SessionError) {
        self.route_exception(ctx, 0, error);
    }

    fn fire_inbound_event(
        &mut self,
        ctx: &mut PipelineCtx<'_>,
        mut event: impl FnMut(&mut dyn InboundHandler, &mut PipelineCtx<'_>) -> Result<(), SessionError>,
    ) {
        let mut failure = None;
        for index in 0..self.handlers.len() {
            let Some(handler) = self.handlers[index].as_inbound() else {
                continue;
            };
            if let Err(error) = event(handler, ctx) {
                failure = Some((index + 1, error));
                break;
            }
        }
        if let Some((from, error)) = failure {
            self.route_exception(ctx, from, error);
        }
    }

    fn fire_outbound_event(
        &mut self,
        ctx: &mut PipelineCtx<'_>,
        mut event: impl FnMut(&mut dyn OutboundHandler, &mut PipelineCtx<'_>) -> Result<(), SessionError>,
    ) {
        let mut failure = None;
        for index in (0..self.handlers.len()).rev() {
            let Some(handler) = self.handlers[index].as_outbound() else {
                continue;
            };
            if let Err(error) = event(handler, ctx) {
                failure = Some(error);
                break;
            }
        }
        if let Some(error) = failure {
            self.route_exception(ctx, 0, error);
        }
    }

    fn route_exception(&mut self, ctx: &mut PipelineCtx<'_>, from: usize, error: SessionError) {
        for index in from..self.handlers.len() {
            let Some(handler) = self.handlers[index].as_inbound() else {
                continue;
            };
            if handler.on_exception(ctx, &error) {
                return;
            }
        }
        // Unreachable while the tail sentinel is in place, but do not let an
        // error vanish if a custom chain removed it.
        error!(session_id = ctx.info.session_id, %error, "unhandled pipeline exception");
        ctx.actions.push(PipelineAction::Close);
    }
}

impl Default for SessionPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal outbound handler: encodes packets and stages the frames for the
/// transport write.
struct HeadHandler;

impl SessionHandler for HeadHandler {
    fn name(&self) -> &'static str {
        "head"
    }

    fn as_outbound(&mut self) -> Option<&mut dyn OutboundHandler> {
        Some(self)
    }
}

impl OutboundHandler for HeadHandler {
    fn on_write(
        &mut self,
        ctx: &mut PipelineCtx<'_>,
        item: WriteItem,
    ) -> Result<ControlFlow<(), WriteItem>, SessionError> {
        match item {
            WriteItem::Packet(packet) => {
                let frame = ctx.codec.encode(&packet)?;
                ctx.outgoing.push(frame);
            }
            WriteItem::Message(message) => {
                // Nothing between here and the tail materialized it.
                warn!(
                    session_id = ctx.info.session_id,
                    ?message,
                    "unhandled outbound message reached the pipeline head"
                );
            }
        }
        Ok(ControlFlow::Break(()))
    }
}

/// Terminal inbound handler: commits application messages and absorbs
/// whatever nothing else claimed.
struct TailHandler;

impl SessionHandler for TailHandler {
    fn name(&self) -> &'static str {
        "tail"
    }

    fn as_inbound(&mut self) -> Option<&mut dyn InboundHandler> {
        Some(self)
    }
}

impl InboundHandler for TailHandler {
    fn on_read(
        &mut self,
        ctx: &mut PipelineCtx<'_>,
        item: ReadItem,
    ) -> Result<ControlFlow<(), ReadItem>, SessionError> {
        match item {
            ReadItem::Message(message) => ctx.queue.push_uncommitted(message),
            ReadItem::Packet(packet) => {
                warn!(
                    session_id = ctx.info.session_id,
                    kind = ?packet.kind(),
                    "unhandled inbound packet reached the pipeline tail"
                );
            }
        }
        Ok(ControlFlow::Break(()))
    }

    fn on_exception(&mut self, ctx: &mut PipelineCtx<'_>, error: &SessionError) -> bool {
        if error.is_fatal() {
            error!(session_id = ctx.info.session_id, %error, "fatal session error, closing");
        } else {
            debug!(session_id = ctx.info.session_id, %error, "session error, closing");
        }
        ctx.actions.push(PipelineAction::Close);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use tether_core::FrameCodec;

    use super::*;
    use crate::config::SessionConfig;
    use crate::session::{SessionInfo, SessionState};

    struct Recording {
        label: &'static str,
        inbound: bool,
        outbound: bool,
        log: mpsc::Sender<String>,
    }

    impl SessionHandler for Recording {
        fn name(&self) -> &'static str {
            self.label
        }

        fn as_inbound(&mut self) -> Option<&mut dyn InboundHandler> {
            self.inbound.then_some(self as &mut dyn InboundHandler)
        }

        fn as_outbound(&mut self) -> Option<&mut dyn OutboundHandler> {
            self.outbound.then_some(self as &mut dyn OutboundHandler)
        }
    }

    impl InboundHandler for Recording {
        fn on_read(
            &mut self,
            _ctx: &mut PipelineCtx<'_>,
            item: ReadItem,
        ) -> Result<ControlFlow<(), ReadItem>, SessionError> {
            self.log.send(format!("read:{}", self.label)).unwrap();
            Ok(ControlFlow::Continue(item))
        }
    }

    impl OutboundHandler for Recording {
        fn on_write(
            &mut self,
            _ctx: &mut PipelineCtx<'_>,
            item: WriteItem,
        ) -> Result<ControlFlow<(), WriteItem>, SessionError> {
            self.log.send(format!("write:{}", self.label)).unwrap();
            Ok(ControlFlow::Continue(item))
        }
    }

    struct Failing;

    impl SessionHandler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn as_inbound(&mut self) -> Option<&mut dyn InboundHandler> {
            Some(self)
        }
    }

    impl InboundHandler for Failing {
        fn on_read(
            &mut self,
            _ctx: &mut PipelineCtx<'_>,
            _item: ReadItem,
        ) -> Result<ControlFlow<(), ReadItem>, SessionError> {
            Err(SessionError::CommitRejected)
        }
    }

    struct Claiming {
        log: mpsc::Sender<String>,
    }

    impl SessionHandler for Claiming {
        fn name(&self) -> &'static str {
            "claiming"
        }

        fn as_inbound(&mut self) -> Option<&mut dyn InboundHandler> {
            Some(self)
        }
    }

    impl InboundHandler for Claiming {
        fn on_exception(&mut self, _ctx: &mut PipelineCtx<'_>, _error: &SessionError) -> bool {
            self.log.send("claimed".to_string()).unwrap();
            true
        }
    }

    fn test_packet() -> Packet {
        Packet::AckPing { ack: 0, sequence: 1 }
    }

    struct Fixture {
        info: SessionInfo,
        config: SessionConfig,
        state: SessionState,
        queue: MessageQueue,
        codec: FrameCodec,
        outgoing: Vec<Bytes>,
        actions: Vec<PipelineAction>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                info: SessionInfo {
                    session_id: 1,
                    local_guid: 10,
                    remote_guid: 20,
                },
                config: SessionConfig::default(),
                state: SessionState::new(),
                queue: MessageQueue::new(),
                codec: FrameCodec::new(),
                outgoing: Vec::new(),
                actions: Vec::new(),
            }
        }

        fn ctx(&mut self) -> PipelineCtx<'_> {
            PipelineCtx {
                info: &self.info,
                config: &self.config,
                state: &self.state,
                queue: &mut self.queue,
                codec: &self.codec,
                outgoing: &mut self.outgoing,
                actions: &mut self.actions,
                now: Instant::now(),
            }
        }
    }

    #[test]
    fn read_visits_inbound_handlers_in_add_order() {
        let (log, seen) = mpsc::channel();
        let mut pipeline = SessionPipeline::new();
        pipeline.add_last(Box::new(Recording {
            label: "a",
            inbound: true,
            outbound: false,
            log: log.clone(),
        }));
        pipeline.add_last(Box::new(Recording {
            label: "b",
            inbound: false,
            outbound: true,
            log: log.clone(),
        }));
        pipeline.add_last(Box::new(Recording {
            label: "c",
            inbound: true,
            outbound: true,
            log,
        }));

        let mut fixture = Fixture::new();
        pipeline.fire_read(&mut fixture.ctx(), test_packet());

        let order: Vec<String> = seen.try_iter().collect();
        // b is outbound-only and skipped.
        assert_eq!(order, vec!["read:a", "read:c"]);
    }

    #[test]
    fn write_visits_outbound_handlers_in_reverse_add_order() {
        let (log, seen) = mpsc::channel();
        let mut pipeline = SessionPipeline::new();
        for label in ["a", "b"] {
            pipeline.add_last(Box::new(Recording {
                label,
                inbound: label == "a",
                outbound: true,
                log: log.clone(),
            }));
        }

        let mut fixture = Fixture::new();
        pipeline.fire_write(&mut fixture.ctx(), WriteItem::Packet(test_packet()));

        let order: Vec<String> = seen.try_iter().collect();
        assert_eq!(order, vec!["write:b", "write:a"]);
        // The head encoded the packet.
        assert_eq!(fixture.outgoing.len(), 1);
    }

    #[test]
    fn handler_error_reaches_the_nearest_exception_hook() {
        let (log, seen) = mpsc::channel();
        let mut pipeline = SessionPipeline::new();
        pipeline.add_last(Box::new(Failing));
        pipeline.add_last(Box::new(Claiming { log }));

        let mut fixture = Fixture::new();
        pipeline.fire_read(&mut fixture.ctx(), test_packet());

        assert_eq!(seen.try_iter().collect::<Vec<_>>(), vec!["claimed"]);
        // Claimed before the tail: no close requested.
        assert!(fixture.actions.is_empty());
    }

    #[test]
    fn unclaimed_error_closes_at_the_tail() {
        let mut pipeline = SessionPipeline::new();
        pipeline.add_last(Box::new(Failing));

        let mut fixture = Fixture::new();
        pipeline.fire_read(&mut fixture.ctx(), test_packet());

        assert!(matches!(fixture.actions.as_slice(), [PipelineAction::Close]));
    }

    #[test]
    fn tail_commits_application_messages() {
        let mut pipeline = SessionPipeline::new();
        let mut fixture = Fixture::new();
        let mut ctx = fixture.ctx();

        // Walk a message through an empty chain: only the tail sees it.
        let item = ReadItem::Message(UncommittedMessage::OneWay {
            body: Bytes::from_static(b"m"),
        });
        let mut item = Some(item);
        for index in 0..pipeline.handlers.len() {
            if let Some(handler) = pipeline.handlers[index].as_inbound() {
                match handler.on_read(&mut ctx, item.take().unwrap()).unwrap() {
                    ControlFlow::Continue(next) => item = Some(next),
                    ControlFlow::Break(()) => break,
                }
            }
        }
        drop(ctx);
        assert!(fixture.queue.has_uncommitted());
    }
}
