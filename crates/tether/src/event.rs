//! Committed-event delivery to the application thread.
//!
//! The network worker never dispatches into application code directly. It
//! batches inbound messages as commit items on a bounded channel; the
//! application drains them through [`SessionEvents`], which executes RPC
//! callbacks inline (pinning them to the draining thread) and yields
//! everything else as a [`SessionEvent`].

use bytes::Bytes;
use tether_core::{ResultCode, RpcResponse, SessionId};
use tokio::sync::mpsc;
use tracing::warn;

use crate::promise::RpcCompletion;
use crate::session::{NetMsg, SubmitItem};

/// One inbound item crossing from the network worker to the application
/// thread.
#[derive(Debug)]
pub(crate) enum CommitItem {
    Message(Bytes),
    Rpc { request_id: u64, body: Bytes },
    /// Completion of one of our own outbound calls; executed during the
    /// drain, never surfaced to the application.
    Callback {
        completion: RpcCompletion,
        response: RpcResponse,
    },
}

/// An inbound event delivered to the application.
#[derive(Debug)]
pub enum SessionEvent {
    /// A one-way message from the peer.
    Message(Bytes),
    /// An RPC request from the peer; answer through the responder.
    Rpc {
        body: Bytes,
        responder: RpcResponder,
    },
}

/// Reply handle for one inbound RPC request.
///
/// Dropping the responder without answering sends an ERROR result so the
/// caller is never left waiting for its own deadline.
#[derive(Debug)]
pub struct RpcResponder {
    tx: mpsc::UnboundedSender<NetMsg>,
    session_id: SessionId,
    request_id: u64,
    responded: bool,
}

impl RpcResponder {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<NetMsg>,
        session_id: SessionId,
        request_id: u64,
    ) -> Self {
        Self {
            tx,
            session_id,
            request_id,
            responded: false,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Send the response. May be called from any thread; the actual write
    /// happens on the session's network worker.
    pub fn respond(mut self, response: RpcResponse) {
        self.responded = true;
        self.submit(response.code, response.body);
    }

    pub fn respond_success(self, body: Bytes) {
        self.respond(RpcResponse::success(body));
    }

    fn submit(&self, code: ResultCode, body: Option<Bytes>) {
        let item = SubmitItem::Response {
            request_id: self.request_id,
            code,
            body,
        };
        // A closed worker means the session is gone; the peer learns of it
        // through the session teardown, not through this response.
        let _ = self.tx.send(NetMsg::Submit(item));
    }
}

impl Drop for RpcResponder {
    fn drop(&mut self) {
        if !self.responded {
            warn!(
                session_id = self.session_id,
                request_id = self.request_id,
                "rpc responder dropped without a response"
            );
            self.submit(ResultCode::Error, None);
        }
    }
}

/// Application-side receiver for a session's committed events.
pub struct SessionEvents {
    rx: mpsc::Receiver<CommitItem>,
    tx: mpsc::UnboundedSender<NetMsg>,
    session_id: SessionId,
}

impl SessionEvents {
    pub(crate) fn new(
        rx: mpsc::Receiver<CommitItem>,
        tx: mpsc::UnboundedSender<NetMsg>,
        session_id: SessionId,
    ) -> Self {
        Self { rx, tx, session_id }
    }

    /// Receive the next event, running any interleaved RPC callbacks.
    /// Returns `None` once the session is closed and drained.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            let item = self.rx.recv().await?;
            if let Some(event) = self.surface(item) {
                return Some(event);
            }
        }
    }

    /// Blocking form of [`recv`](Self::recv) for non-async application
    /// threads.
    pub fn blocking_recv(&mut self) -> Option<SessionEvent> {
        loop {
            let item = self.rx.blocking_recv()?;
            if let Some(event) = self.surface(item) {
                return Some(event);
            }
        }
    }

    /// Drain without blocking. Runs callbacks and returns surfaced events.
    pub fn try_drain(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            if let Some(event) = self.surface(item) {
                events.push(event);
            }
        }
        events
    }

    fn surface(&self, item: CommitItem) -> Option<SessionEvent> {
        match item {
            CommitItem::Message(body) => Some(SessionEvent::Message(body)),
            CommitItem::Rpc { request_id, body } => Some(SessionEvent::Rpc {
                body,
                responder: RpcResponder::new(self.tx.clone(), self.session_id, request_id),
            }),
            CommitItem::Callback {
                completion,
                response,
            } => {
                completion.complete(response);
                None
            }
        }
    }
}
