//! Send-buffering strategies.
//!
//! A [`Sender`] moves outgoing work from application threads onto the
//! session's network worker. Direct mode submits every call immediately;
//! buffered mode accumulates tasks and hands them over as one batch, either
//! on an explicit [`flush`](Sender::flush) or automatically once the batch
//! reaches the configured threshold. Unsharable mode is buffered plus an
//! owner-thread check, turning a silently racing cross-thread use into an
//! immediate error.
//!
//! RPC failure modes are folded into response codes, never raised: `sync`
//! always returns an [`RpcResponse`], and `call` resolves its callback with
//! SESSION_CLOSED when the session is already gone.

use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tether_core::{RpcResponse, SessionError};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{SenderMode, SessionConfig};
use crate::promise::{rpc_promise_pair, RpcCompletion};
use crate::session::{NetMsg, SessionState, SubmitItem};

pub struct Sender {
    mode: SenderMode,
    tx: mpsc::UnboundedSender<NetMsg>,
    state: SessionState,
    flush_threshold: usize,
    default_rpc_timeout: Duration,
    owner: ThreadId,
    buffer: Mutex<Vec<SubmitItem>>,
}

impl Sender {
    pub(crate) fn new(
        config: &SessionConfig,
        tx: mpsc::UnboundedSender<NetMsg>,
        state: SessionState,
    ) -> Self {
        Self {
            mode: config.sender_mode,
            tx,
            state,
            flush_threshold: config.flush_threshold,
            default_rpc_timeout: config.default_rpc_timeout,
            owner: thread::current().id(),
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn mode(&self) -> SenderMode {
        self.mode
    }

    /// Queue a one-way message.
    pub fn send(&self, body: Bytes) -> Result<(), SessionError> {
        self.check_owner()?;
        if self.state.is_closed() {
            return Err(SessionError::Closed);
        }
        self.dispatch(SubmitItem::OneWay { body })
    }

    /// Issue an asynchronous RPC call. The callback is resolved exactly
    /// once: with the peer's response, TIMEOUT at the deadline, or
    /// SESSION_CLOSED if the session dies first.
    pub fn call(
        &self,
        body: Bytes,
        timeout: Option<Duration>,
        callback: impl FnOnce(RpcResponse) + Send + 'static,
    ) -> Result<(), SessionError> {
        self.check_owner()?;
        let completion = RpcCompletion::callback(callback);
        if self.state.is_closed() {
            completion.complete(RpcResponse::session_closed());
            return Ok(());
        }
        let item = SubmitItem::Rpc {
            body,
            sync: false,
            completion,
            timeout: timeout.unwrap_or(self.default_rpc_timeout),
        };
        if let Err(item) = self.try_dispatch(item) {
            item.cancel();
        }
        Ok(())
    }

    /// Issue a synchronous RPC call and block for its response, never past
    /// the deadline. Every failure mode comes back as a result code.
    pub fn sync(&self, body: Bytes, timeout: Option<Duration>) -> RpcResponse {
        if let Err(error) = self.check_owner() {
            return RpcResponse::local_exception(error);
        }
        if self.state.is_closed() {
            return RpcResponse::session_closed();
        }
        // Parking a runtime worker thread would starve the session's own
        // network task. Refuse instead of deadlocking.
        if tokio::runtime::Handle::try_current().is_ok() {
            return RpcResponse::local_exception(SessionError::BlockedOnWorker);
        }
        // Anything buffered ahead of this call must reach the worker before
        // we block, or an earlier send could wait on us forever.
        self.flush();

        let timeout = timeout.unwrap_or(self.default_rpc_timeout);
        let deadline = Instant::now() + timeout;
        let (promise, future) = rpc_promise_pair(deadline);
        let item = SubmitItem::Rpc {
            body,
            sync: true,
            completion: RpcCompletion::Promise(promise),
            timeout,
        };
        // Synchronous calls bypass the buffer so the result does not depend
        // on a flush that will never come while we are parked.
        if self.submit(item).is_err() {
            return RpcResponse::session_closed();
        }
        future.await_response()
    }

    /// Hand the buffered batch to the network worker.
    pub fn flush(&self) {
        let batch = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return;
        }
        if let Err(batch) = self.submit_batch(batch) {
            cancel_batch(batch);
        }
    }

    /// Drop the buffer, resolving every buffered RPC call to SESSION_CLOSED.
    /// Nothing in the buffer reaches the network after this.
    pub fn clear_buffer(&self) {
        let batch = std::mem::take(&mut *self.buffer.lock());
        if !batch.is_empty() {
            debug!(dropped = batch.len(), "clearing buffered send tasks");
            cancel_batch(batch);
        }
    }

    fn dispatch(&self, item: SubmitItem) -> Result<(), SessionError> {
        match self.try_dispatch(item) {
            Ok(()) => Ok(()),
            Err(item) => {
                item.cancel();
                Err(SessionError::Closed)
            }
        }
    }

    /// Route one item per the sender mode. On failure the item is handed
    /// back so the caller controls its cancellation path.
    fn try_dispatch(&self, item: SubmitItem) -> Result<(), SubmitItem> {
        match self.mode {
            SenderMode::Direct => self.submit(item),
            SenderMode::Buffered | SenderMode::Unsharable => {
                let batch = {
                    let mut buffer = self.buffer.lock();
                    buffer.push(item);
                    if buffer.len() >= self.flush_threshold {
                        std::mem::take(&mut *buffer)
                    } else {
                        return Ok(());
                    }
                };
                match self.submit_batch(batch) {
                    Ok(()) => Ok(()),
                    Err(batch) => {
                        cancel_batch(batch);
                        // The triggering item was cancelled with the batch.
                        Ok(())
                    }
                }
            }
        }
    }

    fn submit(&self, item: SubmitItem) -> Result<(), SubmitItem> {
        self.tx.send(NetMsg::Submit(item)).map_err(|err| match err.0 {
            NetMsg::Submit(item) => item,
            _ => unreachable!(),
        })
    }

    fn submit_batch(&self, batch: Vec<SubmitItem>) -> Result<(), Vec<SubmitItem>> {
        self.tx
            .send(NetMsg::SubmitBatch(batch))
            .map_err(|err| match err.0 {
                NetMsg::SubmitBatch(batch) => batch,
                _ => unreachable!(),
            })
    }

    fn check_owner(&self) -> Result<(), SessionError> {
        if self.mode == SenderMode::Unsharable && thread::current().id() != self.owner {
            return Err(SessionError::WrongThread);
        }
        Ok(())
    }
}

fn cancel_batch(batch: Vec<SubmitItem>) {
    for item in batch {
        item.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tether_core::ResultCode;

    use super::*;

    fn sender(mode: SenderMode, threshold: usize) -> (Sender, mpsc::UnboundedReceiver<NetMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = SessionConfig::default()
            .with_sender_mode(mode)
            .with_flush_threshold(threshold);
        (Sender::new(&config, tx, SessionState::new()), rx)
    }

    #[test]
    fn direct_mode_submits_immediately() {
        let (sender, mut rx) = sender(SenderMode::Direct, 32);
        sender.send(Bytes::from_static(b"a")).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            NetMsg::Submit(SubmitItem::OneWay { .. })
        ));
    }

    #[test]
    fn buffered_mode_flushes_at_the_threshold() {
        let (sender, mut rx) = sender(SenderMode::Buffered, 3);
        sender.send(Bytes::from_static(b"1")).unwrap();
        sender.send(Bytes::from_static(b"2")).unwrap();
        assert!(rx.try_recv().is_err());

        // The third enqueue triggers the automatic flush.
        sender.send(Bytes::from_static(b"3")).unwrap();
        match rx.try_recv().unwrap() {
            NetMsg::SubmitBatch(batch) => assert_eq!(batch.len(), 3),
            other => panic!("unexpected {other:?}"),
        }

        // The next enqueue starts a fresh buffer.
        sender.send(Bytes::from_static(b"4")).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn explicit_flush_drains_a_partial_buffer() {
        let (sender, mut rx) = sender(SenderMode::Buffered, 32);
        sender.send(Bytes::from_static(b"1")).unwrap();
        sender.flush();
        match rx.try_recv().unwrap() {
            NetMsg::SubmitBatch(batch) => assert_eq!(batch.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
        // Flushing an empty buffer submits nothing.
        sender.flush();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn clear_buffer_cancels_every_buffered_call() {
        let (sender, mut rx) = sender(SenderMode::Buffered, 32);
        let completions = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let completions = completions.clone();
            sender
                .call(Bytes::from_static(b"q"), None, move |response| {
                    assert_eq!(response.code, ResultCode::SessionClosed);
                    completions.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        sender.send(Bytes::from_static(b"m")).unwrap();

        sender.clear_buffer();
        assert_eq!(completions.load(Ordering::SeqCst), 3);
        // Nothing reached the network side.
        assert!(rx.try_recv().is_err());
        sender.flush();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsharable_mode_rejects_foreign_threads() {
        let (sender, mut rx) = sender(SenderMode::Unsharable, 32);
        sender.send(Bytes::from_static(b"ok")).unwrap();

        let sender = Arc::new(sender);
        let foreign = {
            let sender = sender.clone();
            std::thread::spawn(move || sender.send(Bytes::from_static(b"nope")))
        };
        assert!(matches!(
            foreign.join().unwrap(),
            Err(SessionError::WrongThread)
        ));

        sender.flush();
        match rx.try_recv().unwrap() {
            NetMsg::SubmitBatch(batch) => assert_eq!(batch.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn call_on_a_dead_worker_resolves_session_closed() {
        let (sender, rx) = sender(SenderMode::Direct, 32);
        drop(rx);
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        sender
            .call(Bytes::from_static(b"q"), None, move |response| {
                done_tx.send(response.code).unwrap();
            })
            .unwrap();
        assert_eq!(done_rx.recv().unwrap(), ResultCode::SessionClosed);
    }
}
