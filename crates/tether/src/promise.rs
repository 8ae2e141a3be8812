//! Deadline-bound, single-assignment RPC result containers.
//!
//! An [`RpcPromise`]/[`RpcFuture`] pair is created per outstanding RPC call.
//! The promise side is completed at most once, from whichever source wins:
//! the network worker delivering the peer's response, the timeout scan, or
//! session teardown. The future side blocks the calling thread, but never
//! past the promise's absolute deadline: at the deadline it force-resolves to
//! a TIMEOUT completion itself.
//!
//! Failures are never raised through the future. Every failure mode is a
//! normal completion carrying a [`tether_core::ResultCode`], so callers
//! branch uniformly.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tether_core::RpcResponse;

struct PromiseShared {
    state: Mutex<Option<RpcResponse>>,
    cond: Condvar,
}

/// Completion side; held by the network worker (inside the promise map).
pub struct RpcPromise {
    shared: Arc<PromiseShared>,
}

/// Waiting side; held by the thread that issued a synchronous call.
pub struct RpcFuture {
    shared: Arc<PromiseShared>,
    deadline: Instant,
}

/// Create a connected promise/future pair with an absolute deadline.
pub fn rpc_promise_pair(deadline: Instant) -> (RpcPromise, RpcFuture) {
    let shared = Arc::new(PromiseShared {
        state: Mutex::new(None),
        cond: Condvar::new(),
    });
    (
        RpcPromise {
            shared: shared.clone(),
        },
        RpcFuture { shared, deadline },
    )
}

impl RpcPromise {
    /// Complete the promise. The first completion wins; later attempts are
    /// ignored and reported as `false`.
    pub fn try_complete(&self, response: RpcResponse) -> bool {
        let mut state = self.shared.state.lock();
        if state.is_some() {
            return false;
        }
        *state = Some(response);
        self.shared.cond.notify_all();
        true
    }

    pub fn is_completed(&self) -> bool {
        self.shared.state.lock().is_some()
    }
}

impl RpcFuture {
    /// The absolute deadline this future will not block past.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Non-blocking peek at the completion.
    pub fn peek(&self) -> Option<RpcResponse> {
        self.shared.state.lock().clone()
    }

    /// Block until the promise completes or the deadline passes.
    ///
    /// At the deadline this force-resolves the promise to TIMEOUT, so the
    /// result is produced exactly once no matter who wins the race: a late
    /// network completion after the deadline loses and is dropped.
    pub fn await_response(self) -> RpcResponse {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(response) = state.as_ref() {
                return response.clone();
            }
            let timed_out = self
                .shared
                .cond
                .wait_until(&mut state, self.deadline)
                .timed_out();
            if timed_out && state.is_none() {
                let response = RpcResponse::timeout();
                *state = Some(response.clone());
                self.shared.cond.notify_all();
                return response;
            }
        }
    }
}

impl fmt::Debug for RpcPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcPromise")
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl fmt::Debug for RpcFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcFuture")
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// How an RPC call wants its result delivered: a promise for synchronous
/// callers, a callback for asynchronous ones. Exactly one of the two.
pub enum RpcCompletion {
    Promise(RpcPromise),
    Callback(Box<dyn FnOnce(RpcResponse) + Send + 'static>),
}

impl RpcCompletion {
    pub fn callback(f: impl FnOnce(RpcResponse) + Send + 'static) -> Self {
        Self::Callback(Box::new(f))
    }

    pub fn is_promise(&self) -> bool {
        matches!(self, Self::Promise(_))
    }

    /// Deliver the result, consuming the completion.
    ///
    /// Promise completions may run on any thread (the waiter is parked on its
    /// own thread); callback completions are expected to be invoked on the
    /// application thread that drains the session's events.
    pub fn complete(self, response: RpcResponse) {
        match self {
            Self::Promise(promise) => {
                promise.try_complete(response);
            }
            Self::Callback(callback) => callback(response),
        }
    }
}

impl fmt::Debug for RpcCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Promise(_) => f.write_str("RpcCompletion::Promise"),
            Self::Callback(_) => f.write_str("RpcCompletion::Callback"),
        }
    }
}

/// Bookkeeping for one outstanding RPC call.
///
/// The completion is consumed on first delivery, but the entry itself stays
/// in the promise map until its deadline passes so that a duplicate response
/// for the same request id is detectable as a protocol violation.
#[derive(Debug)]
pub struct RpcPromiseInfo {
    completion: Option<RpcCompletion>,
    pub deadline: Instant,
}

impl RpcPromiseInfo {
    pub fn new(completion: RpcCompletion, deadline: Instant) -> Self {
        Self {
            completion: Some(completion),
            deadline,
        }
    }

    /// Take the completion if it has not been delivered yet.
    pub fn take_completion(&mut self) -> Option<RpcCompletion> {
        self.completion.take()
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_none()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tether_core::ResultCode;

    use super::*;

    #[test]
    fn completes_exactly_once() {
        let (promise, future) = rpc_promise_pair(Instant::now() + Duration::from_secs(1));
        assert!(promise.try_complete(RpcResponse::success(bytes::Bytes::from_static(b"a"))));
        assert!(!promise.try_complete(RpcResponse::cancelled()));
        let response = future.await_response();
        assert_eq!(response.code, ResultCode::Success);
        assert_eq!(response.body.as_deref(), Some(b"a".as_slice()));
    }

    #[test]
    fn times_out_at_deadline() {
        let deadline = Instant::now() + Duration::from_millis(50);
        let (promise, future) = rpc_promise_pair(deadline);
        let response = future.await_response();
        assert!(Instant::now() >= deadline);
        assert_eq!(response.code, ResultCode::Timeout);
        // The losing late completion is dropped.
        assert!(!promise.try_complete(RpcResponse::cancelled()));
    }

    #[test]
    fn unblocks_waiter_from_another_thread() {
        let (promise, future) = rpc_promise_pair(Instant::now() + Duration::from_secs(5));
        let waiter = std::thread::spawn(move || future.await_response());
        std::thread::sleep(Duration::from_millis(20));
        promise.try_complete(RpcResponse::session_closed());
        let response = waiter.join().unwrap();
        assert_eq!(response.code, ResultCode::SessionClosed);
    }

    #[test]
    fn expired_deadline_returns_immediately() {
        let (_promise, future) = rpc_promise_pair(Instant::now() - Duration::from_millis(1));
        let start = Instant::now();
        let response = future.await_response();
        assert_eq!(response.code, ResultCode::Timeout);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn callback_completion_runs_once() {
        let (tx, rx) = std::sync::mpsc::channel();
        let completion = RpcCompletion::callback(move |response: RpcResponse| {
            tx.send(response.code).unwrap();
        });
        completion.complete(RpcResponse::timeout());
        assert_eq!(rx.recv().unwrap(), ResultCode::Timeout);
    }

    #[test]
    fn promise_info_completion_consumed_once() {
        let (promise, _future) = rpc_promise_pair(Instant::now() + Duration::from_secs(1));
        let mut info = RpcPromiseInfo::new(RpcCompletion::Promise(promise), Instant::now());
        assert!(!info.is_completed());
        assert!(info.take_completion().is_some());
        assert!(info.take_completion().is_none());
        assert!(info.is_completed());
    }
}
