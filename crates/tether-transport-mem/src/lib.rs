//! In-process frame transport.
//!
//! This is the **semantic reference** transport for tether sessions: frames
//! move through async channels with no serialization, and every other
//! transport must behave identically to this one. It doubles as the link
//! layer for same-process sessions and for the test suites, where
//! [`MemTransport::pair`] stands in for a real network and dropping one side
//! models a link failure.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tether_core::{FrameTransport, TransportError};
use tokio::sync::{mpsc, Mutex};

/// Channel capacity per direction. Senders await under backpressure once the
/// peer is this many frames behind.
const CHANNEL_CAPACITY: usize = 64;

/// One endpoint of an in-process frame link.
pub struct MemTransport {
    inner: Arc<MemInner>,
}

struct MemInner {
    /// Frames toward the peer.
    tx: mpsc::Sender<Bytes>,
    /// Frames from the peer.
    rx: Mutex<mpsc::Receiver<Bytes>>,
    /// Close is sticky and shared: either side closing kills both
    /// directions.
    closed: Arc<AtomicBool>,
}

impl MemTransport {
    /// Create a connected pair. Frames sent on one endpoint are received on
    /// the other, in order.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));

        let a = Self {
            inner: Arc::new(MemInner {
                tx: tx_b,
                rx: Mutex::new(rx_a),
                closed: closed.clone(),
            }),
        };
        let b = Self {
            inner: Arc::new(MemInner {
                tx: tx_a,
                rx: Mutex::new(rx_b),
                closed,
            }),
        };
        (a, b)
    }
}

impl FrameTransport for MemTransport {
    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.inner
            .tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv_frame(&self) -> Result<Bytes, TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut rx = self.inner.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use tether_core::boxed;

    use super::*;

    #[tokio::test]
    async fn frames_cross_in_order() {
        let (a, b) = MemTransport::pair();
        a.send_frame(Bytes::from_static(b"one")).await.unwrap();
        a.send_frame(Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(b.recv_frame().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b.recv_frame().await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn both_directions_are_independent() {
        let (a, b) = MemTransport::pair();
        a.send_frame(Bytes::from_static(b"ping")).await.unwrap();
        b.send_frame(Bytes::from_static(b"pong")).await.unwrap();

        assert_eq!(b.recv_frame().await.unwrap(), Bytes::from_static(b"ping"));
        assert_eq!(a.recv_frame().await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn close_is_sticky_and_shared() {
        let (a, b) = MemTransport::pair();
        a.close();
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(matches!(
            a.send_frame(Bytes::new()).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(b.recv_frame().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn dropping_one_side_fails_the_other() {
        let (a, b) = MemTransport::pair();
        drop(a);
        assert!(matches!(b.recv_frame().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn works_behind_the_erased_handle() {
        let (a, b) = MemTransport::pair();
        let a = boxed(a);
        a.send_frame(Bytes::from_static(b"erased")).await.unwrap();
        assert_eq!(b.recv_frame().await.unwrap(), Bytes::from_static(b"erased"));
    }
}
