//! The transport capability.
//!
//! The session layer consumes the transport as an opaque deliverer of byte
//! frames. Methods take `&self`: implementations keep their I/O state behind
//! interior mutability so the session worker can interleave sends and
//! receives without splitting the transport.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::TransportError;

/// An ordered, connection-oriented deliverer of byte frames.
///
/// Frame boundaries are preserved: one `send_frame` on one side is one
/// `recv_frame` on the other. Loss shows up as [`TransportError::Closed`],
/// after which the session may be rebound to a replacement transport.
pub trait FrameTransport: Send + Sync + 'static {
    /// Send one frame. Awaits under backpressure.
    fn send_frame(&self, frame: Bytes) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next frame.
    fn recv_frame(&self) -> impl Future<Output = Result<Bytes, TransportError>> + Send;

    /// Signal close. Non-blocking; sticky.
    fn close(&self);

    /// True once the transport is closed or failed.
    fn is_closed(&self) -> bool;
}

/// Object-safe form of [`FrameTransport`], used where the session worker
/// must own an arbitrary transport behind one type.
pub trait DynFrameTransport: Send + Sync {
    fn send_frame(&self, frame: Bytes) -> BoxFuture<'_, Result<(), TransportError>>;
    fn recv_frame(&self) -> BoxFuture<'_, Result<Bytes, TransportError>>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

impl<T: FrameTransport> DynFrameTransport for T {
    fn send_frame(&self, frame: Bytes) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(FrameTransport::send_frame(self, frame))
    }

    fn recv_frame(&self) -> BoxFuture<'_, Result<Bytes, TransportError>> {
        Box::pin(FrameTransport::recv_frame(self))
    }

    fn close(&self) {
        FrameTransport::close(self)
    }

    fn is_closed(&self) -> bool {
        FrameTransport::is_closed(self)
    }
}

/// Shared handle to a type-erased transport.
pub type BoxTransport = Arc<dyn DynFrameTransport>;

/// Erase a concrete transport.
pub fn boxed<T: FrameTransport>(transport: T) -> BoxTransport {
    Arc::new(transport)
}
