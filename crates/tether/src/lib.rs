//! Reliable, ordered, RPC-capable sessions over unreliable frame transports.
//!
//! A [`Session`] gives a pair of communicating processes a logical channel
//! with sliding-window reliability (piggybacked acks, replay on reconnect),
//! request/response correlation with deadline-bound results, pluggable
//! send-buffering strategies, and a per-session handler pipeline. One tokio
//! task per session owns all protocol state; application threads talk to it
//! through channels only.
//!
//! ```no_run
//! use bytes::Bytes;
//! use tether::{SessionBuilder, SessionEvent};
//!
//! # async fn demo(transport: tether_core::BoxTransport) {
//! let (session, mut events) = SessionBuilder::new(1, 100, 200)
//!     .connect(Bytes::from_static(b"token"))
//!     .spawn(transport);
//!
//! session.send(Bytes::from_static(b"hello")).unwrap();
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::Message(body) => println!("peer says {body:?}"),
//!         SessionEvent::Rpc { body, responder } => {
//!             responder.respond_success(body); // echo
//!         }
//!     }
//! }
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod event;
pub mod handlers;
pub mod handshake;
pub mod message;
pub mod pipeline;
pub mod promise;
pub mod queue;
pub mod registry;
pub mod sender;
pub mod session;
pub mod timer;

pub use config::{SenderMode, SessionConfig};
pub use event::{RpcResponder, SessionEvent, SessionEvents};
pub use handlers::ReliabilityHandler;
pub use handshake::{AcceptAnyToken, ClientHandshakeHandler, ServerHandshakeHandler, StaticToken, TokenValidator};
pub use pipeline::{
    InboundHandler, OutboundHandler, PipelineAction, PipelineCtx, ReadItem, SessionHandler,
    SessionPipeline, WriteItem,
};
pub use promise::{rpc_promise_pair, RpcCompletion, RpcFuture, RpcPromise};
pub use queue::MessageQueue;
pub use registry::{CodecRegistry, SessionRegistry};
pub use sender::Sender;
pub use session::{Session, SessionBuilder, SessionInfo, SessionPhase, SessionState};

pub use tether_core::{
    BoxTransport, CodecError, FrameCodec, FrameTransport, Guid, Packet, PacketKind, ProtocolCodec,
    ProtocolViolation, ResultCode, RpcResponse, SessionError, SessionId, TransportError,
};
