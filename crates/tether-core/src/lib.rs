//! tether-core: Protocol vocabulary for the tether session runtime.
//!
//! This crate defines:
//! - The wire packet taxonomy ([`Packet`], [`PacketKind`])
//! - RPC result codes and the response envelope ([`ResultCode`], [`RpcResponse`])
//! - The codec capability ([`ProtocolCodec`], [`FrameCodec`])
//! - The transport capability ([`FrameTransport`], [`BoxTransport`])
//! - Error types ([`SessionError`], [`TransportError`], [`CodecError`])
//!
//! The session runtime itself lives in the `tether` crate. Everything here is
//! deliberately transport- and serialization-agnostic: the session layer hands
//! opaque [`bytes::Bytes`] frames to an injected transport and opaque payload
//! bodies to an injected codec, and never inspects either.

#![forbid(unsafe_code)]

mod codec;
mod error;
mod packet;
mod response;
mod result_code;
mod transport;

pub use codec::*;
pub use error::*;
pub use packet::*;
pub use response::*;
pub use result_code::*;
pub use transport::*;

/// Globally unique session identifier, assigned by the caller.
pub type SessionId = u64;

/// Identity of an endpoint (process or logical role) in the framework.
pub type Guid = u64;
