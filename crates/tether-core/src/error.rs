//! Error types.

use core::fmt;

use crate::PacketKind;

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    /// The transport is closed; no further frames can move in either
    /// direction. Sticky.
    Closed,
    Io(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Codec errors raised while turning packets into frames and back.
#[derive(Debug)]
pub enum CodecError {
    /// The frame ended before the packet was complete.
    Truncated,
    /// The frame's kind byte is not part of the packet taxonomy.
    UnknownKind(u8),
    /// A field carried a value outside its closed set.
    InvalidField(&'static str),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated frame"),
            Self::UnknownKind(kind) => write!(f, "unknown packet kind {kind}"),
            Self::InvalidField(field) => write!(f, "invalid value for field `{field}`"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Protocol violations. All of these are fatal to the session: the session is
/// closed rather than the violation being silently ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// The peer acknowledged a sequence outside the outstanding window.
    AckOutOfBounds { ack: u64, lower: u64, upper: u64 },
    /// A second response arrived for a request that already completed.
    DuplicateRpcResponse { request_id: u64 },
    /// A packet kind arrived that the session's role cannot accept.
    UnexpectedPacket { kind: PacketKind },
    /// The handshake token failed validation.
    TokenRejected,
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AckOutOfBounds { ack, lower, upper } => {
                write!(f, "ack {ack} outside valid bound [{lower}, {upper}]")
            }
            Self::DuplicateRpcResponse { request_id } => {
                write!(f, "duplicate response for request {request_id}")
            }
            Self::UnexpectedPacket { kind } => {
                write!(f, "unexpected packet kind {kind:?}")
            }
            Self::TokenRejected => write!(f, "handshake token rejected"),
        }
    }
}

impl std::error::Error for ProtocolViolation {}

/// Session-level errors.
#[derive(Debug)]
pub enum SessionError {
    /// The session is closed (or closing); the operation was not performed.
    Closed,
    /// A buffered sender was used from a thread other than its owner.
    WrongThread,
    /// A blocking wait was attempted on the session's own network worker;
    /// blocking there would deadlock the session.
    BlockedOnWorker,
    /// Too many RPC calls are already outstanding.
    PendingLimit { pending: usize, max: usize },
    /// The inbound commit channel refused the hand-off.
    CommitRejected,
    Protocol(ProtocolViolation),
    Transport(TransportError),
    Codec(CodecError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "session closed"),
            Self::WrongThread => write!(f, "sender used from a non-owner thread"),
            Self::BlockedOnWorker => {
                write!(f, "blocking operation on the session's network worker")
            }
            Self::PendingLimit { pending, max } => {
                write!(f, "too many pending RPC calls ({pending} >= {max})")
            }
            Self::CommitRejected => write!(f, "inbound message could not be committed"),
            Self::Protocol(v) => write!(f, "protocol violation: {v}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Protocol(v) => Some(v),
            Self::Transport(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolViolation> for SessionError {
    fn from(v: ProtocolViolation) -> Self {
        Self::Protocol(v)
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<CodecError> for SessionError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl SessionError {
    /// True when the error must tear the session down rather than be
    /// reported to the single operation that triggered it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}
