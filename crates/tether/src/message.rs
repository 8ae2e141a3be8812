//! Lifecycle-stage variants of a message in flight.
//!
//! A message is an [`UnsentMessage`] while it sits in the queue, becomes a
//! [`SentMessage`] at the moment of transmission (sequence assigned, current
//! ack attached), and an inbound message is an [`UncommittedMessage`] until
//! it is handed to the application thread. Each stage is single-owner and
//! built/consumed exactly once.

use std::time::Instant;

use bytes::Bytes;
use tether_core::{Packet, ProtocolCodec, ResultCode, RpcResponse};

use crate::promise::RpcCompletion;

/// A message queued but never attempted. Mutable (reorderable) until the
/// moment of transmission.
#[derive(Debug, Clone)]
pub enum UnsentMessage {
    OneWay {
        body: Bytes,
    },
    Rpc {
        request_id: u64,
        sync: bool,
        body: Bytes,
    },
    Response {
        request_id: u64,
        code: ResultCode,
        body: Option<Bytes>,
    },
    AckPing,
    AckPong,
}

impl UnsentMessage {
    /// Synchronous RPC requests jump ahead of buffered one-way traffic.
    pub fn is_urgent(&self) -> bool {
        matches!(self, UnsentMessage::Rpc { sync: true, .. })
    }

    /// Materialize into a [`SentMessage`] at transmission time.
    pub fn into_sent(self, sequence: u64, deadline: Instant) -> SentMessage {
        SentMessage {
            sequence,
            deadline,
            message: self,
        }
    }
}

/// A message transmitted but not yet acknowledged.
///
/// Wire packets are immutable once built, but the piggybacked ack must be
/// current at every (re)transmission, so the sent entry keeps the logical
/// message and builds a fresh transmission copy per send.
#[derive(Debug)]
pub struct SentMessage {
    sequence: u64,
    /// Advisory: the tick scan warns (or closes the session, per config)
    /// when the oldest unacked message outlives this.
    deadline: Instant,
    message: UnsentMessage,
}

impl SentMessage {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Build a transmission copy carrying the current ack.
    pub fn to_packet(&self, ack: u64, codec: &dyn ProtocolCodec) -> Packet {
        match &self.message {
            UnsentMessage::OneWay { body } => Packet::OneWayMessage {
                ack,
                sequence: self.sequence,
                body: codec.clone_body(body),
            },
            UnsentMessage::Rpc {
                request_id,
                sync,
                body,
            } => Packet::RpcRequest {
                ack,
                sequence: self.sequence,
                request_id: *request_id,
                sync: *sync,
                body: codec.clone_body(body),
            },
            UnsentMessage::Response {
                request_id,
                code,
                body,
            } => Packet::RpcResponse {
                ack,
                sequence: self.sequence,
                request_id: *request_id,
                code: *code,
                body: body.as_ref().map(|b| codec.clone_body(b)),
            },
            UnsentMessage::AckPing => Packet::AckPing {
                ack,
                sequence: self.sequence,
            },
            UnsentMessage::AckPong => Packet::AckPong {
                ack,
                sequence: self.sequence,
            },
        }
    }
}

/// An inbound message received on the network worker but not yet handed to
/// the application thread. Exists purely to batch the cross-thread hand-off.
#[derive(Debug)]
pub enum UncommittedMessage {
    OneWay {
        body: Bytes,
    },
    RpcRequest {
        request_id: u64,
        sync: bool,
        body: Bytes,
    },
    /// A completion for an asynchronous call; executed on the application
    /// thread so callbacks never re-enter the network worker.
    RpcCallback {
        completion: RpcCompletion,
        response: RpcResponse,
    },
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tether_core::FrameCodec;

    use super::*;

    #[test]
    fn transmission_copy_carries_current_ack() {
        let codec = FrameCodec::new();
        let sent = UnsentMessage::OneWay {
            body: Bytes::from_static(b"m"),
        }
        .into_sent(5, Instant::now() + Duration::from_secs(1));

        match sent.to_packet(3, &codec) {
            Packet::OneWayMessage { ack, sequence, .. } => {
                assert_eq!(ack, 3);
                assert_eq!(sequence, 5);
            }
            other => panic!("unexpected packet {other:?}"),
        }
        // A later rebuild picks up a newer ack without touching the sequence.
        match sent.to_packet(4, &codec) {
            Packet::OneWayMessage { ack, sequence, .. } => {
                assert_eq!(ack, 4);
                assert_eq!(sequence, 5);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn only_sync_rpc_is_urgent() {
        assert!(UnsentMessage::Rpc {
            request_id: 1,
            sync: true,
            body: Bytes::new()
        }
        .is_urgent());
        assert!(!UnsentMessage::Rpc {
            request_id: 2,
            sync: false,
            body: Bytes::new()
        }
        .is_urgent());
        assert!(!UnsentMessage::OneWay { body: Bytes::new() }.is_urgent());
        assert!(!UnsentMessage::AckPing.is_urgent());
    }
}
