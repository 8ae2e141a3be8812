//! Wire packet taxonomy.
//!
//! The session layer produces and consumes exactly these packet kinds at the
//! pipeline/transport boundary. Every ordered packet (everything except the
//! CONNECT pair) carries an `(ack, sequence)` pair for piggyback
//! acknowledgment; payload bodies are opaque [`Bytes`] owned by the
//! application-level codec.

use bytes::Bytes;

use crate::{Guid, ResultCode};

/// Discriminant for [`Packet`], stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    ConnectRequest = 1,
    ConnectResponse = 2,
    RpcRequest = 3,
    RpcResponse = 4,
    OneWayMessage = 5,
    AckPing = 6,
    AckPong = 7,
}

impl PacketKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ConnectRequest),
            2 => Some(Self::ConnectResponse),
            3 => Some(Self::RpcRequest),
            4 => Some(Self::RpcResponse),
            5 => Some(Self::OneWayMessage),
            6 => Some(Self::AckPing),
            7 => Some(Self::AckPong),
            _ => None,
        }
    }
}

/// A decoded wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Handshake: a connecting peer presents its identity and token.
    ///
    /// `snd_token_times` strictly increases per physical reconnect attempt
    /// under the same logical session, letting the receiver discard stale or
    /// duplicate connect requests. `ack` tells the receiver how much of its
    /// outbound traffic the peer had received before the reconnect.
    ConnectRequest {
        client_guid: Guid,
        snd_token_times: u32,
        ack: u64,
        token: Bytes,
    },
    /// Handshake reply. `verifying_times` echoes the request's
    /// `snd_token_times` so the connecting side can discard stale replies.
    ConnectResponse {
        verifying_times: u32,
        success: bool,
        ack: u64,
    },
    /// An RPC request expecting a correlated [`Packet::RpcResponse`].
    RpcRequest {
        ack: u64,
        sequence: u64,
        request_id: u64,
        sync: bool,
        body: Bytes,
    },
    /// The response to a previously received RPC request.
    RpcResponse {
        ack: u64,
        sequence: u64,
        request_id: u64,
        code: ResultCode,
        body: Option<Bytes>,
    },
    /// A message expecting no response.
    OneWayMessage {
        ack: u64,
        sequence: u64,
        body: Bytes,
    },
    /// Heartbeat probe; also drives ack progress on idle sessions.
    AckPing { ack: u64, sequence: u64 },
    /// Heartbeat reply.
    AckPong { ack: u64, sequence: u64 },
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::ConnectRequest { .. } => PacketKind::ConnectRequest,
            Packet::ConnectResponse { .. } => PacketKind::ConnectResponse,
            Packet::RpcRequest { .. } => PacketKind::RpcRequest,
            Packet::RpcResponse { .. } => PacketKind::RpcResponse,
            Packet::OneWayMessage { .. } => PacketKind::OneWayMessage,
            Packet::AckPing { .. } => PacketKind::AckPing,
            Packet::AckPong { .. } => PacketKind::AckPong,
        }
    }

    /// The piggybacked ack, present on every ordered packet.
    pub fn ack(&self) -> Option<u64> {
        match self {
            Packet::ConnectRequest { ack, .. } | Packet::ConnectResponse { ack, .. } => Some(*ack),
            Packet::RpcRequest { ack, .. }
            | Packet::RpcResponse { ack, .. }
            | Packet::OneWayMessage { ack, .. }
            | Packet::AckPing { ack, .. }
            | Packet::AckPong { ack, .. } => Some(*ack),
        }
    }

    /// The per-session sequence number; `None` for the CONNECT pair, which
    /// sits outside the ordered stream.
    pub fn sequence(&self) -> Option<u64> {
        match self {
            Packet::ConnectRequest { .. } | Packet::ConnectResponse { .. } => None,
            Packet::RpcRequest { sequence, .. }
            | Packet::RpcResponse { sequence, .. }
            | Packet::OneWayMessage { sequence, .. }
            | Packet::AckPing { sequence, .. }
            | Packet::AckPong { sequence, .. } => Some(*sequence),
        }
    }

    /// True for packets that participate in the ordered, acknowledged stream.
    pub fn is_ordered(&self) -> bool {
        self.sequence().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_packets_carry_ack_and_sequence() {
        let pkt = Packet::OneWayMessage {
            ack: 7,
            sequence: 9,
            body: Bytes::from_static(b"hi"),
        };
        assert!(pkt.is_ordered());
        assert_eq!(pkt.ack(), Some(7));
        assert_eq!(pkt.sequence(), Some(9));
    }

    #[test]
    fn connect_packets_are_unordered() {
        let pkt = Packet::ConnectResponse {
            verifying_times: 1,
            success: true,
            ack: 0,
        };
        assert!(!pkt.is_ordered());
        assert_eq!(pkt.sequence(), None);
        assert_eq!(pkt.ack(), Some(0));
    }
}
