//! The codec capability.
//!
//! The session layer never serializes anything itself: it hands [`Packet`]s
//! to an injected [`ProtocolCodec`] and receives opaque byte frames back.
//! [`FrameCodec`] is the reference codec used by the in-process transport and
//! the test suites; production deployments inject their own.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{CodecError, Packet, PacketKind, ResultCode};

/// Capability consumed by the session layer to cross the byte boundary.
pub trait ProtocolCodec: Send + Sync + 'static {
    /// Encode a packet into a single wire frame.
    fn encode(&self, packet: &Packet) -> Result<Bytes, CodecError>;

    /// Decode a single wire frame into a packet.
    fn decode(&self, frame: Bytes) -> Result<Packet, CodecError>;

    /// Clone an opaque payload body.
    ///
    /// The default is a cheap reference-count bump; codecs backed by pooled
    /// or generation-checked storage override this.
    fn clone_body(&self, body: &Bytes) -> Bytes {
        body.clone()
    }
}

/// Reference codec: fixed-layout little-endian fields, length-prefixed body.
///
/// This is the **semantic reference** for the packet taxonomy. Any other
/// codec must decode what this one encodes to the identical [`Packet`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }

    fn put_body(buf: &mut BytesMut, body: &Bytes) {
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(body);
    }

    fn get_body(frame: &mut Bytes) -> Result<Bytes, CodecError> {
        if frame.remaining() < 4 {
            return Err(CodecError::Truncated);
        }
        let len = frame.get_u32_le() as usize;
        if frame.remaining() < len {
            return Err(CodecError::Truncated);
        }
        Ok(frame.split_to(len))
    }

    fn get_u64(frame: &mut Bytes) -> Result<u64, CodecError> {
        if frame.remaining() < 8 {
            return Err(CodecError::Truncated);
        }
        Ok(frame.get_u64_le())
    }

    fn get_u32(frame: &mut Bytes) -> Result<u32, CodecError> {
        if frame.remaining() < 4 {
            return Err(CodecError::Truncated);
        }
        Ok(frame.get_u32_le())
    }

    fn get_u8(frame: &mut Bytes) -> Result<u8, CodecError> {
        if frame.remaining() < 1 {
            return Err(CodecError::Truncated);
        }
        Ok(frame.get_u8())
    }
}

impl ProtocolCodec for FrameCodec {
    fn encode(&self, packet: &Packet) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(packet.kind() as u8);
        match packet {
            Packet::ConnectRequest {
                client_guid,
                snd_token_times,
                ack,
                token,
            } => {
                buf.put_u64_le(*client_guid);
                buf.put_u32_le(*snd_token_times);
                buf.put_u64_le(*ack);
                Self::put_body(&mut buf, token);
            }
            Packet::ConnectResponse {
                verifying_times,
                success,
                ack,
            } => {
                buf.put_u32_le(*verifying_times);
                buf.put_u8(u8::from(*success));
                buf.put_u64_le(*ack);
            }
            Packet::RpcRequest {
                ack,
                sequence,
                request_id,
                sync,
                body,
            } => {
                buf.put_u64_le(*ack);
                buf.put_u64_le(*sequence);
                buf.put_u64_le(*request_id);
                buf.put_u8(u8::from(*sync));
                Self::put_body(&mut buf, body);
            }
            Packet::RpcResponse {
                ack,
                sequence,
                request_id,
                code,
                body,
            } => {
                buf.put_u64_le(*ack);
                buf.put_u64_le(*sequence);
                buf.put_u64_le(*request_id);
                buf.put_u8(*code as u8);
                match body {
                    Some(body) => {
                        buf.put_u8(1);
                        Self::put_body(&mut buf, body);
                    }
                    None => buf.put_u8(0),
                }
            }
            Packet::OneWayMessage {
                ack,
                sequence,
                body,
            } => {
                buf.put_u64_le(*ack);
                buf.put_u64_le(*sequence);
                Self::put_body(&mut buf, body);
            }
            Packet::AckPing { ack, sequence } | Packet::AckPong { ack, sequence } => {
                buf.put_u64_le(*ack);
                buf.put_u64_le(*sequence);
            }
        }
        Ok(buf.freeze())
    }

    fn decode(&self, mut frame: Bytes) -> Result<Packet, CodecError> {
        let kind = Self::get_u8(&mut frame)?;
        let kind = PacketKind::from_u8(kind).ok_or(CodecError::UnknownKind(kind))?;
        let packet = match kind {
            PacketKind::ConnectRequest => Packet::ConnectRequest {
                client_guid: Self::get_u64(&mut frame)?,
                snd_token_times: Self::get_u32(&mut frame)?,
                ack: Self::get_u64(&mut frame)?,
                token: Self::get_body(&mut frame)?,
            },
            PacketKind::ConnectResponse => Packet::ConnectResponse {
                verifying_times: Self::get_u32(&mut frame)?,
                success: Self::get_u8(&mut frame)? != 0,
                ack: Self::get_u64(&mut frame)?,
            },
            PacketKind::RpcRequest => Packet::RpcRequest {
                ack: Self::get_u64(&mut frame)?,
                sequence: Self::get_u64(&mut frame)?,
                request_id: Self::get_u64(&mut frame)?,
                sync: Self::get_u8(&mut frame)? != 0,
                body: Self::get_body(&mut frame)?,
            },
            PacketKind::RpcResponse => {
                let ack = Self::get_u64(&mut frame)?;
                let sequence = Self::get_u64(&mut frame)?;
                let request_id = Self::get_u64(&mut frame)?;
                let code = ResultCode::from_u8(Self::get_u8(&mut frame)?)
                    .ok_or(CodecError::InvalidField("code"))?;
                let body = if Self::get_u8(&mut frame)? != 0 {
                    Some(Self::get_body(&mut frame)?)
                } else {
                    None
                };
                Packet::RpcResponse {
                    ack,
                    sequence,
                    request_id,
                    code,
                    body,
                }
            }
            PacketKind::OneWayMessage => Packet::OneWayMessage {
                ack: Self::get_u64(&mut frame)?,
                sequence: Self::get_u64(&mut frame)?,
                body: Self::get_body(&mut frame)?,
            },
            PacketKind::AckPing => Packet::AckPing {
                ack: Self::get_u64(&mut frame)?,
                sequence: Self::get_u64(&mut frame)?,
            },
            PacketKind::AckPong => Packet::AckPong {
                ack: Self::get_u64(&mut frame)?,
                sequence: Self::get_u64(&mut frame)?,
            },
        };
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: Packet) {
        let codec = FrameCodec::new();
        let frame = codec.encode(&packet).unwrap();
        let decoded = codec.decode(frame).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn connect_pair() {
        round_trip(Packet::ConnectRequest {
            client_guid: 42,
            snd_token_times: 3,
            ack: 17,
            token: Bytes::from_static(b"tok"),
        });
        round_trip(Packet::ConnectResponse {
            verifying_times: 3,
            success: true,
            ack: 17,
        });
    }

    #[test]
    fn rpc_response_without_body() {
        round_trip(Packet::RpcResponse {
            ack: 1,
            sequence: 2,
            request_id: 3,
            code: ResultCode::CommitFailed,
            body: None,
        });
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let codec = FrameCodec::new();
        let frame = codec
            .encode(&Packet::OneWayMessage {
                ack: 1,
                sequence: 2,
                body: Bytes::from_static(b"payload"),
            })
            .unwrap();
        let cut = frame.slice(..frame.len() - 3);
        assert!(matches!(codec.decode(cut), Err(CodecError::Truncated)));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let codec = FrameCodec::new();
        let frame = Bytes::from_static(&[0xEE, 0, 0, 0]);
        assert!(matches!(
            codec.decode(frame),
            Err(CodecError::UnknownKind(0xEE))
        ));
    }
}
