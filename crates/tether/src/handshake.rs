//! Connect / reconnect handshake.
//!
//! A connecting peer presents `(client_guid, snd_token_times, ack, token)`.
//! `snd_token_times` strictly increases per physical reconnect attempt under
//! the same logical session, which lets the accepting side discard stale or
//! duplicate connect requests. The accepting side validates the token and
//! replies `(verifying_times, success, ack)`; on success both sides prune
//! their unacked window against the peer's ack, replay whatever is still
//! outstanding, and transition BOUND -> CONNECTED exactly once no matter how
//! many physical reconnects follow.

use std::ops::ControlFlow;

use bytes::Bytes;
use tether_core::{Guid, Packet, ProtocolViolation, SessionError};
use tracing::{debug, info, warn};

use crate::pipeline::{
    InboundHandler, PipelineAction, PipelineCtx, ReadItem, SessionHandler,
};

/// Validates the credential a connecting peer presents.
pub trait TokenValidator: Send + 'static {
    fn validate(&self, client_guid: Guid, token: &[u8]) -> bool;
}

/// Accepts every token. For trusted in-process wiring and tests.
pub struct AcceptAnyToken;

impl TokenValidator for AcceptAnyToken {
    fn validate(&self, _client_guid: Guid, _token: &[u8]) -> bool {
        true
    }
}

/// Accepts only an exact pre-shared token.
pub struct StaticToken(pub Bytes);

impl TokenValidator for StaticToken {
    fn validate(&self, _client_guid: Guid, token: &[u8]) -> bool {
        self.0.as_ref() == token
    }
}

/// Connecting-side handshake. Sends a CONNECT_REQUEST on every transport
/// bind and waits for the matching CONNECT_RESPONSE.
pub struct ClientHandshakeHandler {
    token: Bytes,
    /// Incremented per physical connect attempt; never reset.
    snd_token_times: u32,
}

impl ClientHandshakeHandler {
    pub fn new(token: Bytes) -> Self {
        Self {
            token,
            snd_token_times: 0,
        }
    }
}

impl SessionHandler for ClientHandshakeHandler {
    fn name(&self) -> &'static str {
        "handshake-client"
    }

    fn as_inbound(&mut self) -> Option<&mut dyn InboundHandler> {
        Some(self)
    }
}

impl InboundHandler for ClientHandshakeHandler {
    fn on_bound(&mut self, ctx: &mut PipelineCtx<'_>) -> Result<(), SessionError> {
        self.snd_token_times += 1;
        debug!(
            session_id = ctx.info.session_id,
            attempt = self.snd_token_times,
            "sending connect request"
        );
        ctx.actions
            .push(PipelineAction::WritePacket(Packet::ConnectRequest {
                client_guid: ctx.info.local_guid,
                snd_token_times: self.snd_token_times,
                ack: ctx.queue.ack(),
                token: self.token.clone(),
            }));
        Ok(())
    }

    fn on_read(
        &mut self,
        ctx: &mut PipelineCtx<'_>,
        item: ReadItem,
    ) -> Result<ControlFlow<(), ReadItem>, SessionError> {
        let (verifying_times, success, ack) = match item {
            ReadItem::Packet(Packet::ConnectResponse {
                verifying_times,
                success,
                ack,
            }) => (verifying_times, success, ack),
            ReadItem::Packet(Packet::ConnectRequest { .. }) => {
                return Err(ProtocolViolation::UnexpectedPacket {
                    kind: tether_core::PacketKind::ConnectRequest,
                }
                .into());
            }
            other => return Ok(ControlFlow::Continue(other)),
        };

        if verifying_times != self.snd_token_times {
            // A reply to an earlier attempt that lost the race.
            debug!(
                session_id = ctx.info.session_id,
                verifying_times,
                current = self.snd_token_times,
                "dropping stale connect response"
            );
            return Ok(ControlFlow::Break(()));
        }
        if !success {
            return Err(ProtocolViolation::TokenRejected.into());
        }

        ctx.queue.update_sent_queue(ack)?;
        replay_outstanding(ctx);
        ctx.actions.push(PipelineAction::Activate);
        Ok(ControlFlow::Break(()))
    }
}

/// Accepting-side handshake. Validates tokens and answers connect requests.
pub struct ServerHandshakeHandler {
    validator: Box<dyn TokenValidator>,
    /// Highest `snd_token_times` verified so far; earlier values are stale.
    verified_times: u32,
}

impl ServerHandshakeHandler {
    pub fn new(validator: Box<dyn TokenValidator>) -> Self {
        Self {
            validator,
            verified_times: 0,
        }
    }
}

impl SessionHandler for ServerHandshakeHandler {
    fn name(&self) -> &'static str {
        "handshake-server"
    }

    fn as_inbound(&mut self) -> Option<&mut dyn InboundHandler> {
        Some(self)
    }
}

impl InboundHandler for ServerHandshakeHandler {
    fn on_read(
        &mut self,
        ctx: &mut PipelineCtx<'_>,
        item: ReadItem,
    ) -> Result<ControlFlow<(), ReadItem>, SessionError> {
        let (client_guid, snd_token_times, ack, token) = match item {
            ReadItem::Packet(Packet::ConnectRequest {
                client_guid,
                snd_token_times,
                ack,
                token,
            }) => (client_guid, snd_token_times, ack, token),
            ReadItem::Packet(Packet::ConnectResponse { .. }) => {
                return Err(ProtocolViolation::UnexpectedPacket {
                    kind: tether_core::PacketKind::ConnectResponse,
                }
                .into());
            }
            other => return Ok(ControlFlow::Continue(other)),
        };

        if snd_token_times <= self.verified_times {
            debug!(
                session_id = ctx.info.session_id,
                snd_token_times,
                verified = self.verified_times,
                "dropping stale connect request"
            );
            return Ok(ControlFlow::Break(()));
        }

        if !self.validator.validate(client_guid, &token) {
            warn!(
                session_id = ctx.info.session_id,
                client_guid, "rejecting connect request, token invalid"
            );
            ctx.actions
                .push(PipelineAction::WritePacket(Packet::ConnectResponse {
                    verifying_times: snd_token_times,
                    success: false,
                    ack: ctx.queue.ack(),
                }));
            return Err(ProtocolViolation::TokenRejected.into());
        }

        self.verified_times = snd_token_times;
        ctx.queue.update_sent_queue(ack)?;

        info!(
            session_id = ctx.info.session_id,
            client_guid, snd_token_times, "connect request accepted"
        );
        ctx.actions
            .push(PipelineAction::WritePacket(Packet::ConnectResponse {
                verifying_times: snd_token_times,
                success: true,
                ack: ctx.queue.ack(),
            }));
        replay_outstanding(ctx);
        ctx.actions.push(PipelineAction::Activate);
        Ok(ControlFlow::Break(()))
    }
}

/// Replay every still-unacked sent message on the fresh transport, each
/// rebuilt with the current ack.
fn replay_outstanding(ctx: &mut PipelineCtx<'_>) {
    let ack = ctx.queue.ack();
    let replayed = ctx.queue.sent_len();
    for sent in ctx.queue.sent_messages() {
        ctx.actions
            .push(PipelineAction::WritePacket(sent.to_packet(ack, ctx.codec)));
    }
    if replayed > 0 {
        info!(
            session_id = ctx.info.session_id,
            replayed, "replaying unacked messages after reconnect"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tether_core::FrameCodec;

    use super::*;
    use crate::config::SessionConfig;
    use crate::message::UnsentMessage;
    use crate::pipeline::SessionPipeline;
    use crate::queue::MessageQueue;
    use crate::session::{SessionInfo, SessionState};

    struct Fixture {
        info: SessionInfo,
        config: SessionConfig,
        state: SessionState,
        queue: MessageQueue,
        codec: FrameCodec,
        outgoing: Vec<Bytes>,
        actions: Vec<PipelineAction>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                info: SessionInfo {
                    session_id: 1,
                    local_guid: 10,
                    remote_guid: 20,
                },
                config: SessionConfig::default(),
                state: SessionState::new(),
                queue: MessageQueue::new(),
                codec: FrameCodec::new(),
                outgoing: Vec::new(),
                actions: Vec::new(),
            }
        }

        fn ctx(&mut self) -> PipelineCtx<'_> {
            PipelineCtx {
                info: &self.info,
                config: &self.config,
                state: &self.state,
                queue: &mut self.queue,
                codec: &self.codec,
                outgoing: &mut self.outgoing,
                actions: &mut self.actions,
                now: Instant::now(),
            }
        }
    }

    fn server_pipeline(validator: Box<dyn TokenValidator>) -> SessionPipeline {
        let mut pipeline = SessionPipeline::new();
        pipeline.add_last(Box::new(ServerHandshakeHandler::new(validator)));
        pipeline
    }

    fn connect_request(times: u32, token: &'static [u8]) -> Packet {
        Packet::ConnectRequest {
            client_guid: 10,
            snd_token_times: times,
            ack: 0,
            token: Bytes::from_static(token),
        }
    }

    #[test]
    fn valid_token_activates_and_replies_success() {
        let mut pipeline = server_pipeline(Box::new(StaticToken(Bytes::from_static(b"secret"))));
        let mut fixture = Fixture::new();

        pipeline.fire_read(&mut fixture.ctx(), connect_request(1, b"secret"));

        assert!(matches!(
            fixture.actions.as_slice(),
            [
                PipelineAction::WritePacket(Packet::ConnectResponse {
                    verifying_times: 1,
                    success: true,
                    ..
                }),
                PipelineAction::Activate,
            ]
        ));
    }

    #[test]
    fn invalid_token_replies_failure_and_closes() {
        let mut pipeline = server_pipeline(Box::new(StaticToken(Bytes::from_static(b"secret"))));
        let mut fixture = Fixture::new();

        pipeline.fire_read(&mut fixture.ctx(), connect_request(1, b"wrong"));

        assert!(matches!(
            fixture.actions.as_slice(),
            [
                PipelineAction::WritePacket(Packet::ConnectResponse { success: false, .. }),
                PipelineAction::Close,
            ]
        ));
    }

    #[test]
    fn stale_connect_request_is_dropped() {
        let mut pipeline = server_pipeline(Box::new(AcceptAnyToken));
        let mut fixture = Fixture::new();

        pipeline.fire_read(&mut fixture.ctx(), connect_request(2, b""));
        fixture.actions.clear();

        // Same and lower attempt numbers are duplicates from the network.
        pipeline.fire_read(&mut fixture.ctx(), connect_request(2, b""));
        pipeline.fire_read(&mut fixture.ctx(), connect_request(1, b""));
        assert!(fixture.actions.is_empty());

        // A higher attempt number is a genuine reconnect.
        pipeline.fire_read(&mut fixture.ctx(), connect_request(3, b""));
        assert!(fixture
            .actions
            .iter()
            .any(|a| matches!(a, PipelineAction::Activate)));
    }

    #[test]
    fn client_sends_connect_request_per_bind() {
        let mut pipeline = SessionPipeline::new();
        pipeline.add_last(Box::new(ClientHandshakeHandler::new(Bytes::from_static(
            b"tok",
        ))));
        let mut fixture = Fixture::new();

        pipeline.fire_bound(&mut fixture.ctx());
        pipeline.fire_bound(&mut fixture.ctx());

        let times: Vec<u32> = fixture
            .actions
            .iter()
            .filter_map(|a| match a {
                PipelineAction::WritePacket(Packet::ConnectRequest {
                    snd_token_times, ..
                }) => Some(*snd_token_times),
                _ => None,
            })
            .collect();
        assert_eq!(times, vec![1, 2]);
    }

    #[test]
    fn reconnect_prunes_and_replays_the_unacked_window() {
        let mut pipeline = SessionPipeline::new();
        pipeline.add_last(Box::new(ClientHandshakeHandler::new(Bytes::new())));
        let mut fixture = Fixture::new();

        // Three messages in flight, none acked.
        for _ in 0..3 {
            let sequence = fixture.queue.next_sequence();
            fixture.queue.push_sent(
                UnsentMessage::OneWay {
                    body: Bytes::from_static(b"x"),
                }
                .into_sent(sequence, Instant::now() + Duration::from_secs(10)),
            );
        }

        pipeline.fire_bound(&mut fixture.ctx());
        fixture.actions.clear();

        // The peer had received sequence 1 before the link dropped.
        pipeline.fire_read(
            &mut fixture.ctx(),
            Packet::ConnectResponse {
                verifying_times: 1,
                success: true,
                ack: 1,
            },
        );

        let replayed: Vec<u64> = fixture
            .actions
            .iter()
            .filter_map(|a| match a {
                PipelineAction::WritePacket(packet) => packet.sequence(),
                _ => None,
            })
            .collect();
        assert_eq!(replayed, vec![2, 3]);
        assert!(matches!(
            fixture.actions.last(),
            Some(PipelineAction::Activate)
        ));
    }

    #[test]
    fn stale_connect_response_is_dropped() {
        let mut pipeline = SessionPipeline::new();
        pipeline.add_last(Box::new(ClientHandshakeHandler::new(Bytes::new())));
        let mut fixture = Fixture::new();

        pipeline.fire_bound(&mut fixture.ctx());
        pipeline.fire_bound(&mut fixture.ctx());
        fixture.actions.clear();

        pipeline.fire_read(
            &mut fixture.ctx(),
            Packet::ConnectResponse {
                verifying_times: 1,
                success: true,
                ack: 0,
            },
        );
        assert!(fixture.actions.is_empty());
    }

    #[test]
    fn rejected_token_closes_the_connecting_side() {
        let mut pipeline = SessionPipeline::new();
        pipeline.add_last(Box::new(ClientHandshakeHandler::new(Bytes::new())));
        let mut fixture = Fixture::new();

        pipeline.fire_bound(&mut fixture.ctx());
        fixture.actions.clear();

        pipeline.fire_read(
            &mut fixture.ctx(),
            Packet::ConnectResponse {
                verifying_times: 1,
                success: false,
                ack: 0,
            },
        );
        assert!(matches!(
            fixture.actions.as_slice(),
            [PipelineAction::Close]
        ));
    }
}
