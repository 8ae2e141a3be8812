//! The reliability handler: the pipeline stage that implements the
//! acknowledged, ordered stream.
//!
//! Outbound, it materializes each logical message into a wire packet at the
//! moment of transmission: the sequence is allocated here, the current ack is
//! piggybacked here, and the sent copy enters the unacked window here.
//! Inbound, it validates the peer's piggybacked ack against the window
//! (violations are fatal), advances the local ack for in-order sequences,
//! drops replayed duplicates, and resolves RPC responses against the
//! correlation map.

use std::ops::ControlFlow;

use tether_core::{Packet, RpcResponse, SessionError};
use tracing::{debug, trace};

use crate::message::{UncommittedMessage, UnsentMessage};
use crate::pipeline::{
    InboundHandler, OutboundHandler, PipelineAction, PipelineCtx, ReadItem, SessionHandler,
    WriteItem,
};

#[derive(Default)]
pub struct ReliabilityHandler;

impl ReliabilityHandler {
    pub fn new() -> Self {
        Self
    }
}

impl SessionHandler for ReliabilityHandler {
    fn name(&self) -> &'static str {
        "reliability"
    }

    fn as_inbound(&mut self) -> Option<&mut dyn InboundHandler> {
        Some(self)
    }

    fn as_outbound(&mut self) -> Option<&mut dyn OutboundHandler> {
        Some(self)
    }
}

impl InboundHandler for ReliabilityHandler {
    fn on_read(
        &mut self,
        ctx: &mut PipelineCtx<'_>,
        item: ReadItem,
    ) -> Result<ControlFlow<(), ReadItem>, SessionError> {
        let packet = match item {
            ReadItem::Packet(packet) if packet.is_ordered() => packet,
            // Handshake packets and already-decoded messages pass through.
            other => return Ok(ControlFlow::Continue(other)),
        };

        // The piggybacked ack prunes our window before anything else; a
        // stale or premature ack is fatal.
        if let Some(ack) = packet.ack() {
            ctx.queue.update_sent_queue(ack)?;
        }

        let sequence = packet.sequence().unwrap_or(0);
        if !ctx.queue.accept_inbound_sequence(sequence) {
            // The peer replays unacked traffic after a reconnect; duplicates
            // are expected there and simply dropped.
            trace!(
                session_id = ctx.info.session_id,
                sequence,
                ack = ctx.queue.ack(),
                "dropping out-of-order packet"
            );
            return Ok(ControlFlow::Break(()));
        }

        match packet {
            Packet::OneWayMessage { body, .. } => Ok(ControlFlow::Continue(ReadItem::Message(
                UncommittedMessage::OneWay { body },
            ))),
            Packet::RpcRequest {
                request_id,
                sync,
                body,
                ..
            } => Ok(ControlFlow::Continue(ReadItem::Message(
                UncommittedMessage::RpcRequest {
                    request_id,
                    sync,
                    body,
                },
            ))),
            Packet::RpcResponse {
                request_id,
                code,
                body,
                ..
            } => {
                match ctx.queue.complete_rpc(request_id)? {
                    Some(completion) => ctx.actions.push(PipelineAction::CompleteRpc {
                        completion,
                        response: RpcResponse::new(code, body),
                    }),
                    None => {
                        // Later than the call's own deadline; stale, not a
                        // violation.
                        debug!(
                            session_id = ctx.info.session_id,
                            request_id, "dropping stale rpc response"
                        );
                    }
                }
                Ok(ControlFlow::Break(()))
            }
            Packet::AckPing { .. } => {
                ctx.actions
                    .push(PipelineAction::WriteMessage(UnsentMessage::AckPong));
                Ok(ControlFlow::Break(()))
            }
            Packet::AckPong { .. } => Ok(ControlFlow::Break(())),
            Packet::ConnectRequest { .. } | Packet::ConnectResponse { .. } => {
                unreachable!("connect packets are not ordered")
            }
        }
    }
}

impl OutboundHandler for ReliabilityHandler {
    fn on_write(
        &mut self,
        ctx: &mut PipelineCtx<'_>,
        item: WriteItem,
    ) -> Result<ControlFlow<(), WriteItem>, SessionError> {
        let message = match item {
            WriteItem::Message(message) => message,
            packet @ WriteItem::Packet(_) => return Ok(ControlFlow::Continue(packet)),
        };

        let sequence = ctx.queue.next_sequence();
        let deadline = ctx.now + ctx.config.ack_timeout;
        let sent = message.into_sent(sequence, deadline);
        let packet = sent.to_packet(ctx.queue.ack(), ctx.codec);
        ctx.queue.push_sent(sent);
        Ok(ControlFlow::Continue(WriteItem::Packet(packet)))
    }
}
