//! Per-session sliding-window state.
//!
//! The [`MessageQueue`] is owned exclusively by its session's network worker
//! and is never shared: all access happens on that worker, so there is no
//! locking here at all.

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use tether_core::{ProtocolViolation, RpcResponse};

use crate::message::{SentMessage, UncommittedMessage, UnsentMessage};
use crate::promise::{RpcCompletion, RpcPromiseInfo};

/// Sliding-window bookkeeping for one session.
#[derive(Debug, Default)]
pub struct MessageQueue {
    /// Last allocated outbound sequence number; source of truth for the next.
    sequencer: u64,
    /// Highest peer sequence received in order; piggybacked on every
    /// outbound ordered packet. Only ever moves forward.
    ack: u64,
    /// Transmitted but not yet acknowledged, oldest first.
    sent_queue: VecDeque<SentMessage>,
    /// Queued but never attempted; reorderable until transmission.
    unsent_queue: VecDeque<UnsentMessage>,
    /// Received but not yet handed to the application thread.
    uncommitted_queue: Vec<UncommittedMessage>,
    /// Outstanding RPC calls. Keyed by the monotonically allocated request
    /// id, so ascending iteration order is insertion order and earlier
    /// requests are always scanned (and expired) first.
    rpc_promise_info: BTreeMap<u64, RpcPromiseInfo>,
    next_request_id: u64,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next outbound sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        self.sequencer += 1;
        self.sequencer
    }

    pub fn sequencer(&self) -> u64 {
        self.sequencer
    }

    /// The ack to piggyback on outbound packets.
    pub fn ack(&self) -> u64 {
        self.ack
    }

    /// Allocate a request id for a new RPC call.
    pub fn next_request_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    // ------------------------------------------------------------------
    // Outbound window
    // ------------------------------------------------------------------

    /// Lowest acceptable peer ack: one before the oldest outstanding
    /// sequence, or the last allocated sequence when nothing is outstanding.
    pub fn ack_lower_bound(&self) -> u64 {
        match self.sent_queue.front() {
            Some(first) => first.sequence() - 1,
            None => self.sequencer,
        }
    }

    /// Highest acceptable peer ack: the newest outstanding sequence, or the
    /// last allocated sequence when nothing is outstanding.
    pub fn ack_upper_bound(&self) -> u64 {
        match self.sent_queue.back() {
            Some(last) => last.sequence(),
            None => self.sequencer,
        }
    }

    /// Validate a peer-supplied ack against the outstanding window.
    pub fn is_ack_ok(&self, ack: u64) -> bool {
        ack >= self.ack_lower_bound() && ack <= self.ack_upper_bound()
    }

    /// Drop every sent entry with `sequence <= ack` from the front of the
    /// sent queue. An ack outside the valid bound is a protocol violation
    /// and is fatal to the session.
    pub fn update_sent_queue(&mut self, ack: u64) -> Result<(), ProtocolViolation> {
        if !self.is_ack_ok(ack) {
            return Err(ProtocolViolation::AckOutOfBounds {
                ack,
                lower: self.ack_lower_bound(),
                upper: self.ack_upper_bound(),
            });
        }
        while let Some(first) = self.sent_queue.front() {
            if first.sequence() > ack {
                break;
            }
            self.sent_queue.pop_front();
        }
        Ok(())
    }

    pub fn push_sent(&mut self, sent: SentMessage) {
        debug_assert!(self
            .sent_queue
            .back()
            .map(|last| last.sequence() < sent.sequence())
            .unwrap_or(true));
        self.sent_queue.push_back(sent);
    }

    pub fn sent_len(&self) -> usize {
        self.sent_queue.len()
    }

    /// Outstanding messages, oldest first; used for reconnect replay.
    pub fn sent_messages(&self) -> impl Iterator<Item = &SentMessage> {
        self.sent_queue.iter()
    }

    /// Deadline of the oldest unacked message, if any.
    pub fn oldest_sent_deadline(&self) -> Option<Instant> {
        self.sent_queue.front().map(|m| m.deadline())
    }

    // ------------------------------------------------------------------
    // Inbound window
    // ------------------------------------------------------------------

    /// Record an inbound ordered sequence. Returns `true` and advances the
    /// ack only for the next expected sequence; duplicates and gaps are
    /// rejected (the peer replays unacked traffic after a reconnect).
    pub fn accept_inbound_sequence(&mut self, sequence: u64) -> bool {
        if sequence == self.ack + 1 {
            self.ack = sequence;
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Unsent / uncommitted exchange
    // ------------------------------------------------------------------

    /// Queue an outbound message. Urgent messages (synchronous RPC) are
    /// inserted ahead of ordinary traffic but behind earlier urgent entries,
    /// so urgency never reorders two synchronous calls.
    pub fn push_unsent(&mut self, message: UnsentMessage) {
        if message.is_urgent() {
            let at = self
                .unsent_queue
                .iter()
                .take_while(|m| m.is_urgent())
                .count();
            self.unsent_queue.insert(at, message);
        } else {
            self.unsent_queue.push_back(message);
        }
    }

    pub fn pop_unsent(&mut self) -> Option<UnsentMessage> {
        self.unsent_queue.pop_front()
    }

    pub fn unsent_len(&self) -> usize {
        self.unsent_queue.len()
    }

    /// Swap the unsent queue for an empty one, returning the old contents.
    pub fn exchange_unsent(&mut self) -> VecDeque<UnsentMessage> {
        std::mem::take(&mut self.unsent_queue)
    }

    pub fn push_uncommitted(&mut self, message: UncommittedMessage) {
        self.uncommitted_queue.push(message);
    }

    pub fn has_uncommitted(&self) -> bool {
        !self.uncommitted_queue.is_empty()
    }

    /// Swap the uncommitted queue for an empty one, returning the old
    /// contents for one batched hand-off to the application thread.
    pub fn exchange_uncommitted(&mut self) -> Vec<UncommittedMessage> {
        std::mem::take(&mut self.uncommitted_queue)
    }

    // ------------------------------------------------------------------
    // RPC correlation
    // ------------------------------------------------------------------

    pub fn register_rpc(&mut self, request_id: u64, info: RpcPromiseInfo) {
        let prev = self.rpc_promise_info.insert(request_id, info);
        debug_assert!(prev.is_none(), "request id {request_id} reused");
    }

    /// Outstanding (not yet completed) RPC calls.
    pub fn rpc_pending(&self) -> usize {
        self.rpc_promise_info
            .values()
            .filter(|info| !info.is_completed())
            .count()
    }

    /// Resolve an inbound response against the correlation map.
    ///
    /// Returns the completion to deliver, `None` when the entry already
    /// expired (a response later than the call's own deadline is stale, not
    /// a violation), and an error when the entry exists but was already
    /// completed: a duplicate response is a protocol violation.
    pub fn complete_rpc(
        &mut self,
        request_id: u64,
    ) -> Result<Option<RpcCompletion>, ProtocolViolation> {
        match self.rpc_promise_info.get_mut(&request_id) {
            None => Ok(None),
            Some(info) => match info.take_completion() {
                Some(completion) => Ok(Some(completion)),
                None => Err(ProtocolViolation::DuplicateRpcResponse { request_id }),
            },
        }
    }

    /// Expire RPC entries in insertion order. Entries past their deadline
    /// that were never completed yield their completion (to be resolved to
    /// TIMEOUT); entries kept only for duplicate detection are dropped.
    pub fn drain_expired_rpc(&mut self, now: Instant) -> Vec<RpcCompletion> {
        let expired: Vec<u64> = self
            .rpc_promise_info
            .iter()
            .filter(|(_, info)| info.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut timed_out = Vec::new();
        for id in expired {
            if let Some(mut info) = self.rpc_promise_info.remove(&id) {
                if let Some(completion) = info.take_completion() {
                    timed_out.push(completion);
                }
            }
        }
        timed_out
    }

    /// Take every undelivered completion; used at session teardown to
    /// resolve all outstanding calls to SESSION_CLOSED.
    pub fn take_all_rpc(&mut self) -> Vec<RpcCompletion> {
        let mut completions = Vec::new();
        for (_, mut info) in std::mem::take(&mut self.rpc_promise_info) {
            if let Some(completion) = info.take_completion() {
                completions.push(completion);
            }
        }
        completions
    }

    /// Resolve the session-closed envelope for a completion; small helper so
    /// teardown call sites stay terse.
    pub fn closed_response() -> RpcResponse {
        RpcResponse::session_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tether_core::ResultCode;

    use super::*;
    use crate::promise::rpc_promise_pair;

    fn sent(queue: &mut MessageQueue, n: usize) {
        for _ in 0..n {
            let sequence = queue.next_sequence();
            let message = UnsentMessage::OneWay {
                body: Bytes::from_static(b"x"),
            }
            .into_sent(sequence, Instant::now() + Duration::from_secs(10));
            queue.push_sent(message);
        }
    }

    #[test]
    fn ack_prunes_only_the_acked_prefix() {
        let mut queue = MessageQueue::new();
        sent(&mut queue, 3); // sequences 1, 2, 3

        queue.update_sent_queue(2).unwrap();
        assert_eq!(queue.sent_len(), 1);
        assert_eq!(queue.sent_messages().next().unwrap().sequence(), 3);

        queue.update_sent_queue(3).unwrap();
        assert_eq!(queue.sent_len(), 0);
    }

    #[test]
    fn monotone_acks_keep_only_newer_entries() {
        let mut queue = MessageQueue::new();
        sent(&mut queue, 5);
        for ack in [1u64, 1, 3, 5] {
            queue.update_sent_queue(ack).unwrap();
            assert!(queue.sent_messages().all(|m| m.sequence() > ack));
        }
    }

    #[test]
    fn out_of_bound_ack_is_a_violation() {
        let mut queue = MessageQueue::new();
        sent(&mut queue, 3);
        queue.update_sent_queue(2).unwrap();

        // Stale: below the window (lower bound is now 2).
        let err = queue.update_sent_queue(1).unwrap_err();
        assert!(matches!(err, ProtocolViolation::AckOutOfBounds { .. }));

        // Premature: acks a sequence never sent.
        let err = queue.update_sent_queue(4).unwrap_err();
        assert!(matches!(
            err,
            ProtocolViolation::AckOutOfBounds {
                ack: 4,
                lower: 2,
                upper: 3
            }
        ));
    }

    #[test]
    fn empty_window_accepts_only_the_last_allocated_sequence() {
        let mut queue = MessageQueue::new();
        assert!(queue.is_ack_ok(0));
        sent(&mut queue, 2);
        queue.update_sent_queue(2).unwrap();
        // Window empty again: only ack == sequencer is acceptable.
        assert!(queue.is_ack_ok(2));
        assert!(!queue.is_ack_ok(1));
        assert!(!queue.is_ack_ok(3));
    }

    #[test]
    fn inbound_sequence_must_be_next_expected() {
        let mut queue = MessageQueue::new();
        assert!(queue.accept_inbound_sequence(1));
        assert_eq!(queue.ack(), 1);
        // Duplicate.
        assert!(!queue.accept_inbound_sequence(1));
        // Gap.
        assert!(!queue.accept_inbound_sequence(3));
        assert_eq!(queue.ack(), 1);
        assert!(queue.accept_inbound_sequence(2));
        assert_eq!(queue.ack(), 2);
    }

    #[test]
    fn urgent_messages_jump_ahead_but_stay_ordered_among_themselves() {
        let mut queue = MessageQueue::new();
        queue.push_unsent(UnsentMessage::OneWay {
            body: Bytes::from_static(b"a"),
        });
        queue.push_unsent(UnsentMessage::Rpc {
            request_id: 1,
            sync: true,
            body: Bytes::new(),
        });
        queue.push_unsent(UnsentMessage::Rpc {
            request_id: 2,
            sync: true,
            body: Bytes::new(),
        });

        match queue.pop_unsent().unwrap() {
            UnsentMessage::Rpc { request_id, .. } => assert_eq!(request_id, 1),
            other => panic!("unexpected {other:?}"),
        }
        match queue.pop_unsent().unwrap() {
            UnsentMessage::Rpc { request_id, .. } => assert_eq!(request_id, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            queue.pop_unsent().unwrap(),
            UnsentMessage::OneWay { .. }
        ));
    }

    #[test]
    fn exchange_swaps_in_an_empty_queue() {
        let mut queue = MessageQueue::new();
        queue.push_uncommitted(UncommittedMessage::OneWay {
            body: Bytes::from_static(b"m"),
        });
        let batch = queue.exchange_uncommitted();
        assert_eq!(batch.len(), 1);
        assert!(!queue.has_uncommitted());
    }

    #[test]
    fn duplicate_response_is_a_violation_while_the_entry_lives() {
        let mut queue = MessageQueue::new();
        let (promise, _future) = rpc_promise_pair(Instant::now() + Duration::from_secs(1));
        let id = queue.next_request_id();
        queue.register_rpc(
            id,
            RpcPromiseInfo::new(
                RpcCompletion::Promise(promise),
                Instant::now() + Duration::from_secs(1),
            ),
        );

        assert!(queue.complete_rpc(id).unwrap().is_some());
        assert!(matches!(
            queue.complete_rpc(id),
            Err(ProtocolViolation::DuplicateRpcResponse { .. })
        ));
        // An id that never existed (or already expired) is stale, not fatal.
        assert!(queue.complete_rpc(9999).unwrap().is_none());
    }

    #[test]
    fn expiry_scan_completes_earlier_requests_first() {
        let mut queue = MessageQueue::new();
        let now = Instant::now();
        let mut futures = Vec::new();
        for offset in [10u64, 20, 30] {
            let (promise, future) = rpc_promise_pair(now + Duration::from_secs(60));
            let id = queue.next_request_id();
            queue.register_rpc(
                id,
                RpcPromiseInfo::new(
                    RpcCompletion::Promise(promise),
                    now + Duration::from_millis(offset),
                ),
            );
            futures.push(future);
        }

        let expired = queue.drain_expired_rpc(now + Duration::from_millis(25));
        assert_eq!(expired.len(), 2);
        for completion in expired {
            completion.complete(RpcResponse::timeout());
        }
        assert_eq!(futures[0].peek().unwrap().code, ResultCode::Timeout);
        assert_eq!(futures[1].peek().unwrap().code, ResultCode::Timeout);
        assert!(futures[2].peek().is_none());
        assert_eq!(queue.rpc_pending(), 1);
    }

    #[test]
    fn teardown_takes_every_undelivered_completion() {
        let mut queue = MessageQueue::new();
        let now = Instant::now();
        for _ in 0..3 {
            let (promise, _future) = rpc_promise_pair(now + Duration::from_secs(1));
            let id = queue.next_request_id();
            queue.register_rpc(
                id,
                RpcPromiseInfo::new(
                    RpcCompletion::Promise(promise),
                    now + Duration::from_secs(1),
                ),
            );
        }
        // One already completed: only two left to cancel.
        let first = *queue.rpc_promise_info.keys().next().unwrap();
        queue.complete_rpc(first).unwrap();
        assert_eq!(queue.take_all_rpc().len(), 2);
        assert_eq!(queue.rpc_pending(), 0);
    }
}
