//! Acknowledgement tracking, retransmission, and duplicate suppression
//!
//! Confirmable sends are remembered (as their fully encoded datagrams, so a
//! retransmit reuses the exact bytes and nonce) until the matching
//! acknowledgement arrives or the retry budget is exhausted. Inbound
//! confirmables are acknowledged unconditionally and deduplicated at the
//! dispatch boundary by a sliding window, so a redelivered datagram is
//! re-acked but dispatched at most once.

use std::collections::VecDeque;
use std::{cmp, mem};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::message::{MessageId, Token};

/// Why a confirmable message was sent; drives timeout reporting
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum SendPurpose {
    /// Keepalive ping; timeout is a session-level `PingTimeout`
    Ping,
    /// Once-per-session clock correction request
    TimeRequest,
    /// Acknowledged publish of the named event
    Publish(String),
    /// Subscription announcement for the given filter
    Subscribe(String),
    /// Response to a peer request
    Response,
    /// OTA progress or completion report
    Update,
}

pub(crate) struct Pending {
    pub datagram: Bytes,
    pub purpose: SendPurpose,
    pub sent_at: u64,
    pub retries: u8,
}

/// Per-session reliability state
pub(crate) struct Reliability {
    next_id: MessageId,
    pending: FxHashMap<u16, Pending>,
    pending_acks: VecDeque<(MessageId, Token)>,
    dedup: Dedup,
    /// When the last datagram arrived, for keepalive accounting
    last_inbound_at: u64,
}

impl Reliability {
    pub fn new(now: u64) -> Self {
        Self {
            next_id: MessageId(0),
            pending: FxHashMap::default(),
            pending_acks: VecDeque::new(),
            dedup: Dedup::new(),
            last_inbound_at: now,
        }
    }

    /// Allocate the id for the next outbound message
    ///
    /// Ids wrap at 65535. Reuse collisions with an in-flight id would require
    /// 65536 sends while a table entry older than the full cycle is still
    /// pending; with a table bounded far below that and retry timeouts far
    /// shorter, this is treated as impossible rather than defended against.
    pub fn next_id(&mut self) -> MessageId {
        self.next_id.next()
    }

    pub fn set_next_id(&mut self, id: u16) {
        self.next_id = MessageId(id);
    }

    pub fn current_next_id(&self) -> u16 {
        self.next_id.0
    }

    /// Track an outbound confirmable until it is acked
    pub fn on_sent(&mut self, id: MessageId, datagram: Bytes, purpose: SendPurpose, now: u64) {
        self.pending.insert(
            id.0,
            Pending {
                datagram,
                purpose,
                sent_at: now,
                retries: 0,
            },
        );
    }

    /// Process an inbound acknowledgement; `None` for an unknown (late or
    /// duplicate) id, which is not an error
    pub fn on_ack(&mut self, id: MessageId) -> Option<SendPurpose> {
        match self.pending.remove(&id.0) {
            Some(pending) => Some(pending.purpose),
            None => {
                trace!(%id, "ack for unknown message id ignored");
                None
            }
        }
    }

    /// Queue an acknowledgement of an inbound confirmable
    pub fn queue_ack(&mut self, id: MessageId, token: Token) {
        self.pending_acks.push_back((id, token));
    }

    /// Next acknowledgement to flush, if any
    pub fn take_ack(&mut self) -> Option<(MessageId, Token)> {
        self.pending_acks.pop_front()
    }

    /// Record inbound traffic for keepalive accounting
    pub fn note_inbound(&mut self, now: u64) {
        self.last_inbound_at = now;
    }

    pub fn last_inbound_at(&self) -> u64 {
        self.last_inbound_at
    }

    /// Whether a fresh inbound id should be dispatched; false for duplicates
    pub fn accept(&mut self, id: MessageId) -> bool {
        !self.dedup.insert(id)
    }

    /// Whether a ping is already awaiting acknowledgement
    pub fn ping_in_flight(&self) -> bool {
        self.pending
            .values()
            .any(|pending| pending.purpose == SendPurpose::Ping)
    }

    /// Collect datagrams due for retransmission and purposes that exhausted
    /// their retry budget
    pub fn poll_retransmits(
        &mut self,
        now: u64,
        ack_timeout: u64,
        max_retries: u8,
    ) -> (Vec<Bytes>, Vec<SendPurpose>) {
        let mut resend = Vec::new();
        let mut expired = Vec::new();
        let mut dead = Vec::new();
        for (&id, pending) in &mut self.pending {
            if now.saturating_sub(pending.sent_at) < ack_timeout {
                continue;
            }
            if pending.retries >= max_retries {
                dead.push(id);
                continue;
            }
            pending.retries += 1;
            pending.sent_at = now;
            resend.push(pending.datagram.clone());
        }
        for id in dead {
            if let Some(pending) = self.pending.remove(&id) {
                expired.push(pending.purpose);
            }
        }
        (resend, expired)
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop all reliability state, e.g. on disconnect or session failure
    pub fn clear(&mut self) {
        self.pending.clear();
        self.pending_acks.clear();
        self.dedup = Dedup::new();
    }
}

/// RFC4303-style sliding window duplicate detector over message ids
///
/// Message ids are 16-bit and wrap, so each inbound id is first expanded to
/// the 64-bit value closest to the highest id seen, the same way truncated
/// packet numbers are recovered. A set bit means the id was already
/// dispatched; ids left of the window are assumed seen.
struct Dedup {
    window: Window,
    /// Lowest expanded id higher than all yet dispatched, or `None` before
    /// the first inbound message
    next: Option<u64>,
}

type Window = u128;

const WINDOW_SIZE: u64 = 1 + mem::size_of::<Window>() as u64 * 8;

impl Dedup {
    fn new() -> Self {
        Self {
            window: 0,
            next: None,
        }
    }

    fn highest(&self) -> Option<u64> {
        self.next.map(|next| next - 1)
    }

    fn expand(&self, id: MessageId) -> u64 {
        let expected = self.next.unwrap_or(0);
        let candidate = (expected & !0xffff) | u64::from(id.0);
        if candidate + 0x8000 < expected {
            candidate + 0x1_0000
        } else if candidate > expected.wrapping_add(0x8000) && candidate >= 0x1_0000 {
            candidate - 0x1_0000
        } else {
            candidate
        }
    }

    /// Record an inbound id; returns whether it is a duplicate
    fn insert(&mut self, id: MessageId) -> bool {
        let packet = self.expand(id);
        let Some(highest) = self.highest() else {
            self.window = 1;
            self.next = Some(packet + 1);
            return false;
        };
        if let Some(diff) = packet.checked_sub(highest + 1) {
            // Right of window
            self.window = (self.window << 1 | 1)
                .checked_shl(cmp::min(diff, u64::from(u32::MAX)) as u32)
                .unwrap_or(0);
            self.next = Some(packet + 1);
            false
        } else if highest - packet < WINDOW_SIZE {
            // Within window
            if let Some(bit) = (highest - packet).checked_sub(1) {
                let mask = 1 << bit;
                let duplicate = self.window & mask != 0;
                self.window |= mask;
                duplicate
            } else {
                // == highest
                true
            }
        } else {
            // Left of window
            true
        }
    }
}
