// SPDX-License-Identifier: BSD-3-Clause

//! The polymorphic request handle (spec §3 "Data model").

use crate::config::RdzvProto;
use crate::matchbits::{MatchBits, RequestFlags};
use crate::nic::{CAddr, CounterHandle, CqHandle, EventType, FiAddr, MatchId, MrHandle, ReturnCode};

/// Stable numeric identifier for a request. Unique while the request is
/// live; reused by the arena once freed (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReqId(pub u32);

/// Which component's callback owns events addressed to this request. The
/// demultiplexer (C1) uses this to route, rather than matching on the
/// request variant directly, so a request can be reassigned mid-life (e.g.
/// an unexpected-send record that becomes a rendezvous child).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callback {
    Recv,
    Send,
    Rendezvous,
    FlowControl,
    Overflow,
    Search,
}

/// Tracks the (at most 4) rendezvous event types seen for one request
/// (spec §3: "a rendezvous-event counter with a history array (cap 4)").
#[derive(Debug, Clone, Copy, Default)]
pub struct RdzvEventHistory {
    seen: [Option<EventType>; 4],
    count: u8,
}

impl RdzvEventHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `kind`. Returns `false` if `kind` was already recorded at an
    /// *earlier* position — per spec §4.5, that signals the initiator reused
    /// the rendezvous id and the coordinator must drain before proceeding
    /// (return `try-later`). A `kind` matching the most recently recorded
    /// entry is treated as the same NIC event being re-presented after a
    /// `try-later` (spec §4.1) and is accepted idempotently, so the
    /// dependent action (pull issuance, done-notify) gets retried rather
    /// than permanently wedged behind a spurious "reused" verdict.
    pub fn record(&mut self, kind: EventType) -> bool {
        if self.count > 0 && self.seen[self.count as usize - 1] == Some(kind) {
            return true;
        }
        if self.seen[..self.count as usize].iter().any(|e| *e == Some(kind)) {
            return false;
        }
        if (self.count as usize) < self.seen.len() {
            self.seen[self.count as usize] = Some(kind);
            self.count += 1;
        }
        true
    }

    pub fn has(&self, kind: EventType) -> bool {
        self.seen[..self.count as usize].iter().any(|e| *e == Some(kind))
    }

    pub fn count(&self) -> u8 {
        self.count
    }

    /// Three events (or four with the restricted protocol's done-notify)
    /// complete a rendezvous (spec §4.5).
    pub fn is_complete(&self, needs_done_notify_ack: bool) -> bool {
        let have_body = self.has(EventType::Put) || self.has(EventType::PutOverflow);
        let have_rdzv = self.has(EventType::Rendezvous);
        let have_reply = self.has(EventType::Reply);
        let have_ack = self.has(EventType::Ack);
        have_body && have_rdzv && have_reply && (!needs_done_notify_ack || have_ack)
    }
}

/// Peek/claim bookkeeping (spec §3, §4.3.5).
#[derive(Debug, Clone, Default)]
pub struct PeekState {
    pub ule_offsets: Vec<u64>,
    pub cur_ule_offset: usize,
    pub offset_found: bool,
    pub ule_offset: Option<u64>,
}

/// Receive-specific fields (spec §3).
#[derive(Debug, Clone)]
pub struct ReceiveRequest {
    pub buf: Option<MrHandle>,
    pub ulen: u64,
    pub tag: u64,
    pub ignore: u64,
    pub match_id: MatchId,

    /// Offset into a multi-receive buffer where the next match should land.
    pub start_offset: u64,
    pub rlen: u64,
    pub data_len: u64,

    pub parent: Option<ReqId>,
    pub children: Vec<ReqId>,

    pub tgt_event: bool,
    pub unlinked: bool,
    pub canceled: bool,
    pub auto_unlinked: bool,
    pub software_list: bool,
    pub hw_offloaded: bool,
    pub multi_recv: bool,
    pub tagged: bool,
    pub done_notify: bool,

    pub rdzv_events: RdzvEventHistory,
    pub rdzv_id: Option<u32>,
    pub rdzv_lac: u8,
    pub rdzv_proto: Option<RdzvProto>,
    pub eager_inline_len: u64,
    pub rdzv_initiator: Option<(u32, u32)>,
    pub src_offset: u64,

    pub return_code: Option<ReturnCode>,
    pub peek: PeekState,

    /// Bytes consumed toward an auto-unlink, and the unlink threshold that
    /// was recorded when the parent was posted (spec §4.3.6).
    pub mrecv_bytes: u64,
    pub mrecv_unlink_bytes: u64,
}

impl ReceiveRequest {
    pub fn new(ulen: u64, buf: Option<MrHandle>, tag: u64, ignore: u64, match_id: MatchId) -> Self {
        Self {
            buf,
            ulen,
            tag,
            ignore,
            match_id,
            start_offset: 0,
            rlen: 0,
            data_len: 0,
            parent: None,
            children: Vec::new(),
            tgt_event: false,
            unlinked: false,
            canceled: false,
            auto_unlinked: false,
            software_list: false,
            hw_offloaded: false,
            multi_recv: false,
            tagged: false,
            done_notify: false,
            rdzv_events: RdzvEventHistory::new(),
            rdzv_id: None,
            rdzv_lac: 0,
            rdzv_proto: None,
            eager_inline_len: 0,
            rdzv_initiator: None,
            src_offset: 0,
            return_code: None,
            peek: PeekState::default(),
            mrecv_bytes: 0,
            mrecv_unlink_bytes: 0,
        }
    }
}

/// Either a registered buffer or an inline bounce buffer; never both
/// (spec §3: "memory-registration or inline-bounce-buffer ownership
/// (exclusive)").
#[derive(Debug, Clone)]
pub enum SendPayload {
    Registered { mr: MrHandle, len: u64 },
    Inline(Vec<u8>),
}

impl SendPayload {
    pub fn len(&self) -> u64 {
        match self {
            Self::Registered { len, .. } => *len,
            Self::Inline(bytes) => bytes.len() as u64,
        }
    }
}

/// Send-specific fields (spec §3).
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub caddr: CAddr,
    pub dest: FiAddr,
    pub tag: u64,
    pub payload: SendPayload,

    /// The full wire match-bits computed once at post time (tag, tagged,
    /// cq_data, match_complete/tx_id, rdzv_id/proto) — `emit` reuses this
    /// verbatim rather than rebuilding it, so a replayed send carries the
    /// same bits as the original.
    pub match_bits: MatchBits,

    pub rdzv_id: Option<u32>,
    /// Counts ACK + (for rendezvous) the source-side GET landing on the
    /// rendezvous-source PTE; completion needs both (spec §4.6).
    pub initiator_events: u8,

    /// Index into the sender-side flow-control peer table. Never owning —
    /// a dropped peer record is looked up by `CAddr`, not held alive by this
    /// field (spec §3: "per-peer flow-control back-reference (weak, never
    /// owning)").
    pub fc_peer: Option<CAddr>,

    pub match_complete_tx_id: Option<u32>,
}

/// An onloaded unexpected-send record (spec §3 "Unexpected-send record").
#[derive(Debug, Clone)]
pub struct UnexpectedSendRecord {
    pub initiator: MatchId,
    pub physical: Option<(u32, u32)>,
    pub match_bits: MatchBits,
    pub rlength: u64,
    pub mlength: u64,
    pub header_data: Option<u64>,
    pub remote_offset: u64,
    pub overflow_req: Option<ReqId>,
    pub claimed: bool,
    pub is_rendezvous: bool,
    pub rdzv_id: Option<u32>,
}

/// Overflow-buffer bookkeeping (spec §3, C4).
#[derive(Debug, Clone)]
pub struct OverflowRequest {
    pub start_addr: u64,
    pub mr: MrHandle,
    pub len: u64,
    pub cur_offset: u64,
    pub unlink_length: u64,
    pub consumed: u64,
    pub link_refcount: u32,
    pub deferred_pending: u32,
}

impl OverflowRequest {
    /// The buffer is freed once every byte has been consumed *and* no
    /// deferred-table entry still points at it (spec §3 invariant 3).
    pub fn fully_consumed(&self) -> bool {
        self.consumed >= self.unlink_length && self.deferred_pending == 0
    }
}

/// A software-issued rendezvous pull source-side bookkeeping lives on the
/// receive request itself; this variant exists for the rare case a
/// rendezvous needs its own tracked request distinct from the receive that
/// spawned it (e.g. a multi-receive child created before the parent's
/// `PUT`/`PUT_OVERFLOW` arrives, spec §4.5).
#[derive(Debug, Clone)]
pub struct RendezvousSourceRequest {
    pub initiator: (u32, u32),
    pub rdzv_id: u32,
}

/// A reverse zero-byte put used for match-complete notification or
/// done-notify (spec §4.3.3 step 6, §4.5).
#[derive(Debug, Clone)]
pub struct ZeroByteRequest {
    pub dest: FiAddr,
    pub match_bits: MatchBits,
    pub purpose: ZeroBytePurpose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroBytePurpose {
    MatchCompleteNotify,
    RdzvDoneNotify,
    FcNotify,
    FcResume,
}

#[derive(Debug, Clone)]
pub enum RequestKind {
    Receive(ReceiveRequest),
    Send(SendRequest),
    Search,
    Overflow(OverflowRequest),
    RendezvousSource(RendezvousSourceRequest),
    ZeroByte(ZeroByteRequest),
}

/// The polymorphic request handle (spec §3).
#[derive(Debug, Clone)]
pub struct Request {
    pub id: ReqId,
    pub callback: Callback,
    pub context: u64,
    pub flags: RequestFlags,
    pub cq: Option<CqHandle>,
    pub counter: Option<CounterHandle>,
    pub kind: RequestKind,
}

impl Request {
    pub fn as_receive(&self) -> Option<&ReceiveRequest> {
        match &self.kind {
            RequestKind::Receive(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_receive_mut(&mut self) -> Option<&mut ReceiveRequest> {
        match &mut self.kind {
            RequestKind::Receive(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_send(&self) -> Option<&SendRequest> {
        match &self.kind {
            RequestKind::Send(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_send_mut(&mut self) -> Option<&mut SendRequest> {
        match &mut self.kind {
            RequestKind::Send(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_overflow(&self) -> Option<&OverflowRequest> {
        match &self.kind {
            RequestKind::Overflow(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_overflow_mut(&mut self) -> Option<&mut OverflowRequest> {
        match &mut self.kind {
            RequestKind::Overflow(o) => Some(o),
            _ => None,
        }
    }
}

pub type RequestArena = crate::arena::Arena<Request>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rdzv_history_rejects_duplicate_types_until_drained() {
        let mut hist = RdzvEventHistory::new();
        assert!(hist.record(EventType::Put));
        assert!(hist.record(EventType::Rendezvous));
        // Source reused the rdzv id: same event type shows up again before
        // the first trio completed.
        assert!(!hist.record(EventType::Put));
    }

    #[test]
    fn completion_requires_ack_only_for_restricted_protocol() {
        let mut hist = RdzvEventHistory::new();
        hist.record(EventType::Put);
        hist.record(EventType::Rendezvous);
        hist.record(EventType::Reply);
        assert!(hist.is_complete(false));
        assert!(!hist.is_complete(true));
        hist.record(EventType::Ack);
        assert!(hist.is_complete(true));
    }
}
