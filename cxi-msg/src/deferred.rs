// SPDX-License-Identifier: BSD-3-Clause

//! C2: the deferred-event table. Pairs `PUT` with `PUT_OVERFLOW` events that
//! can arrive in either order (spec §4.2).

use fnv::FnvHasher;
use std::hash::{Hash, Hasher};

use crate::matchbits::MatchBits;
use crate::nic::{Event, EventType, MatchId, ReturnCode};
use crate::request::{ReqId, UnexpectedSendRecord};

/// Key for correlating the two halves of an unexpected delivery (spec §4.2:
/// "{initiator-process, rendezvous-id, rdzv-flag=1} XOR {overflow-buffer
/// start address, rdzv-flag=0}").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeferredKey {
    Rendezvous { initiator: (u32, u32), rdzv_id: u32 },
    Overflow { start_addr: u64 },
}

fn fingerprint(key: &DeferredKey) -> u64 {
    let mut hasher = FnvHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

/// What the other half of the pair is, once it arrives: either a receive
/// request waiting on the second event, or a record destined for the
/// unexpected list (spec §3 "Deferred event").
#[derive(Debug, Clone)]
pub enum Awaiting {
    Receive(ReqId),
    UnexpectedSend(Box<UnexpectedSendRecord>),
}

#[derive(Debug, Clone)]
pub struct DeferredRecord {
    pub key: DeferredKey,
    pub event_type: EventType,
    pub event: Event,
    pub awaiting: Awaiting,
}

fn complement(kind: EventType) -> Option<EventType> {
    match kind {
        EventType::Put => Some(EventType::PutOverflow),
        EventType::PutOverflow => Some(EventType::Put),
        _ => None,
    }
}

fn same_correlation(a: &Event, b: &Event) -> bool {
    a.return_code == b.return_code
        && initiator_eq(a.initiator, b.initiator)
        && a.match_bits == b.match_bits
}

fn initiator_eq(a: MatchId, b: MatchId) -> bool {
    match (a, b) {
        (MatchId::Any, MatchId::Any) => true,
        (MatchId::Logical(x), MatchId::Logical(y)) => x == y,
        (MatchId::Physical { nic: n1, pid: p1 }, MatchId::Physical { nic: n2, pid: p2 }) => {
            n1 == n2 && p1 == p2
        }
        _ => false,
    }
}

pub enum MatchOutcome {
    /// The complementary event was already waiting; caller consumes and
    /// frees the returned record.
    Matched(DeferredRecord),
    /// No complement yet; a new record was inserted and must be freed by the
    /// caller once the complement arrives.
    Inserted,
    /// The table is at capacity (spec §4.2: "on allocation failure return
    /// (false, nil)"). Caller must surface `try-later`.
    AtCapacity,
}

/// Bucketed by a 64-bit fingerprint; bucket count is a compile-time power of
/// two sized for a few thousand live entries (spec §3).
const BUCKET_COUNT: usize = 4096;

pub struct DeferredEventTable {
    buckets: Vec<Vec<DeferredRecord>>,
    len: usize,
    capacity: usize,
}

impl DeferredEventTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| Vec::new()).collect(),
            len: 0,
            capacity,
        }
    }

    fn bucket_for(&self, key: &DeferredKey) -> usize {
        (fingerprint(key) as usize) & (BUCKET_COUNT - 1)
    }

    fn key_for_event(event: &Event) -> DeferredKey {
        if event.kind == EventType::Rendezvous || event.match_bits.rdzv_id() != 0 {
            let initiator = match event.initiator {
                MatchId::Physical { nic, pid } => (nic, pid),
                _ => (0, 0),
            };
            DeferredKey::Rendezvous {
                initiator,
                rdzv_id: event.match_bits.rdzv_id(),
            }
        } else {
            DeferredKey::Overflow {
                start_addr: event.overflow_start.unwrap_or(0),
            }
        }
    }

    /// Spec §4.2 `match_put_event`. `req` is the id of the request tracked in
    /// `awaiting` if this insert is the first half of the pair; it is not
    /// otherwise consulted.
    pub fn match_put_event(&mut self, event: Event, awaiting: Awaiting) -> MatchOutcome {
        let key = Self::key_for_event(&event);
        let Some(wanted) = complement(event.kind) else {
            // Only PUT/PUT_OVERFLOW participate in this correlation.
            return MatchOutcome::Inserted;
        };

        let bucket = &mut self.buckets[self.bucket_for(&key)];
        if let Some(pos) = bucket
            .iter()
            .position(|r| r.key == key && r.event_type == wanted && same_correlation(&r.event, &event))
        {
            let record = bucket.remove(pos);
            self.len -= 1;
            return MatchOutcome::Matched(record);
        }

        if self.len >= self.capacity {
            return MatchOutcome::AtCapacity;
        }

        bucket.push(DeferredRecord {
            key,
            event_type: event.kind,
            event,
            awaiting,
        });
        self.len += 1;
        MatchOutcome::Inserted
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchbits::MatchBits;

    fn overflow_event(kind: EventType, start: u64) -> Event {
        Event {
            user_ptr: ReqId(0),
            kind,
            return_code: ReturnCode::Ok,
            initiator: MatchId::Physical { nic: 1, pid: 2 },
            match_bits: MatchBits::new().with_tag(7),
            ignore_bits: 0,
            mlength: 64,
            rlength: 64,
            remote_offset: 0,
            header_data: None,
            overflow_start: Some(start),
            auto_unlinked: false,
        }
    }

    #[test]
    fn pairs_put_and_put_overflow_regardless_of_arrival_order() {
        let mut table = DeferredEventTable::new(16);

        let put = overflow_event(EventType::Put, 0x1000);
        match table.match_put_event(put, Awaiting::Receive(ReqId(5))) {
            MatchOutcome::Inserted => {}
            _ => panic!("expected first half to insert"),
        }
        assert_eq!(table.len(), 1);

        let overflow = overflow_event(EventType::PutOverflow, 0x1000);
        match table.match_put_event(overflow, Awaiting::Receive(ReqId(5))) {
            MatchOutcome::Matched(record) => {
                assert_eq!(record.event_type, EventType::Put);
            }
            _ => panic!("expected second half to match"),
        }
        assert!(table.is_empty(), "steady state: table drains to empty");
    }

    #[test]
    fn unrelated_overflow_addresses_do_not_match() {
        let mut table = DeferredEventTable::new(16);
        table.match_put_event(overflow_event(EventType::Put, 0x1000), Awaiting::Receive(ReqId(1)));
        let outcome = table.match_put_event(overflow_event(EventType::PutOverflow, 0x2000), Awaiting::Receive(ReqId(2)));
        assert!(matches!(outcome, MatchOutcome::Inserted));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn reports_capacity_exhaustion() {
        let mut table = DeferredEventTable::new(1);
        table.match_put_event(overflow_event(EventType::Put, 1), Awaiting::Receive(ReqId(1)));
        let outcome = table.match_put_event(overflow_event(EventType::Put, 2), Awaiting::Receive(ReqId(2)));
        assert!(matches!(outcome, MatchOutcome::AtCapacity));
    }
}
