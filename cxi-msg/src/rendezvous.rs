// SPDX-License-Identifier: BSD-3-Clause

//! C5: the rendezvous coordinator. Issues the pull once a RENDEZVOUS event
//! names a source buffer, and finalizes the receive once the full event
//! history is in (spec §4.5).

use log::trace;

use crate::completion::CompletionSink;
use crate::config::{Config, RdzvProto};
use crate::error::{Disposition, FatalReason};
use crate::matchbits::{LeType, MatchBits, RdzvProtoBits};
use crate::nic::{physical_to_fi_addr, CommandQueue, Event, EventType, ReturnCode};
use crate::recv::{ReceiveEngine, RdzvNoteResult};
use crate::request::{ReqId, RequestArena};

const CACHE_LINE: u64 = 64;

fn round_up_cache_line(len: u64) -> u64 {
    (len + CACHE_LINE - 1) & !(CACHE_LINE - 1)
}

fn needs_done_notify_ack(config: &Config) -> bool {
    matches!(config.rdzv_proto, RdzvProto::Restricted { done_notify: true })
}

/// Bounds how many software-issued pulls (`GET`s) can be outstanding at once
/// (spec §4.3.4's "TX-credit reservation").
pub struct RendezvousCoordinator {
    credits: u32,
    max_credits: u32,
}

impl RendezvousCoordinator {
    pub fn new(max_concurrent_pulls: u32) -> Self {
        Self {
            credits: max_concurrent_pulls,
            max_credits: max_concurrent_pulls,
        }
    }

    pub fn available_credits(&self) -> u32 {
        self.credits
    }

    fn reserve(&mut self) -> bool {
        if self.credits > 0 {
            self.credits -= 1;
            true
        } else {
            false
        }
    }

    fn release(&mut self) {
        self.credits = (self.credits + 1).min(self.max_credits);
    }

    /// spec §4.5: a `RENDEZVOUS` event names the source buffer; record it
    /// and, unless the history somehow already completed (e.g. a
    /// zero-length rendezvous), pull the remainder with a `GET`.
    #[allow(clippy::too_many_arguments)]
    pub fn on_rendezvous_event(
        &mut self,
        requests: &mut RequestArena,
        recv_engine: &mut ReceiveEngine,
        cmdq: &mut dyn CommandQueue,
        config: &Config,
        completions: &mut CompletionSink,
        event: &Event,
    ) -> Disposition {
        let req_id = event.user_ptr;
        match recv_engine.note_rendezvous_event(requests, req_id, EventType::Rendezvous, needs_done_notify_ack(config)) {
            RdzvNoteResult::Reused => Disposition::TryLater,
            RdzvNoteResult::Complete => recv_engine
                .finish_rendezvous(requests, config, completions, req_id)
                .map_or_else(|d| d, |_| Disposition::Success),
            RdzvNoteResult::Pending => self.issue_pull(requests, cmdq, config, req_id, event),
        }
    }

    fn issue_pull(
        &mut self,
        requests: &mut RequestArena,
        cmdq: &mut dyn CommandQueue,
        config: &Config,
        req_id: ReqId,
        event: &Event,
    ) -> Disposition {
        if !self.reserve() {
            return Disposition::TryLater;
        }
        if !cmdq.has_capacity() {
            self.release();
            return Disposition::TryLater;
        }

        let Some(recv) = requests.get(req_id.0).and_then(|r| r.as_receive()) else {
            self.release();
            return Disposition::Fatal(FatalReason::new("rendezvous pull: receive request vanished"));
        };
        let Some(mr) = recv.buf else {
            self.release();
            return Disposition::Fatal(FatalReason::new("rendezvous pull: receive has no registered buffer"));
        };
        let ulen = recv.ulen;
        let Some((nic, pid)) = recv.rdzv_initiator else {
            self.release();
            return Disposition::Fatal(FatalReason::new("rendezvous pull: no initiator address recorded"));
        };

        let remaining_remote = event.rlength.saturating_sub(config.rdzv_eager_size);
        let remaining_local = ulen.saturating_sub(config.rdzv_eager_size);
        let pull_len = round_up_cache_line(remaining_remote.min(remaining_local));
        if pull_len == 0 {
            self.release();
            return Disposition::Success;
        }

        let dest = physical_to_fi_addr(nic, pid);
        trace!("rendezvous pull for {:?}: {} bytes from {:?}", req_id, pull_len, dest);
        match cmdq.get_dma(req_id, dest, mr, config.rdzv_eager_size, event.remote_offset, pull_len) {
            Disposition::Success => Disposition::Success,
            Disposition::TryLater => {
                self.release();
                Disposition::TryLater
            }
            Disposition::Fatal(r) => {
                self.release();
                Disposition::Fatal(r)
            }
        }
    }

    /// spec §4.5: the pull's completion lands as a `REPLY` on the target
    /// queue. Under the restricted protocol with `done_notify` enabled the
    /// receiver must additionally push a zero-byte done-notify back to the
    /// initiator before the rendezvous can finish.
    #[allow(clippy::too_many_arguments)]
    pub fn on_reply_event(
        &mut self,
        requests: &mut RequestArena,
        recv_engine: &mut ReceiveEngine,
        cmdq: &mut dyn CommandQueue,
        config: &Config,
        completions: &mut CompletionSink,
        event: &Event,
    ) -> Disposition {
        self.release();
        let req_id = event.user_ptr;
        match recv_engine.note_rendezvous_event(requests, req_id, EventType::Reply, needs_done_notify_ack(config)) {
            RdzvNoteResult::Reused => Disposition::TryLater,
            RdzvNoteResult::Complete => recv_engine
                .finish_rendezvous(requests, config, completions, req_id)
                .map_or_else(|d| d, |_| Disposition::Success),
            RdzvNoteResult::Pending => {
                if needs_done_notify_ack(config) {
                    self.issue_done_notify(requests, cmdq, req_id)
                } else {
                    Disposition::Success
                }
            }
        }
    }

    /// spec §4.5: push the reverse zero-byte put that tells the initiator
    /// its rendezvous send is fully drained. Reuses the receive's own
    /// `req_id` so the resulting `ACK` routes back to [`Self::on_ack_event`].
    fn issue_done_notify(&mut self, requests: &mut RequestArena, cmdq: &mut dyn CommandQueue, req_id: ReqId) -> Disposition {
        if !cmdq.has_capacity() {
            return Disposition::TryLater;
        }
        let Some(recv) = requests.get(req_id.0).and_then(|r| r.as_receive()) else {
            return Disposition::Fatal(FatalReason::new("rendezvous done-notify: receive request vanished"));
        };
        let Some((nic, pid)) = recv.rdzv_initiator else {
            return Disposition::Fatal(FatalReason::new("rendezvous done-notify: no initiator address recorded"));
        };
        let Some(rdzv_id) = recv.rdzv_id else {
            return Disposition::Fatal(FatalReason::new("rendezvous done-notify: no rendezvous id recorded"));
        };

        let dest = physical_to_fi_addr(nic, pid);
        let match_bits = MatchBits::new()
            .with_le_type(LeType::Zbp)
            .with_rdzv_proto(RdzvProtoBits::Restricted)
            .with_rdzv_done(true)
            .with_rdzv_id(rdzv_id);

        trace!("rendezvous done-notify for {:?} -> {:?}", req_id, dest);
        cmdq.put_idc(req_id, dest, match_bits, &[])
    }

    /// spec §4.5: the done-notify `ACK`, only expected under the restricted
    /// protocol with `done_notify` enabled. `EntryNotFound` means the
    /// initiator's zero-byte-put PTE wasn't ready yet; sleep the configured
    /// micro-delay and retry, consuming the already-reserved credit.
    pub fn on_ack_event(
        &mut self,
        requests: &mut RequestArena,
        recv_engine: &mut ReceiveEngine,
        cmdq: &mut dyn CommandQueue,
        config: &Config,
        completions: &mut CompletionSink,
        event: &Event,
    ) -> Disposition {
        let req_id = event.user_ptr;
        if event.return_code == ReturnCode::EntryNotFound {
            std::thread::sleep(std::time::Duration::from_micros(config.fc_retry_usec_delay));
            return self.issue_done_notify(requests, cmdq, req_id);
        }
        match recv_engine.note_rendezvous_event(requests, req_id, EventType::Ack, needs_done_notify_ack(config)) {
            RdzvNoteResult::Reused => Disposition::TryLater,
            RdzvNoteResult::Complete => recv_engine
                .finish_rendezvous(requests, config, completions, req_id)
                .map_or_else(|d| d, |_| Disposition::Success),
            RdzvNoteResult::Pending => Disposition::Success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_line_rounding() {
        assert_eq!(round_up_cache_line(0), 0);
        assert_eq!(round_up_cache_line(1), 64);
        assert_eq!(round_up_cache_line(64), 64);
        assert_eq!(round_up_cache_line(65), 128);
    }

    #[test]
    fn credits_are_bounded() {
        let mut c = RendezvousCoordinator::new(2);
        assert!(c.reserve());
        assert!(c.reserve());
        assert!(!c.reserve());
        c.release();
        assert_eq!(c.available_credits(), 1);
        c.release();
        c.release();
        assert_eq!(c.available_credits(), 2, "release never exceeds the configured max");
    }
}
