// SPDX-License-Identifier: BSD-3-Clause

//! C3: the receive request engine. Posts, matches, and completes receives;
//! multi-receive bookkeeping (spec §4.3).

use std::collections::VecDeque;

use log::{debug, trace};

use crate::completion::{Completion, CompletionSink};
use crate::config::Config;
use crate::deferred::{Awaiting, DeferredEventTable, MatchOutcome};
use crate::error::{CompletionError, Disposition, FatalReason};
use crate::matchbits::{MatchBits, RequestFlags};
use crate::nic::{CommandQueue, CounterHandle, CqHandle, Event, EventType, MatchId, MemoryRegion, MrHandle, ReturnCode};
use crate::overflow::OverflowPool;
use crate::request::{
    Callback, PeekState, ReceiveRequest, ReqId, Request, RequestArena, RequestKind, UnexpectedSendRecord,
};

/// Outcome of recording one rendezvous-sequence event against a receive
/// request's history (spec §4.5).
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RdzvNoteResult {
    Complete,
    Pending,
    Reused,
}

pub struct PostParams {
    pub buf: Option<MrHandle>,
    pub len: u64,
    pub match_id: MatchId,
    pub tag: u64,
    pub ignore: u64,
    pub flags: RequestFlags,
    pub context: u64,
    pub cq: Option<CqHandle>,
    pub counter: Option<CounterHandle>,
    /// Stable token correlating a `PEEK+CLAIM` with the later `CLAIM`-only
    /// post that retrieves it (spec §4.3.5).
    pub peek_context: Option<usize>,
}

/// Outcome of something that could also just be "queued, wait for a NIC
/// event later" — separate from [`Disposition`] so callers don't confuse a
/// synchronous software match with a busy/fatal signal.
#[derive(Debug, PartialEq, Eq)]
pub enum PostOutcome {
    /// Appended to hardware or the software queue; completion arrives later.
    Queued,
    /// Matched and completed synchronously against the software unexpected
    /// list.
    AlreadyMatched,
    /// A `PEEK` completed synchronously (with or without a match).
    PeekDone,
}

fn init_match(sender: MatchId, wanted: MatchId) -> bool {
    matches!(wanted, MatchId::Any) || sender == wanted
}

/// C3. Holds the software receive queue, the onloaded unexpected list, and
/// the bookkeeping the hybrid-preemptive checks in C7 read.
#[derive(Default)]
pub struct ReceiveEngine {
    pub sw_ux_list: Vec<UnexpectedSendRecord>,
    pub sw_recv_queue: VecDeque<ReqId>,
    pub posted_count: u64,
    pub unexpected_count: u64,
}

impl ReceiveEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// spec §4.3 "Post".
    #[allow(clippy::too_many_arguments)]
    pub fn post(
        &mut self,
        requests: &mut RequestArena,
        deferred: &mut DeferredEventTable,
        overflow: &mut OverflowPool,
        cmdq: &mut dyn CommandQueue,
        mem: &mut dyn MemoryRegion,
        config: &Config,
        rx_enabled: bool,
        completions: &mut CompletionSink,
        params: PostParams,
    ) -> Result<(ReqId, PostOutcome), Disposition> {
        if params.len > 0 && params.buf.is_none() {
            return Err(Disposition::Fatal(FatalReason::new(
                "post: len > 0 requires a buffer",
            )));
        }
        if (params.tag | params.ignore) & !config.tag_mask != 0 {
            return Err(Disposition::Fatal(FatalReason::new(
                "post: tag/ignore bits outside the provider tag-mask",
            )));
        }

        if params.flags.contains(RequestFlags::CLAIM) && !params.flags.contains(RequestFlags::PEEK) {
            // CLAIM-only: no new request is allocated, retrieve the stashed
            // peek record by context.
            return self
                .claim(requests, overflow, mem, completions, &params)
                .map(|id| (id, PostOutcome::AlreadyMatched));
        }

        if !rx_enabled {
            return Err(Disposition::TryLater);
        }

        let mr = if params.len > 0 {
            match mem.register(params.len) {
                Some(mr) => Some(mr),
                None => return Err(Disposition::TryLater),
            }
        } else {
            None
        };

        let mut recv = ReceiveRequest::new(params.len, mr.or(params.buf), params.tag, params.ignore, params.match_id);
        recv.tagged = params.flags.contains(RequestFlags::TAGGED);
        recv.multi_recv = params.flags.contains(RequestFlags::MULTI_RECV);
        recv.software_list = matches!(config.rx_match_mode, crate::config::RxMatchMode::Software);
        recv.hw_offloaded = !recv.software_list;
        recv.peek = PeekState::default();

        let idx = requests.insert(Request {
            id: ReqId(0),
            callback: Callback::Recv,
            context: params.context,
            flags: params.flags,
            cq: params.cq,
            counter: params.counter,
            kind: RequestKind::Receive(recv),
        });
        let req_id = ReqId(idx);
        if let Some(req) = requests.get_mut(idx) {
            req.id = req_id;
        }

        if params.flags.contains(RequestFlags::PEEK) {
            self.peek(requests, cmdq, completions, req_id, params.flags.contains(RequestFlags::CLAIM), params.peek_context)?;
            return Ok((req_id, PostOutcome::PeekDone));
        }

        let outcome = self.queue(requests, deferred, overflow, cmdq, mem, config, completions, req_id)?;
        Ok((req_id, outcome))
    }

    /// spec §4.3.1 "Queue".
    #[allow(clippy::too_many_arguments)]
    pub fn queue(
        &mut self,
        requests: &mut RequestArena,
        deferred: &mut DeferredEventTable,
        overflow: &mut OverflowPool,
        cmdq: &mut dyn CommandQueue,
        mem: &mut dyn MemoryRegion,
        config: &Config,
        completions: &mut CompletionSink,
        req_id: ReqId,
    ) -> Result<PostOutcome, Disposition> {
        if let Some(idx) = self.find_sw_match(requests, req_id) {
            let record = self.sw_ux_list.remove(idx);
            self.sw_matched(requests, deferred, overflow, cmdq, mem, config, completions, req_id, record)?;
            return Ok(PostOutcome::AlreadyMatched);
        }

        let software_managed = requests
            .get(req_id.0)
            .and_then(|r| r.as_receive())
            .map(|r| r.software_list)
            .unwrap_or(false);

        if software_managed {
            self.sw_recv_queue.push_back(req_id);
            self.posted_count += 1;
            return Ok(PostOutcome::Queued);
        }

        let recv = requests.get(req_id.0).and_then(|r| r.as_receive()).ok_or_else(|| {
            Disposition::Fatal(FatalReason::new("queue: receive request vanished"))
        })?;
        let match_bits = MatchBits::new().with_tag(recv.tag).with_tagged(recv.tagged);
        let ignore = recv.ignore;
        let buf = recv.buf;

        match cmdq.append_priority(req_id, match_bits, ignore, buf) {
            Disposition::Success => {
                self.posted_count += 1;
                Ok(PostOutcome::Queued)
            }
            Disposition::TryLater => Err(Disposition::TryLater),
            Disposition::Fatal(r) => Err(Disposition::Fatal(r)),
        }
    }

    fn find_sw_match(&self, requests: &RequestArena, req_id: ReqId) -> Option<usize> {
        let recv = requests.get(req_id.0)?.as_receive()?;
        self.sw_ux_list.iter().position(|rec| {
            !rec.claimed
                && MatchBits::new()
                    .with_tag(rec.match_bits.tag())
                    .tag_matches(MatchBits::new().with_tag(recv.tag), recv.ignore, u64::MAX)
                && init_match(rec.initiator, recv.match_id)
        })
    }

    /// spec §4.3.4 "sw_matched".
    #[allow(clippy::too_many_arguments)]
    #[allow(clippy::too_many_arguments)]
    fn sw_matched(
        &mut self,
        requests: &mut RequestArena,
        deferred: &mut DeferredEventTable,
        overflow: &mut OverflowPool,
        cmdq: &mut dyn CommandQueue,
        mem: &mut dyn MemoryRegion,
        config: &Config,
        completions: &mut CompletionSink,
        req_id: ReqId,
        record: UnexpectedSendRecord,
    ) -> Result<(), Disposition> {
        // The actual rendezvous pull is issued by the coordinator once this
        // function hands back control; here we only move bytes already
        // resident (the eager head) and leave the RGet for the caller to
        // trigger via the endpoint's software-rendezvous drive step.
        self.ux_send(requests, deferred, overflow, cmdq, mem, config, completions, req_id, &record)
    }

    /// spec §4.3.3 "ux_send": deliver a matched unexpected send into the
    /// receive buffer. Returns without completing the request if a
    /// match-complete notify or a rendezvous pull still needs to land.
    #[allow(clippy::too_many_arguments)]
    pub fn ux_send(
        &mut self,
        requests: &mut RequestArena,
        deferred: &mut DeferredEventTable,
        overflow: &mut OverflowPool,
        cmdq: &mut dyn CommandQueue,
        mem: &mut dyn MemoryRegion,
        config: &Config,
        completions: &mut CompletionSink,
        req_id: ReqId,
        record: &UnexpectedSendRecord,
    ) -> Result<(), Disposition> {
        let (buf, start_offset, copy_len) = {
            let recv = requests
                .get_mut(req_id.0)
                .and_then(|r| r.as_receive_mut())
                .ok_or_else(|| Disposition::Fatal(FatalReason::new("ux_send: receive request vanished")))?;

            let room = if recv.multi_recv { record.mlength } else { recv.ulen };
            let copy_len = record.mlength.min(room);
            recv.rlen = record.rlength;
            recv.data_len = copy_len;
            if record.physical.is_some() {
                recv.rdzv_initiator = record.physical;
            }
            if record.rdzv_id.is_some() {
                recv.rdzv_id = record.rdzv_id;
            }
            recv.src_offset = record.remote_offset;

            (recv.buf, recv.start_offset, copy_len)
        };

        // spec §4.3.3 step 4/5: copy bytes out of the overflow buffer that
        // actually owns them, then account consumption against it and
        // retire it once every byte has been claimed (spec §4.4, invariant
        // 3 of §3).
        if let Some(overflow_id) = record.overflow_req {
            let src = requests.get_mut(overflow_id.0).and_then(|r| r.as_overflow_mut()).map(|o| {
                let src_offset = o.cur_offset;
                o.cur_offset += copy_len;
                (o.mr, src_offset)
            });
            if let (Some(dst), Some((src_mr, src_offset))) = (buf, src) {
                mem.copy_into(dst, start_offset, src_mr, src_offset, copy_len);
            }
            if let Some(o) = requests.get_mut(overflow_id.0).and_then(|r| r.as_overflow_mut()) {
                o.consumed += copy_len;
                o.deferred_pending = o.deferred_pending.saturating_sub(1);
            }
            let fully_consumed = requests
                .get(overflow_id.0)
                .and_then(|r| r.as_overflow())
                .map(|o| o.fully_consumed())
                .unwrap_or(false);
            if fully_consumed {
                overflow.retire(requests, overflow_id, mem);
            }
        }
        let _ = deferred;

        if let Some(recv) = requests.get_mut(req_id.0).and_then(|r| r.as_receive_mut()) {
            if recv.multi_recv {
                recv.start_offset += copy_len;
                recv.mrecv_bytes += copy_len;
            }
        }

        if record.is_rendezvous {
            // Completion deferred to the rendezvous coordinator (C5).
            return Ok(());
        }

        // spec §4.3.3 step 6: the sender asked for match-complete reporting
        // and the priority list didn't match, so its own ACK is sitting
        // deferred (spec §4.6) waiting on this reverse zero-byte notify,
        // correlated by the `tx_id` it reflected into the send. This
        // receive still completes normally; only the *sender's* completion
        // depends on the notify landing.
        if record.match_bits.match_complete() {
            self.send_match_complete_notify(cmdq, record)?;
        }

        self.complete_and_free(requests, config, completions, req_id)
    }

    /// Pushes the reverse zero-byte put that lets the sender's deferred
    /// eager-ACK completion (spec §4.6 "Eager ACK callback") proceed,
    /// reflecting the `tx_id` the sender allocated.
    fn send_match_complete_notify(&self, cmdq: &mut dyn CommandQueue, record: &UnexpectedSendRecord) -> Result<(), Disposition> {
        let Some((nic, pid)) = record.physical else {
            return Err(Disposition::Fatal(FatalReason::new(
                "match-complete notify: initiator address unavailable",
            )));
        };
        let dest = crate::nic::physical_to_fi_addr(nic, pid);
        let bits = MatchBits::new()
            .with_le_type(crate::matchbits::LeType::Zbp)
            .with_tx_id(record.match_bits.tx_id());
        match cmdq.put_idc(ReqId(u32::MAX), dest, bits, &[]) {
            Disposition::Success => Ok(()),
            other => Err(other),
        }
    }

    /// spec §4.3.2 "Receive callback" — dispatches a NIC event addressed to
    /// a receive request.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_event(
        &mut self,
        requests: &mut RequestArena,
        deferred: &mut DeferredEventTable,
        overflow: &mut OverflowPool,
        cmdq: &mut dyn CommandQueue,
        mem: &mut dyn MemoryRegion,
        config: &Config,
        completions: &mut CompletionSink,
        event: &Event,
    ) -> Disposition {
        match event.kind {
            EventType::Link => self.on_link(requests, event),
            EventType::Unlink => self.on_unlink(requests, completions, event),
            EventType::PutOverflow => self.on_put_overflow(requests, deferred, overflow, cmdq, mem, config, completions, event),
            EventType::Put => self.on_put(requests, deferred, overflow, cmdq, mem, config, completions, event),
            EventType::Reply => self.on_reply(requests, config, completions, event),
            EventType::Send => Disposition::Success,
            other => Disposition::Fatal(FatalReason::new(format!(
                "receive callback got an unexpected event kind {other:?}"
            ))),
        }
    }

    fn on_link(&mut self, requests: &mut RequestArena, event: &Event) -> Disposition {
        match event.return_code {
            ReturnCode::Ok => Disposition::Success,
            ReturnCode::SoftwareManagedTransition => {
                if let Some(recv) = requests.get_mut(event.user_ptr.0).and_then(|r| r.as_receive_mut()) {
                    recv.software_list = true;
                    recv.hw_offloaded = false;
                }
                self.sw_recv_queue.push_back(event.user_ptr);
                Disposition::Success
            }
            ReturnCode::NoSpace => {
                if let Some(recv) = requests.get_mut(event.user_ptr.0).and_then(|r| r.as_receive_mut()) {
                    recv.software_list = true;
                }
                self.sw_recv_queue.push_back(event.user_ptr);
                Disposition::Success
            }
            other => Disposition::Fatal(FatalReason::new(format!("LINK failed: {other:?}"))),
        }
    }

    fn on_unlink(&mut self, requests: &mut RequestArena, completions: &mut CompletionSink, event: &Event) -> Disposition {
        if let Some(recv) = requests.get_mut(event.user_ptr.0).and_then(|r| r.as_receive_mut()) {
            recv.unlinked = true;
            let canceled = recv.canceled;
            let (context, cq, flags) = (0u64, None, RequestFlags::empty());
            let _ = (context, cq, flags);
            if canceled {
                self.emit_completion(requests, completions, event.user_ptr, Some(CompletionError::Canceled));
                requests.remove(event.user_ptr.0);
            }
        }
        Disposition::Success
    }

    /// spec §4.2/§4.3.2: a message the NIC could not match lands here. When
    /// `user_ptr` already names a posted receive, the NIC matched the header
    /// but the bulk raced into overflow — deliver it straight through. When
    /// it doesn't, nothing will ever complement this event with a targeted
    /// `PUT`, so the record goes directly onto the software unexpected list
    /// rather than waiting forever in the deferred table.
    #[allow(clippy::too_many_arguments)]
    fn on_put_overflow(
        &mut self,
        requests: &mut RequestArena,
        deferred: &mut DeferredEventTable,
        overflow: &mut OverflowPool,
        cmdq: &mut dyn CommandQueue,
        mem: &mut dyn MemoryRegion,
        config: &Config,
        completions: &mut CompletionSink,
        event: &Event,
    ) -> Disposition {
        let parent = event.user_ptr;
        let racing_recv = requests.get(parent.0).and_then(|r| r.as_receive()).is_some();

        let remote_offset = if racing_recv {
            requests
                .get_mut(parent.0)
                .and_then(|r| r.as_receive_mut())
                .map(|recv| {
                    let start = recv.start_offset;
                    if recv.multi_recv {
                        recv.start_offset += event.mlength;
                    }
                    start
                })
                .unwrap_or(0)
        } else {
            event.remote_offset
        };

        let overflow_req = event.overflow_start.and_then(|addr| overflow.find_by_start_addr(requests, addr));
        if let Some(id) = overflow_req {
            if let Some(o) = requests.get_mut(id.0).and_then(|r| r.as_overflow_mut()) {
                o.deferred_pending += 1;
            }
        }

        let record = UnexpectedSendRecord {
            initiator: event.initiator,
            physical: match event.initiator {
                MatchId::Physical { nic, pid } => Some((nic, pid)),
                _ => None,
            },
            match_bits: event.match_bits,
            rlength: event.rlength,
            mlength: event.mlength,
            header_data: event.header_data,
            remote_offset,
            overflow_req,
            claimed: false,
            is_rendezvous: false,
            rdzv_id: None,
        };

        if !racing_recv {
            self.sw_ux_list.push(record);
            return Disposition::Success;
        }

        match deferred.match_put_event(*event, Awaiting::UnexpectedSend(Box::new(record.clone()))) {
            MatchOutcome::Matched(found) => {
                if let Awaiting::Receive(recv_id) = found.awaiting {
                    debug!("deferred pair completed for {:?}", recv_id);
                    return self
                        .ux_send(requests, deferred, overflow, cmdq, mem, config, completions, recv_id, &record)
                        .map_or_else(|d| d, |_| Disposition::Success);
                }
                Disposition::Success
            }
            MatchOutcome::Inserted => Disposition::Success,
            MatchOutcome::AtCapacity => Disposition::TryLater,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_put(
        &mut self,
        requests: &mut RequestArena,
        deferred: &mut DeferredEventTable,
        overflow: &mut OverflowPool,
        cmdq: &mut dyn CommandQueue,
        mem: &mut dyn MemoryRegion,
        config: &Config,
        completions: &mut CompletionSink,
        event: &Event,
    ) -> Disposition {
        let parent = event.user_ptr;

        if event.match_bits.rdzv_id() != 0 {
            // The eager head of a rendezvous message: record it into the
            // history and let the coordinator finalize once the
            // RENDEZVOUS/REPLY (and, for the restricted protocol, the
            // done-notify ACK) events land (spec §4.5).
            if let Some(recv) = requests.get_mut(parent.0).and_then(|r| r.as_receive_mut()) {
                recv.rdzv_events.record(EventType::Put);
                recv.rdzv_id = Some(event.match_bits.rdzv_id());
                if let MatchId::Physical { nic, pid } = event.initiator {
                    recv.rdzv_initiator = Some((nic, pid));
                }
                // The PUT's rlength already carries the full source length
                // (eager head plus whatever the coordinator will later pull),
                // so the completion's length fields can be fixed right away
                // rather than waiting on the REPLY (spec §4.5, §4.6).
                recv.rlen = event.rlength;
                recv.data_len = event.rlength.min(recv.ulen);
            }
            return Disposition::Success;
        }

        if event.overflow_start.is_some() {
            // This PUT's data raced with an overflow buffer: part of the
            // message may already be sitting there (spec §4.2). Pair with
            // whatever PUT_OVERFLOW event carries the complement, in either
            // arrival order.
            return match deferred.match_put_event(*event, Awaiting::Receive(parent)) {
                MatchOutcome::Matched(found) => {
                    if let Awaiting::UnexpectedSend(ux) = found.awaiting {
                        return self
                            .ux_send(requests, deferred, overflow, cmdq, mem, config, completions, parent, &ux)
                            .map_or_else(|d| d, |_| Disposition::Success);
                    }
                    Disposition::Success
                }
                MatchOutcome::Inserted => Disposition::Success,
                MatchOutcome::AtCapacity => Disposition::TryLater,
            };
        }

        let is_multi_recv = requests
            .get(parent.0)
            .and_then(|r| r.as_receive())
            .map(|r| r.multi_recv)
            .unwrap_or(false);

        if is_multi_recv {
            let data_len = event.mlength;
            let start = requests
                .get(parent.0)
                .and_then(|r| r.as_receive())
                .map(|r| r.start_offset)
                .unwrap_or(0);

            self.emit_completion(requests, completions, parent, None);
            if let Some(recv) = requests.get_mut(parent.0).and_then(|r| r.as_receive_mut()) {
                recv.start_offset = start + data_len;
                recv.mrecv_bytes += data_len;
            }
            self.maybe_unlink_multi_recv(requests, config, parent);
            Disposition::Success
        } else {
            if let Some(recv) = requests.get_mut(parent.0).and_then(|r| r.as_receive_mut()) {
                recv.data_len = event.mlength.min(recv.ulen);
                recv.rlen = event.rlength;
            }
            self.complete_and_free(requests, config, completions, parent).map_or_else(
                |d| d,
                |_| Disposition::Success,
            )
        }
    }

    fn on_reply(&mut self, requests: &mut RequestArena, config: &Config, completions: &mut CompletionSink, event: &Event) -> Disposition {
        if let Some(recv) = requests.get_mut(event.user_ptr.0).and_then(|r| r.as_receive_mut()) {
            recv.return_code = Some(event.return_code);
            recv.rdzv_events.record(EventType::Reply);
        }
        self.complete_and_free(requests, config, completions, event.user_ptr).map_or_else(
            |d| d,
            |_| Disposition::Success,
        )
    }

    /// spec §4.3.6 "Multi-receive unlink policy".
    fn maybe_unlink_multi_recv(&mut self, requests: &mut RequestArena, config: &Config, parent: ReqId) {
        let Some(recv) = requests.get(parent.0).and_then(|r| r.as_receive()) else {
            return;
        };
        let hw_exhausted = recv.auto_unlinked && recv.mrecv_bytes >= recv.mrecv_unlink_bytes;
        let sw_exhausted = !recv.hw_offloaded && recv.ulen.saturating_sub(recv.mrecv_bytes) < config.min_multi_recv;

        if hw_exhausted || sw_exhausted {
            debug!("multi-recv parent {:?} exhausted, freeing", parent);
            requests.remove(parent.0);
        }
    }

    /// Records a rendezvous-side event (RENDEZVOUS, REPLY, ACK) into the
    /// receive request's history and reports progress (spec §4.5). Called by
    /// the rendezvous coordinator (C5).
    pub(crate) fn note_rendezvous_event(
        &mut self,
        requests: &mut RequestArena,
        req_id: ReqId,
        kind: EventType,
        needs_done_notify_ack: bool,
    ) -> RdzvNoteResult {
        let Some(recv) = requests.get_mut(req_id.0).and_then(|r| r.as_receive_mut()) else {
            return RdzvNoteResult::Pending;
        };
        if !recv.rdzv_events.record(kind) {
            // The initiator reused this rendezvous id before the prior
            // sequence finished draining.
            return RdzvNoteResult::Reused;
        }
        if recv.rdzv_events.is_complete(needs_done_notify_ack) {
            RdzvNoteResult::Complete
        } else {
            RdzvNoteResult::Pending
        }
    }

    /// Finalize a rendezvous receive once its history is complete.
    pub(crate) fn finish_rendezvous(
        &mut self,
        requests: &mut RequestArena,
        config: &Config,
        completions: &mut CompletionSink,
        req_id: ReqId,
    ) -> Result<(), Disposition> {
        self.complete_and_free(requests, config, completions, req_id)
    }

    fn complete_and_free(
        &mut self,
        requests: &mut RequestArena,
        config: &Config,
        completions: &mut CompletionSink,
        req_id: ReqId,
    ) -> Result<(), Disposition> {
        let truncated = requests.get(req_id.0).and_then(|r| r.as_receive()).map(|recv| {
            (recv.rlen > recv.ulen, recv.rlen, recv.ulen)
        });

        let err = match truncated {
            Some((true, rlen, ulen)) => Some(CompletionError::Truncated { received: rlen, posted: ulen }),
            _ => None,
        };
        let _ = config;

        self.emit_completion(requests, completions, req_id, err);

        let is_parent = requests
            .get(req_id.0)
            .and_then(|r| r.as_receive())
            .map(|r| !r.children.is_empty())
            .unwrap_or(false);
        if !is_parent {
            requests.remove(req_id.0);
        }
        Ok(())
    }

    fn emit_completion(
        &mut self,
        requests: &RequestArena,
        completions: &mut CompletionSink,
        req_id: ReqId,
        err: Option<CompletionError>,
    ) {
        if let Some(req) = requests.get(req_id.0) {
            if let Some(recv) = req.as_receive() {
                completions.push(Completion {
                    req_id,
                    context: req.context,
                    cq: req.cq,
                    flags: req.flags,
                    len: recv.data_len,
                    tag: recv.tag,
                    src: recv.match_id,
                    header_data: None,
                    err,
                });
            }
        }
    }

    /// spec §4.3.5 "Peek".
    fn peek(
        &mut self,
        requests: &mut RequestArena,
        cmdq: &mut dyn CommandQueue,
        completions: &mut CompletionSink,
        req_id: ReqId,
        claim: bool,
        peek_context: Option<usize>,
    ) -> Result<(), Disposition> {
        let Some(idx) = self.find_sw_match(requests, req_id) else {
            // No software hit: fall back to a hardware SEARCH if offload is
            // on, otherwise report NOMSG immediately.
            let hw = requests
                .get(req_id.0)
                .and_then(|r| r.as_receive())
                .map(|r| r.hw_offloaded)
                .unwrap_or(false);
            if hw {
                let (mb, ignore) = requests
                    .get(req_id.0)
                    .and_then(|r| r.as_receive())
                    .map(|r| (MatchBits::new().with_tag(r.tag), r.ignore))
                    .unwrap_or((MatchBits::new(), 0));
                return match cmdq.search(req_id, mb, ignore) {
                    Disposition::Success => Ok(()),
                    Disposition::TryLater => Err(Disposition::TryLater),
                    Disposition::Fatal(r) => Err(Disposition::Fatal(r)),
                };
            }
            self.emit_completion(requests, completions, req_id, Some(CompletionError::NoMessage));
            requests.remove(req_id.0);
            return Ok(());
        };

        if claim {
            self.sw_ux_list[idx].claimed = true;
            if let Some(recv) = requests.get_mut(req_id.0).and_then(|r| r.as_receive_mut()) {
                recv.peek.ule_offset = peek_context.map(|c| c as u64);
                recv.peek.offset_found = true;
            }
            let record = &self.sw_ux_list[idx];
            completions.push(Completion {
                req_id,
                context: requests.get(req_id.0).map(|r| r.context).unwrap_or(0),
                cq: requests.get(req_id.0).and_then(|r| r.cq),
                flags: RequestFlags::PEEK | RequestFlags::CLAIM,
                len: record.mlength,
                tag: record.match_bits.tag(),
                src: record.initiator,
                header_data: record.header_data,
                err: None,
            });
        } else {
            let record = self.sw_ux_list.remove(idx);
            self.emit_completion_for_peek(requests, completions, req_id, &record);
            self.sw_ux_list.insert(idx, record);
        }
        // Either way this request has already produced its one completion:
        // the unexpected record itself (not this request) carries the
        // `claimed` bit forward to the later CLAIM-only post.
        requests.remove(req_id.0);
        Ok(())
    }

    fn emit_completion_for_peek(
        &self,
        requests: &RequestArena,
        completions: &mut CompletionSink,
        req_id: ReqId,
        record: &UnexpectedSendRecord,
    ) {
        if let Some(req) = requests.get(req_id.0) {
            completions.push(Completion {
                req_id,
                context: req.context,
                cq: req.cq,
                flags: RequestFlags::PEEK,
                len: record.mlength,
                tag: record.match_bits.tag(),
                src: record.initiator,
                header_data: record.header_data,
                err: None,
            });
        }
    }

    /// spec §4.3.5: "a subsequent post with CLAIM and the same context
    /// retrieves the stored record."
    fn claim(
        &mut self,
        requests: &mut RequestArena,
        overflow: &mut OverflowPool,
        mem: &mut dyn MemoryRegion,
        completions: &mut CompletionSink,
        params: &PostParams,
    ) -> Result<ReqId, Disposition> {
        let Some(idx) = self.sw_ux_list.iter().position(|r| r.claimed) else {
            return Err(Disposition::Fatal(FatalReason::new(
                "claim: no claimed record for this peek context",
            )));
        };
        let record = self.sw_ux_list.remove(idx);

        let dst = if params.len > 0 {
            match mem.register(params.len) {
                Some(mr) => Some(mr),
                None => return Err(Disposition::TryLater),
            }
        } else {
            params.buf
        };

        let mut recv = ReceiveRequest::new(params.len, dst, params.tag, params.ignore, params.match_id);
        let copy_len = record.mlength.min(params.len);
        recv.data_len = copy_len;
        recv.rlen = record.rlength;

        let req_idx = requests.insert(Request {
            id: ReqId(0),
            callback: Callback::Recv,
            context: params.context,
            flags: params.flags,
            cq: params.cq,
            counter: params.counter,
            kind: RequestKind::Receive(recv),
        });
        let req_id = ReqId(req_idx);
        if let Some(req) = requests.get_mut(req_idx) {
            req.id = req_id;
        }

        if let (Some(dst), Some(overflow_id)) = (dst, record.overflow_req) {
            let src = requests.get_mut(overflow_id.0).and_then(|r| r.as_overflow_mut()).map(|o| {
                let src_offset = o.cur_offset;
                o.cur_offset += copy_len;
                (o.mr, src_offset)
            });
            if let Some((src_mr, src_offset)) = src {
                mem.copy_into(dst, 0, src_mr, src_offset, copy_len);
            }
            if let Some(o) = requests.get_mut(overflow_id.0).and_then(|r| r.as_overflow_mut()) {
                o.consumed += copy_len;
                o.deferred_pending = o.deferred_pending.saturating_sub(1);
            }
            let fully_consumed = requests
                .get(overflow_id.0)
                .and_then(|r| r.as_overflow())
                .map(|o| o.fully_consumed())
                .unwrap_or(false);
            if fully_consumed {
                overflow.retire(requests, overflow_id, mem);
            }
        }

        self.emit_completion(requests, completions, req_id, None);
        requests.remove(req_id.0);
        Ok(req_id)
    }

    /// spec §4.3 "Cancel".
    pub fn cancel(
        &mut self,
        requests: &mut RequestArena,
        cmdq: &mut dyn CommandQueue,
        completions: &mut CompletionSink,
        req_id: ReqId,
    ) -> Disposition {
        if let Some(pos) = self.sw_recv_queue.iter().position(|id| *id == req_id) {
            self.sw_recv_queue.remove(pos);
            self.emit_completion(requests, completions, req_id, Some(CompletionError::Canceled));
            requests.remove(req_id.0);
            return Disposition::Success;
        }

        if let Some(recv) = requests.get_mut(req_id.0).and_then(|r| r.as_receive_mut()) {
            recv.canceled = true;
        } else {
            return Disposition::Fatal(FatalReason::new("cancel: unknown request"));
        }
        trace!("unlinking {:?} for cancel", req_id);
        cmdq.unlink(req_id)
    }

    /// Re-scan the software queue against the unexpected list — called by
    /// the endpoint after onload adds new records so multi-receive parents
    /// left in `sw_recv_queue` get a chance at further matches.
    #[allow(clippy::too_many_arguments)]
    pub fn drain_software_matches(
        &mut self,
        requests: &mut RequestArena,
        deferred: &mut DeferredEventTable,
        overflow: &mut OverflowPool,
        cmdq: &mut dyn CommandQueue,
        mem: &mut dyn MemoryRegion,
        config: &Config,
        completions: &mut CompletionSink,
    ) {
        let mut progressed = true;
        while progressed {
            progressed = false;
            let pending: Vec<ReqId> = self.sw_recv_queue.iter().copied().collect();
            for req_id in pending {
                if let Some(idx) = self.find_sw_match(requests, req_id) {
                    let record = self.sw_ux_list.remove(idx);
                    if self
                        .sw_matched(requests, deferred, overflow, cmdq, mem, config, completions, req_id, record)
                        .is_ok()
                    {
                        if let Some(pos) = self.sw_recv_queue.iter().position(|id| *id == req_id) {
                            self.sw_recv_queue.remove(pos);
                        }
                        progressed = true;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::deferred::DeferredEventTable;

    struct NullCmdQ;
    impl CommandQueue for NullCmdQ {
        fn has_capacity(&self) -> bool {
            true
        }
        fn event_queue_saturated(&self) -> bool {
            false
        }
        fn append_priority(&mut self, _: ReqId, _: MatchBits, _: u64, _: Option<MrHandle>) -> Disposition {
            Disposition::Success
        }
        fn append_overflow(&mut self, _: ReqId, _: u64, _: MrHandle) -> Disposition {
            Disposition::Success
        }
        fn unlink(&mut self, _: ReqId) -> Disposition {
            Disposition::Success
        }
        fn search(&mut self, _: ReqId, _: MatchBits, _: u64) -> Disposition {
            Disposition::Success
        }
        fn search_and_delete(&mut self, _: ReqId, _: MatchBits, _: u64) -> Disposition {
            Disposition::Success
        }
        fn put_idc(&mut self, _: ReqId, _: crate::nic::FiAddr, _: MatchBits, _: &[u8]) -> Disposition {
            Disposition::Success
        }
        fn put_dma(&mut self, _: ReqId, _: crate::nic::FiAddr, _: MatchBits, _: MrHandle, _: u64) -> Disposition {
            Disposition::Success
        }
        fn get_dma(&mut self, _: ReqId, _: crate::nic::FiAddr, _: MrHandle, _: u64, _: u64, _: u64) -> Disposition {
            Disposition::Success
        }
        fn state_change(&mut self, _: ReqId, _: bool) -> Disposition {
            Disposition::Success
        }
    }

    struct NullMem;
    impl MemoryRegion for NullMem {
        fn register(&mut self, _: u64) -> Option<MrHandle> {
            Some(MrHandle(1))
        }
        fn deregister(&mut self, _: MrHandle) {}
        fn copy_into(&mut self, _: MrHandle, _: u64, _: MrHandle, _: u64, _: u64) {}
    }

    #[test]
    fn post_rejects_oversized_tag() {
        let mut engine = ReceiveEngine::new();
        let mut requests = RequestArena::new();
        let mut deferred = DeferredEventTable::new(16);
        let mut overflow = OverflowPool::new(crate::overflow::OverflowPoolConfig {
            buf_size: 4096,
            min_posted: 1,
            max_cached: 1,
            min_free: 1,
        });
        let mut cmdq = NullCmdQ;
        let mut mem = NullMem;
        let config = Config::default();
        let mut completions = Vec::new();

        let params = PostParams {
            buf: Some(MrHandle(1)),
            len: 16,
            match_id: MatchId::Any,
            tag: u64::MAX,
            ignore: 0,
            flags: RequestFlags::RECV | RequestFlags::TAGGED,
            context: 0,
            cq: None,
            counter: None,
            peek_context: None,
        };

        let result = engine.post(
            &mut requests,
            &mut deferred,
            &mut overflow,
            &mut cmdq,
            &mut mem,
            &config,
            true,
            &mut completions,
            params,
        );
        assert!(matches!(result, Err(Disposition::Fatal(_))));
    }

    #[test]
    fn post_returns_try_later_when_disabled() {
        let mut engine = ReceiveEngine::new();
        let mut requests = RequestArena::new();
        let mut deferred = DeferredEventTable::new(16);
        let mut overflow = OverflowPool::new(crate::overflow::OverflowPoolConfig {
            buf_size: 4096,
            min_posted: 1,
            max_cached: 1,
            min_free: 1,
        });
        let mut cmdq = NullCmdQ;
        let mut mem = NullMem;
        let config = Config::default();
        let mut completions = Vec::new();

        let params = PostParams {
            buf: Some(MrHandle(1)),
            len: 16,
            match_id: MatchId::Any,
            tag: 7,
            ignore: 0,
            flags: RequestFlags::RECV | RequestFlags::TAGGED,
            context: 0,
            cq: None,
            counter: None,
            peek_context: None,
        };

        let result = engine.post(
            &mut requests,
            &mut deferred,
            &mut overflow,
            &mut cmdq,
            &mut mem,
            &config,
            false,
            &mut completions,
            params,
        );
        assert!(matches!(result, Err(Disposition::TryLater)));
    }
}
