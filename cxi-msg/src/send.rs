// SPDX-License-Identifier: BSD-3-Clause

//! C6: the send engine. Picks an eager or rendezvous path, tracks in-flight
//! sends, and routes drops into the per-peer replay queue (spec §4.6, §4.7.2).

use std::collections::{HashMap, VecDeque};

use log::{debug, trace};

use crate::completion::{Completion, CompletionSink};
use crate::config::Config;
use crate::error::{CompletionError, Disposition, FatalReason};
use crate::matchbits::{LeType, MatchBits, RdzvProtoBits, RequestFlags};
use crate::nic::{physical_to_fi_addr, CAddr, CommandQueue, CqHandle, CounterHandle, Event, FiAddr, ReturnCode};
use crate::request::{Callback, ReqId, Request, RequestArena, RequestKind, SendPayload, SendRequest};

fn to_fi_addr(caddr: CAddr) -> FiAddr {
    physical_to_fi_addr(caddr.nic, caddr.pid)
}

/// Which wire path an outbound send takes (spec §4.6's selection table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendPath {
    EagerIdc,
    EagerDma,
    Rendezvous,
}

fn choose_path(len: u64, inject: bool, triggered: bool, config: &Config) -> SendPath {
    if len == 0 {
        SendPath::EagerDma
    } else if !triggered && (inject || (len <= config.inject_size && !config.disable_non_inject_msg_idc)) {
        SendPath::EagerIdc
    } else if len <= config.rdzv_threshold {
        SendPath::EagerDma
    } else {
        SendPath::Rendezvous
    }
}

pub struct SendParams {
    pub caddr: CAddr,
    pub dest: FiAddr,
    pub tag: u64,
    pub payload: SendPayload,
    pub flags: RequestFlags,
    pub context: u64,
    pub cq: Option<CqHandle>,
    pub counter: Option<CounterHandle>,
    pub inject: bool,
    pub triggered: bool,
}

/// Sender-side per-disabled-peer bookkeeping (spec §3 "Flow-control peer").
pub struct FcPeer {
    pub dest: CAddr,
    pub pending: u32,
    pub dropped: u32,
    pub pending_acks: u32,
    pub replayed: bool,
    pub queue: VecDeque<ReqId>,
}

/// C6. Owns the in-flight message queue, the tx-id allocator, and the
/// sender-side flow-control peer table.
pub struct SendEngine {
    pub msg_queue: VecDeque<ReqId>,
    pub fc_peers: HashMap<CAddr, FcPeer>,
    next_tx_id: u32,
    free_tx_ids: Vec<u32>,
    next_rdzv_id: u32,
}

impl Default for SendEngine {
    fn default() -> Self {
        Self {
            msg_queue: VecDeque::new(),
            fc_peers: HashMap::new(),
            next_tx_id: 0,
            free_tx_ids: Vec::new(),
            // Starts at 1: consumers treat `match_bits.rdzv_id() != 0` as the
            // rendezvous sentinel (recv.rs, network.rs, deferred.rs), so 0
            // must never be handed out as a live rendezvous id.
            next_rdzv_id: 1,
        }
    }
}

impl SendEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_tx_id(&mut self) -> u32 {
        self.free_tx_ids.pop().unwrap_or_else(|| {
            let id = self.next_tx_id;
            self.next_tx_id = self.next_tx_id.wrapping_add(1);
            id
        })
    }

    fn free_tx_id(&mut self, id: u32) {
        self.free_tx_ids.push(id);
    }

    fn alloc_rdzv_id(&mut self) -> u32 {
        let id = self.next_rdzv_id;
        self.next_rdzv_id = self.next_rdzv_id.wrapping_add(1);
        if self.next_rdzv_id == 0 {
            // Skip the sentinel value on wraparound.
            self.next_rdzv_id = 1;
        }
        id
    }

    /// spec §4.6 "Queue discipline": refuse new posts to an already-disabled
    /// peer with `try-later`.
    #[allow(clippy::too_many_arguments)]
    pub fn post(
        &mut self,
        requests: &mut RequestArena,
        cmdq: &mut dyn CommandQueue,
        config: &Config,
        params: SendParams,
    ) -> Result<ReqId, Disposition> {
        if self.fc_peers.contains_key(&params.caddr) {
            return Err(Disposition::TryLater);
        }
        if !cmdq.has_capacity() {
            return Err(Disposition::TryLater);
        }

        let len = params.payload.len();
        let path = choose_path(len, params.inject, params.triggered, config);

        let tx_id = if params.flags.contains(RequestFlags::MATCH_COMPLETE) {
            Some(self.alloc_tx_id())
        } else {
            None
        };
        let rdzv_id = matches!(path, SendPath::Rendezvous).then(|| self.alloc_rdzv_id());

        let mut match_bits = MatchBits::new()
            .with_tag(params.tag)
            .with_tagged(params.flags.contains(RequestFlags::TAGGED))
            .with_cq_data(params.flags.contains(RequestFlags::REMOTE_CQ_DATA))
            .with_match_complete(tx_id.is_some())
            .with_le_type(LeType::Rx);
        if let Some(id) = tx_id {
            match_bits = match_bits.with_tx_id(id);
        }
        if let Some(id) = rdzv_id {
            match_bits = match_bits
                .with_rdzv_id(id)
                .with_rdzv_proto(RdzvProtoBits::Restricted);
        }

        let send = SendRequest {
            caddr: params.caddr,
            dest: params.dest,
            tag: params.tag,
            payload: params.payload,
            match_bits,
            rdzv_id,
            initiator_events: 0,
            fc_peer: None,
            match_complete_tx_id: tx_id,
        };

        let idx = requests.insert(Request {
            id: ReqId(0),
            callback: Callback::Send,
            context: params.context,
            flags: params.flags,
            cq: params.cq,
            counter: params.counter,
            kind: RequestKind::Send(send),
        });
        let req_id = ReqId(idx);
        if let Some(req) = requests.get_mut(idx) {
            req.id = req_id;
        }
        self.msg_queue.push_back(req_id);

        let disposition = self.emit(requests, cmdq, config, req_id, path);
        match disposition {
            Disposition::Success => Ok(req_id),
            other => {
                if let Some(id) = tx_id {
                    self.free_tx_id(id);
                }
                self.msg_queue.retain(|id| *id != req_id);
                requests.remove(idx);
                Err(other)
            }
        }
    }

    fn emit(
        &mut self,
        requests: &mut RequestArena,
        cmdq: &mut dyn CommandQueue,
        config: &Config,
        req_id: ReqId,
        path: SendPath,
    ) -> Disposition {
        let Some(send) = requests.get(req_id.0).and_then(|r| r.as_send()) else {
            return Disposition::Fatal(FatalReason::new("emit: send request vanished"));
        };
        let match_bits = send.match_bits;

        match path {
            SendPath::EagerIdc => {
                let bytes = match &send.payload {
                    SendPayload::Inline(b) => b.clone(),
                    SendPayload::Registered { .. } => {
                        return Disposition::Fatal(FatalReason::new("IDC path requires an inline payload"));
                    }
                };
                cmdq.put_idc(req_id, send.dest, match_bits, &bytes)
            }
            SendPath::EagerDma => match &send.payload {
                SendPayload::Registered { mr, len } => cmdq.put_dma(req_id, send.dest, match_bits, *mr, *len),
                SendPayload::Inline(bytes) => cmdq.put_idc(req_id, send.dest, match_bits, bytes),
            },
            SendPath::Rendezvous => match &send.payload {
                SendPayload::Registered { mr, .. } => {
                    cmdq.put_dma(req_id, send.dest, match_bits, *mr, config.rdzv_eager_size)
                }
                SendPayload::Inline(_) => {
                    Disposition::Fatal(FatalReason::new("rendezvous path requires a registered buffer"))
                }
            },
        }
    }

    /// spec §4.6 "Eager ACK callback".
    pub fn on_ack_event(
        &mut self,
        requests: &mut RequestArena,
        completions: &mut CompletionSink,
        event: &Event,
    ) -> Disposition {
        let req_id = event.user_ptr;

        if event.return_code == ReturnCode::PtDisabled {
            return self.handle_drop(requests, req_id);
        }

        self.msg_queue.retain(|id| *id != req_id);

        let (needs_notify, tx_id) = requests
            .get(req_id.0)
            .and_then(|r| r.as_send())
            .map(|s| (s.match_complete_tx_id.is_some(), s.match_complete_tx_id))
            .unwrap_or((false, None));

        if needs_notify {
            // Completion deferred until the target's match-complete notify
            // lands, correlated by `tx_id` (spec §4.6). The tx-id itself
            // stays allocated until then.
            let _ = tx_id;
            return Disposition::Success;
        }

        self.complete(requests, completions, req_id, translate_return_code(event.return_code))
    }

    /// spec §4.6 "Rendezvous ACK callback".
    pub fn on_rendezvous_ack_event(
        &mut self,
        requests: &mut RequestArena,
        completions: &mut CompletionSink,
        event: &Event,
    ) -> Disposition {
        let req_id = event.user_ptr;
        if event.return_code == ReturnCode::PtDisabled {
            if let Some(send) = requests.get_mut(req_id.0).and_then(|r| r.as_send_mut()) {
                send.rdzv_id = None;
            }
            return self.handle_drop(requests, req_id);
        }
        self.note_initiator_event(requests, completions, req_id)
    }

    /// The target-initiated `GET` landing on this sender's rendezvous-source
    /// PTE (the other half of rendezvous-send completion, spec §4.6).
    pub fn on_source_get_event(
        &mut self,
        requests: &mut RequestArena,
        completions: &mut CompletionSink,
        event: &Event,
    ) -> Disposition {
        self.note_initiator_event(requests, completions, event.user_ptr)
    }

    fn note_initiator_event(
        &mut self,
        requests: &mut RequestArena,
        completions: &mut CompletionSink,
        req_id: ReqId,
    ) -> Disposition {
        let count = requests.get_mut(req_id.0).and_then(|r| r.as_send_mut()).map(|send| {
            send.initiator_events += 1;
            send.initiator_events
        });

        match count {
            Some(n) if n >= 2 => {
                self.msg_queue.retain(|id| *id != req_id);
                self.complete(requests, completions, req_id, None)
            }
            Some(_) => Disposition::Success,
            None => Disposition::Fatal(FatalReason::new("rendezvous ack for unknown send")),
        }
    }

    fn complete(
        &mut self,
        requests: &mut RequestArena,
        completions: &mut CompletionSink,
        req_id: ReqId,
        err: Option<CompletionError>,
    ) {
        if let Some(req) = requests.get(req_id.0) {
            completions.push(Completion {
                req_id,
                context: req.context,
                cq: req.cq,
                flags: req.flags,
                len: req.as_send().map(|s| s.payload.len()).unwrap_or(0),
                tag: req.as_send().map(|s| s.tag).unwrap_or(0),
                src: crate::nic::MatchId::Any,
                header_data: None,
                err,
            });
        }
        if let Some(req) = requests.get(req_id.0).and_then(|r| r.as_send()) {
            if let Some(id) = req.match_complete_tx_id {
                self.free_tx_id(id);
            }
        }
        requests.remove(req_id.0);
    }

    /// spec §4.7.2 "Sender-side drop/resume": the first drop to a peer
    /// creates its `fc_peer` and pulls every other in-flight send destined
    /// there into its replay queue, preserving order.
    fn handle_drop(&mut self, requests: &mut RequestArena, dropped_req: ReqId) -> Disposition {
        let Some(dest) = requests.get(dropped_req.0).and_then(|r| r.as_send()).map(|s| s.caddr) else {
            return Disposition::Fatal(FatalReason::new("drop ack for an unknown send"));
        };

        if !self.fc_peers.contains_key(&dest) {
            let mut moved = VecDeque::new();
            let mut remaining = VecDeque::new();
            for id in self.msg_queue.drain(..) {
                let same_dest = requests.get(id.0).and_then(|r| r.as_send()).map(|s| s.caddr) == Some(dest);
                if same_dest {
                    moved.push_back(id);
                } else {
                    remaining.push_back(id);
                }
            }
            self.msg_queue = remaining;
            if !moved.iter().any(|id| *id == dropped_req) {
                moved.push_back(dropped_req);
            }
            for id in &moved {
                if let Some(s) = requests.get_mut(id.0).and_then(|r| r.as_send_mut()) {
                    s.fc_peer = Some(dest);
                }
            }
            let pending = moved.len() as u32;
            debug!("peer {:?} disabled, {} send(s) queued for replay", dest, pending);
            self.fc_peers.insert(
                dest,
                FcPeer {
                    dest,
                    pending,
                    dropped: pending,
                    pending_acks: 1,
                    replayed: false,
                    queue: moved,
                },
            );
            return Disposition::Success;
        }

        self.msg_queue.retain(|id| *id != dropped_req);
        if let Some(peer) = self.fc_peers.get_mut(&dest) {
            if !peer.queue.iter().any(|id| *id == dropped_req) {
                peer.queue.push_back(dropped_req);
                peer.pending += 1;
                peer.dropped += 1;
            }
        }
        if let Some(s) = requests.get_mut(dropped_req.0).and_then(|r| r.as_send_mut()) {
            s.fc_peer = Some(dest);
        }
        Disposition::Success
    }

    /// Emits the `FC_NOTIFY` control message for a disabled peer. The
    /// endpoint calls this once, right after the drop is first observed,
    /// since under this single-threaded model the full in-flight set for
    /// the peer is already known synchronously (see DESIGN.md).
    pub fn notify_peer(&mut self, cmdq: &mut dyn CommandQueue, dest: CAddr) -> Disposition {
        let Some(peer) = self.fc_peers.get(&dest) else {
            return Disposition::Fatal(FatalReason::new("notify_peer: no fc_peer for this destination"));
        };
        let ctrl_bits = MatchBits::new().with_le_type(LeType::Ctrl).with_tx_id(peer.dropped);
        cmdq.put_idc(ReqId(u32::MAX), to_fi_addr(dest), ctrl_bits, &[])
    }

    /// spec §4.7.2: "Sender's RESUME callback replays queued sends in order
    /// ... and then, if all NOTIFY acks are in, frees the peer record."
    pub fn on_resume(&mut self, requests: &mut RequestArena, cmdq: &mut dyn CommandQueue, config: &Config, dest: CAddr) -> Disposition {
        let Some(peer) = self.fc_peers.get_mut(&dest) else {
            return Disposition::Success;
        };

        while let Some(req_id) = peer.queue.front().copied() {
            let path = requests
                .get(req_id.0)
                .and_then(|r| r.as_send())
                .map(|s| choose_path(s.payload.len(), false, false, config))
                .unwrap_or(SendPath::EagerDma);

            if !cmdq.has_capacity() {
                return Disposition::TryLater;
            }
            match self.emit(requests, cmdq, config, req_id, path) {
                Disposition::Success => {
                    peer.queue.pop_front();
                    self.msg_queue.push_back(req_id);
                }
                Disposition::TryLater => return Disposition::TryLater,
                Disposition::Fatal(r) => return Disposition::Fatal(r),
            }
        }

        peer.replayed = true;
        trace!("replay drained for peer {:?}", dest);
        if peer.pending_acks == 0 {
            self.fc_peers.remove(&dest);
        }
        Disposition::Success
    }

    /// The acknowledgement for this sender's own `FC_NOTIFY`.
    pub fn on_notify_ack(&mut self, dest: CAddr) {
        if let Some(peer) = self.fc_peers.get_mut(&dest) {
            peer.pending_acks = peer.pending_acks.saturating_sub(1);
            if peer.replayed && peer.pending_acks == 0 {
                self.fc_peers.remove(&dest);
            }
        }
    }

    pub fn has_fc_peer(&self, peer: CAddr) -> bool {
        self.fc_peers.contains_key(&peer)
    }

    /// spec §4.6/§4.3.3 step 6: the target's match-complete notify landed,
    /// correlated by `tx_id`. The eager ACK for this send already arrived
    /// and was held back pending exactly this (spec §4.6's deferred-notify
    /// row); complete it now.
    pub fn on_match_complete_notify(
        &mut self,
        requests: &mut RequestArena,
        completions: &mut CompletionSink,
        tx_id: u32,
    ) -> Disposition {
        let req_id = self.msg_queue.iter().copied().find(|id| {
            requests
                .get(id.0)
                .and_then(|r| r.as_send())
                .map(|s| s.match_complete_tx_id == Some(tx_id))
                .unwrap_or(false)
        });
        match req_id {
            Some(id) => {
                self.msg_queue.retain(|i| *i != id);
                self.complete(requests, completions, id, None);
                Disposition::Success
            }
            None => Disposition::Fatal(FatalReason::new("match-complete notify for unknown tx_id")),
        }
    }
}

fn translate_return_code(code: ReturnCode) -> Option<CompletionError> {
    match code {
        ReturnCode::Ok => None,
        ReturnCode::Provider(p) => Some(CompletionError::Provider(crate::error::ProviderCode(p))),
        other => Some(CompletionError::Provider(crate::error::ProviderCode(other_code(other)))),
    }
}

fn other_code(code: ReturnCode) -> i32 {
    match code {
        ReturnCode::FlowControl => 1,
        ReturnCode::SoftwareManagedTransition => 2,
        ReturnCode::NoSpace => 3,
        ReturnCode::PtDisabled => 4,
        ReturnCode::EntryNotFound => 5,
        ReturnCode::DisUncor => 6,
        ReturnCode::Ok | ReturnCode::Provider(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn chooses_idc_for_small_non_triggered_sends() {
        let config = Config::default();
        assert_eq!(choose_path(64, false, false, &config), SendPath::EagerIdc);
    }

    #[test]
    fn chooses_rendezvous_above_threshold() {
        let config = Config::default();
        assert_eq!(
            choose_path(config.rdzv_threshold + 1, false, false, &config),
            SendPath::Rendezvous
        );
    }

    #[test]
    fn zero_length_is_always_eager_dma() {
        let config = Config::default();
        assert_eq!(choose_path(0, true, false, &config), SendPath::EagerDma);
    }

    #[test]
    fn triggered_sends_never_use_idc() {
        let config = Config::default();
        assert_eq!(choose_path(8, true, true, &config), SendPath::EagerDma);
    }
}
