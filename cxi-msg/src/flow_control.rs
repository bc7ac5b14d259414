// SPDX-License-Identifier: BSD-3-Clause

//! C7: the flow-control subsystem. Two interleaved responsibilities —
//! receiver-side endpoint-state transitions (spec §4.7.1) and sender-side
//! drop/resume bookkeeping, the latter owned by [`crate::send::SendEngine`].

use log::{info, warn};

use crate::completion::CompletionSink;
use crate::config::{Config, DropCountInit};
use crate::error::{Disposition, FatalReason};
use crate::matchbits::{LeType, MatchBits};
use crate::nic::{physical_to_fi_addr, CAddr, CommandQueue, Event, MemoryRegion, ReturnCode};
use crate::overflow::OverflowPool;
use crate::recv::ReceiveEngine;
use crate::request::{ReqId, RequestArena};
use crate::send::SendEngine;

/// spec §3 "Receive-endpoint state machine".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Disabled,
    Enabled,
    EnabledSoftware,
    PendingPtlteDisable,
    PendingPtlteSoftwareManaged,
    PendingPtlteHardware,
    OnloadFlowControl,
    OnloadFlowControlReenable,
    FlowControl,
}

/// Per-peer receive-side drop accounting (spec §4.7.2 "receiver-side NOTIFY
/// handling").
#[derive(Debug, Clone, Default)]
struct PeerDrops {
    drop_count: i64,
    target_drop_count: Option<i64>,
    notifies_received: u32,
}

/// C7. Owns the endpoint's receive-side state and the onload bookkeeping
/// that accompanies it.
pub struct FlowControlSubsystem {
    state: EndpointState,
    prev_state: Option<EndpointState>,
    drop_count: i64,
    known_peers: Vec<CAddr>,
    peer_drops: std::collections::HashMap<CAddr, PeerDrops>,
}

impl FlowControlSubsystem {
    pub fn new(config: &Config) -> Self {
        Self {
            state: EndpointState::Enabled,
            prev_state: None,
            drop_count: config.drop_count_init.initial_value(),
            known_peers: Vec::new(),
            peer_drops: std::collections::HashMap::new(),
        }
    }

    pub fn state(&self) -> EndpointState {
        self.state
    }

    pub fn note_peer(&mut self, peer: CAddr) {
        if !self.known_peers.contains(&peer) {
            self.known_peers.push(peer);
        }
    }

    /// ENABLED -> PENDING_PTLTE_DISABLE, for an application-initiated disable.
    pub fn request_disable(&mut self, cmdq: &mut dyn CommandQueue, req_id: ReqId) -> Disposition {
        if self.state != EndpointState::Enabled {
            return Disposition::Fatal(FatalReason::new("request_disable: endpoint not enabled"));
        }
        match cmdq.state_change(req_id, false) {
            Disposition::Success => {
                self.transition(EndpointState::PendingPtlteDisable);
                Disposition::Success
            }
            other => other,
        }
    }

    /// spec §4.7.1 "Hybrid preemptive transitions": called on every `LINK`
    /// event with the current LE-pool usage fraction.
    pub fn check_link_usage(&mut self, cmdq: &mut dyn CommandQueue, req_id: ReqId, config: &Config, usage_fraction: f64) -> Disposition {
        if self.preemption_due(config, config.hybrid_preemptive.on_link_le_usage, usage_fraction > 0.5) {
            return self.request_disable(cmdq, req_id);
        }
        Disposition::Success
    }

    /// spec §4.7.1: called on each post with the current posted-receive count.
    pub fn check_posted_recv_count(&mut self, cmdq: &mut dyn CommandQueue, req_id: ReqId, config: &Config, posted: u64, hint: u64) -> Disposition {
        if self.preemption_due(config, config.hybrid_preemptive.on_posted_recv_count, posted > hint) {
            return self.request_disable(cmdq, req_id);
        }
        Disposition::Success
    }

    /// spec §4.7.1: called on unexpected-message arrival with the outstanding
    /// unexpected-header count.
    pub fn check_unexpected_msg_count(&mut self, cmdq: &mut dyn CommandQueue, req_id: ReqId, config: &Config, outstanding: u64, hint: u64) -> Disposition {
        if self.preemption_due(config, config.hybrid_preemptive.on_unexpected_msg_count, outstanding > hint) {
            return self.request_disable(cmdq, req_id);
        }
        Disposition::Success
    }

    fn preemption_due(&self, config: &Config, check_enabled: bool, condition: bool) -> bool {
        self.state == EndpointState::Enabled
            && config.hybrid_preemptive.enabled
            && check_enabled
            && condition
    }

    /// spec §4.7.1's state table, driven by NIC `StateChange` events. Also
    /// takes the unexpected-list onload's destination (spec §4.7.1 "Onload
    /// UX"): each `PUT_OVERFLOW` returned by the barrier's
    /// `search_and_delete` is handed to [`ReceiveEngine`] the same way a
    /// live overflow event would be.
    #[allow(clippy::too_many_arguments)]
    pub fn on_state_change_event(
        &mut self,
        requests: &mut RequestArena,
        _recv_engine: &mut ReceiveEngine,
        overflow: &mut OverflowPool,
        cmdq: &mut dyn CommandQueue,
        mem: &mut dyn MemoryRegion,
        config: &Config,
        _completions: &mut CompletionSink,
        event: &Event,
    ) -> Disposition {
        let _ = config;
        match event.return_code {
            ReturnCode::DisUncor => {
                return Disposition::Fatal(FatalReason::new("DIS_UNCOR: unrecoverable PTE disable"));
            }
            ReturnCode::FlowControl => {
                if self.state != EndpointState::Enabled {
                    return Disposition::Fatal(FatalReason::new("SC_FC_* received outside ENABLED"));
                }
                self.prev_state = Some(self.state);
                self.transition(EndpointState::OnloadFlowControl);
                return self.flush_and_onload(cmdq);
            }
            ReturnCode::SoftwareManagedTransition => {
                if self.state != EndpointState::Enabled {
                    return Disposition::Fatal(FatalReason::new("SM_*_FAIL received outside ENABLED"));
                }
                self.prev_state = Some(self.state);
                self.transition(EndpointState::PendingPtlteSoftwareManaged);
                return self.flush_and_onload(cmdq);
            }
            ReturnCode::Ok => {}
            other => {
                warn!("unexpected state-change return code {:?}", other);
                return Disposition::Fatal(FatalReason::new("unexpected state-change return code"));
            }
        }

        match self.state {
            EndpointState::PendingPtlteDisable => {
                self.transition(EndpointState::Disabled);
                Disposition::Success
            }
            EndpointState::OnloadFlowControlReenable => {
                self.transition(EndpointState::FlowControl);
                match overflow.replenish(requests, cmdq, mem) {
                    Disposition::Success => cmdq.state_change(event.user_ptr, false),
                    other => other,
                }
            }
            EndpointState::PendingPtlteSoftwareManaged => {
                self.transition(EndpointState::EnabledSoftware);
                overflow.replenish(requests, cmdq, mem)
            }
            _ => Disposition::Success,
        }
    }

    /// "ULE freed event during onload" row of the table.
    pub fn on_ule_freed(&mut self) {
        if self.state == EndpointState::OnloadFlowControl {
            self.transition(EndpointState::OnloadFlowControlReenable);
        }
    }

    /// spec §4.7.1 "Flush-appends": a SEARCH that matches nothing, whose
    /// completion is a barrier proving all previously submitted appends have
    /// drained, followed by the onload `SEARCH_AND_DELETE`. The records it
    /// returns arrive later as ordinary `PUT_OVERFLOW`-shaped events into
    /// [`ReceiveEngine::handle_event`], same as a live overflow landing.
    fn flush_and_onload(&mut self, cmdq: &mut dyn CommandQueue) -> Disposition {
        let barrier_req = ReqId(u32::MAX);
        let barrier_bits = MatchBits::new().with_tag(u64::MAX);
        match cmdq.search(barrier_req, barrier_bits, 0) {
            Disposition::Success => {}
            other => return other,
        }
        match cmdq.search_and_delete(barrier_req, MatchBits::new(), u64::MAX) {
            Disposition::Success => {}
            other => return other,
        }
        self.drop_count = DropCountInit::StartsAtZero.initial_value();
        Disposition::Success
    }

    /// spec §4.7.1 "Drop-count discipline". `target` is the NIC-reported
    /// target drop count for this peer-notify; re-enable is attempted
    /// repeatedly until the local count matches it.
    pub fn on_notify(
        &mut self,
        requests: &mut RequestArena,
        send: &mut SendEngine,
        cmdq: &mut dyn CommandQueue,
        config: &Config,
        peer: CAddr,
        target: i64,
    ) -> Disposition {
        self.note_peer(peer);
        let entry = self.peer_drops.entry(peer).or_default();
        entry.drop_count += 1;
        entry.target_drop_count = Some(target);
        entry.notifies_received += 1;

        let all_matched = self.known_peers.iter().all(|p| {
            self.peer_drops
                .get(p)
                .map(|d| Some(d.drop_count) == d.target_drop_count)
                .unwrap_or(false)
        });

        if !all_matched || self.state != EndpointState::FlowControl {
            return Disposition::Success;
        }

        // FLOW_CONTROL is only reached via the hardware SC_FC_* path
        // (ONLOAD_FLOW_CONTROL -> ONLOAD_FLOW_CONTROL_REENABLE -> FLOW_CONTROL);
        // the software-managed transition (SM_*_FAIL) goes straight from
        // PENDING_PTLTE_SOFTWARE_MANAGED to ENABLED_SOFTWARE on onload
        // complete, with no drop-count gate and no PT disable visible to
        // senders (spec §4.7.1's table gives it its own "onload complete"
        // trigger, distinct from "drop counts match target's"). So the only
        // re-enable this row ever produces is ENABLED.
        self.transition(EndpointState::Enabled);

        // spec §4.7.1: "send RESUME to each peer with stored drops" — this is
        // a wire message to the *remote* sender, not a local replay (that
        // happens on the other side when its own `handle_resume` fires); see
        // DESIGN.md for why `send.on_resume` is also called here.
        for p in self.known_peers.clone() {
            match self.send_resume(cmdq, p) {
                Disposition::Success => {}
                other => return other,
            }
            match send.on_resume(requests, cmdq, config, p) {
                Disposition::Success => {}
                other => return other,
            }
        }
        Disposition::Success
    }

    /// Emits the `FC_RESUME` control message (spec §6.2) telling peer `dest`
    /// it may replay its queued sends.
    fn send_resume(&self, cmdq: &mut dyn CommandQueue, dest: CAddr) -> Disposition {
        let bits = MatchBits::new().with_le_type(LeType::Ctrl).with_ctrl_is_resume(true);
        cmdq.put_idc(ReqId(u32::MAX), physical_to_fi_addr(dest.nic, dest.pid), bits, &[])
    }

    fn transition(&mut self, to: EndpointState) {
        info!("endpoint state {:?} -> {:?}", self.state, to);
        self.prev_state = Some(self.state);
        self.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_enabled() {
        let config = Config::default();
        let fc = FlowControlSubsystem::new(&config);
        assert_eq!(fc.state(), EndpointState::Enabled);
        assert_eq!(fc.drop_count, 0);
    }

    #[test]
    fn negative_one_init_is_honored() {
        let mut config = Config::default();
        config.drop_count_init = DropCountInit::StartsAtNegativeOne;
        let fc = FlowControlSubsystem::new(&config);
        assert_eq!(fc.drop_count, -1);
    }

    #[test]
    fn preemption_only_fires_when_hybrid_enabled() {
        let mut config = Config::default();
        config.hybrid_preemptive.enabled = false;
        let fc = FlowControlSubsystem::new(&config);
        assert!(!fc.preemption_due(&config, true, true));
        config.hybrid_preemptive.enabled = true;
        assert!(fc.preemption_due(&config, true, true));
    }
}
