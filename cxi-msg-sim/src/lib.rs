// SPDX-License-Identifier: BSD-3-Clause

//! An in-memory NIC and the thin per-peer harness that drives [`cxi_msg`]
//! against it. Exists so the six scenarios of spec §8 ("Illustrative
//! end-to-end scenarios") can run as ordinary tests without a real CXI
//! device: [`Fabric`] plays the NIC's priority/overflow lists and event
//! queues, [`Peer`] plays one process's endpoint plus its own view onto
//! that fabric.

pub mod memory;
pub mod network;

use cxi_msg::completion::{Completion, CompletionSink};
use cxi_msg::config::Config;
use cxi_msg::endpoint::{Endpoint, DEFAULT_PROGRESS_BATCH};
use cxi_msg::error::Disposition;
use cxi_msg::nic::{physical_to_fi_addr, CAddr, FiAddr, MrHandle, ReturnCode};
use cxi_msg::recv::{PostOutcome, PostParams};
use cxi_msg::request::ReqId;
use cxi_msg::send::SendParams;

pub use network::{ControlMsg, Fabric};

/// One process's view of the world: its own endpoint plus the fabric views
/// (`cmdq`, `mem`) it was handed at creation. Never touches another peer's
/// state directly — cross-endpoint effects only ever happen inside
/// [`network::FabricInner`], the same separation of concerns a real process
/// has from its neighbors.
pub struct Peer {
    pub caddr: CAddr,
    pub endpoint: Endpoint,
    pub completions: CompletionSink,
    cmdq: network::SimCommandQueue,
    mem: network::SimMemoryView,
    fabric: Fabric,
}

impl Peer {
    pub fn fi_addr(&self) -> FiAddr {
        fi_addr_of(self.caddr)
    }

    pub fn register(&mut self, len: u64) -> MrHandle {
        use cxi_msg::nic::MemoryRegion;
        self.mem.register(len).expect("sim memory registration never fails")
    }

    pub fn write(&self, mr: MrHandle, offset: u64, data: &[u8]) {
        self.fabric.write(self.caddr, mr, offset, data);
    }

    pub fn read(&self, mr: MrHandle, offset: u64, len: u64) -> Vec<u8> {
        self.fabric.read(self.caddr, mr, offset, len)
    }

    pub fn prime_overflow(&mut self) -> Disposition {
        self.endpoint.prime_overflow(&mut self.cmdq, &mut self.mem)
    }

    pub fn post_recv(&mut self, params: PostParams) -> Result<(ReqId, PostOutcome), Disposition> {
        self.endpoint.post_recv(&mut self.cmdq, &mut self.mem, &mut self.completions, params)
    }

    pub fn post_send(&mut self, params: SendParams) -> Result<ReqId, Disposition> {
        self.endpoint.post_send(&mut self.cmdq, params)
    }

    pub fn cancel(&mut self, req_id: ReqId) -> Disposition {
        self.endpoint.cancel(&mut self.cmdq, &mut self.completions, req_id)
    }

    /// Drains whatever the fabric queued for this peer since the last call,
    /// up to `batch` events, the way a real process would between epochs of
    /// its progress loop (spec §5).
    pub fn progress(&mut self, batch: usize) -> Disposition {
        let mut events = self.fabric.drain_events(self.caddr);
        let result = self.endpoint.progress(&mut self.cmdq, &mut self.mem, &mut self.completions, &mut events, batch);
        self.fabric.push_events_front(self.caddr, events);
        result
    }

    pub fn progress_default(&mut self) -> Disposition {
        self.progress(DEFAULT_PROGRESS_BATCH)
    }

    pub fn has_events(&self) -> bool {
        self.fabric.has_events(self.caddr)
    }

    pub fn drain_software_matches(&mut self) {
        self.endpoint.drain_software_matches(&mut self.cmdq, &mut self.mem, &mut self.completions);
    }

    /// Drains every control message (match-complete notify, FC notify/resume)
    /// queued for this peer and feeds each to the matching `Endpoint` method
    /// (spec §6.2; these never ride the NIC event queue, see
    /// [`network::ControlMsg`]'s own doc comment).
    pub fn poll_ctrl(&mut self) -> Disposition {
        while let Some(msg) = self.fabric.pop_ctrl(self.caddr) {
            let disposition = match msg {
                ControlMsg::MatchCompleteNotify { tx_id } => {
                    self.endpoint.handle_match_complete_notify(&mut self.completions, tx_id)
                }
                ControlMsg::FcNotify { from, drop_count } => self.endpoint.handle_notify(&mut self.cmdq, from, drop_count),
                ControlMsg::FcResume { from } => self.endpoint.handle_resume(&mut self.cmdq, from),
            };
            if !matches!(disposition, Disposition::Success) {
                return disposition;
            }
        }
        Disposition::Success
    }

    /// Notifies `peer` that this endpoint disabled receive into it, if a
    /// flow-control peer record was created for it (spec §4.7.2). A harness
    /// calls this once, right after whatever drove the disable (here,
    /// [`Fabric::set_disabled`] plus a failed send).
    pub fn notify_disabled_peer(&mut self, peer: CAddr) -> Disposition {
        if self.endpoint.has_fc_peer(peer) {
            self.endpoint.notify_peer_disabled(&mut self.cmdq, peer)
        } else {
            Disposition::Success
        }
    }

    pub fn ack_notify(&mut self, peer: CAddr) {
        self.endpoint.ack_notify(peer);
    }

    pub fn drain_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }
}

pub fn fi_addr_of(caddr: CAddr) -> FiAddr {
    physical_to_fi_addr(caddr.nic, caddr.pid)
}

pub fn caddr(nic: u32, pid: u32) -> CAddr {
    CAddr { nic, pid, auth_key_idx: None }
}

/// Owns the shared fabric and hands out one [`Peer`] per simulated process.
#[derive(Default)]
pub struct Sim {
    fabric: Fabric,
}

impl Sim {
    pub fn new() -> Self {
        Self { fabric: Fabric::new() }
    }

    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    pub fn add_peer(&self, nic: u32, pid: u32, config: Config) -> Peer {
        let caddr = caddr(nic, pid);
        Peer {
            caddr,
            endpoint: Endpoint::new(config),
            completions: Vec::new(),
            cmdq: self.fabric.command_queue_for(caddr),
            mem: self.fabric.memory_for(caddr),
            fabric: self.fabric.clone(),
        }
    }

    /// Runs `progress` on every peer until none of them have queued events
    /// left, or `max_rounds` is hit (a stuck protocol should fail a test
    /// loudly, not hang it).
    pub fn progress_until_quiet(&self, peers: &mut [&mut Peer], max_rounds: usize) -> Disposition {
        for _ in 0..max_rounds {
            let mut did_work = false;
            for peer in peers.iter_mut() {
                peer.poll_ctrl();
                if peer.has_events() {
                    did_work = true;
                    match peer.progress_default() {
                        Disposition::Success => {}
                        other => return other,
                    }
                }
            }
            if !did_work {
                return Disposition::Success;
            }
        }
        Disposition::Fatal(cxi_msg::error::FatalReason::new("progress_until_quiet: did not converge"))
    }
}

/// Harness equivalent of [`cxi_msg::endpoint::Endpoint::on_ule_freed`] and
/// the flow-control `StateChange` events neither has a resource-exhaustion
/// model behind it in this simulator: call [`Fabric::push_state_change`]
/// directly, then progress the affected peer.
pub fn push_state_change(peer: &mut Peer, req_id: ReqId, return_code: ReturnCode) {
    peer.fabric.push_state_change(peer.caddr, req_id, return_code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use cxi_msg::matchbits::RequestFlags;

    #[test]
    fn eager_send_completes_on_both_sides() {
        let sim = Sim::new();
        let mut a = sim.add_peer(1, 0, Config::default());
        let mut b = sim.add_peer(1, 1, Config::default());
        a.prime_overflow();
        b.prime_overflow();

        let recv_mr = b.register(16);
        b.post_recv(PostParams {
            buf: Some(recv_mr),
            len: 16,
            match_id: cxi_msg::nic::MatchId::Any,
            tag: 0,
            ignore: 0,
            flags: RequestFlags::MSG | RequestFlags::RECV,
            context: 0,
            cq: None,
            counter: None,
            peek_context: None,
        })
        .unwrap();

        a.post_send(SendParams {
            caddr: b.caddr,
            dest: fi_addr_of(b.caddr),
            tag: 0,
            payload: cxi_msg::request::SendPayload::Inline(b"hello".to_vec()),
            flags: RequestFlags::MSG | RequestFlags::SEND,
            context: 0,
            cq: None,
            counter: None,
            inject: false,
            triggered: false,
        })
        .unwrap();

        sim.progress_until_quiet(&mut [&mut a, &mut b], 16);

        assert_eq!(b.read(recv_mr, 0, 5), b"hello");
    }
}
