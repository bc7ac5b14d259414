// SPDX-License-Identifier: BSD-3-Clause

//! The endpoint: the sole aggregate root tying the seven components
//! together (spec §9 "Global state"). Mirrors the single-threaded,
//! one-event-at-a-time drain of the teacher's `RpcServer::main_loop` — no
//! internal locking, because nothing here suspends or hands control to
//! another thread mid-event (spec §5 "Scheduling model").

use std::collections::VecDeque;

use log::trace;

use crate::completion::CompletionSink;
use crate::config::Config;
use crate::deferred::DeferredEventTable;
use crate::error::Disposition;
use crate::event::{self, Components};
use crate::flow_control::{EndpointState, FlowControlSubsystem};
use crate::nic::{CAddr, CommandQueue, Event, MemoryRegion};
use crate::overflow::{OverflowPool, OverflowPoolConfig};
use crate::recv::{PostOutcome, PostParams, ReceiveEngine};
use crate::rendezvous::RendezvousCoordinator;
use crate::request::{ReqId, RequestArena};
use crate::send::{SendEngine, SendParams};

/// Bounds how many events a single [`Endpoint::progress`] call drains before
/// releasing control back to the caller (spec §5: "drains a bounded batch of
/// events, releases the lock, and may re-enter").
pub const DEFAULT_PROGRESS_BATCH: usize = 64;

pub struct Endpoint {
    requests: RequestArena,
    deferred: DeferredEventTable,
    recv: ReceiveEngine,
    send: SendEngine,
    rendezvous: RendezvousCoordinator,
    flow_control: FlowControlSubsystem,
    overflow: OverflowPool,
    config: Config,
    rx_enabled: bool,
}

impl Endpoint {
    pub fn new(config: Config) -> Self {
        let overflow_config = OverflowPoolConfig {
            buf_size: config.oflow_buf_size,
            min_posted: config.oflow_buf_min_posted,
            max_cached: config.oflow_buf_max_cached,
            min_free: 1,
        };
        Self {
            requests: RequestArena::new(),
            deferred: DeferredEventTable::new(config.deferred_table_capacity),
            recv: ReceiveEngine::new(),
            send: SendEngine::new(),
            rendezvous: RendezvousCoordinator::new(config.max_concurrent_rdzv_pulls),
            flow_control: FlowControlSubsystem::new(&config),
            overflow: OverflowPool::new(overflow_config),
            config,
            rx_enabled: true,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Primes the overflow pool so unexpected sends have somewhere to land
    /// before the first event arrives.
    pub fn prime_overflow(&mut self, cmdq: &mut dyn CommandQueue, mem: &mut dyn MemoryRegion) -> Disposition {
        self.overflow.replenish(&mut self.requests, cmdq, mem)
    }

    pub fn post_recv(
        &mut self,
        cmdq: &mut dyn CommandQueue,
        mem: &mut dyn MemoryRegion,
        completions: &mut CompletionSink,
        params: PostParams,
    ) -> Result<(ReqId, PostOutcome), Disposition> {
        self.recv.post(
            &mut self.requests,
            &mut self.deferred,
            &mut self.overflow,
            cmdq,
            mem,
            &self.config,
            self.rx_enabled,
            completions,
            params,
        )
    }

    pub fn post_send(&mut self, cmdq: &mut dyn CommandQueue, params: SendParams) -> Result<ReqId, Disposition> {
        self.send.post(&mut self.requests, cmdq, &self.config, params)
    }

    pub fn cancel(&mut self, cmdq: &mut dyn CommandQueue, completions: &mut CompletionSink, req_id: ReqId) -> Disposition {
        self.recv.cancel(&mut self.requests, cmdq, completions, req_id)
    }

    pub fn request_disable(&mut self, cmdq: &mut dyn CommandQueue, req_id: ReqId) -> Disposition {
        self.rx_enabled = false;
        self.flow_control.request_disable(cmdq, req_id)
    }

    pub fn notify_peer_disabled(&mut self, cmdq: &mut dyn CommandQueue, peer: CAddr) -> Disposition {
        self.send.notify_peer(cmdq, peer)
    }

    pub fn handle_notify(&mut self, cmdq: &mut dyn CommandQueue, peer: CAddr, target_drop_count: i64) -> Disposition {
        self.flow_control
            .on_notify(&mut self.requests, &mut self.send, cmdq, &self.config, peer, target_drop_count)
    }

    pub fn handle_resume(&mut self, cmdq: &mut dyn CommandQueue, peer: CAddr) -> Disposition {
        self.send.on_resume(&mut self.requests, cmdq, &self.config, peer)
    }

    /// Acknowledges this endpoint's own `FC_NOTIFY` to `peer` (spec §4.7.2:
    /// the sender frees a peer record once replay is done and every notify
    /// it sent has been acked). A transport with a real wire turns this
    /// around as its own event; an in-memory fabric has nothing to lose in
    /// flight, so a harness may call this the moment delivery is confirmed.
    pub fn ack_notify(&mut self, peer: CAddr) {
        self.send.on_notify_ack(peer);
    }

    /// The receive-side endpoint state (spec §3's state machine), for a
    /// harness to decide when a disabled peer needs notifying or a resume
    /// has landed.
    pub fn fc_state(&self) -> EndpointState {
        self.flow_control.state()
    }

    /// "ULE freed event during onload" (spec §4.7.1's table): tells C7 a
    /// list-entry was just returned to the pool while onloading. A software
    /// NIC has no separate hardware-visible event for this, so a harness
    /// calls it directly once it knows a buffer was freed.
    pub fn on_ule_freed(&mut self) {
        self.flow_control.on_ule_freed();
    }

    /// spec §5: "drains a bounded batch of events, releases the lock, and
    /// may re-enter." Stops on the first event that can't advance
    /// (`try-later`, re-presented to the next call) or that is fatal.
    pub fn progress(
        &mut self,
        cmdq: &mut dyn CommandQueue,
        mem: &mut dyn MemoryRegion,
        completions: &mut CompletionSink,
        events: &mut VecDeque<Event>,
        batch: usize,
    ) -> Disposition {
        let mut drained = 0;
        while drained < batch {
            let Some(event) = events.front().copied() else {
                break;
            };

            let mut components = Components {
                requests: &mut self.requests,
                deferred: &mut self.deferred,
                recv: &mut self.recv,
                send: &mut self.send,
                rendezvous: &mut self.rendezvous,
                flow_control: &mut self.flow_control,
                overflow: &mut self.overflow,
                cmdq,
                mem,
                config: &self.config,
                completions,
            };

            match event::dispatch(&mut components, &event) {
                Disposition::Success => {
                    events.pop_front();
                    drained += 1;
                }
                Disposition::TryLater => {
                    trace!("event {:?} re-presented", event.user_ptr);
                    return Disposition::TryLater;
                }
                fatal @ Disposition::Fatal(_) => return fatal,
            }
        }
        self.rx_enabled = matches!(
            self.flow_control.state(),
            crate::flow_control::EndpointState::Enabled | crate::flow_control::EndpointState::EnabledSoftware
        );
        Disposition::Success
    }

    pub fn drain_software_matches(
        &mut self,
        cmdq: &mut dyn CommandQueue,
        mem: &mut dyn MemoryRegion,
        completions: &mut CompletionSink,
    ) {
        self.recv.drain_software_matches(
            &mut self.requests,
            &mut self.deferred,
            &mut self.overflow,
            cmdq,
            mem,
            &self.config,
            completions,
        );
    }

    /// Lets a harness detect a peer was just dropped into flow control and
    /// call [`Self::notify_peer_disabled`] exactly once for it.
    pub fn has_fc_peer(&self, peer: CAddr) -> bool {
        self.send.has_fc_peer(peer)
    }

    /// Correlates an inbound match-complete notify (spec §4.3.3 step 6) by
    /// `tx_id`, completing the sender's deferred eager send.
    pub fn handle_match_complete_notify(&mut self, completions: &mut CompletionSink, tx_id: u32) -> Disposition {
        self.send.on_match_complete_notify(&mut self.requests, completions, tx_id)
    }
}
