// SPDX-License-Identifier: BSD-3-Clause

//! C1: the event demultiplexer. Every NIC event arrives here first and is
//! routed to the component that owns its request's [`Callback`] (spec §4.1).
//! A callback's `try-later` means exactly what it says: the event is not
//! advanced past, and the caller is expected to re-present it.

use crate::completion::CompletionSink;
use crate::config::Config;
use crate::deferred::DeferredEventTable;
use crate::error::{Disposition, FatalReason};
use crate::flow_control::FlowControlSubsystem;
use crate::nic::{CommandQueue, Event, EventType, MemoryRegion};
use crate::overflow::OverflowPool;
use crate::recv::ReceiveEngine;
use crate::rendezvous::RendezvousCoordinator;
use crate::request::{Callback, RequestArena};
use crate::send::SendEngine;

/// Every collaborator a dispatched event might need. Bundled so
/// [`dispatch`]'s signature doesn't grow a parameter every time a component
/// gains a dependency on another.
pub struct Components<'a> {
    pub requests: &'a mut RequestArena,
    pub deferred: &'a mut DeferredEventTable,
    pub recv: &'a mut ReceiveEngine,
    pub send: &'a mut SendEngine,
    pub rendezvous: &'a mut RendezvousCoordinator,
    pub flow_control: &'a mut FlowControlSubsystem,
    pub overflow: &'a mut OverflowPool,
    pub cmdq: &'a mut dyn CommandQueue,
    pub mem: &'a mut dyn MemoryRegion,
    pub config: &'a Config,
    pub completions: &'a mut CompletionSink,
}

fn receive_is_mid_rendezvous(c: &Components, event: &Event) -> bool {
    c.requests
        .get(event.user_ptr.0)
        .and_then(|r| r.as_receive())
        .map(|r| r.rdzv_id.is_some())
        .unwrap_or(false)
}

fn send_is_rendezvous(c: &Components, event: &Event) -> bool {
    c.requests
        .get(event.user_ptr.0)
        .and_then(|r| r.as_send())
        .map(|s| s.rdzv_id.is_some())
        .unwrap_or(false)
}

/// spec §4.1: every callback that emits a command checks command-queue
/// capacity and event-queue saturation first; back off with `try-later`
/// before even routing if the event queue itself can't take more
/// command-driven progress right now.
pub fn dispatch(c: &mut Components, event: &Event) -> Disposition {
    if c.cmdq.event_queue_saturated() {
        return Disposition::TryLater;
    }

    if event.kind == EventType::StateChange {
        return c.flow_control.on_state_change_event(
            c.requests,
            c.recv,
            c.overflow,
            c.cmdq,
            c.mem,
            c.config,
            c.completions,
            event,
        );
    }

    let callback = c.requests.get(event.user_ptr.0).map(|r| r.callback);

    match callback {
        Some(Callback::Recv) => dispatch_recv(c, event),
        Some(Callback::Send) => dispatch_send(c, event),
        // A genuinely unexpected PUT_OVERFLOW lands addressed to the
        // overflow buffer's own request, not a receive (spec §4.2); route it
        // through the same receive callback so it lands on the software
        // unexpected list instead of being dropped.
        Some(Callback::Overflow) => dispatch_recv(c, event),
        Some(Callback::Rendezvous) | Some(Callback::FlowControl) | Some(Callback::Search) => Disposition::Success,
        None => {
            // The onload barrier's own SEARCH/SEARCH_AND_DELETE events carry
            // the sentinel request id and are consumed at emission time, not
            // here; anything else addressed to a request that no longer
            // exists is a provider bug.
            Disposition::Fatal(FatalReason::new(format!(
                "event for unknown request {:?}",
                event.user_ptr
            )))
        }
    }
}

fn dispatch_recv(c: &mut Components, event: &Event) -> Disposition {
    match event.kind {
        EventType::Rendezvous => c.rendezvous.on_rendezvous_event(c.requests, c.recv, c.cmdq, c.config, c.completions, event),
        EventType::Reply if receive_is_mid_rendezvous(c, event) => {
            c.rendezvous.on_reply_event(c.requests, c.recv, c.cmdq, c.config, c.completions, event)
        }
        EventType::Ack => c.rendezvous.on_ack_event(c.requests, c.recv, c.cmdq, c.config, c.completions, event),
        _ => c.recv.handle_event(c.requests, c.deferred, c.overflow, c.cmdq, c.mem, c.config, c.completions, event),
    }
}

fn dispatch_send(c: &mut Components, event: &Event) -> Disposition {
    match event.kind {
        EventType::Get => c.send.on_source_get_event(c.requests, c.completions, event),
        EventType::Ack if send_is_rendezvous(c, event) => c.send.on_rendezvous_ack_event(c.requests, c.completions, event),
        EventType::Ack => c.send.on_ack_event(c.requests, c.completions, event),
        other => Disposition::Fatal(FatalReason::new(format!("send callback got an unexpected event kind {other:?}"))),
    }
}
