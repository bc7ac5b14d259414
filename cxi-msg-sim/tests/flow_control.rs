// SPDX-License-Identifier: BSD-3-Clause

//! Disable, onload, drain, resume: a send dropped by a disabled target is
//! queued for replay, the target walks its onload state machine back to
//! `Enabled`, and the replay lands on the receive buffer it would have hit
//! had the peer never gone down.

use cxi_msg::nic::ReturnCode;
use cxi_msg::config::Config;
use cxi_msg::matchbits::RequestFlags;
use cxi_msg::nic::MatchId;
use cxi_msg::recv::PostParams;
use cxi_msg::request::{ReqId, SendPayload};
use cxi_msg::send::SendParams;
use cxi_msg_sim::{fi_addr_of, push_state_change, Sim};

#[test]
fn dropped_send_replays_after_peer_resumes() {
    let sim = Sim::new();
    let mut a = sim.add_peer(5, 0, Config::default());
    let mut b = sim.add_peer(5, 1, Config::default());
    a.prime_overflow();
    b.prime_overflow();

    sim.fabric().set_disabled(b.caddr, true);

    let recv_mr = b.register(32);
    b.post_recv(PostParams {
        buf: Some(recv_mr),
        len: 32,
        match_id: MatchId::Any,
        tag: 11,
        ignore: 0,
        flags: RequestFlags::MSG | RequestFlags::RECV | RequestFlags::TAGGED,
        context: 0,
        cq: None,
        counter: None,
        peek_context: None,
    })
    .unwrap();

    a.post_send(SendParams {
        caddr: b.caddr,
        dest: fi_addr_of(b.caddr),
        tag: 11,
        payload: SendPayload::Inline(b"flow control".to_vec()),
        flags: RequestFlags::MSG | RequestFlags::SEND | RequestFlags::TAGGED,
        context: 0,
        cq: None,
        counter: None,
        inject: false,
        triggered: false,
    })
    .unwrap();

    // The PUT bounces off b's disabled PTE; a sees it as a dropped send and
    // opens an fc_peer record for b.
    a.progress_default();
    a.notify_disabled_peer(b.caddr);

    // b has no organic resource-exhaustion signal in this harness, so its
    // walk through the onload state machine (spec §4.7.1) is driven by hand:
    // ENABLED -> ONLOAD_FC -> ONLOAD_FC_REENABLE -> FLOW_CONTROL.
    push_state_change(&mut b, ReqId(1), ReturnCode::FlowControl);
    b.progress_default();
    b.endpoint.on_ule_freed();
    push_state_change(&mut b, ReqId(2), ReturnCode::Ok);
    b.progress_default();

    sim.fabric().set_disabled(b.caddr, false);

    // Drains b's NOTIFY, which (drop counts now matching) flips b back to
    // ENABLED and fires RESUME back at a.
    b.poll_ctrl();
    // Drains a's RESUME, which replays the queued send onto the now-enabled
    // target.
    a.poll_ctrl();
    a.ack_notify(b.caddr);

    sim.progress_until_quiet(&mut [&mut a, &mut b], 16);

    assert_eq!(b.read(recv_mr, 0, 12), b"flow control");

    let send_completions = a.drain_completions();
    assert_eq!(send_completions.len(), 1);
    assert!(send_completions[0].is_ok());

    let recv_completions = b.drain_completions();
    assert_eq!(recv_completions.len(), 1);
    let c = &recv_completions[0];
    assert!(c.is_ok());
    assert_eq!(c.len, 12);
}
