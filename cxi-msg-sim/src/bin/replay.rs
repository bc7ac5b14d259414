// SPDX-License-Identifier: BSD-3-Clause

//! Drives one of the named two-peer scenarios against the in-memory fabric
//! and prints the completions each side collects. A manual way to eyeball a
//! protocol path without reaching for the test harness's assertions.

use clap::{Parser, ValueEnum};
use log::info;

use cxi_msg::config::Config;
use cxi_msg::fatal::{route, AbortOnFatal, FatalHandler};
use cxi_msg::matchbits::RequestFlags;
use cxi_msg::nic::{MatchId, ReturnCode};
use cxi_msg::recv::PostParams;
use cxi_msg::request::{ReqId, SendPayload};
use cxi_msg::send::SendParams;
use cxi_msg_sim::{fi_addr_of, push_state_change, Sim};

#[derive(Clone, Copy, ValueEnum)]
enum Scenario {
    Eager,
    Truncation,
    Rendezvous,
    FlowControl,
    PeekClaim,
}

#[derive(Parser)]
struct Cli {
    /// Which of spec-style end-to-end scenarios to replay.
    #[arg(long, value_enum, default_value_t = Scenario::Eager)]
    scenario: Scenario,

    /// Rounds of progress() to allow before giving up on convergence.
    #[arg(long, default_value_t = 32)]
    max_rounds: usize,
}

fn main() {
    env_logger::init();
    let args = Cli::parse();
    let handler = AbortOnFatal;

    let sim = Sim::new();
    let mut a = sim.add_peer(100, 0, Config::default());
    let mut b = sim.add_peer(100, 1, Config::default());
    route(&handler, a.prime_overflow());
    route(&handler, b.prime_overflow());

    match args.scenario {
        Scenario::Eager => run_eager(&sim, &mut a, &mut b, &handler, args.max_rounds),
        Scenario::Truncation => run_truncation(&sim, &mut a, &mut b, &handler, args.max_rounds),
        Scenario::Rendezvous => run_rendezvous(&sim, &mut a, &mut b, &handler, args.max_rounds),
        Scenario::FlowControl => run_flow_control(&sim, &mut a, &mut b, &handler, args.max_rounds),
        Scenario::PeekClaim => run_peek_claim(&mut a, &mut b, &handler),
    }

    for c in a.drain_completions() {
        info!("a: {:?}", c);
    }
    for c in b.drain_completions() {
        info!("b: {:?}", c);
    }
}

fn run_eager(sim: &Sim, a: &mut cxi_msg_sim::Peer, b: &mut cxi_msg_sim::Peer, handler: &dyn FatalHandler, max_rounds: usize) {
    let recv_mr = b.register(64);
    route(
        handler,
        b.post_recv(PostParams {
            buf: Some(recv_mr),
            len: 64,
            match_id: MatchId::Any,
            tag: 7,
            ignore: 0,
            flags: RequestFlags::MSG | RequestFlags::RECV | RequestFlags::TAGGED,
            context: 0,
            cq: None,
            counter: None,
            peek_context: None,
        })
        .map(|_| cxi_msg::error::Disposition::Success)
        .unwrap_or_else(|d| d),
    );

    route(
        handler,
        a.post_send(SendParams {
            caddr: b.caddr,
            dest: fi_addr_of(b.caddr),
            tag: 7,
            payload: SendPayload::Inline(vec![0xA5; 64]),
            flags: RequestFlags::MSG | RequestFlags::SEND | RequestFlags::TAGGED,
            context: 0,
            cq: None,
            counter: None,
            inject: false,
            triggered: false,
        })
        .map(|_| cxi_msg::error::Disposition::Success)
        .unwrap_or_else(|d| d),
    );

    route(handler, sim.progress_until_quiet(&mut [a, b], max_rounds));
}

fn run_truncation(sim: &Sim, a: &mut cxi_msg_sim::Peer, b: &mut cxi_msg_sim::Peer, handler: &dyn FatalHandler, max_rounds: usize) {
    let recv_mr = b.register(16);
    route(
        handler,
        b.post_recv(PostParams {
            buf: Some(recv_mr),
            len: 16,
            match_id: MatchId::Any,
            tag: 9,
            ignore: 0,
            flags: RequestFlags::MSG | RequestFlags::RECV | RequestFlags::TAGGED,
            context: 0,
            cq: None,
            counter: None,
            peek_context: None,
        })
        .map(|_| cxi_msg::error::Disposition::Success)
        .unwrap_or_else(|d| d),
    );

    route(
        handler,
        a.post_send(SendParams {
            caddr: b.caddr,
            dest: fi_addr_of(b.caddr),
            tag: 9,
            payload: SendPayload::Inline(vec![0x22; 64]),
            flags: RequestFlags::MSG | RequestFlags::SEND | RequestFlags::TAGGED,
            context: 0,
            cq: None,
            counter: None,
            inject: false,
            triggered: false,
        })
        .map(|_| cxi_msg::error::Disposition::Success)
        .unwrap_or_else(|d| d),
    );

    route(handler, sim.progress_until_quiet(&mut [a, b], max_rounds));
}

fn run_rendezvous(sim: &Sim, a: &mut cxi_msg_sim::Peer, b: &mut cxi_msg_sim::Peer, handler: &dyn FatalHandler, max_rounds: usize) {
    const LEN: u64 = 1024 * 1024;
    let payload: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();

    let recv_mr = b.register(LEN);
    route(
        handler,
        b.post_recv(PostParams {
            buf: Some(recv_mr),
            len: LEN,
            match_id: MatchId::Any,
            tag: 1,
            ignore: 0,
            flags: RequestFlags::MSG | RequestFlags::RECV | RequestFlags::TAGGED,
            context: 0,
            cq: None,
            counter: None,
            peek_context: None,
        })
        .map(|_| cxi_msg::error::Disposition::Success)
        .unwrap_or_else(|d| d),
    );

    let send_mr = a.register(LEN);
    a.write(send_mr, 0, &payload);
    route(
        handler,
        a.post_send(SendParams {
            caddr: b.caddr,
            dest: fi_addr_of(b.caddr),
            tag: 1,
            payload: SendPayload::Registered { mr: send_mr, len: LEN },
            flags: RequestFlags::MSG | RequestFlags::SEND | RequestFlags::TAGGED,
            context: 0,
            cq: None,
            counter: None,
            inject: false,
            triggered: false,
        })
        .map(|_| cxi_msg::error::Disposition::Success)
        .unwrap_or_else(|d| d),
    );

    route(handler, sim.progress_until_quiet(&mut [a, b], max_rounds));
}

fn run_flow_control(sim: &Sim, a: &mut cxi_msg_sim::Peer, b: &mut cxi_msg_sim::Peer, handler: &dyn FatalHandler, max_rounds: usize) {
    sim.fabric().set_disabled(b.caddr, true);

    let recv_mr = b.register(32);
    route(
        handler,
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
        .map(|_| cxi_msg::error::Disposition::Success)
        .unwrap_or_else(|d| d),
    );

    route(
        handler,
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
        .map(|_| cxi_msg::error::Disposition::Success)
        .unwrap_or_else(|d| d),
    );

    route(handler, a.progress_default());
    route(handler, a.notify_disabled_peer(b.caddr));

    push_state_change(b, ReqId(1), ReturnCode::FlowControl);
    route(handler, b.progress_default());
    b.endpoint.on_ule_freed();
    push_state_change(b, ReqId(2), ReturnCode::Ok);
    route(handler, b.progress_default());

    sim.fabric().set_disabled(b.caddr, false);

    route(handler, b.poll_ctrl());
    route(handler, a.poll_ctrl());
    a.ack_notify(b.caddr);

    route(handler, sim.progress_until_quiet(&mut [a, b], max_rounds));
}

fn run_peek_claim(a: &mut cxi_msg_sim::Peer, b: &mut cxi_msg_sim::Peer, handler: &dyn FatalHandler) {
    route(
        handler,
        a.post_send(SendParams {
            caddr: b.caddr,
            dest: fi_addr_of(b.caddr),
            tag: 5,
            payload: SendPayload::Inline(b"hello".to_vec()),
            flags: RequestFlags::MSG | RequestFlags::SEND | RequestFlags::TAGGED,
            context: 0,
            cq: None,
            counter: None,
            inject: false,
            triggered: false,
        })
        .map(|_| cxi_msg::error::Disposition::Success)
        .unwrap_or_else(|d| d),
    );

    route(handler, a.progress_default());
    route(handler, b.progress_default());

    route(
        handler,
        b.post_recv(PostParams {
            buf: None,
            len: 0,
            match_id: MatchId::Any,
            tag: 5,
            ignore: 0,
            flags: RequestFlags::MSG | RequestFlags::RECV | RequestFlags::TAGGED | RequestFlags::PEEK | RequestFlags::CLAIM,
            context: 42,
            cq: None,
            counter: None,
            peek_context: Some(7),
        })
        .map(|_| cxi_msg::error::Disposition::Success)
        .unwrap_or_else(|d| d),
    );

    let recv_mr = b.register(64);
    route(
        handler,
        b.post_recv(PostParams {
            buf: Some(recv_mr),
            len: 64,
            match_id: MatchId::Any,
            tag: 5,
            ignore: 0,
            flags: RequestFlags::MSG | RequestFlags::RECV | RequestFlags::TAGGED | RequestFlags::CLAIM,
            context: 0,
            cq: None,
            counter: None,
            peek_context: Some(7),
        })
        .map(|_| cxi_msg::error::Disposition::Success)
        .unwrap_or_else(|d| d),
    );
}
