// SPDX-License-Identifier: BSD-3-Clause

//! Eager-path two-peer scenarios: a tagged receive posted ahead of its
//! matching send, and one that lands unexpected and onloads first.

use cxi_msg::config::Config;
use cxi_msg::matchbits::RequestFlags;
use cxi_msg::nic::MatchId;
use cxi_msg::recv::PostParams;
use cxi_msg::request::SendPayload;
use cxi_msg::send::SendParams;
use cxi_msg_sim::{fi_addr_of, Sim};

#[test]
fn expected_tagged_send_fills_receiver_buffer() {
    let sim = Sim::new();
    let mut a = sim.add_peer(1, 0, Config::default());
    let mut b = sim.add_peer(1, 1, Config::default());
    a.prime_overflow();
    b.prime_overflow();

    let recv_mr = b.register(64);
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
    .unwrap();

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
    .unwrap();

    sim.progress_until_quiet(&mut [&mut a, &mut b], 16);

    assert_eq!(b.read(recv_mr, 0, 64), vec![0xA5; 64]);

    let send_completions = a.drain_completions();
    assert_eq!(send_completions.len(), 1);
    assert!(send_completions[0].is_ok());

    let recv_completions = b.drain_completions();
    assert_eq!(recv_completions.len(), 1);
    let c = &recv_completions[0];
    assert!(c.is_ok());
    assert_eq!(c.tag, 7);
    assert_eq!(c.len, 64);
}

#[test]
fn unexpected_send_onloads_then_matches_later_post() {
    let sim = Sim::new();
    let mut a = sim.add_peer(2, 0, Config::default());
    let mut b = sim.add_peer(2, 1, Config::default());
    a.prime_overflow();
    b.prime_overflow();

    a.post_send(SendParams {
        caddr: b.caddr,
        dest: fi_addr_of(b.caddr),
        tag: 3,
        payload: SendPayload::Inline(vec![0x11; 128]),
        flags: RequestFlags::MSG | RequestFlags::SEND | RequestFlags::TAGGED,
        context: 0,
        cq: None,
        counter: None,
        inject: false,
        triggered: false,
    })
    .unwrap();

    // Drains the send's own ack and lands the bytes in b's overflow buffer,
    // onloading a software unexpected-send record before any recv exists.
    a.progress_default();
    b.progress_default();

    let recv_mr = b.register(256);
    let (_, outcome) = b
        .post_recv(PostParams {
            buf: Some(recv_mr),
            len: 256,
            match_id: MatchId::Any,
            tag: 3,
            ignore: 0,
            flags: RequestFlags::MSG | RequestFlags::RECV | RequestFlags::TAGGED,
            context: 0,
            cq: None,
            counter: None,
            peek_context: None,
        })
        .unwrap();
    assert_eq!(outcome, cxi_msg::recv::PostOutcome::AlreadyMatched);

    let mut expected = vec![0x11; 128];
    expected.resize(256, 0);
    assert_eq!(&b.read(recv_mr, 0, 128), &expected[..128]);

    let recv_completions = b.drain_completions();
    assert_eq!(recv_completions.len(), 1);
    let c = &recv_completions[0];
    assert!(c.is_ok());
    assert_eq!(c.len, 128);
}
