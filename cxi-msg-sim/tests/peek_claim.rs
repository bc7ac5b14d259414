// SPDX-License-Identifier: BSD-3-Clause

//! An unexpected send onloads into software; `PEEK+CLAIM` inspects it without
//! consuming it, and a later `CLAIM`-only post retrieves the bytes it staked
//! out (spec §4.3.5).

use cxi_msg::config::Config;
use cxi_msg::matchbits::RequestFlags;
use cxi_msg::nic::MatchId;
use cxi_msg::recv::{PostOutcome, PostParams};
use cxi_msg::request::SendPayload;
use cxi_msg::send::SendParams;
use cxi_msg_sim::{fi_addr_of, Sim};

#[test]
fn peek_claim_then_claim_retrieves_the_unexpected_send() {
    let sim = Sim::new();
    let mut a = sim.add_peer(6, 0, Config::default());
    let mut b = sim.add_peer(6, 1, Config::default());
    a.prime_overflow();
    b.prime_overflow();

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
    .unwrap();

    // No recv posted yet: this onloads the send into b's software
    // unexpected list.
    a.progress_default();
    b.progress_default();

    let (_, peek_outcome) = b
        .post_recv(PostParams {
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
        .unwrap();
    assert_eq!(peek_outcome, PostOutcome::PeekDone);

    let peek_completions = b.drain_completions();
    assert_eq!(peek_completions.len(), 1);
    let peek_c = &peek_completions[0];
    assert!(peek_c.is_ok());
    assert_eq!(peek_c.tag, 5);
    assert_eq!(peek_c.len, 5);
    assert!(peek_c.flags.contains(RequestFlags::PEEK));
    assert!(peek_c.flags.contains(RequestFlags::CLAIM));

    let recv_mr = b.register(64);
    let (_, claim_outcome) = b
        .post_recv(PostParams {
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
        .unwrap();
    assert_eq!(claim_outcome, PostOutcome::AlreadyMatched);

    assert_eq!(&b.read(recv_mr, 0, 5), b"hello");

    let claim_completions = b.drain_completions();
    assert_eq!(claim_completions.len(), 1);
    let claim_c = &claim_completions[0];
    assert!(claim_c.is_ok());
    assert_eq!(claim_c.len, 5);
}
