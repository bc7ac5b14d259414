// SPDX-License-Identifier: BSD-3-Clause

//! A send past the rendezvous threshold: only the eager head rides the
//! initial `PUT`, the rest arrives through the target's own pulled `GET`, and
//! the restricted protocol's done-notify/ack pair closes out the receive.

use cxi_msg::config::Config;
use cxi_msg::matchbits::RequestFlags;
use cxi_msg::nic::MatchId;
use cxi_msg::recv::PostParams;
use cxi_msg::request::SendPayload;
use cxi_msg::send::SendParams;
use cxi_msg_sim::{fi_addr_of, Sim};

fn deterministic_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn large_send_completes_through_rendezvous_pull() {
    let sim = Sim::new();
    let mut a = sim.add_peer(4, 0, Config::default());
    let mut b = sim.add_peer(4, 1, Config::default());
    a.prime_overflow();
    b.prime_overflow();

    const LEN: u64 = 1024 * 1024;
    let payload = deterministic_payload(LEN as usize);

    let recv_mr = b.register(LEN);
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
    .unwrap();

    let send_mr = a.register(LEN);
    a.write(send_mr, 0, &payload);
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
    .unwrap();

    let result = sim.progress_until_quiet(&mut [&mut a, &mut b], 32);
    assert!(matches!(result, cxi_msg::error::Disposition::Success));

    assert_eq!(b.read(recv_mr, 0, LEN), payload);

    let send_completions = a.drain_completions();
    assert_eq!(send_completions.len(), 1);
    assert!(send_completions[0].is_ok());

    let recv_completions = b.drain_completions();
    assert_eq!(recv_completions.len(), 1);
    let c = &recv_completions[0];
    assert!(c.is_ok());
    assert_eq!(c.len, LEN);
}
