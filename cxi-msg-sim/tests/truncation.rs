// SPDX-License-Identifier: BSD-3-Clause

//! A send larger than the posted receive buffer completes `TRUNC`, with only
//! the buffer's own capacity worth of bytes actually copied.

use cxi_msg::config::Config;
use cxi_msg::error::CompletionError;
use cxi_msg::matchbits::RequestFlags;
use cxi_msg::nic::MatchId;
use cxi_msg::recv::PostParams;
use cxi_msg::request::SendPayload;
use cxi_msg::send::SendParams;
use cxi_msg_sim::{fi_addr_of, Sim};

#[test]
fn oversized_send_truncates_to_buffer_capacity() {
    let sim = Sim::new();
    let mut a = sim.add_peer(3, 0, Config::default());
    let mut b = sim.add_peer(3, 1, Config::default());
    a.prime_overflow();
    b.prime_overflow();

    let recv_mr = b.register(16);
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
    .unwrap();

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
    .unwrap();

    sim.progress_until_quiet(&mut [&mut a, &mut b], 16);

    assert_eq!(b.read(recv_mr, 0, 16), vec![0x22; 16]);

    let recv_completions = b.drain_completions();
    assert_eq!(recv_completions.len(), 1);
    let c = &recv_completions[0];
    assert_eq!(c.len, 16);
    assert_eq!(c.err, Some(CompletionError::Truncated { received: 64, posted: 16 }));
}
