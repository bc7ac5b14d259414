// SPDX-License-Identifier: BSD-3-Clause

//! C4: the overflow buffer pool. Supplies unexpected-message landing
//! buffers and replenishes them as the NIC auto-unlinks exhausted ones
//! (spec §4.4).

use crate::error::Disposition;
use crate::nic::{CommandQueue, MemoryRegion, MrHandle};
use crate::request::{OverflowRequest, ReqId, Request, RequestArena};

#[derive(Debug, Clone, Copy)]
pub struct OverflowPoolConfig {
    pub buf_size: u64,
    pub min_posted: u32,
    pub max_cached: u32,
    pub min_free: u32,
}

struct CachedBuffer {
    mr: MrHandle,
}

/// One overflow pool, private to an RX context (spec §5).
pub struct OverflowPool {
    config: OverflowPoolConfig,
    /// Requests currently linked on the NIC's overflow list.
    linked: Vec<ReqId>,
    /// Deregistered-but-kept buffers ready to relink without a fresh
    /// registration.
    cache: Vec<CachedBuffer>,
}

impl OverflowPool {
    pub fn new(config: OverflowPoolConfig) -> Self {
        Self {
            config,
            linked: Vec::new(),
            cache: Vec::new(),
        }
    }

    pub fn posted_count(&self) -> u32 {
        self.linked.len() as u32
    }

    /// Resolves the overflow buffer's own request id from the start address
    /// a `PUT_OVERFLOW` event carries (spec §4.2's key component), so the
    /// receive engine can copy bytes out of and retire the right buffer
    /// rather than a sentinel.
    pub fn find_by_start_addr(&self, requests: &RequestArena, start_addr: u64) -> Option<ReqId> {
        self.linked.iter().copied().find(|id| {
            requests
                .get(id.0)
                .and_then(|r| r.as_overflow())
                .map(|o| o.start_addr == start_addr)
                .unwrap_or(false)
        })
    }

    /// Post buffers onto the overflow list until `min_posted` is satisfied,
    /// reusing cached buffers first.
    pub fn replenish(
        &mut self,
        requests: &mut RequestArena,
        cmdq: &mut dyn CommandQueue,
        mem: &mut dyn MemoryRegion,
    ) -> Disposition {
        while self.posted_count() < self.config.min_posted {
            if !cmdq.has_capacity() {
                return Disposition::TryLater;
            }

            let mr = if let Some(cached) = self.cache.pop() {
                cached.mr
            } else {
                match mem.register(self.config.buf_size) {
                    Some(mr) => mr,
                    None => return Disposition::TryLater,
                }
            };

            let overflow = OverflowRequest {
                start_addr: mr.0,
                mr,
                len: self.config.buf_size,
                cur_offset: 0,
                unlink_length: self.config.buf_size,
                consumed: 0,
                link_refcount: 1,
                deferred_pending: 0,
            };
            let req_id = ReqId(requests.insert(Request {
                id: ReqId(0),
                callback: crate::request::Callback::Overflow,
                context: 0,
                flags: crate::matchbits::RequestFlags::empty(),
                cq: None,
                counter: None,
                kind: crate::request::RequestKind::Overflow(overflow),
            }));
            if let Some(req) = requests.get_mut(req_id.0) {
                req.id = req_id;
            }

            match cmdq.append_overflow(req_id, self.config.buf_size, mr) {
                Disposition::Success => self.linked.push(req_id),
                other => {
                    requests.remove(req_id.0);
                    return other;
                }
            }
        }
        Disposition::Success
    }

    /// Called when a buffer's `consumed` bytes reach its unlink length and
    /// no deferred-table entry still refers to it (spec §4.4: "each
    /// `ux_send` that took bytes from the buffer decrements remaining
    /// bytes; at zero the buffer is returned to the cache or freed").
    pub fn retire(&mut self, requests: &mut RequestArena, req_id: ReqId, mem: &mut dyn MemoryRegion) {
        self.linked.retain(|id| *id != req_id);
        if let Some(req) = requests.remove(req_id.0) {
            if let crate::request::RequestKind::Overflow(overflow) = req.kind {
                if self.cache.len() < self.config.max_cached as usize {
                    self.cache.push(CachedBuffer { mr: overflow.mr });
                } else {
                    mem.deregister(overflow.mr);
                }
            }
        }
    }

    /// An explicit unlink, only observed during teardown (spec §4.4).
    pub fn teardown(&mut self, requests: &mut RequestArena, mem: &mut dyn MemoryRegion) {
        for req_id in std::mem::take(&mut self.linked) {
            if let Some(req) = requests.remove(req_id.0) {
                if let crate::request::RequestKind::Overflow(overflow) = req.kind {
                    mem.deregister(overflow.mr);
                }
            }
        }
        for cached in self.cache.drain(..) {
            mem.deregister(cached.mr);
        }
    }
}
