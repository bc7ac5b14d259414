// SPDX-License-Identifier: BSD-3-Clause

//! The narrow interfaces onto the collaborators spec §1 places out of scope:
//! counters, completion queues, address vectors, memory registration, and the
//! device command queue. The core only ever reaches these through the traits
//! below; a software NIC implementing all of them lives in `cxi-msg-sim`.

use crate::error::Disposition;
use crate::matchbits::MatchBits;
use crate::request::ReqId;

/// Opaque handle to a registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MrHandle(pub u64);

/// Opaque handle to an application completion counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterHandle(pub u64);

/// Opaque handle to an application completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CqHandle(pub u64);

/// Fabric address as resolved through the address vector (may be logical,
/// under a symmetric AV, or already physical).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiAddr(pub u64);

/// Encodes a physical (nic, pid) pair the way a real AV entry would, for the
/// handful of call sites that must address a peer without going through a
/// full address-vector resolution (reverse zero-byte puts: match-complete
/// notify, rendezvous done-notify, flow-control notify/resume).
pub fn physical_to_fi_addr(nic: u32, pid: u32) -> FiAddr {
    FiAddr(((nic as u64) << 32) | pid as u64)
}

/// Physical NIC/PID pair identifying a peer endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CAddr {
    pub nic: u32,
    pub pid: u32,
    pub auth_key_idx: Option<u16>,
}

/// The initiator match-id carried in an event: either a specific peer or the
/// wildcard used by untargeted receives (spec §4.3 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchId {
    Any,
    Logical(FiAddr),
    Physical { nic: u32, pid: u32 },
}

/// NIC event-type discriminant (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Link,
    Unlink,
    Put,
    PutOverflow,
    Rendezvous,
    Search,
    Get,
    Send,
    Ack,
    Reply,
    StateChange,
}

/// NIC disable reasons (spec §4.7.1's `SC_*`/`SM_*_FAIL` codes) and other
/// provider return codes an event can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok,
    /// `SC_FC_*`: NIC disabled the PTE for flow control.
    FlowControl,
    /// `SM_*_FAIL`: NIC is transitioning the PTE to software-managed.
    SoftwareManagedTransition,
    /// Resource exhaustion on append (no free list-entries).
    NoSpace,
    /// A send targeted a peer whose receive queue is disabled.
    PtDisabled,
    /// A retryable condition on the event queue itself.
    EntryNotFound,
    /// Uncorrectable disable: always fatal (spec §4.7.1: "any -> DIS_UNCOR -> fatal").
    DisUncor,
    Provider(i32),
}

/// A NIC target- or initiator-side event, already decoded.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    /// The request id this event is addressed to (`user_ptr`).
    pub user_ptr: ReqId,
    pub kind: EventType,
    pub return_code: ReturnCode,
    /// Decoded initiator (DFA already resolved to nic/pid, spec §4.5).
    pub initiator: MatchId,
    pub match_bits: MatchBits,
    pub ignore_bits: u64,
    /// Bytes delivered by *this* event.
    pub mlength: u64,
    /// Total length of the remote send, from its header.
    pub rlength: u64,
    pub remote_offset: u64,
    pub header_data: Option<u64>,
    /// Overflow-buffer start address (PUT_OVERFLOW) used as a deferred-table
    /// key component (spec §4.2).
    pub overflow_start: Option<u64>,
    pub auto_unlinked: bool,
}

/// The device command queue. Every command emission checks capacity first
/// (spec §4.1: "every callback that emits a command checks command-queue
/// capacity... on inability to proceed it returns try-later").
pub trait CommandQueue {
    /// True if at least one more command can be submitted right now.
    fn has_capacity(&self) -> bool;

    /// True if the event queue itself is saturated and callbacks must stop
    /// emitting new commands until it drains (spec §4.1).
    fn event_queue_saturated(&self) -> bool;

    /// `buf` is the receive's registered destination, passed through so a
    /// software NIC can place message bytes there directly the way a real
    /// one's target DMA engine would (spec §4.3: posted-receive append).
    fn append_priority(&mut self, req_id: ReqId, match_bits: MatchBits, ignore_bits: u64, buf: Option<MrHandle>) -> Disposition;
    /// `buf` is the overflow buffer's own registered backing store, for the
    /// same reason [`Self::append_priority`] takes one.
    fn append_overflow(&mut self, req_id: ReqId, len: u64, buf: MrHandle) -> Disposition;
    fn unlink(&mut self, req_id: ReqId) -> Disposition;
    fn search(&mut self, req_id: ReqId, match_bits: MatchBits, ignore_bits: u64) -> Disposition;
    fn search_and_delete(&mut self, req_id: ReqId, match_bits: MatchBits, ignore_bits: u64) -> Disposition;

    fn put_idc(&mut self, req_id: ReqId, dest: FiAddr, match_bits: MatchBits, data: &[u8]) -> Disposition;
    fn put_dma(&mut self, req_id: ReqId, dest: FiAddr, match_bits: MatchBits, mr: MrHandle, len: u64) -> Disposition;
    fn get_dma(
        &mut self,
        req_id: ReqId,
        dest: FiAddr,
        local_mr: MrHandle,
        local_offset: u64,
        remote_offset: u64,
        len: u64,
    ) -> Disposition;

    fn state_change(&mut self, req_id: ReqId, software_managed: bool) -> Disposition;
}

/// Memory registration and the host-memory-iface copy helper (out of scope
/// per spec §1, reached only through this trait).
pub trait MemoryRegion {
    fn register(&mut self, len: u64) -> Option<MrHandle>;
    fn deregister(&mut self, mr: MrHandle);
    /// Copy `len` bytes from `src` at `src_offset` into a registered
    /// receive buffer at `dst_offset` (spec §4.3.3 step 4: moving an
    /// overflow/bounce buffer's resident bytes into the matched receive).
    fn copy_into(&mut self, dst: MrHandle, dst_offset: u64, src: MrHandle, src_offset: u64, len: u64);
}

/// A completion counter (out of scope collaborator, spec §1).
pub trait Counter {
    fn increment(&mut self, handle: CounterHandle, by: u64);
}
