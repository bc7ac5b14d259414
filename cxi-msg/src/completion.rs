// SPDX-License-Identifier: BSD-3-Clause

//! Completions handed to the application. The real completion queue is one
//! of the out-of-scope collaborators (spec §1); this crate reports into a
//! plain sink that a provider would fan out to the bound [`CqHandle`].

use crate::matchbits::RequestFlags;
use crate::nic::{CqHandle, MatchId};
use crate::request::ReqId;

#[derive(Debug, Clone)]
pub struct Completion {
    pub req_id: ReqId,
    pub context: u64,
    pub cq: Option<CqHandle>,
    pub flags: RequestFlags,
    /// Bytes actually transferred for this completion.
    pub len: u64,
    pub tag: u64,
    pub src: MatchId,
    pub header_data: Option<u64>,
    pub err: Option<crate::error::CompletionError>,
}

impl Completion {
    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }
}

/// Where completions land. A `Vec` is enough to drive both tests and the
/// in-memory simulator; a real provider implementation would fan these out
/// to per-`CqHandle` ring buffers.
pub type CompletionSink = Vec<Completion>;
