// SPDX-License-Identifier: BSD-3-Clause

//! A host-side messaging core for a connectionless, tagged-matching NIC
//! (match-bits tags, rendezvous pulls, unexpected-send onload, flow control).
//! This crate models the host state machine only; it is driven by a
//! [`nic::CommandQueue`]/[`nic::MemoryRegion`] implementation supplied by the
//! caller (see the simulator crate for an in-memory one) and never touches
//! real hardware itself.

pub mod arena;
pub mod completion;
pub mod config;
pub mod deferred;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod fatal;
pub mod flow_control;
pub mod matchbits;
pub mod nic;
pub mod overflow;
pub mod recv;
pub mod rendezvous;
pub mod request;
pub mod send;

pub use completion::Completion;
pub use config::Config;
pub use endpoint::Endpoint;
pub use error::{CompletionError, Disposition, FatalReason};
pub use request::ReqId;
