// SPDX-License-Identifier: BSD-3-Clause

//! Error and control-flow result types.
//!
//! Two different things get called "errors" in this crate and they must never
//! be conflated: [`CompletionError`] is what the *application* sees on a
//! completion queue entry (truncation, cancellation, ...); [`Disposition`] is
//! what a NIC-event callback returns to the demultiplexer (success, retry
//! later, or fatal). A `try-later` is never surfaced to the application and a
//! `CompletionError` never causes the demultiplexer to re-present an event.

use std::fmt;

/// Provider-specific NIC return codes that don't have a dedicated variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCode(pub i32);

impl fmt::Display for ProviderCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider code {}", self.0)
    }
}

/// Errors surfaced to the application on a completion-queue entry (spec §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    /// The request was canceled before it matched.
    Canceled,
    /// The received message was larger than the posted buffer.
    Truncated { received: u64, posted: u64 },
    /// A `PEEK` found no matching unexpected message.
    NoMessage,
    /// The initiator's address could not be resolved. Carries the physical
    /// (nic, pid) when source-error reporting is enabled and the address was
    /// at least partially decoded.
    AddrNotAvail { physical: Option<(u32, u32)> },
    /// Any other failure code reported by the NIC, already translated.
    Provider(ProviderCode),
}

impl fmt::Display for CompletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled => write!(f, "request canceled"),
            Self::Truncated { received, posted } => {
                write!(f, "truncated: received {received} bytes into {posted}-byte buffer")
            }
            Self::NoMessage => write!(f, "no matching unexpected message"),
            Self::AddrNotAvail { physical } => match physical {
                Some((nic, pid)) => write!(f, "address not available (nic {nic}, pid {pid})"),
                None => write!(f, "address not available"),
            },
            Self::Provider(code) => write!(f, "{code}"),
        }
    }
}

impl std::error::Error for CompletionError {}

/// What an event callback tells the demultiplexer to do with the event it was
/// just handed (spec §4.1).
#[derive(Debug)]
pub enum Disposition {
    /// The event was fully handled; advance the event queue.
    Success,
    /// The callback could not make progress (command-queue pressure, a
    /// resource reservation that is not yet available, an allocation that
    /// could not be made). The event is re-presented; the queue does not
    /// advance.
    TryLater,
    /// An invariant was violated or an unrecoverable disable reason was
    /// reported. The caller must route this through [`crate::fatal::route`].
    Fatal(FatalReason),
}

/// Why the process is about to abort. Never constructed for a recoverable
/// condition — see spec §7's propagation policy.
#[derive(Debug, Clone)]
pub struct FatalReason(pub String);

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FatalReason {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
