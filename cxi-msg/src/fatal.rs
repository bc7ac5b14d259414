// SPDX-License-Identifier: BSD-3-Clause

//! Fatal-condition handling (spec §7: "the process logs and aborts").
//!
//! Production code wants `std::process::abort()`. Tests want to assert on
//! *which* reason fired without taking the whole test binary down with them.
//! [`FatalHandler`] is the seam: `Endpoint::progress` hands a `Disposition`
//! back out rather than calling one itself (spec §7: the core never decides
//! how a fatal condition is reported), so a caller routes it through
//! [`route`] once it owns a handler.

use crate::error::{Disposition, FatalReason};
use log::error;

pub trait FatalHandler {
    /// Called when an invariant is violated or the NIC reports an
    /// unrecoverable disable reason. Implementations that don't actually
    /// abort the process must still make it impossible for the caller to
    /// continue treating the event as handled.
    fn fatal(&self, reason: &FatalReason) -> !;
}

/// Passes `disposition` through unchanged unless it's `Fatal`, in which case
/// `handler` takes over and never returns. The one place a caller needs to
/// mention both `Disposition` and a `FatalHandler` together.
pub fn route(handler: &dyn FatalHandler, disposition: Disposition) -> Disposition {
    match disposition {
        Disposition::Fatal(reason) => handler.fatal(&reason),
        other => other,
    }
}

/// The production handler: log at error level, then abort.
#[derive(Default)]
pub struct AbortOnFatal;

impl FatalHandler for AbortOnFatal {
    fn fatal(&self, reason: &FatalReason) -> ! {
        error!("fatal: {reason}");
        std::process::abort();
    }
}

/// A test handler that records the reason and unwinds instead of aborting.
#[cfg(any(test, feature = "test-support"))]
pub struct PanicOnFatal;

#[cfg(any(test, feature = "test-support"))]
impl FatalHandler for PanicOnFatal {
    fn fatal(&self, reason: &FatalReason) -> ! {
        error!("fatal (test): {reason}");
        panic!("fatal condition: {reason}");
    }
}
