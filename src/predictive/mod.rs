//! Predictive terminal interposition.
//!
//! The pieces that turn a plain session channel into a predictively
//! echoed one: the [`AsyncSink`] write buffer, the [`RingDelay`] latency
//! shim, the [`EpochTracker`] round-trip ledger, the late-binding
//! [`IoSwitch`], and the [`Interposer`] itself.

mod delay;
mod epoch;
mod interposer;
mod sink;
mod switch;

pub use delay::RingDelay;
pub use epoch::{EpochOpener, EpochTracker};
pub use interposer::{EpochCallback, Interposer};
pub use sink::{AsyncSink, FlushHook};
pub use switch::IoSwitch;

use std::time::Duration;

use crate::term::DisplayPreference;

/// Coalescing window for frame deltas: one 60 Hz display frame.
pub const COALESCE_INTERVAL: Duration = Duration::from_micros(16_667);

/// Default capacity of the async sink buffer, in bytes.
pub const SINK_CAPACITY: usize = 8192;

/// Default capacity of the ring delay shim, in queued writes.
pub const RING_CAPACITY: usize = 512;

/// Tunables for a predictive interposer.
#[derive(Debug, Clone)]
pub struct InterposerOptions {
    /// When to show predictions.
    pub display_preference: DisplayPreference,

    /// Whether to predict overwrites of occupied cells.
    pub predict_overwrite: bool,

    /// Minimum wall-clock interval between emitted frame deltas.
    pub coalesce_interval: Duration,

    /// Async sink buffer capacity in bytes.
    pub sink_capacity: usize,

    /// Initial terminal dimensions, replaced by the first `pty-req`.
    pub width: usize,
    pub height: usize,
}

impl Default for InterposerOptions {
    fn default() -> Self {
        Self {
            display_preference: DisplayPreference::Experimental,
            predict_overwrite: true,
            coalesce_interval: COALESCE_INTERVAL,
            sink_capacity: SINK_CAPACITY,
            width: 80,
            height: 24,
        }
    }
}
