//! Terminal emulation library: grid state, control-sequence processing,
//! frame-delta generation, and the speculative echo overlay.
//!
//! This module is the single collaborator the predictive interposer
//! consumes: [`Framebuffer`] snapshots, an [`Emulator`] fed by either
//! server bytes or local [`Action`]s, a [`Display`] producing deltas, and
//! the [`PredictionEngine`] overlay.

mod display;
mod emulator;
mod framebuffer;
mod predict;

pub use display::Display;
pub use emulator::{Action, Emulator};
pub use framebuffer::{Cell, Color, Cursor, Framebuffer};
pub use predict::{DisplayPreference, PredictionEngine};

/// Identification string for the predictive backend.
pub fn backend_version() -> String {
    format!("foreshell-term {}", env!("CARGO_PKG_VERSION"))
}
