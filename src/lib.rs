//! # Foreshell
//!
//! Predictive terminal emulation for SSH.
//!
//! Foreshell is a transparent SSH proxy that sits between an unmodified
//! SSH client and an unmodified SSH server and injects immediate,
//! speculative echo and line-editing feedback into interactive sessions.
//! On a high-latency link the user sees the predicted effect of each
//! keystroke at once; the proxy reconciles predictions against the
//! authoritative server output using numbered round-trip markers.
//!
//! ## Features
//!
//! - Dual-role SSH endpoint via russh: server role toward the client,
//!   client role toward the target
//! - Authentication forwarding: agent keys, identity files (passphrase
//!   prompts relayed through the connecting client), keyboard-interactive
//! - Per-channel filters; only interactive session channels pay for the
//!   predictive machinery
//! - Frame-delta output coalesced to the display refresh rate
//!
//! ## Quick start
//!
//! ```bash
//! foreshell -port 2022 -target remote.example.com:22
//! ssh -p 2022 user@localhost
//! ```

pub mod error;
pub mod filter;
pub mod predictive;
pub mod proxy;
pub mod stream;
pub mod term;

// Re-export main types for convenience
pub use error::{ChannelError, CodecError, Error, ProxyError, Result};
pub use filter::{predictive_filter, FilterOptions};
pub use predictive::{Interposer, InterposerOptions};
pub use proxy::{run_proxy, AuthConfig, HostKeyCheck, ProxyConfig};
pub use stream::ByteStream;
pub use term::DisplayPreference;
