//! Error types for foreshell.

use std::io;
use thiserror::Error;

/// Main error type for foreshell operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Proxy fabric errors
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Channel forwarding errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Request payload codec errors
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Proxy fabric errors (listening, dialing, authentication).
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Failed to listen on the proxy port
    #[error("Listen failed on port {port}: {source}")]
    ListenFailed {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Failed to resolve the target address
    #[error("Cannot resolve target '{target}'")]
    TargetUnresolvable { target: String },

    /// SSH protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Target authentication failed
    #[error("Authentication to target failed for user '{user}'")]
    TargetAuthFailed { user: String },

    /// Target dial timed out
    #[error("Target dial timed out after {0:?}")]
    DialTimeout(std::time::Duration),

    /// SSH key error
    #[error("SSH key error: {0}")]
    Key(String),

    /// Strict host key checking without a known-hosts source
    #[error("Strict host key checking enabled, but no known_hosts provided")]
    NoKnownHosts,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Channel forwarding errors.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Peer rejected the channel open
    #[error("Channel open rejected: {reason}")]
    OpenRejected { reason: String },

    /// Channel closed unexpectedly
    #[error("Channel closed")]
    Closed,

    /// The client stopped reading frame deltas for too long
    #[error("Emission buffer overflow")]
    EmissionOverflow,

    /// I/O error on a channel stream
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Request payload parse errors (`pty-req`, `window-change`).
#[derive(Error, Debug)]
pub enum CodecError {
    /// Payload ended before the field could be read
    #[error("Truncated {request} payload reading {field}")]
    Truncated {
        request: &'static str,
        field: &'static str,
    },

    /// TERM name was not valid UTF-8
    #[error("Invalid TERM string in pty-req payload")]
    InvalidTerm,
}

/// Result type alias using foreshell's Error.
pub type Result<T> = std::result::Result<T, Error>;
