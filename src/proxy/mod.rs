//! The SSH proxy fabric.
//!
//! A dual-role endpoint: a server role terminates the connecting client,
//! a client role dials the target, and channel pairs shuttle data and
//! requests between the two, honouring per-channel stream filters.

pub mod auth;
pub mod channel;
pub mod client;
pub mod requests;
pub mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::stream::ByteStream;
use server::ProxyHandler;

/// How the client role verifies the target's host key.
#[derive(Debug, Clone)]
pub enum HostKeyCheck {
    /// Accept any key. For lab use and disabled strict checking.
    AcceptAll,

    /// Verify against a known-hosts file; unknown and changed keys are
    /// both rejected.
    KnownHosts(PathBuf),
}

/// Authentication material for the target dial.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Identity files in attempt order (already discovered/deduplicated).
    pub identities: Vec<PathBuf>,

    /// Whether to offer keys held by the SSH agent.
    pub use_agent: bool,

    /// Send a blank password only, skipping keys and forwarded prompts.
    pub dumb_auth: bool,
}

/// A channel-scoped SSH request in transit through the proxy.
///
/// `reply`, when present, must be fired exactly once with the peer's
/// answer; for consumed requests the consumer answers directly.
pub struct ChannelRequest {
    pub kind: String,
    pub want_reply: bool,
    pub payload: Vec<u8>,
    pub reply: Option<oneshot::Sender<bool>>,
}

impl std::fmt::Debug for ChannelRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRequest")
            .field("kind", &self.kind)
            .field("want_reply", &self.want_reply)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// A [`ByteStream`] that is also able to carry channel-scoped requests:
/// what a filter sees of the server side of a pair.
#[async_trait]
pub trait RequestChannel: ByteStream {
    /// Send a channel request to the peer. The request's `reply` fires
    /// when the peer answers.
    async fn send_channel_request(&self, request: ChannelRequest);
}

/// Product of filtering a freshly-opened channel.
#[derive(Default)]
pub struct FilterOutcome {
    /// Replacement stream interposed between the two channel halves.
    pub stream: Option<Arc<dyn ByteStream>>,

    /// Transformer over the client's request stream; the default mirrors
    /// every request to the server side unchanged.
    pub requests: Option<RequestTransformer>,
}

/// Optionally wraps a channel of the given type. Receives the channel
/// type and the raw server-side channel.
pub type ChannelStreamFilter =
    Arc<dyn Fn(&str, Arc<dyn RequestChannel>) -> FilterOutcome + Send + Sync>;

/// Rewrites the client's channel-request stream. Consumed requests are
/// answered by the transformer; everything else flows through.
pub type RequestTransformer = Arc<
    dyn Fn(mpsc::Receiver<ChannelRequest>) -> mpsc::Receiver<ChannelRequest> + Send + Sync,
>;

/// Proxy configuration assembled by the binary.
pub struct ProxyConfig {
    /// Resolved target address.
    pub target: SocketAddr,

    /// Target host name as given, for known-hosts lookups.
    pub target_host: String,

    /// Target port, for known-hosts lookups.
    pub target_port: u16,

    /// Host key verification for the target dial.
    pub host_key_check: HostKeyCheck,

    /// Per-channel stream filter.
    pub channel_filter: Option<ChannelStreamFilter>,

    /// Authentication material for the target dial.
    pub auth: AuthConfig,

    /// Banner template shown to connecting clients; `None` disables it.
    pub banner: Option<String>,

    /// Surface target authentication errors to the client.
    pub report_auth_err: bool,

    /// Reject server-originated agent-forwarding channels.
    pub block_agent: bool,

    /// Target dial timeout.
    pub dial_timeout: Duration,
}

impl ProxyConfig {
    /// The banner line for a given user, if banners are enabled.
    pub fn banner_for(&self, user: &str) -> Option<String> {
        self.banner
            .as_ref()
            .map(|target| format!("Foreshell proxying ~ {user}@{target}\n"))
    }
}

/// Default timeout for the target dial.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Accept loop: serves the proxy until the listener fails fatally.
/// Individual accept and handshake errors are logged and skipped.
pub async fn run_proxy(
    listener: TcpListener,
    server_config: Arc<russh::server::Config>,
    config: Arc<ProxyConfig>,
) -> Result<()> {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept failed: {err}");
                continue;
            }
        };
        let handler = ProxyHandler::new(Arc::clone(&config), peer);
        let server_config = Arc::clone(&server_config);
        tokio::spawn(async move {
            match russh::server::run_stream(server_config, socket, handler).await {
                Ok(session) => {
                    if let Err(err) = session.await {
                        log::debug!("session from {peer} ended: {err}");
                    }
                }
                Err(err) => {
                    log::debug!("handshake from {peer} failed: {err}");
                }
            }
        });
    }
}
