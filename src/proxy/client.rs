//! Client role: dialing and authenticating to the target server.
//!
//! Authentication methods are tried in order: agent-held keys, identity
//! files (passphrase-protected ones prompt through the question router),
//! keyboard-interactive forwarded to the connecting client, and finally a
//! blank password. `-dumbauth` collapses the ladder to the blank password
//! and blank interactive answers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use russh::client::{self, Handle, KeyboardInteractiveAuthResponse, Msg};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::server::Handle as ServerHandle;
use russh::Channel;

use super::auth::{forward_prompts, key_id, load_identities, QuestionRouter};
use super::channel::{bridge, ChannelEndpoint};
use super::{HostKeyCheck, ProxyConfig};
use crate::error::ProxyError;
use crate::stream::ByteStream;

/// Client-role handler: verifies the target host key and accepts (or
/// rejects) channels the target opens toward us.
pub struct TargetHandler {
    host: String,
    port: u16,
    host_key_check: HostKeyCheck,
    block_agent: bool,

    /// Filled in once the server-role session is ready to take
    /// reverse-opened channels.
    server_handle: Arc<Mutex<Option<ServerHandle>>>,

    /// Stores a detailed host-key error so the dial can surface it
    /// instead of the generic key-rejection error.
    host_key_error: Arc<Mutex<Option<ProxyError>>>,
}

/// What to do with an agent-forwarding channel the target opens.
enum AgentForwardDecision {
    /// Rejected: agent forwarding is administratively prohibited.
    Prohibited,

    /// Rejected: no client session to bridge into yet.
    Unavailable,

    /// Bridge through this server-role session handle.
    Bridge(ServerHandle),
}

impl TargetHandler {
    fn agent_forward_decision(&self) -> AgentForwardDecision {
        if self.block_agent {
            return AgentForwardDecision::Prohibited;
        }
        match self.server_handle.lock().unwrap().clone() {
            Some(handle) => AgentForwardDecision::Bridge(handle),
            None => AgentForwardDecision::Unavailable,
        }
    }
}

impl client::Handler for TargetHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.host_key_check {
            HostKeyCheck::AcceptAll => Ok(true),
            HostKeyCheck::KnownHosts(path) => {
                match russh::keys::check_known_hosts_path(
                    &self.host,
                    self.port,
                    server_public_key,
                    path,
                ) {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        *self.host_key_error.lock().unwrap() = Some(ProxyError::Key(format!(
                            "host key for {}:{} not found in known_hosts",
                            self.host, self.port
                        )));
                        Ok(false)
                    }
                    Err(err) => {
                        *self.host_key_error.lock().unwrap() =
                            Some(ProxyError::Key(err.to_string()));
                        Ok(false)
                    }
                }
            }
        }
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let handle = match self.agent_forward_decision() {
            AgentForwardDecision::Prohibited => {
                info!("rejecting agent-forwarding channel from target (prohibited)");
                let _ = channel.close().await;
                return Ok(());
            }
            AgentForwardDecision::Unavailable => {
                let _ = channel.close().await;
                return Ok(());
            }
            AgentForwardDecision::Bridge(handle) => handle,
        };
        tokio::spawn(async move {
            match handle.channel_open_agent().await {
                Ok(client_channel) => {
                    debug!("bridging reverse agent-forwarding channel");
                    let (target_end, _target_reqs) = ChannelEndpoint::spawn(channel);
                    let (client_end, _client_reqs) = ChannelEndpoint::spawn(client_channel);
                    bridge(
                        target_end as Arc<dyn ByteStream>,
                        client_end as Arc<dyn ByteStream>,
                    )
                    .await;
                }
                Err(err) => {
                    warn!("cannot open agent channel toward client: {err}");
                }
            }
        });
        Ok(())
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let handle = self.server_handle.lock().unwrap().clone();
        let Some(handle) = handle else {
            let _ = channel.close().await;
            return Ok(());
        };
        let connected_address = connected_address.to_string();
        let originator_address = originator_address.to_string();
        tokio::spawn(async move {
            match handle
                .channel_open_forwarded_tcpip(
                    connected_address,
                    connected_port,
                    originator_address,
                    originator_port,
                )
                .await
            {
                Ok(client_channel) => {
                    debug!("bridging forwarded-tcpip channel");
                    let (target_end, _target_reqs) = ChannelEndpoint::spawn(channel);
                    let (client_end, _client_reqs) = ChannelEndpoint::spawn(client_channel);
                    bridge(
                        target_end as Arc<dyn ByteStream>,
                        client_end as Arc<dyn ByteStream>,
                    )
                    .await;
                }
                Err(err) => {
                    warn!("cannot open forwarded-tcpip channel toward client: {err}");
                }
            }
        });
        Ok(())
    }
}

/// Established client-role session plus the slot connecting it back to
/// the server role for reverse channels.
pub struct TargetClient {
    pub session: Handle<TargetHandler>,
    pub server_handle: Arc<Mutex<Option<ServerHandle>>>,
}

/// Dial and authenticate to the target on behalf of `user`.
pub async fn dial_target(
    user: &str,
    config: &ProxyConfig,
    router: &QuestionRouter,
) -> Result<TargetClient, ProxyError> {
    let server_handle = Arc::new(Mutex::new(None));
    let host_key_error: Arc<Mutex<Option<ProxyError>>> = Arc::new(Mutex::new(None));
    let handler = TargetHandler {
        host: config.target_host.clone(),
        port: config.target_port,
        host_key_check: config.host_key_check.clone(),
        block_agent: config.block_agent,
        server_handle: Arc::clone(&server_handle),
        host_key_error: Arc::clone(&host_key_error),
    };

    let ssh_config = Arc::new(client::Config::default());
    let mut session = tokio::time::timeout(
        config.dial_timeout,
        client::connect(ssh_config, config.target, handler),
    )
    .await
    .map_err(|_| ProxyError::DialTimeout(config.dial_timeout))?
    .map_err(|err| {
        if let Some(hk_err) = host_key_error.lock().unwrap().take() {
            hk_err
        } else {
            ProxyError::Ssh(err)
        }
    })?;

    let authenticated = if config.auth.dumb_auth {
        authenticate_dumb(&mut session, user).await?
    } else {
        authenticate_ladder(&mut session, user, config, router).await?
    };

    if !authenticated {
        return Err(ProxyError::TargetAuthFailed {
            user: user.to_string(),
        });
    }

    info!("authenticated to target as {user}");
    Ok(TargetClient {
        session,
        server_handle,
    })
}

/// Blank password, then blank keyboard-interactive answers.
async fn authenticate_dumb(
    session: &mut Handle<TargetHandler>,
    user: &str,
) -> Result<bool, ProxyError> {
    if session
        .authenticate_password(user, "")
        .await
        .map_err(ProxyError::Ssh)?
        .success()
    {
        return Ok(true);
    }

    let mut response = session
        .authenticate_keyboard_interactive_start(user, None)
        .await
        .map_err(ProxyError::Ssh)?;
    loop {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                let answers = vec![String::new(); prompts.len()];
                response = session
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(ProxyError::Ssh)?;
            }
            _ => return Ok(false),
        }
    }
}

/// The full method ladder: agent keys, identity files, forwarded
/// keyboard-interactive, blank password.
async fn authenticate_ladder(
    session: &mut Handle<TargetHandler>,
    user: &str,
    config: &ProxyConfig,
    router: &QuestionRouter,
) -> Result<bool, ProxyError> {
    let mut offered: HashSet<String> = HashSet::new();

    if config.auth.use_agent {
        if let Ok(mut agent) = russh::keys::agent::client::AgentClient::connect_env().await {
            match agent.request_identities().await {
                Ok(keys) => {
                    for key in keys {
                        if !offered.insert(key_id(&key)) {
                            continue;
                        }
                        let hash_alg = session
                            .best_supported_rsa_hash()
                            .await
                            .map_err(ProxyError::Ssh)?
                            .flatten();
                        match session
                            .authenticate_publickey_with(user, key, hash_alg, &mut agent)
                            .await
                        {
                            Ok(result) if result.success() => return Ok(true),
                            Ok(_) => {}
                            Err(err) => debug!("agent key attempt failed: {err}"),
                        }
                    }
                }
                Err(err) => debug!("agent identity listing failed: {err}"),
            }
        }
    }

    for identity in load_identities(&config.auth.identities) {
        if let Some(public) = identity.public_key() {
            if !offered.insert(key_id(&public)) {
                continue;
            }
        }
        let Some(key) = identity.force(router).await else {
            debug!("identity {} skipped", identity.path().display());
            continue;
        };
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .map_err(ProxyError::Ssh)?
            .flatten();
        let result = session
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
            .await
            .map_err(ProxyError::Ssh)?;
        if result.success() {
            return Ok(true);
        }
    }

    let mut response = session
        .authenticate_keyboard_interactive_start(user, None)
        .await
        .map_err(ProxyError::Ssh)?;
    loop {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::InfoRequest {
                instructions,
                prompts,
                ..
            } => {
                let pairs: Vec<(String, bool)> = prompts
                    .into_iter()
                    .map(|prompt| (prompt.prompt, prompt.echo))
                    .collect();
                let Some(answers) = forward_prompts(router, &instructions, &pairs).await else {
                    break;
                };
                response = session
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(ProxyError::Ssh)?;
            }
            _ => break,
        }
    }

    Ok(session
        .authenticate_password(user, "")
        .await
        .map_err(ProxyError::Ssh)?
        .success())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(block_agent: bool) -> TargetHandler {
        TargetHandler {
            host: "target.example".to_string(),
            port: 22,
            host_key_check: HostKeyCheck::AcceptAll,
            block_agent,
            server_handle: Arc::new(Mutex::new(None)),
            host_key_error: Arc::new(Mutex::new(None)),
        }
    }

    #[test]
    fn test_agent_channel_prohibited_when_forwarding_disabled() {
        let handler = handler(true);
        assert!(matches!(
            handler.agent_forward_decision(),
            AgentForwardDecision::Prohibited
        ));
    }

    #[test]
    fn test_agent_channel_needs_client_session() {
        // forwarding allowed, but the server-role session is not up yet
        let handler = handler(false);
        assert!(matches!(
            handler.agent_forward_decision(),
            AgentForwardDecision::Unavailable
        ));
    }
}
