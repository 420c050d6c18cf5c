//! Server role: terminating the connecting client.
//!
//! The handler bridges authentication (one keyboard-interactive
//! conversation relaying every prompt the target dial produces) and turns
//! each client-opened channel into a forwarded pair.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use russh::client::Handle as ClientHandle;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, PrivateKey};
use russh::server::{Auth, Handler, Msg, Response, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use super::auth::{AuthQuestion, QuestionRouter};
use super::channel::{put_string, run_pair, ClientFeed, ClientSide};
use super::client::{dial_target, TargetClient, TargetHandler};
use super::requests::{PtyReqData, WindowChange};
use super::{ChannelRequest, ProxyConfig};
use crate::error::ProxyError;

/// Generate the proxy's host key: fresh Ed25519, never persisted.
pub fn generate_host_key() -> Result<PrivateKey, ProxyError> {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|err| ProxyError::Key(err.to_string()))
}

/// Per-channel plumbing feeding the pair tasks from handler callbacks.
struct ChannelFeed {
    /// Present until the client half-closes the channel.
    data_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Present until the client closes the channel.
    req_tx: Option<mpsc::Sender<ChannelRequest>>,

    /// Keeps the server-side channel object alive for the pair's
    /// lifetime; all traffic flows through the session handle instead.
    _channel: Channel<Msg>,
}

#[derive(Default)]
struct AuthProgress {
    started: bool,
    question_rx: Option<mpsc::Receiver<AuthQuestion>>,
    done_rx: Option<oneshot::Receiver<Result<TargetClient, ProxyError>>>,
    pending: Option<AuthQuestion>,
    asked_any: bool,
    banner_sent: bool,
    accepted: bool,
    failed: bool,
}

/// One connecting client's session.
pub struct ProxyHandler {
    config: Arc<ProxyConfig>,
    peer: SocketAddr,
    auth: AuthProgress,
    target: Option<Arc<AsyncMutex<ClientHandle<TargetHandler>>>>,
    server_handle_slot: Option<Arc<std::sync::Mutex<Option<russh::server::Handle>>>>,
    channels: HashMap<ChannelId, ChannelFeed>,
}

impl ProxyHandler {
    pub fn new(config: Arc<ProxyConfig>, peer: SocketAddr) -> Self {
        Self {
            config,
            peer,
            auth: AuthProgress::default(),
            target: None,
            server_handle_slot: None,
            channels: HashMap::new(),
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    /// One keyboard-interactive round carrying a single question.
    fn challenge_round(&mut self, question: AuthQuestion) -> Auth {
        let instructions = question.message.clone();
        let prompts = vec![(question.prompt.clone().into(), question.echo)];
        self.auth.pending = Some(question);
        Auth::Partial {
            name: "".into(),
            instructions: instructions.into(),
            prompts: prompts.into(),
        }
    }

    /// An empty informational round (used for the banner-only challenge
    /// and for surfacing dial errors).
    fn message_round(message: String) -> Auth {
        Auth::Partial {
            name: "".into(),
            instructions: message.into(),
            prompts: Vec::new().into(),
        }
    }

    /// Queue a mirrored client request toward the target, wiring the
    /// reply back through the session handle.
    async fn queue_request(
        &mut self,
        id: ChannelId,
        session: &mut Session,
        kind: &str,
        payload: Vec<u8>,
        want_reply: bool,
    ) -> Result<(), russh::Error> {
        let Some(feed) = self.channels.get(&id) else {
            if want_reply {
                session.channel_failure(id)?;
            }
            return Ok(());
        };
        let Some(req_tx) = feed.req_tx.clone() else {
            return Ok(());
        };

        let reply = if want_reply {
            let (tx, rx) = oneshot::channel();
            let handle = session.handle();
            tokio::spawn(async move {
                let ok = rx.await.unwrap_or(false);
                let result = if ok {
                    handle.channel_success(id).await
                } else {
                    handle.channel_failure(id).await
                };
                if result.is_err() {
                    debug!("request reply not delivered (session gone)");
                }
            });
            Some(tx)
        } else {
            None
        };

        let request = ChannelRequest {
            kind: kind.to_string(),
            want_reply,
            payload,
            reply,
        };
        if req_tx.send(request).await.is_err() {
            debug!("request '{kind}' dropped: pair gone");
        }
        Ok(())
    }

    /// Open the matching channel on the target and start the pair.
    async fn open_pair(
        &mut self,
        channel_type: &str,
        channel: Channel<Msg>,
        target_channel: Channel<russh::client::Msg>,
        session: &mut Session,
    ) {
        let (data_tx, data_rx) = mpsc::channel(64);
        let (req_tx, req_rx) = mpsc::channel(64);
        let client = ClientSide {
            handle: session.handle(),
            id: channel.id(),
        };
        self.channels.insert(
            channel.id(),
            ChannelFeed {
                data_tx: Some(data_tx),
                req_tx: Some(req_tx),
                _channel: channel,
            },
        );
        let filter = self.config.channel_filter.clone();
        let channel_type = channel_type.to_string();
        tokio::spawn(async move {
            run_pair(
                channel_type,
                client,
                target_channel,
                filter.as_ref(),
                ClientFeed { data_rx, req_rx },
            )
            .await;
        });
    }
}

impl Handler for ProxyHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(&[MethodKind::KeyboardInteractive][..])),
            partial_success: false,
        })
    }

    async fn auth_password(&mut self, _user: &str, _password: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(&[MethodKind::KeyboardInteractive][..])),
            partial_success: false,
        })
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        response: Option<Response<'_>>,
    ) -> Result<Auth, Self::Error> {
        // an answer to the previous round feeds the pending question
        if let Some(question) = self.auth.pending.take() {
            let answer = response
                .and_then(|mut r| r.next())
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default();
            if !(question.on_answer)(answer) {
                info!("auth from {} failed: rejected answer", self.peer);
                return Ok(Self::reject());
            }
        }
        if self.auth.accepted {
            return Ok(Auth::Accept);
        }
        if self.auth.failed {
            return Ok(Self::reject());
        }

        // the dial starts as soon as the proxy knows the user name
        if !self.auth.started {
            self.auth.started = true;
            let (router, question_rx) = QuestionRouter::new();
            let (done_tx, done_rx) = oneshot::channel();
            let config = Arc::clone(&self.config);
            let user = user.to_string();
            tokio::spawn(async move {
                let result = dial_target(&user, &config, &router).await;
                drop(router); // close the question funnel
                let _ = done_tx.send(result);
            });
            self.auth.question_rx = Some(question_rx);
            self.auth.done_rx = Some(done_rx);
        }

        let banner = if self.auth.banner_sent {
            None
        } else {
            self.auth.banner_sent = true;
            self.config.banner_for(user)
        };

        // relay the next supplementary question, if any
        if let Some(question_rx) = self.auth.question_rx.as_mut() {
            if let Some(mut question) = question_rx.recv().await {
                self.auth.asked_any = true;
                if let Some(banner) = banner {
                    question.message = format!("{banner}{}", question.message);
                }
                return Ok(self.challenge_round(question));
            }
            self.auth.question_rx = None;
        }

        // the funnel is drained: the dial has finished
        let result = match self.auth.done_rx.take() {
            Some(done_rx) => done_rx.await.unwrap_or(Err(ProxyError::TargetAuthFailed {
                user: user.to_string(),
            })),
            None => {
                return Ok(Self::reject());
            }
        };

        match result {
            Ok(target) => {
                self.server_handle_slot = Some(Arc::clone(&target.server_handle));
                self.target = Some(Arc::new(AsyncMutex::new(target.session)));
                if self.auth.asked_any && banner.is_none() {
                    Ok(Auth::Accept)
                } else {
                    // blank challenge so the client does not prompt on its
                    // own; also carries the banner
                    self.auth.accepted = true;
                    Ok(Self::message_round(banner.unwrap_or_default()))
                }
            }
            Err(err) => {
                warn!("dial for {} failed: {err}", self.peer);
                if self.config.report_auth_err {
                    self.auth.failed = true;
                    Ok(Self::message_round(format!("{err}\n")))
                } else {
                    Ok(Self::reject())
                }
            }
        }
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        if let Some(slot) = &self.server_handle_slot {
            *slot.lock().unwrap() = Some(session.handle());
        }
        info!("client {} authenticated", self.peer);
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(target) = self.target.clone() else {
            return Ok(false);
        };
        let result = target.lock().await.channel_open_session().await;
        match result {
            Ok(target_channel) => {
                debug!("session channel paired for {}", self.peer);
                self.open_pair("session", channel, target_channel, session)
                    .await;
                Ok(true)
            }
            Err(err) => {
                warn!("target refused session channel: {err}");
                Ok(false)
            }
        }
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(target) = self.target.clone() else {
            return Ok(false);
        };
        let result = target.lock().await.tcpip_forward(address, *port).await;
        match result {
            Ok(_) => {
                debug!("tcpip-forward for {address}:{port} mirrored");
                Ok(true)
            }
            Err(err) => {
                debug!("tcpip-forward not mirrored: {err}");
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(target) = self.target.clone() else {
            return Ok(false);
        };
        match target.lock().await.cancel_tcpip_forward(address, port).await {
            Ok(()) => Ok(true),
            Err(err) => {
                debug!("cancel-tcpip-forward not mirrored: {err}");
                Ok(false)
            }
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(target) = self.target.clone() else {
            return Ok(false);
        };
        match target
            .lock()
            .await
            .channel_open_direct_tcpip(
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            )
            .await
        {
            Ok(target_channel) => {
                self.open_pair("direct-tcpip", channel, target_channel, session)
                    .await;
                Ok(true)
            }
            Err(err) => {
                debug!("target refused direct-tcpip channel: {err}");
                Ok(false)
            }
        }
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(feed) = self.channels.get(&channel) {
            if let Some(tx) = feed.data_tx.clone() {
                if tx.send(data.to_vec()).await.is_err() {
                    debug!("data for closed pair dropped");
                }
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(feed) = self.channels.get_mut(&channel) {
            feed.data_tx.take();
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = PtyReqData {
            term: term.to_string(),
            width: col_width,
            height: row_height,
        }
        .serialize();
        self.queue_request(channel, session, "pty-req", payload, true)
            .await
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = WindowChange {
            width: col_width,
            height: row_height,
        }
        .serialize();
        self.queue_request(channel, session, "window-change", payload, false)
            .await
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.queue_request(channel, session, "shell", Vec::new(), true)
            .await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.queue_request(channel, session, "exec", data.to_vec(), true)
            .await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.queue_request(channel, session, "subsystem", name.as_bytes().to_vec(), true)
            .await
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = bytes::BytesMut::new();
        put_string(&mut payload, variable_name.as_bytes());
        put_string(&mut payload, variable_value.as_bytes());
        self.queue_request(channel, session, "env", payload.to_vec(), false)
            .await
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.queue_request(
            channel,
            session,
            "auth-agent-req@openssh.com",
            Vec::new(),
            true,
        )
        .await?;
        Ok(true)
    }
}
