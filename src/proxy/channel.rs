//! Channel pair forwarding.
//!
//! Each client-opened channel is matched with a channel to the target and
//! driven by four long-lived tasks: two data copies and two request
//! mirrors. The pair is released only when all four have finished; each
//! half's write-close propagates EOF to the other half.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, trace, warn};
use russh::server::Handle as ServerHandle;
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, Sig};
use tokio::sync::{mpsc, oneshot, Mutex};

use super::requests::{PtyReqData, WindowChange};
use super::{ChannelRequest, FilterOutcome, RequestChannel};
use crate::stream::ByteStream;

/// Read an SSH wire string (u32 length prefix) from a payload.
fn get_string(buf: &mut Bytes) -> Option<Vec<u8>> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return None;
    }
    Some(buf.split_to(len).to_vec())
}

/// Write an SSH wire string.
pub(crate) fn put_string(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

enum EndpointCmd {
    Data(Vec<u8>),
    Eof,
    Close,
    Request(ChannelRequest),
}

/// A russh channel driven by a dedicated task, exposed as a [`ByteStream`]
/// plus a stream of the requests the peer sent on it.
pub struct ChannelEndpoint {
    cmd_tx: mpsc::Sender<EndpointCmd>,
    data_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    leftover: Mutex<Vec<u8>>,
}

impl ChannelEndpoint {
    /// Take ownership of `channel` and pump it. Returns the endpoint and
    /// the receiver of peer-originated requests (exit-status and friends).
    pub fn spawn<S>(channel: Channel<S>) -> (Arc<Self>, mpsc::Receiver<ChannelRequest>)
    where
        S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (data_tx, data_rx) = mpsc::channel(64);
        let (req_tx, req_rx) = mpsc::channel(64);
        tokio::spawn(drive_channel(channel, cmd_rx, data_tx, req_tx));
        (
            Arc::new(Self {
                cmd_tx,
                data_rx: Mutex::new(data_rx),
                leftover: Mutex::new(Vec::new()),
            }),
            req_rx,
        )
    }

    /// Half-close: signal EOF to the peer, keeping reads alive.
    pub async fn close_write(&self) {
        let _ = self.cmd_tx.send(EndpointCmd::Eof).await;
    }
}

#[async_trait]
impl RequestChannel for ChannelEndpoint {
    async fn send_channel_request(&self, request: ChannelRequest) {
        if self.cmd_tx.send(EndpointCmd::Request(request)).await.is_err() {
            trace!("request dropped: channel endpoint gone");
        }
    }
}

#[async_trait]
impl ByteStream for ChannelEndpoint {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut leftover = self.leftover.lock().await;
        if leftover.is_empty() {
            let chunk = { self.data_rx.lock().await.recv().await };
            match chunk {
                Some(chunk) => *leftover = chunk,
                None => return Ok(0),
            }
        }
        let n = leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&leftover[..n]);
        leftover.drain(..n);
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.cmd_tx
            .send(EndpointCmd::Data(buf.to_vec()))
            .await
            .map(|_| buf.len())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))
    }

    async fn close(&self) -> io::Result<()> {
        let _ = self.cmd_tx.send(EndpointCmd::Close).await;
        Ok(())
    }
}

/// Owns a russh channel: routes peer messages out and commands in.
/// Reply routing is FIFO, matching the wire ordering of channel replies.
async fn drive_channel<S>(
    channel: Channel<S>,
    mut cmd_rx: mpsc::Receiver<EndpointCmd>,
    data_tx: mpsc::Sender<Vec<u8>>,
    req_tx: mpsc::Sender<ChannelRequest>,
) where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    let (mut read_half, write_half) = channel.split();
    let mut pending_replies: VecDeque<Option<oneshot::Sender<bool>>> = VecDeque::new();
    let mut data_tx = Some(data_tx);

    loop {
        tokio::select! {
            msg = read_half.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if let Some(tx) = &data_tx {
                        if tx.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    // stderr merges into the data path for forwarding
                    if let Some(tx) = &data_tx {
                        if tx.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
                Some(ChannelMsg::Eof) => {
                    data_tx.take();
                }
                Some(ChannelMsg::Close) => break,
                Some(ChannelMsg::Success) => {
                    if let Some(Some(tx)) = pending_replies.pop_front() {
                        let _ = tx.send(true);
                    }
                }
                Some(ChannelMsg::Failure) => {
                    if let Some(Some(tx)) = pending_replies.pop_front() {
                        let _ = tx.send(false);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    let mut payload = BytesMut::new();
                    payload.put_u32(exit_status);
                    let _ = req_tx.send(ChannelRequest {
                        kind: "exit-status".to_string(),
                        want_reply: false,
                        payload: payload.to_vec(),
                        reply: None,
                    }).await;
                }
                Some(ChannelMsg::ExitSignal { signal_name, core_dumped, error_message, lang_tag }) => {
                    let mut payload = BytesMut::new();
                    put_string(&mut payload, sig_name(&signal_name).as_bytes());
                    payload.put_u8(core_dumped as u8);
                    put_string(&mut payload, error_message.as_bytes());
                    put_string(&mut payload, lang_tag.as_bytes());
                    let _ = req_tx.send(ChannelRequest {
                        kind: "exit-signal".to_string(),
                        want_reply: false,
                        payload: payload.to_vec(),
                        reply: None,
                    }).await;
                }
                Some(_) => {}
                None => break,
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(EndpointCmd::Data(data)) => {
                    if write_half.data(&data[..]).await.is_err() {
                        break;
                    }
                }
                Some(EndpointCmd::Eof) => {
                    let _ = write_half.eof().await;
                }
                Some(EndpointCmd::Close) | None => {
                    let _ = write_half.close().await;
                    break;
                }
                Some(EndpointCmd::Request(request)) => {
                    let ChannelRequest { kind, want_reply, payload, reply } = request;
                    if want_reply {
                        pending_replies.push_back(reply);
                    }
                    if let Err(err) =
                        forward_request(&write_half, &kind, want_reply, &payload).await
                    {
                        debug!("request '{kind}' not forwarded: {err}");
                        if want_reply {
                            if let Some(Some(tx)) = pending_replies.pop_back() {
                                let _ = tx.send(false);
                            }
                        }
                    }
                }
            },
        }
    }
}

/// Replay a mirrored request onto a russh channel.
async fn forward_request<S>(
    channel: &russh::ChannelWriteHalf<S>,
    kind: &str,
    want_reply: bool,
    payload: &[u8],
) -> Result<(), String>
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    let ssh = |err: russh::Error| err.to_string();
    match kind {
        "pty-req" => {
            let pty = PtyReqData::parse(payload).map_err(|e| e.to_string())?;
            channel
                .request_pty(
                    want_reply,
                    &pty.term,
                    pty.width,
                    pty.height,
                    pty.width * 8,
                    pty.height * 8,
                    &[],
                )
                .await
                .map_err(ssh)
        }
        "shell" => channel.request_shell(want_reply).await.map_err(ssh),
        "exec" => channel.exec(want_reply, payload).await.map_err(ssh),
        "subsystem" => {
            let name =
                std::str::from_utf8(payload).map_err(|_| "subsystem name not utf-8")?;
            channel
                .request_subsystem(want_reply, name)
                .await
                .map_err(ssh)
        }
        "env" => {
            let mut buf = Bytes::copy_from_slice(payload);
            let (name, value) = match (get_string(&mut buf), get_string(&mut buf)) {
                (Some(name), Some(value)) => (name, value),
                _ => return Err("truncated env payload".to_string()),
            };
            channel
                .set_env(
                    want_reply,
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
                .await
                .map_err(ssh)
        }
        "window-change" => {
            let wc = WindowChange::parse(payload).map_err(|e| e.to_string())?;
            channel
                .window_change(wc.width, wc.height, wc.width * 8, wc.height * 8)
                .await
                .map_err(ssh)
        }
        "signal" => {
            let mut buf = Bytes::copy_from_slice(payload);
            let name = get_string(&mut buf).ok_or("truncated signal payload")?;
            channel
                .signal(sig_from_name(&String::from_utf8_lossy(&name)))
                .await
                .map_err(ssh)
        }
        "auth-agent-req@openssh.com" => {
            channel.agent_forward(want_reply).await.map_err(ssh)
        }
        _ => {
            // proxy-local markers and anything else nonstandard
            channel
                .request_custom(want_reply, kind, payload)
                .await
                .map_err(ssh)
        }
    }
}

/// RFC 4254 signal names for the russh `Sig` enum.
fn sig_name(sig: &Sig) -> String {
    match sig {
        Sig::ABRT => "ABRT".to_string(),
        Sig::ALRM => "ALRM".to_string(),
        Sig::FPE => "FPE".to_string(),
        Sig::HUP => "HUP".to_string(),
        Sig::ILL => "ILL".to_string(),
        Sig::INT => "INT".to_string(),
        Sig::KILL => "KILL".to_string(),
        Sig::PIPE => "PIPE".to_string(),
        Sig::QUIT => "QUIT".to_string(),
        Sig::SEGV => "SEGV".to_string(),
        Sig::TERM => "TERM".to_string(),
        Sig::USR1 => "USR1".to_string(),
        Sig::Custom(name) => name.clone(),
    }
}

fn sig_from_name(name: &str) -> Sig {
    match name {
        "ABRT" => Sig::ABRT,
        "ALRM" => Sig::ALRM,
        "FPE" => Sig::FPE,
        "HUP" => Sig::HUP,
        "ILL" => Sig::ILL,
        "INT" => Sig::INT,
        "KILL" => Sig::KILL,
        "PIPE" => Sig::PIPE,
        "QUIT" => Sig::QUIT,
        "SEGV" => Sig::SEGV,
        "TERM" => Sig::TERM,
        "USR1" => Sig::USR1,
        other => Sig::Custom(other.to_string()),
    }
}

/// The connecting client's side of a pair: the server-role session handle
/// plus the channel id within it.
#[derive(Clone)]
pub struct ClientSide {
    pub handle: ServerHandle,
    pub id: ChannelId,
}

impl ClientSide {
    async fn write(&self, data: &[u8]) -> Result<(), ()> {
        self.handle
            .data(self.id, CryptoVec::from_slice(data))
            .await
            .map_err(|_| ())
    }

    async fn close_write(&self) {
        let _ = self.handle.eof(self.id).await;
    }

    async fn close(&self) {
        let _ = self.handle.close(self.id).await;
    }
}

/// Inputs fed by the server-role handler callbacks.
pub struct ClientFeed {
    pub data_rx: mpsc::Receiver<Vec<u8>>,
    pub req_rx: mpsc::Receiver<ChannelRequest>,
}

/// Drive one channel pair to completion: two data copies and two request
/// mirrors. Returns when all four activities have finished and both
/// halves are closed.
pub async fn run_pair(
    channel_type: String,
    client: ClientSide,
    target: Channel<russh::client::Msg>,
    filter: Option<&super::ChannelStreamFilter>,
    feed: ClientFeed,
) {
    let (raw_target, target_req_rx) = ChannelEndpoint::spawn(target);

    let FilterOutcome { stream, requests } = match filter {
        Some(filter) => filter(&channel_type, raw_target.clone() as Arc<dyn RequestChannel>),
        None => FilterOutcome::default(),
    };
    let copy_target: Arc<dyn ByteStream> = match &stream {
        Some(stream) => Arc::clone(stream),
        None => raw_target.clone(),
    };
    let filtered = stream.is_some();

    let ClientFeed { mut data_rx, req_rx } = feed;
    let client_req_rx = match &requests {
        Some(transform) => transform(req_rx),
        None => req_rx,
    };

    let (client_closed_tx, client_closed_rx) = oneshot::channel::<()>();
    let (server_closed_tx, server_closed_rx) = oneshot::channel::<()>();

    // client -> server data
    let c2s = {
        let copy_target = Arc::clone(&copy_target);
        let raw_target = Arc::clone(&raw_target);
        tokio::spawn(async move {
            while let Some(chunk) = data_rx.recv().await {
                if copy_target.write(&chunk).await.is_err() {
                    break;
                }
            }
            raw_target.close_write().await;
            let _ = client_closed_tx.send(());
        })
    };

    // server -> client data
    let s2c = {
        let copy_target = Arc::clone(&copy_target);
        let client = client.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 32 * 1024];
            loop {
                match copy_target.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if client.write(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!("server->client copy ended: {err}");
                        break;
                    }
                }
            }
            client.close_write().await;
            let _ = server_closed_tx.send(());
        })
    };

    // client -> server requests; closes the server side when both the
    // request stream and the client data copy are done
    let creq = {
        let raw_target = Arc::clone(&raw_target);
        let copy_target = Arc::clone(&copy_target);
        let mut client_req_rx = client_req_rx;
        tokio::spawn(async move {
            while let Some(request) = client_req_rx.recv().await {
                trace!("forwarding client request '{}'", request.kind);
                raw_target.send_channel_request(request).await;
            }
            let _ = client_closed_rx.await;
            let _ = ByteStream::close(&*raw_target).await;
            if filtered {
                let _ = copy_target.close().await;
            }
        })
    };

    // server -> client requests; closes the client side when both the
    // request stream and the server data copy are done
    let sreq = {
        let client = client.clone();
        let mut target_req_rx = target_req_rx;
        tokio::spawn(async move {
            while let Some(request) = target_req_rx.recv().await {
                mirror_to_client(&client, request).await;
            }
            let _ = server_closed_rx.await;
            client.close().await;
        })
    };

    for task in [c2s, s2c, creq, sreq] {
        if let Err(err) = task.await {
            warn!("channel pair task panicked: {err}");
        }
    }
    debug!("channel pair ({channel_type}) released");
}

/// Replay a server-originated request onto the connecting client.
async fn mirror_to_client(client: &ClientSide, request: ChannelRequest) {
    match request.kind.as_str() {
        "exit-status" => {
            let mut buf = Bytes::copy_from_slice(&request.payload);
            if buf.remaining() >= 4 {
                let status = buf.get_u32();
                let _ = client
                    .handle
                    .exit_status_request(client.id, status)
                    .await;
            }
        }
        "exit-signal" => {
            let mut buf = Bytes::copy_from_slice(&request.payload);
            let name = get_string(&mut buf).unwrap_or_default();
            let core_dumped = buf.remaining() >= 1 && buf.get_u8() != 0;
            let error_message = get_string(&mut buf).unwrap_or_default();
            let lang_tag = get_string(&mut buf).unwrap_or_default();
            let _ = client
                .handle
                .exit_signal_request(
                    client.id,
                    sig_from_name(&String::from_utf8_lossy(&name)),
                    core_dumped,
                    String::from_utf8_lossy(&error_message).into_owned(),
                    String::from_utf8_lossy(&lang_tag).into_owned(),
                )
                .await;
        }
        other => {
            trace!("dropping unmirrorable server request '{other}'");
            if let Some(reply) = request.reply {
                let _ = reply.send(false);
            }
        }
    }
}

/// Bridge two endpoints byte-for-byte in both directions; used for
/// reverse-opened channels, which carry no filter.
pub async fn bridge(a: Arc<dyn ByteStream>, b: Arc<dyn ByteStream>) {
    async fn copy(from: Arc<dyn ByteStream>, to: Arc<dyn ByteStream>) {
        let mut buf = vec![0u8; 32 * 1024];
        loop {
            match from.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if to.write(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = to.close().await;
    }

    let forward = tokio::spawn(copy(Arc::clone(&a), Arc::clone(&b)));
    let backward = tokio::spawn(copy(b, a));
    let _ = forward.await;
    let _ = backward.await;
}
