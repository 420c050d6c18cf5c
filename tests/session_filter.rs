//! Session filter behaviour: lazy interposer activation, epoch pings,
//! and the proxy-local configuration requests.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use foreshell::filter::{predictive_filter, FilterOptions, PING_REQUEST_PREFIX};
use foreshell::proxy::requests::PtyReqData;
use foreshell::proxy::{ChannelRequest, RequestChannel};
use foreshell::stream::{ByteStream, MemoryPipe};
use tokio::sync::mpsc;

/// Test double for the server side of a session channel: bytes flow over
/// a memory pipe, channel requests are recorded and answered success.
struct FakeSessionChannel {
    pipe: Arc<MemoryPipe>,
    requests: Mutex<Vec<(String, bool)>>,
}

impl FakeSessionChannel {
    fn new(pipe: Arc<MemoryPipe>) -> Arc<Self> {
        Arc::new(Self {
            pipe,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn recorded(&self) -> Vec<(String, bool)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ByteStream for FakeSessionChannel {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.pipe.read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.pipe.write(buf).await
    }

    async fn close(&self) -> io::Result<()> {
        self.pipe.close().await
    }
}

#[async_trait]
impl RequestChannel for FakeSessionChannel {
    async fn send_channel_request(&self, request: ChannelRequest) {
        self.requests
            .lock()
            .unwrap()
            .push((request.kind.clone(), request.want_reply));
        if let Some(reply) = request.reply {
            let _ = reply.send(true);
        }
    }
}

fn pty_req(width: u32, height: u32) -> ChannelRequest {
    ChannelRequest {
        kind: "pty-req".to_string(),
        want_reply: true,
        payload: PtyReqData {
            term: "xterm-256color".to_string(),
            width,
            height,
        }
        .serialize(),
        reply: None,
    }
}

async fn server_read(far: &MemoryPipe, want: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    while out.len() < want {
        match far.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    out
}

/// Filter + transformer wired the way `run_pair` does it, minus the SSH
/// layer.
struct Session {
    stream: Arc<dyn ByteStream>,
    req_tx: mpsc::Sender<ChannelRequest>,
    forwarded: Arc<Mutex<Vec<String>>>,
    fake: Arc<FakeSessionChannel>,
    far: Arc<MemoryPipe>,
}

fn start_session(opts: FilterOptions) -> Session {
    let (near, far) = MemoryPipe::pair();
    let fake = FakeSessionChannel::new(near);
    let filter = predictive_filter(opts);

    let outcome = filter("session", fake.clone() as Arc<dyn RequestChannel>);
    let stream = outcome.stream.expect("session channels are wrapped");
    let transform = outcome.requests.expect("session channels get a transformer");

    let (req_tx, req_rx) = mpsc::channel(16);
    let mut transformed = transform(req_rx);
    let forwarded = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&forwarded);
    tokio::spawn(async move {
        while let Some(request) = transformed.recv().await {
            log.lock().unwrap().push(request.kind.clone());
            if let Some(reply) = request.reply {
                let _ = reply.send(true);
            }
        }
    });

    Session {
        stream,
        req_tx,
        forwarded,
        fake,
        far,
    }
}

#[tokio::test]
async fn test_non_session_channels_are_untouched() {
    let (near, _far) = MemoryPipe::pair();
    let fake = FakeSessionChannel::new(near);
    let filter = predictive_filter(FilterOptions::default());
    let outcome = filter("direct-tcpip", fake as Arc<dyn RequestChannel>);
    assert!(outcome.stream.is_none());
    assert!(outcome.requests.is_none());
}

#[tokio::test]
async fn test_nopredict_without_delay_is_passthrough() {
    let (near, _far) = MemoryPipe::pair();
    let fake = FakeSessionChannel::new(near);
    let filter = predictive_filter(FilterOptions {
        predict: false,
        ..Default::default()
    });
    let outcome = filter("session", fake as Arc<dyn RequestChannel>);
    assert!(outcome.stream.is_none());
    assert!(outcome.requests.is_none());
}

#[tokio::test]
async fn test_bytes_pass_through_before_pty_req() {
    let session = start_session(FilterOptions::default());
    // no pty-req yet: the switch is in passthrough, bytes go straight out
    session.stream.write(b"raw").await.unwrap();
    assert_eq!(server_read(&session.far, 3).await, b"raw");
    assert!(session.fake.recorded().is_empty());
}

#[tokio::test]
async fn test_pty_req_activates_interposer_and_pings_flow() {
    let session = start_session(FilterOptions::default());

    session.req_tx.send(pty_req(80, 24)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        *session.forwarded.lock().unwrap(),
        vec!["pty-req".to_string()],
        "pty-req is forwarded to the server"
    );

    // consume the terminal prologue the interposer now emits
    let mut buf = [0u8; 4096];
    session.stream.read(&mut buf).await.unwrap();

    // first keystroke
    session.stream.write(b"a").await.unwrap();
    assert_eq!(server_read(&session.far, 1).await, b"a");
    tokio::time::sleep(Duration::from_millis(60)).await;

    // second keystroke
    session.stream.write(b"b").await.unwrap();
    assert_eq!(server_read(&session.far, 1).await, b"b");
    tokio::time::sleep(Duration::from_millis(60)).await;

    let pings: Vec<(String, bool)> = session
        .fake
        .recorded()
        .into_iter()
        .filter(|(kind, _)| kind.starts_with(PING_REQUEST_PREFIX))
        .collect();
    assert_eq!(
        pings,
        vec![
            (format!("{PING_REQUEST_PREFIX}1"), true),
            (format!("{PING_REQUEST_PREFIX}2"), true),
        ]
    );
}

#[tokio::test]
async fn test_display_preference_request_is_consumed() {
    let session = start_session(FilterOptions::default());
    session.req_tx.send(pty_req(80, 24)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    session
        .req_tx
        .send(ChannelRequest {
            kind: "foreshell/displayPreference".to_string(),
            want_reply: true,
            payload: b"never".to_vec(),
            reply: Some(reply_tx),
        })
        .await
        .unwrap();

    assert!(reply_rx.await.unwrap(), "recognised payload replies success");
    assert_eq!(
        *session.forwarded.lock().unwrap(),
        vec!["pty-req".to_string()],
        "the preference request is not forwarded"
    );
}

#[tokio::test]
async fn test_predict_overwrite_rejects_unknown_payload() {
    let session = start_session(FilterOptions::default());
    session.req_tx.send(pty_req(80, 24)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    session
        .req_tx
        .send(ChannelRequest {
            kind: "foreshell/predictOverwrite".to_string(),
            want_reply: true,
            payload: b"perhaps".to_vec(),
            reply: Some(reply_tx),
        })
        .await
        .unwrap();

    assert!(!reply_rx.await.unwrap());
    assert_eq!(*session.forwarded.lock().unwrap(), vec!["pty-req".to_string()]);
}

#[tokio::test]
async fn test_window_change_is_forwarded_and_applied() {
    let session = start_session(FilterOptions::default());
    session.req_tx.send(pty_req(80, 24)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    session
        .req_tx
        .send(ChannelRequest {
            kind: "window-change".to_string(),
            want_reply: false,
            payload: foreshell::proxy::requests::WindowChange {
                width: 132,
                height: 43,
            }
            .serialize(),
            reply: None,
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        *session.forwarded.lock().unwrap(),
        vec!["pty-req".to_string(), "window-change".to_string()]
    );
}
