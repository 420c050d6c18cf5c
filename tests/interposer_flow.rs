//! End-to-end interposer behaviour over in-memory streams.
//!
//! The far end of the pipe plays the remote server; the near end is
//! handed to the interposer the way the session filter would.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use foreshell::predictive::{EpochCallback, Interposer, InterposerOptions};
use foreshell::stream::{ByteStream, MemoryPipe};
use foreshell::term::Display;

/// Read from the interposer until `pred` matches the accumulated output
/// or the timeout expires.
async fn read_until(
    interposer: &Interposer,
    pred: impl Fn(&[u8]) -> bool,
    timeout: Duration,
) -> Vec<u8> {
    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = [0u8; 4096];
    while !pred(&collected) {
        let read = tokio::time::timeout_at(deadline, interposer.read(&mut buf)).await;
        match read {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
            _ => break,
        }
    }
    collected
}

fn contains(haystack: &[u8], needle: &str) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle.as_bytes())
}

/// Collect all bytes the "server" receives until `want` bytes arrived.
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

/// An interposer whose epochs are acknowledged automatically, recording
/// their order.
fn auto_acked(upstream: Arc<dyn ByteStream>) -> (Interposer, Arc<Mutex<Vec<u64>>>) {
    let opened = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&opened);
    let callback: EpochCallback = Arc::new(move |interposer: Interposer, epoch, opened_at| {
        log.lock().unwrap().push(epoch);
        tokio::spawn(async move {
            interposer.acknowledge_epoch(epoch, opened_at).await;
        });
    });
    let interposer = Interposer::new(upstream, callback, InterposerOptions::default());
    (interposer, opened)
}

/// An interposer whose epochs stay unacknowledged until the returned
/// handles are used.
fn held(upstream: Arc<dyn ByteStream>) -> Interposer {
    let callback: EpochCallback = Arc::new(|_, _, _| {});
    Interposer::new(upstream, callback, InterposerOptions::default())
}

#[tokio::test]
async fn test_first_read_is_display_prologue() {
    let (near, _far) = MemoryPipe::pair();
    let (interposer, _) = auto_acked(near);

    let mut buf = [0u8; 4096];
    let n = interposer.read(&mut buf).await.unwrap();
    let prologue = Display::new(true).open();
    assert!(n > 0);
    assert_eq!(&buf[..n.min(prologue.len())], &prologue.as_bytes()[..n.min(prologue.len())]);
    assert_eq!(buf[0], prologue.as_bytes()[0]);
}

#[tokio::test]
async fn test_keystroke_reaches_server_verbatim() {
    let (near, far) = MemoryPipe::pair();
    let (interposer, _) = auto_acked(near);

    interposer.write(b"ls\n").await.unwrap();
    assert_eq!(server_read(&far, 3).await, b"ls\n");
}

#[tokio::test]
async fn test_prediction_emitted_before_any_echo() {
    let (near, _far) = MemoryPipe::pair();
    let (interposer, _) = auto_acked(near);

    // consume the prologue
    let mut buf = [0u8; 4096];
    interposer.read(&mut buf).await.unwrap();

    interposer.write(b"a").await.unwrap();
    let emitted = read_until(
        &interposer,
        |out| contains(out, "a"),
        Duration::from_millis(500),
    )
    .await;
    assert!(
        contains(&emitted, "a"),
        "predicted glyph missing from delta: {:?}",
        String::from_utf8_lossy(&emitted)
    );
}

#[tokio::test]
async fn test_epochs_open_in_order_one_per_flush() {
    let (near, far) = MemoryPipe::pair();
    let (interposer, opened) = auto_acked(near);

    interposer.write(b"a").await.unwrap();
    assert_eq!(server_read(&far, 1).await, b"a");
    tokio::time::sleep(Duration::from_millis(50)).await;

    interposer.write(b"b").await.unwrap();
    assert_eq!(server_read(&far, 1).await, b"b");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*opened.lock().unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn test_zero_length_write_opens_no_epoch() {
    let (near, _far) = MemoryPipe::pair();
    let (interposer, opened) = auto_acked(near);

    assert_eq!(interposer.write(b"").await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(opened.lock().unwrap().is_empty());
    assert_eq!(interposer.current_epoch(), 0);
}

#[tokio::test]
async fn test_idle_server_output_reaches_client_without_epochs() {
    let (near, far) = MemoryPipe::pair();
    let (interposer, opened) = auto_acked(near);

    let mut buf = [0u8; 4096];
    interposer.read(&mut buf).await.unwrap(); // prologue

    far.write(b"unsolicited").await.unwrap();
    let emitted = read_until(
        &interposer,
        |out| contains(out, "unsolicited"),
        Duration::from_millis(500),
    )
    .await;
    assert!(contains(&emitted, "unsolicited"));
    assert!(opened.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_authoritative_state_frozen_while_epoch_pending() {
    let (near, far) = MemoryPipe::pair();
    let interposer = held(near);

    let mut buf = [0u8; 4096];
    interposer.read(&mut buf).await.unwrap(); // prologue

    // a keystroke opens an epoch that nobody acknowledges
    interposer.write(b"a").await.unwrap();
    assert_eq!(server_read(&far, 1).await, b"a");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(interposer.epoch_pending());

    // server output arriving mid-epoch must not surface yet
    far.write(b"Z").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let emitted = read_until(
        &interposer,
        |out| contains(out, "Z"),
        Duration::from_millis(120),
    )
    .await;
    assert!(
        !contains(&emitted, "Z"),
        "pending output leaked: {:?}",
        String::from_utf8_lossy(&emitted)
    );

    // acknowledging the epoch commits and releases it
    let epoch = interposer.current_epoch();
    interposer
        .acknowledge_epoch(epoch, std::time::Instant::now())
        .await;
    assert!(!interposer.epoch_pending());
    let emitted = read_until(
        &interposer,
        |out| contains(out, "Z"),
        Duration::from_millis(500),
    )
    .await;
    assert!(contains(&emitted, "Z"));
}

#[tokio::test]
async fn test_ctrl_l_forces_full_repaint() {
    let (near, far) = MemoryPipe::pair();
    let (interposer, _) = auto_acked(near);

    let mut buf = [0u8; 4096];
    interposer.read(&mut buf).await.unwrap(); // prologue

    // settle some server output first
    far.write(b"hello").await.unwrap();
    read_until(
        &interposer,
        |out| contains(out, "hello"),
        Duration::from_millis(500),
    )
    .await;

    interposer.write(&[0x0c]).await.unwrap();
    let emitted = read_until(
        &interposer,
        |out| contains(out, "\x1b[2J"),
        Duration::from_millis(500),
    )
    .await;
    assert!(
        contains(&emitted, "\x1b[2J"),
        "expected a full clear after Ctrl-L"
    );
}

#[tokio::test]
async fn test_close_after_open_emits_epilogue_then_eof() {
    let (near, _far) = MemoryPipe::pair();
    let (interposer, _) = auto_acked(near);

    let mut buf = [0u8; 4096];
    interposer.read(&mut buf).await.unwrap(); // prologue -> Open

    interposer.close().await.unwrap();
    let emitted = read_until(&interposer, |_| false, Duration::from_millis(500)).await;
    let epilogue = Display::new(true).close();
    assert!(contains(&emitted, &epilogue));

    let mut buf = [0u8; 16];
    assert_eq!(interposer.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_upstream_eof_drains_epilogue() {
    let (near, far) = MemoryPipe::pair();
    let (interposer, _) = auto_acked(near);

    let mut buf = [0u8; 4096];
    interposer.read(&mut buf).await.unwrap(); // prologue -> Open

    far.close().await.unwrap();
    let emitted = read_until(&interposer, |_| false, Duration::from_millis(500)).await;
    assert!(contains(&emitted, &Display::new(true).close()));
}

#[tokio::test]
async fn test_resize_discards_predictions() {
    let (near, _far) = MemoryPipe::pair();
    let (interposer, _) = auto_acked(near);

    let mut buf = [0u8; 4096];
    interposer.read(&mut buf).await.unwrap(); // prologue

    interposer.write(b"abc").await.unwrap();
    interposer.resize(100, 30).await;

    // after the resize the pending predictions are gone; the next delta
    // is a geometry-driven repaint without the speculative glyphs
    let emitted = read_until(
        &interposer,
        |out| contains(out, "abc"),
        Duration::from_millis(150),
    )
    .await;
    assert!(!contains(&emitted, "abc"));
}

#[tokio::test]
async fn test_write_after_close_fails() {
    let (near, _far) = MemoryPipe::pair();
    let (interposer, _) = auto_acked(near);
    interposer.close().await.unwrap();
    assert!(interposer.write(b"x").await.is_err());
}
