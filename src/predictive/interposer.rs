//! The predictive interposer.
//!
//! An [`Interposer`] sits between an SSH session channel and the client's
//! real terminal. Writes are user keystrokes: each byte is echoed
//! speculatively onto the client's visual state and forwarded upstream
//! through the async sink, whose flushes open confirmation epochs. Reads
//! are frame deltas: the authoritative framebuffer from the last closed
//! epoch, overlaid with surviving predictions, diffed against whatever the
//! client saw last, coalesced to the display frame rate.
//!
//! Three surfaces are maintained under the emulator lock:
//! - the emulator's live framebuffer (pending remote state),
//! - `complete_remote_fb`, committed from the live framebuffer when an
//!   epoch closes (or on idle output with no epoch outstanding),
//! - `local_fb`, the frame last emitted to the client.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use log::{debug, trace, warn};
use tokio::sync::{Mutex, Notify};

use super::epoch::EpochTracker;
use super::sink::AsyncSink;
use super::InterposerOptions;
use crate::stream::ByteStream;
use crate::term::{Action, Display, DisplayPreference, Emulator, Framebuffer, PredictionEngine};

/// Upper bound on the emission carry-over buffer; a client that stops
/// reading for this long gets its channel torn down instead of an
/// unbounded allocation.
const EMISSION_CAP: usize = 64 * 1024;

/// Invoked once per opened epoch with a handle back to the interposer.
/// The callback issues the round-trip marker toward the server and, on
/// any reply, calls [`Interposer::acknowledge_epoch`].
pub type EpochCallback = Arc<dyn Fn(Interposer, u64, Instant) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fresh,
    Open,
    Draining,
    Closed,
}

struct TermState {
    emulator: Emulator,
    predictor: PredictionEngine,
    complete_remote_fb: Framebuffer,
    local_fb: Framebuffer,
    initialized: bool,
}

struct EmitState {
    pending: BytesMut,
    last_emit: Option<tokio::time::Instant>,
    phase: Phase,
    sticky: Option<(io::ErrorKind, String)>,
}

struct Ledger {
    last_closed: u64,
}

struct Shared {
    sink: AsyncSink,
    display: Display,
    prologue: String,
    epilogue: String,
    coalesce: Duration,

    term: Mutex<TermState>,
    emit: Mutex<EmitState>,

    tracker: EpochTracker,
    ledger: Mutex<Ledger>,
    last_closed: AtomicU64,
    epoch_closed: Notify,

    upstream_update: Notify,
    prediction_ready: Notify,
}

/// Cloneable handle to a predictive interposer.
#[derive(Clone)]
pub struct Interposer {
    shared: Arc<Shared>,
}

impl Interposer {
    /// Interpose on `upstream` (the server side of a session channel).
    /// Spawns the upstream pump and the sink drainer; `callback` is
    /// invoked off the write path once per opened epoch.
    pub fn new(
        upstream: Arc<dyn ByteStream>,
        callback: EpochCallback,
        opts: InterposerOptions,
    ) -> Self {
        let display = Display::new(true);
        let prologue = display.open();
        let epilogue = display.close();

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let opener_weak = weak.clone();
            let opener = Box::new(move |epoch: u64, opened_at: Instant| {
                let Some(shared) = opener_weak.upgrade() else {
                    return;
                };
                let handle = Interposer { shared };
                let callback = Arc::clone(&callback);
                tokio::spawn(async move {
                    {
                        let mut term = handle.shared.term.lock().await;
                        term.predictor.local_frame_sent(epoch);
                    }
                    callback(handle.clone(), epoch, opened_at);
                });
            });

            let flush_weak = weak.clone();
            let flush_hook = Box::new(move |_flushed: usize| {
                if let Some(shared) = flush_weak.upgrade() {
                    shared.tracker.open();
                }
            });

            Shared {
                sink: AsyncSink::new(
                    Arc::clone(&upstream),
                    opts.sink_capacity,
                    Some(flush_hook),
                ),
                display,
                prologue,
                epilogue,
                coalesce: opts.coalesce_interval,
                term: Mutex::new(TermState {
                    emulator: Emulator::new(opts.width, opts.height),
                    predictor: PredictionEngine::new(
                        opts.display_preference,
                        opts.predict_overwrite,
                    ),
                    complete_remote_fb: Framebuffer::new(opts.width, opts.height),
                    local_fb: Framebuffer::new(opts.width, opts.height),
                    initialized: false,
                }),
                emit: Mutex::new(EmitState {
                    pending: BytesMut::new(),
                    last_emit: None,
                    phase: Phase::Fresh,
                    sticky: None,
                }),
                tracker: EpochTracker::new(opener),
                ledger: Mutex::new(Ledger { last_closed: 0 }),
                last_closed: AtomicU64::new(0),
                epoch_closed: Notify::new(),
                upstream_update: Notify::new(),
                prediction_ready: Notify::new(),
            }
        });

        tokio::spawn(pump(Arc::clone(&shared), upstream));
        Self { shared }
    }

    /// User keystrokes from the client.
    pub async fn write(&self, p: &[u8]) -> io::Result<usize> {
        if p.is_empty() {
            return Ok(0);
        }
        {
            let emit = self.shared.emit.lock().await;
            if let Some((kind, msg)) = &emit.sticky {
                return Err(io::Error::new(*kind, msg.clone()));
            }
            if matches!(emit.phase, Phase::Draining | Phase::Closed) {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "interposer closed",
                ));
            }
        }

        let mut to_host = Vec::with_capacity(p.len());
        {
            let mut term = self.shared.term.lock().await;
            let TermState {
                emulator,
                predictor,
                local_fb,
                initialized,
                ..
            } = &mut *term;
            for &byte in p {
                predictor.new_user_byte(byte, local_fb);
                to_host.extend(emulator.act(Action::UserByte(byte)));
                if byte == 0x0c {
                    // Ctrl-L: force a full repaint on the next emission
                    *initialized = false;
                }
            }
        }

        self.shared.prediction_ready.notify_one();

        if !to_host.is_empty() {
            self.shared.sink.write(&to_host).await?;
        }
        Ok(p.len())
    }

    /// Frame delta for the client's terminal.
    pub async fn read(&self, p: &mut [u8]) -> io::Result<usize> {
        if p.is_empty() {
            return Ok(0);
        }
        loop {
            // carry-over and lifecycle transitions first
            {
                let mut emit = self.shared.emit.lock().await;
                if !emit.pending.is_empty() {
                    let n = emit.pending.len().min(p.len());
                    p[..n].copy_from_slice(&emit.pending[..n]);
                    emit.pending.advance(n);
                    return Ok(n);
                }
                match emit.phase {
                    Phase::Fresh => {
                        emit.phase = Phase::Open;
                        let prologue = self.shared.prologue.clone();
                        emit.pending.extend_from_slice(prologue.as_bytes());
                        continue;
                    }
                    Phase::Draining => {
                        emit.phase = Phase::Closed;
                        return Ok(0);
                    }
                    Phase::Closed => return Ok(0),
                    Phase::Open => {}
                }
                if let Some((kind, msg)) = &emit.sticky {
                    return Err(io::Error::new(*kind, msg.clone()));
                }
            }

            // coalesce emissions to the display frame rate
            let deadline = {
                self.shared
                    .emit
                    .lock()
                    .await
                    .last_emit
                    .map(|at| at + self.shared.coalesce)
            };
            if let Some(deadline) = deadline {
                tokio::time::sleep_until(deadline).await;
            }

            // wait for server output or a staged prediction
            let mut prediction_only = false;
            tokio::select! {
                _ = self.shared.upstream_update.notified() => {}
                _ = self.shared.prediction_ready.notified() => {
                    prediction_only = true;
                }
            }

            {
                let emit = self.shared.emit.lock().await;
                if emit.phase != Phase::Open {
                    continue;
                }
            }

            let delta = {
                let mut term = self.shared.term.lock().await;
                let TermState {
                    predictor,
                    complete_remote_fb,
                    local_fb,
                    initialized,
                    ..
                } = &mut *term;
                let mut frame = complete_remote_fb.clone();
                predictor.cull(&frame);
                predictor.apply(&mut frame);
                let delta = self.shared.display.new_frame(*initialized, local_fb, &frame);
                *local_fb = frame;
                *initialized = true;
                delta
            };
            if delta.is_empty() {
                continue;
            }
            trace!(
                "emitting {} byte delta ({})",
                delta.len(),
                if prediction_only { "prediction" } else { "server" }
            );

            {
                let mut emit = self.shared.emit.lock().await;
                if !prediction_only {
                    emit.last_emit = Some(tokio::time::Instant::now());
                }
                if emit.pending.len() + delta.len() > EMISSION_CAP {
                    let msg = "emission buffer overflow";
                    emit.sticky = Some((io::ErrorKind::Other, msg.to_string()));
                    return Err(io::Error::other(msg));
                }
                emit.pending.extend_from_slice(delta.as_bytes());
            }
        }
    }

    /// Close the interposer. After a session was open, the terminal
    /// cleanup epilogue is queued so the final reads restore the client's
    /// terminal before EOF.
    pub async fn close(&self) -> io::Result<()> {
        {
            let mut emit = self.shared.emit.lock().await;
            match emit.phase {
                Phase::Fresh => emit.phase = Phase::Closed,
                Phase::Open => {
                    emit.phase = Phase::Draining;
                    let epilogue = self.shared.epilogue.clone();
                    emit.pending.extend_from_slice(epilogue.as_bytes());
                }
                Phase::Draining | Phase::Closed => return Ok(()),
            }
        }
        self.shared.upstream_update.notify_one();
        self.shared.sink.close().await
    }

    /// Apply a window-size change. Predictions do not survive a resize.
    pub async fn resize(&self, cols: u16, rows: u16) {
        let mut term = self.shared.term.lock().await;
        term.emulator.act(Action::Resize(cols, rows));
        let (w, h) = (
            term.emulator.framebuffer().width(),
            term.emulator.framebuffer().height(),
        );
        term.complete_remote_fb.resize(w, h);
        term.predictor.reset();
        debug!("interposer resized to {w}x{h}");
    }

    /// Change when predictions are displayed. Takes effect from the next
    /// emission; `Never` culls everything currently in flight.
    pub async fn set_display_preference(&self, preference: DisplayPreference) {
        {
            let mut term = self.shared.term.lock().await;
            term.predictor.set_display_preference(preference);
        }
        self.shared.prediction_ready.notify_one();
    }

    /// Toggle overwrite predictions.
    pub async fn set_predict_overwrite(&self, overwrite: bool) {
        let mut term = self.shared.term.lock().await;
        term.predictor.set_predict_overwrite(overwrite);
    }

    /// Whether any opened epoch has not yet been closed.
    pub fn epoch_pending(&self) -> bool {
        self.shared.tracker.current() > self.shared.last_closed.load(Ordering::SeqCst)
    }

    /// Full acknowledgement sequence for an epoch whose marker reply has
    /// arrived: record timing, hold the epoch open one further display
    /// frame to absorb output the server emits right after answering the
    /// marker, then commit.
    pub async fn acknowledge_epoch(&self, epoch: u64, opened_at: Instant) {
        {
            let mut term = self.shared.term.lock().await;
            term.predictor.local_frame_acked(epoch);
            term.predictor.local_frame_late_acked(epoch);
        }
        tokio::time::sleep(self.shared.coalesce).await;
        self.close_epoch(epoch, opened_at).await;
    }

    /// Commit the emulator's framebuffer as the authoritative remote state
    /// for `epoch`. Epochs close strictly in order of opening; a caller
    /// arriving early waits for its predecessor.
    pub async fn close_epoch(&self, epoch: u64, opened_at: Instant) {
        loop {
            let mut notified = std::pin::pin!(self.shared.epoch_closed.notified());
            notified.as_mut().enable();
            {
                let ledger = self.shared.ledger.lock().await;
                if epoch <= ledger.last_closed {
                    return;
                }
                if ledger.last_closed + 1 == epoch {
                    break;
                }
            }
            notified.await;
        }

        {
            let mut term = self.shared.term.lock().await;
            let frame = term.emulator.framebuffer().clone();
            term.complete_remote_fb = frame;
        }
        {
            let mut ledger = self.shared.ledger.lock().await;
            ledger.last_closed = epoch;
            self.shared.last_closed.store(epoch, Ordering::SeqCst);
        }
        self.shared.epoch_closed.notify_waiters();
        self.shared.upstream_update.notify_one();
        debug!("epoch {epoch} closed after {:?}", opened_at.elapsed());
    }

    /// The most recently opened epoch (0 before the first flush).
    pub fn current_epoch(&self) -> u64 {
        self.shared.tracker.current()
    }

    /// A patch transforming a fresh terminal into the current contents of
    /// the interposed one.
    pub async fn current_contents(&self) -> String {
        let term = self.shared.term.lock().await;
        let fb = term.emulator.framebuffer();
        let blank = Framebuffer::new(fb.width(), fb.height());
        self.shared.display.new_frame(false, &blank, fb)
    }
}

#[async_trait]
impl ByteStream for Interposer {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Interposer::read(self, buf).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Interposer::write(self, buf).await
    }

    async fn close(&self) -> io::Result<()> {
        Interposer::close(self).await
    }
}

/// Background upstream pump: feeds server bytes to the emulator, writes
/// terminal-to-host replies back through the sink, and publishes update
/// signals. Idle output (no epoch outstanding) becomes authoritative
/// immediately so unsolicited server chatter still reaches the client.
async fn pump(shared: Arc<Shared>, upstream: Arc<dyn ByteStream>) {
    let mut buf = vec![0u8; 4096];
    loop {
        match upstream.read(&mut buf).await {
            Ok(0) => {
                let mut emit = shared.emit.lock().await;
                match emit.phase {
                    Phase::Open => {
                        emit.phase = Phase::Draining;
                        let epilogue = shared.epilogue.clone();
                        emit.pending.extend_from_slice(epilogue.as_bytes());
                    }
                    Phase::Fresh => emit.phase = Phase::Closed,
                    Phase::Draining | Phase::Closed => {}
                }
                drop(emit);
                shared.upstream_update.notify_one();
                debug!("upstream closed; interposer draining");
                return;
            }
            Ok(n) => {
                let reply = {
                    let mut term = shared.term.lock().await;
                    let reply = term.emulator.perform(&buf[..n]);
                    let pending =
                        shared.tracker.current() > shared.last_closed.load(Ordering::SeqCst);
                    if !pending {
                        let frame = term.emulator.framebuffer().clone();
                        term.complete_remote_fb = frame;
                    }
                    reply
                };
                if !reply.is_empty() {
                    if let Err(err) = shared.sink.write(&reply).await {
                        warn!("terminal report write-back failed: {err}");
                    }
                }
                shared.upstream_update.notify_one();
            }
            Err(err) => {
                let mut emit = shared.emit.lock().await;
                if emit.sticky.is_none() {
                    emit.sticky = Some((err.kind(), err.to_string()));
                }
                drop(emit);
                shared.upstream_update.notify_one();
                warn!("upstream read failed: {err}");
                return;
            }
        }
    }
}
