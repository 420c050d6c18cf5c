//! Asynchronous sink writer.
//!
//! An [`AsyncSink`] fronts a possibly-slow upstream writer with a bounded
//! in-memory buffer. Writes within remaining capacity return immediately;
//! a write that does not fit waits until the single drainer task has freed
//! space. The drainer transfers buffered bytes FIFO and records the first
//! upstream error as sticky. An optional flush hook runs on the drainer
//! after each successful upstream write; the interposer uses it to open
//! confirmation epochs strictly after their bytes have reached the
//! transport.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use log::trace;
use tokio::sync::{Mutex, Notify};

use crate::stream::ByteStream;

/// Hook invoked with the number of bytes each drain pass flushed upstream.
pub type FlushHook = Box<dyn Fn(usize) + Send + Sync>;

struct SinkState {
    buffer: BytesMut,
    /// Sticky terminal condition: an upstream error message, or the
    /// end-of-stream marker once `close` has run.
    sticky: Option<StickyError>,
}

#[derive(Clone)]
enum StickyError {
    Closed,
    Upstream(io::ErrorKind, String),
}

impl StickyError {
    fn to_io_error(&self) -> io::Error {
        match self {
            StickyError::Closed => {
                io::Error::new(io::ErrorKind::BrokenPipe, "sink closed")
            }
            StickyError::Upstream(kind, msg) => io::Error::new(*kind, msg.clone()),
        }
    }
}

struct Shared {
    upstream: Arc<dyn ByteStream>,
    capacity: usize,
    state: Mutex<SinkState>,
    /// Signalled by writers when bytes are buffered, and by `close`.
    data: Notify,
    /// Signalled by the drainer when capacity frees up or on termination.
    space: Notify,
    flush_hook: Option<FlushHook>,
}

/// Bounded buffered writer in front of a [`ByteStream`].
pub struct AsyncSink {
    shared: Arc<Shared>,
}

impl AsyncSink {
    /// Create a sink over `upstream` with a buffer of `capacity` bytes and
    /// spawn its drainer task.
    pub fn new(
        upstream: Arc<dyn ByteStream>,
        capacity: usize,
        flush_hook: Option<FlushHook>,
    ) -> Self {
        let shared = Arc::new(Shared {
            upstream,
            capacity: capacity.max(1),
            state: Mutex::new(SinkState {
                buffer: BytesMut::with_capacity(capacity),
                sticky: None,
            }),
            data: Notify::new(),
            space: Notify::new(),
            flush_hook,
        });
        tokio::spawn(drain(Arc::clone(&shared)));
        Self { shared }
    }

    /// Buffer `p` for upstream delivery. Waits whenever the buffer is
    /// full; returns the sticky error with zero bytes accepted once the
    /// sink has terminated.
    pub async fn write(&self, p: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < p.len() {
            // register interest in freed space before inspecting the
            // buffer, so a drain between the check and the await still wakes us
            let mut notified = std::pin::pin!(self.shared.space.notified());
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock().await;
                if let Some(sticky) = &state.sticky {
                    return if written > 0 {
                        Ok(written)
                    } else {
                        Err(sticky.to_io_error())
                    };
                }
                let room = self.shared.capacity - state.buffer.len();
                let take = room.min(p.len() - written);
                if take > 0 {
                    state.buffer.extend_from_slice(&p[written..written + take]);
                    written += take;
                    self.shared.data.notify_one();
                    continue;
                }
            }
            // buffer full: wait for the drainer to free space
            notified.await;
        }
        Ok(written)
    }

    /// Mark end-of-stream and close the upstream. Idempotent.
    pub async fn close(&self) -> io::Result<()> {
        {
            let mut state = self.shared.state.lock().await;
            if state.sticky.is_some() {
                return Ok(());
            }
            state.sticky = Some(StickyError::Closed);
        }
        self.shared.data.notify_one();
        self.shared.space.notify_waiters();
        self.shared.upstream.close().await
    }

    /// The sticky error, if the sink has terminated.
    pub async fn terminated(&self) -> Option<io::Error> {
        let state = self.shared.state.lock().await;
        state.sticky.as_ref().map(StickyError::to_io_error)
    }
}

/// The single drainer: moves buffered bytes upstream in FIFO order until
/// the sink terminates.
async fn drain(shared: Arc<Shared>) {
    loop {
        let notified = shared.data.notified();
        let chunk = {
            let mut state = shared.state.lock().await;
            if !state.buffer.is_empty() {
                Some(state.buffer.split().freeze())
            } else if state.sticky.is_some() {
                return;
            } else {
                None
            }
        };

        let Some(chunk) = chunk else {
            notified.await;
            continue;
        };

        shared.space.notify_waiters();

        match shared.upstream.write(&chunk).await {
            Ok(_) => {
                trace!("sink flushed {} bytes", chunk.len());
                if let Some(hook) = &shared.flush_hook {
                    hook(chunk.len());
                }
            }
            Err(err) => {
                let mut state = shared.state.lock().await;
                if state.sticky.is_none() {
                    state.sticky =
                        Some(StickyError::Upstream(err.kind(), err.to_string()));
                }
                drop(state);
                shared.space.notify_waiters();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryPipe;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn read_all(pipe: &MemoryPipe, want: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        while out.len() < want {
            let n = pipe.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn test_write_drains_upstream_in_order() {
        let (near, far) = MemoryPipe::pair();
        let sink = AsyncSink::new(near, 64, None);
        sink.write(b"one ").await.unwrap();
        sink.write(b"two").await.unwrap();
        assert_eq!(read_all(&far, 7).await, b"one two");
    }

    #[tokio::test]
    async fn test_oversized_write_blocks_until_drained() {
        let (near, far) = MemoryPipe::pair();
        let sink = AsyncSink::new(near, 4, None);
        // larger than capacity: completes only because the drainer frees space
        let n = sink.write(b"abcdefgh").await.unwrap();
        assert_eq!(n, 8);
        assert_eq!(read_all(&far, 8).await, b"abcdefgh");
    }

    #[tokio::test]
    async fn test_write_after_close_returns_sticky_error() {
        let (near, _far) = MemoryPipe::pair();
        let sink = AsyncSink::new(near, 16, None);
        sink.close().await.unwrap();
        sink.close().await.unwrap(); // idempotent
        let err = sink.write(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_upstream_error_is_sticky() {
        let (near, far) = MemoryPipe::pair();
        let sink = AsyncSink::new(near, 16, None);
        drop(far); // peer gone: next drain fails
        sink.write(b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sink.terminated().await.is_some());
        assert!(sink.write(b"y").await.is_err());
    }

    #[tokio::test]
    async fn test_flush_hook_reports_flushed_bytes() {
        let flushed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flushed);
        let (near, far) = MemoryPipe::pair();
        let sink = AsyncSink::new(
            near,
            64,
            Some(Box::new(move |n| {
                counter.fetch_add(n, Ordering::SeqCst);
            })),
        );
        sink.write(b"hello").await.unwrap();
        assert_eq!(read_all(&far, 5).await, b"hello");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(flushed.load(Ordering::SeqCst), 5);
    }
}
