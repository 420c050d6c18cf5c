//! Artificial write-side latency.
//!
//! [`RingDelay`] wraps a stream and holds every write in a fixed-capacity
//! ring until `now + delay`, dispatched by a single worker that sleeps
//! until the head entry is due. Reads pass straight through. Used for
//! demonstrating and testing prediction behaviour on a fast link.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::stream::ByteStream;

struct RingState {
    ring: VecDeque<(Bytes, Instant)>,
    capacity: usize,
    /// Set on close or on the first upstream write error.
    terminated: Option<io::ErrorKind>,
}

struct Shared {
    upstream: Arc<dyn ByteStream>,
    delay: Duration,
    state: Mutex<RingState>,
    queued: Notify,
    slot_free: Notify,
}

/// Fixed-ring write delayer over a [`ByteStream`].
pub struct RingDelay {
    shared: Arc<Shared>,
}

impl RingDelay {
    /// Wrap `upstream`, delaying each write by `delay`. The ring holds at
    /// most `capacity` pending writes; further writers wait for the worker.
    pub fn new(upstream: Arc<dyn ByteStream>, delay: Duration, capacity: usize) -> Self {
        let shared = Arc::new(Shared {
            upstream,
            delay,
            state: Mutex::new(RingState {
                ring: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                terminated: None,
            }),
            queued: Notify::new(),
            slot_free: Notify::new(),
        });
        tokio::spawn(dispatch(Arc::clone(&shared)));
        Self { shared }
    }

    /// Schedule `f` to run after the configured delay; lets associated
    /// events (such as epoch pings) share the simulated timescale.
    pub fn callback_after(&self, f: impl FnOnce() + Send + 'static) {
        let delay = self.shared.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
    }

    pub fn delay(&self) -> Duration {
        self.shared.delay
    }
}

#[async_trait]
impl ByteStream for RingDelay {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        // only writes are delayed
        self.shared.upstream.read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let due = Instant::now() + self.shared.delay;
        loop {
            let mut notified = std::pin::pin!(self.shared.slot_free.notified());
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock().await;
                if let Some(kind) = state.terminated {
                    return Err(io::Error::new(kind, "delayed stream terminated"));
                }
                if state.ring.len() < state.capacity {
                    state.ring.push_back((Bytes::copy_from_slice(buf), due));
                    self.shared.queued.notify_one();
                    return Ok(buf.len());
                }
            }
            // ring is full: wait until the worker advances the head
            notified.await;
        }
    }

    async fn close(&self) -> io::Result<()> {
        {
            let mut state = self.shared.state.lock().await;
            if state.terminated.is_some() {
                return Ok(());
            }
            state.terminated = Some(io::ErrorKind::BrokenPipe);
        }
        self.shared.queued.notify_one();
        self.shared.slot_free.notify_waiters();
        Ok(())
    }
}

/// Single worker: sleeps until the head entry is due, writes it upstream,
/// and on close drains the remaining entries before closing the upstream.
async fn dispatch(shared: Arc<Shared>) {
    loop {
        let mut notified = std::pin::pin!(shared.queued.notified());
        notified.as_mut().enable();

        let head = {
            let state = shared.state.lock().await;
            match state.ring.front() {
                Some((_, due)) => Some(*due),
                None if state.terminated.is_some() => None,
                None => {
                    drop(state);
                    notified.await;
                    continue;
                }
            }
        };

        let Some(due) = head else {
            let _ = shared.upstream.close().await;
            return;
        };

        tokio::time::sleep_until(due).await;

        let entry = {
            let mut state = shared.state.lock().await;
            state.ring.pop_front()
        };
        shared.slot_free.notify_waiters();

        if let Some((buffer, _)) = entry {
            if let Err(err) = shared.upstream.write(&buffer).await {
                let mut state = shared.state.lock().await;
                state.terminated = Some(err.kind());
                state.ring.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryPipe;

    #[tokio::test]
    async fn test_write_is_delayed() {
        let (near, far) = MemoryPipe::pair();
        let delayed = RingDelay::new(near, Duration::from_millis(50), 8);
        let start = std::time::Instant::now();
        delayed.write(b"late").await.unwrap();
        let mut buf = [0u8; 8];
        let n = far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"late");
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_reads_pass_through_immediately() {
        let (near, far) = MemoryPipe::pair();
        let delayed = RingDelay::new(near, Duration::from_secs(5), 8);
        far.write(b"now").await.unwrap();
        let mut buf = [0u8; 8];
        let n = delayed.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"now");
    }

    #[tokio::test]
    async fn test_writes_preserve_order() {
        let (near, far) = MemoryPipe::pair();
        let delayed = Arc::new(RingDelay::new(near, Duration::from_millis(10), 4));
        for chunk in [b"a".as_slice(), b"b", b"c"] {
            delayed.write(chunk).await.unwrap();
        }
        let mut out = Vec::new();
        let mut buf = [0u8; 8];
        while out.len() < 3 {
            let n = far.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn test_close_drains_pending_writes() {
        let (near, far) = MemoryPipe::pair();
        let delayed = RingDelay::new(near, Duration::from_millis(20), 8);
        delayed.write(b"tail").await.unwrap();
        delayed.close().await.unwrap();
        let mut buf = [0u8; 8];
        let n = far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"tail");
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (near, _far) = MemoryPipe::pair();
        let delayed = RingDelay::new(near, Duration::from_millis(1), 2);
        delayed.close().await.unwrap();
        assert!(delayed.write(b"x").await.is_err());
    }
}
