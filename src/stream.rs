//! Byte-stream abstraction shared by the proxy fabric and the predictive
//! shims.
//!
//! A [`ByteStream`] is the async analogue of a read/write/close octet
//! stream. Methods take `&self` so a single stream can be driven by
//! concurrent reader and writer tasks, which is how every channel pair in
//! the proxy operates.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

/// A bidirectional octet stream with independent read and write halves.
///
/// `read` returns `Ok(0)` at end of stream. `close` is idempotent and
/// signals write-close to the peer's reader.
#[async_trait]
pub trait ByteStream: Send + Sync {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn write(&self, buf: &[u8]) -> io::Result<usize>;
    async fn close(&self) -> io::Result<()>;
}

/// In-memory duplex stream: each end is a [`ByteStream`], bytes written to
/// one end are read from the other. Used by the integration tests and the
/// delay-shim demo paths.
pub struct MemoryPipe {
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    leftover: Mutex<Vec<u8>>,
}

impl MemoryPipe {
    /// Create a connected pair of pipe ends.
    pub fn pair() -> (Arc<MemoryPipe>, Arc<MemoryPipe>) {
        let (a_tx, b_rx) = mpsc::channel(64);
        let (b_tx, a_rx) = mpsc::channel(64);
        let a = Arc::new(MemoryPipe {
            tx: Mutex::new(Some(a_tx)),
            rx: Mutex::new(a_rx),
            leftover: Mutex::new(Vec::new()),
        });
        let b = Arc::new(MemoryPipe {
            tx: Mutex::new(Some(b_tx)),
            rx: Mutex::new(b_rx),
            leftover: Mutex::new(Vec::new()),
        });
        (a, b)
    }
}

#[async_trait]
impl ByteStream for MemoryPipe {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut leftover = self.leftover.lock().await;
        if leftover.is_empty() {
            let chunk = { self.rx.lock().await.recv().await };
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
        let tx = { self.tx.lock().await.clone() };
        match tx {
            Some(tx) => tx
                .send(buf.to_vec())
                .await
                .map(|_| buf.len())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed")),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")),
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.tx.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipe_roundtrip() {
        let (a, b) = MemoryPipe::pair();
        a.write(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_pipe_partial_reads() {
        let (a, b) = MemoryPipe::pair();
        a.write(b"abcdef").await.unwrap();
        let mut buf = [0u8; 4];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn test_close_yields_eof() {
        let (a, b) = MemoryPipe::pair();
        a.write(b"x").await.unwrap();
        a.close().await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).await.unwrap(), 1);
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }
}
