//! Late-binding stream switch.
//!
//! An [`IoSwitch`] starts as a transparent passthrough and can be switched
//! once to an alternate stream. Session channels get one of these so the
//! interposer is only instantiated when a `pty-req` proves the channel
//! interactive; file transfers and tunnels never pay for it.

use std::io;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::stream::ByteStream;

/// Passthrough-until-enabled [`ByteStream`].
pub struct IoSwitch {
    passthrough: Arc<dyn ByteStream>,
    refractor: RwLock<Option<Arc<dyn ByteStream>>>,
}

impl IoSwitch {
    pub fn new(passthrough: Arc<dyn ByteStream>) -> Self {
        Self {
            passthrough,
            refractor: RwLock::new(None),
        }
    }

    /// Route all subsequent reads, writes, and closes to `refractor`.
    /// Only the first call takes effect.
    pub fn enable(&self, refractor: Arc<dyn ByteStream>) {
        let mut slot = self.refractor.write().unwrap();
        if slot.is_none() {
            *slot = Some(refractor);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.refractor.read().unwrap().is_some()
    }

    fn target(&self) -> Arc<dyn ByteStream> {
        match &*self.refractor.read().unwrap() {
            Some(refractor) => Arc::clone(refractor),
            None => Arc::clone(&self.passthrough),
        }
    }
}

#[async_trait]
impl ByteStream for IoSwitch {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.target().read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.target().write(buf).await
    }

    async fn close(&self) -> io::Result<()> {
        self.target().close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryPipe;

    #[tokio::test]
    async fn test_passthrough_before_enable() {
        let (near, far) = MemoryPipe::pair();
        let switch = IoSwitch::new(near);
        switch.write(b"direct").await.unwrap();
        let mut buf = [0u8; 8];
        let n = far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"direct");
    }

    #[tokio::test]
    async fn test_enable_redirects_traffic() {
        let (near, _far) = MemoryPipe::pair();
        let (alt_near, alt_far) = MemoryPipe::pair();
        let switch = IoSwitch::new(near);
        switch.enable(alt_near);
        assert!(switch.is_enabled());
        switch.write(b"routed").await.unwrap();
        let mut buf = [0u8; 8];
        let n = alt_far.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"routed");
    }

    #[tokio::test]
    async fn test_second_enable_is_ignored() {
        let (near, _far) = MemoryPipe::pair();
        let (first, first_far) = MemoryPipe::pair();
        let (second, _second_far) = MemoryPipe::pair();
        let switch = IoSwitch::new(near);
        switch.enable(first);
        switch.enable(second);
        switch.write(b"x").await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(first_far.read(&mut buf).await.unwrap(), 1);
    }
}
