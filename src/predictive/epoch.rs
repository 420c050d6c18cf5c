//! Confirmation epochs.
//!
//! Every flush of user bytes toward the server opens an *epoch*: a
//! monotone 64-bit marker whose round trip is probed with a channel
//! request the server cannot recognise but must still answer. The reply,
//! success or failure alike, is the timing signal. Epochs are opened here
//! and closed by the interposer, strictly in order of opening.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use log::trace;

/// Invoked once per opened epoch, off the write path, with the epoch
/// number and its open timestamp. The callback owns issuing the ping and
/// eventually acknowledging the epoch on the interposer.
pub type EpochOpener = Box<dyn Fn(u64, Instant) + Send + Sync>;

/// Monotone epoch source. The first opened epoch is 1.
pub struct EpochTracker {
    counter: AtomicU64,
    opener: EpochOpener,
}

impl EpochTracker {
    pub fn new(opener: EpochOpener) -> Self {
        Self {
            counter: AtomicU64::new(0),
            opener,
        }
    }

    /// Open the next epoch and hand it to the opener callback.
    pub fn open(&self) -> (u64, Instant) {
        let epoch = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let opened_at = Instant::now();
        trace!("epoch {epoch} opened");
        (self.opener)(epoch, opened_at);
        (epoch, opened_at)
    }

    /// The most recently opened epoch (0 before the first write).
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_epochs_start_at_one_and_increment() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let tracker = EpochTracker::new(Box::new(move |epoch, _| {
            log.lock().unwrap().push(epoch);
        }));
        assert_eq!(tracker.current(), 0);
        assert_eq!(tracker.open().0, 1);
        assert_eq!(tracker.open().0, 2);
        assert_eq!(tracker.open().0, 3);
        assert_eq!(tracker.current(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }
}
