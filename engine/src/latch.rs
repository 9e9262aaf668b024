//! Process-wide advisory latch held while any protocol task is running.
//!
//! The host application uses it to delay unrelated maintenance work during
//! DKG or signing activity. Cooperative only; never a correctness mechanism.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts currently executing protocol tasks.
#[derive(Debug, Default)]
pub struct ProtocolLatch {
    active: AtomicUsize,
}

impl ProtocolLatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire the latch for the duration of the returned guard.
    pub fn acquire(self: &Arc<Self>) -> LatchGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        LatchGuard {
            latch: Arc::clone(self),
        }
    }

    /// True if at least one protocol task is currently executing.
    pub fn is_executing(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }
}

/// Releases the latch on drop.
pub struct LatchGuard {
    latch: Arc<ProtocolLatch>,
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.latch.active.fetch_sub(1, Ordering::SeqCst);
    }
}
