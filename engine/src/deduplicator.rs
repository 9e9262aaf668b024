//! Deduplication of chain events. The same DKG-started event can be
//! delivered more than once by the event subscription; only the first
//! occurrence per seed may start protocol tasks.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::types::DkgSeed;

/// Tracks DKG session seeds that have already been acted upon.
#[derive(Debug, Default)]
pub struct Deduplicator {
    started_seeds: Mutex<HashSet<DkgSeed>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the seed has not been seen before and the caller
    /// should process the event.
    pub fn notify_dkg_started(&self, seed: &DkgSeed) -> bool {
        let mut seen = self
            .started_seeds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        seen.insert(*seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_notification_passes_repeat_is_dropped() {
        let deduplicator = Deduplicator::new();
        let seed = DkgSeed([7u8; 32]);

        assert!(deduplicator.notify_dkg_started(&seed));
        assert!(!deduplicator.notify_dkg_started(&seed));

        let other = DkgSeed([8u8; 32]);
        assert!(deduplicator.notify_dkg_started(&other));
    }
}
