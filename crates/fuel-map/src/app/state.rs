//! Shared engine state
//!
//! The reconciler publishes each new snapshot here; readers load the current
//! one without locking and can watch the version counter for changes.

use arc_swap::ArcSwap;
use fuel_map_lib::{ReconcileStats, Snapshot};
use std::sync::Arc;
use tokio::sync::watch;

/// The published snapshot plus a version notification
pub struct SharedSnapshot {
    current: ArcSwap<Snapshot>,
    version: watch::Sender<u64>,
}

impl SharedSnapshot {
    pub fn new(snapshot: Snapshot) -> Self {
        let version = snapshot.version;
        Self {
            current: ArcSwap::from_pointee(snapshot),
            version: watch::Sender::new(version),
        }
    }

    /// Current snapshot; stays valid while held even if a newer one is published
    pub fn load(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Swap in a new snapshot and notify watchers
    pub fn publish(&self, snapshot: Arc<Snapshot>) {
        let version = snapshot.version;
        self.current.store(snapshot);
        self.version.send_replace(version);
    }

    /// Receiver notified with the version of every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

impl std::fmt::Debug for SharedSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSnapshot")
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

/// Summary of the engine's published state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStatus {
    pub snapshot_version: u64,
    /// Stations in the store
    pub stations: usize,
    /// Stations with a valid position, i.e. in the index
    pub indexed: usize,
    /// Removed ids remembered to reject stale re-additions
    pub tombstones: usize,
    /// Counters of the last reconciler run
    pub reconcile: ReconcileStats,
    pub queued_events: usize,
    pub dropped_events: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuel_map_lib::Config;

    #[test]
    fn test_publish_swaps_and_notifies() {
        let shared = SharedSnapshot::new(Snapshot::empty(&Config::default()).unwrap());
        let mut versions = shared.subscribe();
        let before = shared.load();
        assert_eq!(shared.version(), 0);

        let mut next = (*before).clone();
        next.version = 1;
        shared.publish(Arc::new(next));

        assert!(versions.has_changed().unwrap());
        assert_eq!(*versions.borrow_and_update(), 1);
        assert_eq!(shared.version(), 1);
        // Readers holding the old snapshot keep seeing it
        assert_eq!(before.version, 0);
    }
}
