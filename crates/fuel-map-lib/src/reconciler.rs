//! Applies change events to the entity store and the spatial index
//!
//! The reconciler owns the only mutable working copy of the store and the
//! index. Events are applied one at a time; [`Reconciler::commit`] freezes the
//! working copy into a new [`Snapshot`] once per batch.
//!
//! Version rules:
//! - `added`/`updated` apply only when their version is newer than the stored
//!   one. A missing version always counts as newer.
//! - `removed` always applies and leaves a tombstone.
//! - `updated` never creates a station; unknown or removed ids are orphans.
//! - `added` re-creates a removed id only with an explicit version above the
//!   tombstone's version.

use crate::event::is_newer;
use crate::{ChangeEvent, Coordinates, Snapshot, Station, StationFields, StationId};
use std::sync::Arc;
use tracing::{debug, warn};

/// What applying a single event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Store record replaced, index untouched
    AttributeOnly,
    /// Store record replaced and the index updated locally
    Structural,
    /// Version not newer than the stored one (or than the tombstone)
    Stale,
    /// Update for an unknown or removed station
    Orphaned,
    /// Removal of a station that was not stored; only the tombstone changed
    Tombstoned,
}

impl Outcome {
    #[inline]
    pub fn is_applied(self) -> bool {
        matches!(self, Self::AttributeOnly | Self::Structural)
    }
}

/// Counters reported by the reconciler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub applied: u64,
    pub stale: u64,
    pub orphaned: u64,
    /// Removals of ids that were not stored
    pub tombstoned: u64,
    pub structural: u64,
    pub attribute_only: u64,
    pub full_rebuilds: u64,
    pub data_quality_warnings: u64,
}

#[derive(Debug)]
pub struct Reconciler {
    working: Snapshot,
    stats: ReconcileStats,
    /// Changes applied since the last commit
    dirty: bool,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Reconciler {
    /// Take ownership of a snapshot as the working copy
    pub fn new(snapshot: Snapshot) -> Self {
        let stats = ReconcileStats {
            data_quality_warnings: snapshot.unpositioned_len() as u64,
            ..Default::default()
        };
        Self {
            working: snapshot,
            stats,
            dirty: false,
        }
    }

    pub fn stats(&self) -> ReconcileStats {
        ReconcileStats {
            full_rebuilds: self.working.index.full_rebuilds() as u64,
            ..self.stats
        }
    }

    /// Current working state, including uncommitted changes
    #[inline]
    pub fn working(&self) -> &Snapshot {
        &self.working
    }

    /// Version of the last committed snapshot
    #[inline]
    pub fn version(&self) -> u64 {
        self.working.version
    }

    /// Apply a single change event to the working copy
    pub fn apply(&mut self, event: ChangeEvent) -> Outcome {
        let outcome = match event {
            ChangeEvent::Added {
                id,
                version,
                fields,
            } => self.apply_added(id, version, fields),
            ChangeEvent::Updated {
                id,
                version,
                fields,
            } => self.apply_updated(id, version, fields),
            ChangeEvent::Removed { id, version } => self.apply_removed(id, version),
        };

        match outcome {
            Outcome::AttributeOnly => self.stats.attribute_only += 1,
            Outcome::Structural => self.stats.structural += 1,
            Outcome::Stale => self.stats.stale += 1,
            Outcome::Orphaned => self.stats.orphaned += 1,
            Outcome::Tombstoned => self.stats.tombstoned += 1,
        }
        if outcome.is_applied() {
            self.stats.applied += 1;
        }
        if outcome.is_applied() || outcome == Outcome::Tombstoned {
            self.dirty = true;
        }
        outcome
    }

    /// Apply a batch of events and publish the result
    ///
    /// Returns `None` when no event in the batch changed anything.
    pub fn apply_batch(
        &mut self,
        events: impl IntoIterator<Item = ChangeEvent>,
    ) -> Option<Arc<Snapshot>> {
        #[cfg(feature = "profiling")]
        profiling::scope!("reconciler::apply_batch");

        for event in events {
            self.apply(event);
        }
        self.commit()
    }

    /// Freeze the working copy into a new snapshot if it changed
    pub fn commit(&mut self) -> Option<Arc<Snapshot>> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        self.working.version += 1;
        Some(Arc::new(self.working.clone()))
    }

    fn apply_added(&mut self, id: StationId, version: Option<u64>, fields: StationFields) -> Outcome {
        if let Some(tombstone) = self.working.store.tombstone(&id) {
            let revives = match (version, tombstone) {
                (Some(v), Some(removed_at)) => v > removed_at,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !revives {
                debug!(station = %id, ?version, "Ignoring addition of a removed station");
                return Outcome::Stale;
            }
        }

        let station = match self.working.store.get(&id) {
            Some(current) if !is_newer(version, Some(current.version)) => {
                debug!(station = %id, ?version, current = current.version, "Stale addition");
                return Outcome::Stale;
            }
            Some(current) => Station::new(id, fields, version.unwrap_or(current.version)),
            None => Station::new(id, fields, version.unwrap_or(0)),
        };
        self.replace(station, true)
    }

    fn apply_updated(
        &mut self,
        id: StationId,
        version: Option<u64>,
        fields: StationFields,
    ) -> Outcome {
        let Some(current) = self.working.store.get(&id) else {
            debug!(
                station = %id,
                removed = self.working.store.is_removed(&id),
                "Dropping update for unknown station"
            );
            return Outcome::Orphaned;
        };
        if !is_newer(version, Some(current.version)) {
            debug!(station = %id, ?version, current = current.version, "Stale update");
            return Outcome::Stale;
        }

        let station = current.patched(&fields, version);
        self.replace(station, fields.touches_position())
    }

    fn apply_removed(&mut self, id: StationId, version: Option<u64>) -> Outcome {
        let removed = self.working.store.remove(&id, version);
        let structural = self.working.index.remove(&id);
        debug!(station = %id, ?version, known = removed.is_some(), "Station removed");
        match (removed, structural) {
            (None, _) => Outcome::Tombstoned,
            (Some(_), true) => Outcome::Structural,
            (Some(_), false) => Outcome::AttributeOnly,
        }
    }

    /// Store `station` and move its index leaf if the position changed
    fn replace(&mut self, station: Station, position_given: bool) -> Outcome {
        let id = station.id.clone();
        let old_position: Option<Coordinates> = self
            .working
            .store
            .get(&id)
            .and_then(|current| current.position());
        let new_position = station.position();

        if new_position.is_none() && position_given {
            self.stats.data_quality_warnings += 1;
            warn!(
                station = %id,
                lat = ?station.lat,
                lon = ?station.lon,
                "Station has no valid position and is excluded from the index"
            );
        }

        self.working.store.insert(Arc::new(station));

        let structural = match (old_position, new_position) {
            (old, new) if old == new => false,
            (_, Some(position)) => match self.working.index.upsert(id.clone(), position) {
                Ok(moved) => moved,
                Err(e) => {
                    warn!(station = %id, error = %e, "Failed to index station");
                    false
                }
            },
            (Some(_), None) => self.working.index.remove(&id),
            (None, None) => false,
        };

        if structural {
            Outcome::Structural
        } else {
            Outcome::AttributeOnly
        }
    }
}
