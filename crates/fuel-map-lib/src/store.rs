//! Entity store - canonical mapping from station id to its current record
//!
//! The store keeps every known station, including those without a valid
//! position, plus a tombstone per removed id so that late updates can never
//! resurrect a removed station.

use crate::cow::CowMap;
use crate::{Station, StationId};
use std::sync::Arc;

/// Canonical station records, cheap to clone into a snapshot
#[derive(Clone, Debug, Default)]
pub struct EntityStore {
    stations: CowMap<StationId, Arc<Station>>,
    /// Removed ids with the version carried by the removal, if any
    tombstones: CowMap<StationId, Option<u64>>,
    /// Number of stored stations with a valid position
    positioned: usize,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a bulk set; later duplicates of an id win
    pub fn from_stations(stations: impl IntoIterator<Item = Station>) -> Self {
        let mut store = Self::new();
        for station in stations {
            store.insert(Arc::new(station));
        }
        store
    }

    #[inline]
    pub fn get(&self, id: &StationId) -> Option<&Arc<Station>> {
        self.stations.get(id)
    }

    #[inline]
    pub fn contains(&self, id: &StationId) -> bool {
        self.stations.contains_key(id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    /// Number of stations that take part in the spatial index
    #[inline]
    pub fn positioned_len(&self) -> usize {
        self.positioned
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Station>> {
        self.stations.values()
    }

    /// Insert or replace a station record, returning the previous one
    pub fn insert(&mut self, station: Arc<Station>) -> Option<Arc<Station>> {
        if station.position().is_some() {
            self.positioned += 1;
        }
        self.tombstones.remove(&station.id);
        let previous = self.stations.insert(station.id.clone(), station);
        if previous.as_ref().is_some_and(|p| p.position().is_some()) {
            self.positioned -= 1;
        }
        previous
    }

    /// Remove a station and leave a tombstone carrying the removal version
    pub fn remove(&mut self, id: &StationId, version: Option<u64>) -> Option<Arc<Station>> {
        let previous_tombstone = self.tombstones.get(id).copied().flatten();
        let version = match (previous_tombstone, version) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.tombstones.insert(id.clone(), version);

        let removed = self.stations.remove(id);
        if removed.as_ref().is_some_and(|s| s.position().is_some()) {
            self.positioned -= 1;
        }
        removed
    }

    /// The tombstone left by a removal: `Some(version)` if `id` was removed
    #[inline]
    pub fn tombstone(&self, id: &StationId) -> Option<Option<u64>> {
        self.tombstones.get(id).copied()
    }

    #[inline]
    pub fn is_removed(&self, id: &StationId) -> bool {
        self.tombstones.contains_key(id)
    }

    /// Number of tombstones currently kept
    #[inline]
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }
}
