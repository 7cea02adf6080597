//! Immutable (store, index) pairs handed to readers

use crate::{
    Bounds, Config, Coordinates, EntityStore, QueryItem, Result, SpatialIndex, Station, StationId,
};
use std::sync::Arc;
use tracing::{info, warn};

/// A consistent view of the entity store and the spatial index
///
/// Snapshots are never mutated after publication. Cloning one is cheap since
/// both halves are persistent maps that share unchanged nodes.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Increases by one with every published batch
    pub version: u64,
    pub store: EntityStore,
    pub index: SpatialIndex,
}

impl Snapshot {
    /// An empty snapshot
    pub fn empty(config: &Config) -> Result<Self> {
        Ok(Self {
            version: 0,
            store: EntityStore::new(),
            index: SpatialIndex::new(config)?,
        })
    }

    /// Populate the store from a bulk set and build the index over it
    ///
    /// Stations without a valid position are kept in the store and logged.
    pub fn build(config: &Config, stations: impl IntoIterator<Item = Station>) -> Result<Self> {
        #[cfg(feature = "profiling")]
        profiling::scope!("snapshot::build");

        let store = EntityStore::from_stations(stations);

        let mut positions: Vec<(StationId, Coordinates)> = Vec::with_capacity(store.positioned_len());
        for station in store.iter() {
            match station.position() {
                Some(position) => positions.push((station.id.clone(), position)),
                None => warn!(
                    station = %station.id,
                    lat = ?station.lat,
                    lon = ?station.lon,
                    "Station has no valid position and is excluded from the index"
                ),
            }
        }

        let index = SpatialIndex::build(config, positions)?;
        info!(
            stations = store.len(),
            indexed = index.len(),
            "Built initial snapshot"
        );

        Ok(Self {
            version: 0,
            store,
            index,
        })
    }

    /// Stations that are stored but not indexed
    #[inline]
    pub fn unpositioned_len(&self) -> usize {
        self.store.len() - self.store.positioned_len()
    }

    pub fn query(&self, bounds: &Bounds, zoom: f64) -> Vec<QueryItem> {
        self.index.query(bounds, zoom)
    }

    #[inline]
    pub fn station(&self, id: &StationId) -> Option<&Arc<Station>> {
        self.store.get(id)
    }
}
