//! Fuel Map Library - Station Store, Clustering Index and Reconciliation
//!
//! This library keeps the canonical set of fuel-price stations, clusters their
//! positions into a zoom-dependent hierarchy and merges a stream of partial
//! live updates into both without ever exposing a half-applied state.
//!
//! # Architecture
//!
//! - **[`EntityStore`]**: canonical station records plus removal tombstones
//! - **[`SpatialIndex`]**: per-zoom grid clustering with localized updates
//! - **[`ChangeEvent`]**: validated live update payloads
//! - **[`Reconciler`]**: the single writer, publishing immutable [`Snapshot`]s
//!
//! # Performance Characteristics
//!
//! - **Build Time**: O(N × Z) for N stations and Z zoom levels, cells clustered in parallel
//! - **Update Time**: O(affected cells × Z × log N) per structural change
//! - **Query Time**: O(visited cells + K) where K = results
//! - **Snapshot**: O(Z) to publish; writes copy only the trie path to the changed entry

mod cluster;
mod config;
mod cow;
mod event;
mod index;
mod reconciler;
mod snapshot;
mod station;
mod store;
pub mod utils;

// Public API exports
pub use cluster::{Bounds, ClusterId, ClusterNode, NodeKind, QueryItem};
pub use config::{Config, MAX_SUPPORTED_ZOOM};
pub use event::{ChangeEvent, Coalesced, is_newer, parse_event};
pub use index::{IndexStats, LevelStats, SpatialIndex};
pub use reconciler::{Outcome, ReconcileStats, Reconciler};
pub use snapshot::Snapshot;
pub use station::{Coordinates, Prices, Station, StationFields, StationId, StationRecord};
pub use store::EntityStore;

/// Error types for the data module
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("Invalid coordinates for station {id}: ({lat}, {lon})")]
    InvalidCoordinates { id: String, lat: f64, lon: f64 },

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Unknown cluster {0}")]
    UnknownCluster(ClusterId),

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DataError>;

/// Parse a bulk JSON array of station records
pub fn parse_stations(json: &[u8]) -> Result<Vec<Station>> {
    let records: Vec<StationRecord> = serde_json::from_slice(json)?;
    Ok(records.into_iter().map(Station::from_record).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that all public types are accessible
        let _: fn(Snapshot) -> Reconciler = Reconciler::new;
        let _: fn() -> Config = Config::default;
        let _: fn(&str) -> Result<ChangeEvent> = parse_event;
    }

    #[test]
    fn test_parse_stations() {
        let stations = parse_stations(
            br#"[{"id": 1, "lat": 48.1, "lon": 11.5, "brand": "Aral"},
                 {"id": "x", "latitude": 52.5, "longitude": 13.4, "prices": {"e10": 1.7}}]"#,
        )
        .unwrap();
        assert_eq!(stations.len(), 2);
        assert_eq!(stations[0].id.as_str(), "1");
        assert_eq!(stations[1].price("e10"), Some(1.7));

        assert!(matches!(parse_stations(b"{}"), Err(DataError::Json(_))));
    }
}
