//! Engine configuration

use crate::{DataError, Result};
use serde::{Deserialize, Serialize};

/// Deepest zoom level the grid supports before cell indices overflow `u32`
pub const MAX_SUPPORTED_ZOOM: u8 = 24;

/// Configuration for clustering, the live channel and the viewport controller
///
/// Durations are in milliseconds. Every field has a default, so a partial
/// JSON/TOML document can be deserialised into a full configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Coarsest zoom level that is clustered. Default: 0
    pub min_zoom: u8,
    /// Finest zoom level that is clustered; above it queries return single
    /// stations. Default: 16
    pub max_zoom: u8,
    /// Cluster radius in screen pixels. Default: 40
    pub cluster_pixel_radius: f64,
    /// Tile size in pixels used to relate pixels to world units. Default: 256
    pub tile_extent: f64,
    /// Minimum number of stations in a cell before they are merged. Default: 2
    pub min_cluster_size: usize,
    /// Number of localized index updates after which the index is rebuilt
    /// from scratch. Default: 10000
    pub full_rebuild_threshold: usize,

    /// First reconnect delay, doubled after each failure. Default: 500
    pub initial_reconnect_interval_ms: u64,
    /// Upper bound for the reconnect delay. Default: 30000
    pub max_reconnect_interval_ms: u64,
    /// Consecutive failed connection attempts before giving up; 0 retries
    /// forever. Default: 0
    pub max_reconnect_attempts: u32,
    /// Bounded event buffer between the channel and the reconciler. Default: 1024
    pub event_buffer_capacity: usize,
    /// Consecutive malformed payloads that mark the channel degraded. Default: 20
    pub degraded_parse_threshold: usize,
    /// Silence after which an open stream is treated as lost, 0 disables.
    /// Default: 60000
    pub stream_idle_timeout_ms: u64,

    /// Settling interval for viewport changes. Default: 150
    pub debounce_interval_ms: u64,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Default for Config {
    fn default() -> Self {
        Self {
            min_zoom: 0,
            max_zoom: 16,
            cluster_pixel_radius: 40.0,
            tile_extent: 256.0,
            min_cluster_size: 2,
            full_rebuild_threshold: 10_000,
            initial_reconnect_interval_ms: 500,
            max_reconnect_interval_ms: 30_000,
            max_reconnect_attempts: 0,
            event_buffer_capacity: 1024,
            degraded_parse_threshold: 20,
            stream_idle_timeout_ms: 60_000,
            debounce_interval_ms: 150,
        }
    }
}

impl Config {
    /// Reject configurations the index or the channel cannot work with
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(DataError::InvalidConfig {
                reason: reason.to_string(),
            })
        };

        if self.max_zoom > MAX_SUPPORTED_ZOOM {
            return invalid("max_zoom must be at most 24");
        }
        if self.min_zoom > self.max_zoom {
            return invalid("min_zoom must not exceed max_zoom");
        }
        if !(self.cluster_pixel_radius.is_finite() && self.cluster_pixel_radius > 0.0) {
            return invalid("cluster_pixel_radius must be positive");
        }
        if !(self.tile_extent.is_finite() && self.tile_extent > 0.0) {
            return invalid("tile_extent must be positive");
        }
        if self.min_cluster_size == 0 {
            return invalid("min_cluster_size must be at least 1");
        }
        if self.initial_reconnect_interval_ms == 0 {
            return invalid("initial_reconnect_interval_ms must be positive");
        }
        if self.max_reconnect_interval_ms < self.initial_reconnect_interval_ms {
            return invalid("max_reconnect_interval_ms must not be below the initial interval");
        }
        if self.event_buffer_capacity == 0 {
            return invalid("event_buffer_capacity must be positive");
        }
        Ok(())
    }

    /// Side length of a grid cell at `zoom`, in normalised world units
    #[inline]
    pub fn cell_size(&self, zoom: u8) -> f64 {
        self.cluster_pixel_radius / (self.tile_extent * 2f64.powi(i32::from(zoom)))
    }
}
