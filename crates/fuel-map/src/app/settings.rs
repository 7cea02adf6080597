use clap::Parser;
use fuel_map_lib::{Bounds, Config};

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// Fuel Map Live - clustered fuel station map kept current by a live update stream
pub struct Settings {
    /// Initial station set: JSON file path or http(s) URL
    #[clap(short, long, env = "FUEL_MAP_STATIONS", value_name = "PATH_OR_URL")]
    pub stations: Option<String>,

    /// Server-Sent Events endpoint delivering station changes
    #[clap(short = 'u', long, env = "FUEL_MAP_STREAM_URL", value_name = "URL")]
    pub stream_url: String,

    /// Viewport as west,south,east,north in degrees
    #[clap(
        long,
        env = "FUEL_MAP_BOUNDS",
        value_parser = parse_bounds,
        allow_hyphen_values = true,
        default_value = "-180,-85,180,85"
    )]
    pub bounds: Bounds,

    /// Viewport zoom level
    #[clap(short, long, env = "FUEL_MAP_ZOOM", default_value = "5")]
    pub zoom: f64,

    /// Timeout for opening the stream connection, in seconds
    #[clap(long, env = "FUEL_MAP_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout_secs: u64,

    /// Coarsest clustered zoom level
    #[clap(long, env = "FUEL_MAP_MIN_ZOOM", default_value = "0")]
    pub min_zoom: u8,

    /// Finest clustered zoom level (max 24)
    #[clap(long, env = "FUEL_MAP_MAX_ZOOM", default_value = "16")]
    pub max_zoom: u8,

    /// Cluster radius in screen pixels
    #[clap(long, env = "FUEL_MAP_CLUSTER_PIXEL_RADIUS", default_value = "40.0")]
    pub cluster_pixel_radius: f64,

    /// Tile size in pixels
    #[clap(long, env = "FUEL_MAP_TILE_EXTENT", default_value = "256.0")]
    pub tile_extent: f64,

    /// Minimum number of stations merged into a cluster
    #[clap(long, env = "FUEL_MAP_MIN_CLUSTER_SIZE", default_value = "2")]
    pub min_cluster_size: usize,

    /// Localized index updates before a full rebuild (0 = never)
    #[clap(long, env = "FUEL_MAP_FULL_REBUILD_THRESHOLD", default_value = "10000")]
    pub full_rebuild_threshold: usize,

    /// First reconnect delay in milliseconds
    #[clap(long, env = "FUEL_MAP_INITIAL_RECONNECT_MS", default_value = "500")]
    pub initial_reconnect_interval_ms: u64,

    /// Reconnect delay cap in milliseconds
    #[clap(long, env = "FUEL_MAP_MAX_RECONNECT_MS", default_value = "30000")]
    pub max_reconnect_interval_ms: u64,

    /// Consecutive failed connection attempts before giving up (0 = unlimited)
    #[clap(long, env = "FUEL_MAP_MAX_RECONNECT_ATTEMPTS", default_value = "0")]
    pub max_reconnect_attempts: u32,

    /// Event buffer capacity between the stream and the reconciler
    #[clap(long, env = "FUEL_MAP_EVENT_BUFFER", default_value = "1024")]
    pub event_buffer_capacity: usize,

    /// Consecutive malformed payloads that mark the stream degraded
    #[clap(long, env = "FUEL_MAP_DEGRADED_THRESHOLD", default_value = "20")]
    pub degraded_parse_threshold: usize,

    /// Reconnect when the stream stays silent this long, 0 disables
    #[clap(long, env = "FUEL_MAP_STREAM_IDLE_TIMEOUT_MS", default_value = "60000")]
    pub stream_idle_timeout_ms: u64,

    /// Viewport settling interval in milliseconds
    #[clap(long, env = "FUEL_MAP_DEBOUNCE_MS", default_value = "150")]
    pub debounce_interval_ms: u64,
}

/// Parse `west,south,east,north`
fn parse_bounds(value: &str) -> Result<Bounds, String> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid coordinate: {e}"))?;
    let [west, south, east, north] = parts[..] else {
        return Err(format!(
            "expected west,south,east,north but got {} values",
            parts.len()
        ));
    };
    if !(-90.0..=90.0).contains(&south) || !(-90.0..=90.0).contains(&north) || south > north {
        return Err("latitudes must be within [-90, 90] with south <= north".to_string());
    }
    if !(-180.0..=180.0).contains(&west) || !(-180.0..=180.0).contains(&east) {
        return Err("longitudes must be within [-180, 180]".to_string());
    }
    Ok(Bounds::new(west, south, east, north))
}

impl Settings {
    /// Parse the command line, exiting with usage on error
    pub fn from_cli() -> Self {
        match Settings::try_parse() {
            Ok(args) => args,
            Err(e) => e.exit(),
        }
    }

    /// Engine configuration from these settings
    pub fn config(&self) -> Config {
        Config {
            min_zoom: self.min_zoom,
            max_zoom: self.max_zoom,
            cluster_pixel_radius: self.cluster_pixel_radius,
            tile_extent: self.tile_extent,
            min_cluster_size: self.min_cluster_size,
            full_rebuild_threshold: self.full_rebuild_threshold,
            initial_reconnect_interval_ms: self.initial_reconnect_interval_ms,
            max_reconnect_interval_ms: self.max_reconnect_interval_ms,
            max_reconnect_attempts: self.max_reconnect_attempts,
            event_buffer_capacity: self.event_buffer_capacity,
            degraded_parse_threshold: self.degraded_parse_threshold,
            stream_idle_timeout_ms: self.stream_idle_timeout_ms,
            debounce_interval_ms: self.debounce_interval_ms,
        }
    }
}
