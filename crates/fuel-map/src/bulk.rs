//! Initial station set loading
//!
//! The bulk set is a JSON array of station records, read from a local file or
//! fetched over http(s).

use crate::Result;
use fuel_map_lib::{Station, parse_stations};
use tracing::info;

fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Load and parse the bulk station set from a path or URL
pub async fn load_stations(source: &str) -> Result<Vec<Station>> {
    #[cfg(feature = "profiling")]
    profiling::scope!("bulk::load_stations");

    let bytes = if is_url(source) {
        info!(url = source, "Fetching stations");
        let response = reqwest::get(source).await?.error_for_status()?;
        response.bytes().await?.to_vec()
    } else {
        info!(path = source, "Reading stations");
        tokio::fs::read(source).await?
    };

    let stations = parse_stations(&bytes)?;
    info!(
        count = stations.len(),
        bytes = bytes.len(),
        "Loaded stations"
    );
    Ok(stations)
}
