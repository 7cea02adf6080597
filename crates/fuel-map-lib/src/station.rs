//! Station records and partial field updates
//!
//! A [`Station`] is the canonical record kept by the entity store. Live
//! updates carry [`StationFields`], a sparse overlay where every absent field
//! means "unchanged".

use crate::utils;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Per fuel-type prices; `None` marks a fuel type that is currently not sold
pub type Prices = BTreeMap<String, Option<f64>>;

/// Stable station identifier
///
/// The wire format allows either a JSON string or an integer; both are
/// normalised to their string form so `"42"` and `42` name the same station.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StationId(String);

impl StationId {
    /// Create an identifier, rejecting empty or whitespace-only ids
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for StationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Unsigned(u64),
            Signed(i64),
        }

        match RawId::deserialize(deserializer)? {
            RawId::Text(text) => {
                StationId::new(text).ok_or_else(|| D::Error::custom("station id must not be empty"))
            }
            RawId::Unsigned(n) => Ok(StationId(n.to_string())),
            RawId::Signed(n) => Ok(StationId(n.to_string())),
        }
    }
}

/// A WGS84 position in degrees
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Whether the position is finite and inside lat ∈ [-90,90], lon ∈ [-180,180]
    #[inline]
    pub fn is_valid(&self) -> bool {
        utils::is_valid_wgs84(self.lat, self.lon)
    }
}

/// Sparse set of station attributes carried by bulk records and live updates
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StationFields {
    #[serde(default, alias = "latitude", skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(
        default,
        alias = "lng",
        alias = "longitude",
        skip_serializing_if = "Option::is_none"
    )]
    pub lon: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    /// Prices are merged key by key; a `null` price clears that fuel type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prices: Option<Prices>,
}

impl StationFields {
    /// Whether applying these fields could move the station
    #[inline]
    pub fn touches_position(&self) -> bool {
        self.lat.is_some() || self.lon.is_some()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lat.is_none() && self.lon.is_none() && self.brand.is_none() && self.prices.is_none()
    }

    /// Whether every field set in `older` is also set here, so that
    /// overlaying `self` hides `older` completely
    pub fn covers(&self, older: &StationFields) -> bool {
        let prices = match (&self.prices, &older.prices) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(newer), Some(older)) => older.keys().all(|fuel| newer.contains_key(fuel)),
        };
        prices
            && (older.lat.is_none() || self.lat.is_some())
            && (older.lon.is_none() || self.lon.is_some())
            && (older.brand.is_none() || self.brand.is_some())
    }

    /// Overlay `newer` on top of `self`, field by field
    pub fn overlay(&mut self, newer: StationFields) {
        if newer.lat.is_some() {
            self.lat = newer.lat;
        }
        if newer.lon.is_some() {
            self.lon = newer.lon;
        }
        if newer.brand.is_some() {
            self.brand = newer.brand;
        }
        if let Some(prices) = newer.prices {
            self.prices.get_or_insert_with(Prices::new).extend(prices);
        }
    }
}

/// A bulk-load record: identity plus a full set of fields
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StationRecord {
    pub id: StationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(flatten)]
    pub fields: StationFields,
}

/// Canonical station record stored in the entity store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: StationId,
    /// Raw position as last received, possibly invalid or incomplete
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub brand: Option<String>,
    pub prices: Prices,
    pub version: u64,
}

impl Station {
    /// Create a station from a full set of fields
    pub fn new(id: StationId, fields: StationFields, version: u64) -> Self {
        Self {
            id,
            lat: fields.lat,
            lon: fields.lon,
            brand: fields.brand,
            prices: fields.prices.unwrap_or_default(),
            version,
        }
    }

    /// Create a station from a bulk-load record
    pub fn from_record(record: StationRecord) -> Self {
        Self::new(record.id, record.fields, record.version.unwrap_or(0))
    }

    /// The station's position if it is complete and valid
    ///
    /// Stations without a valid position stay in the store but are
    /// excluded from the spatial index.
    #[inline]
    pub fn position(&self) -> Option<Coordinates> {
        let coordinates = Coordinates::new(self.lat?, self.lon?);
        coordinates.is_valid().then_some(coordinates)
    }

    /// Return a copy of this station with `fields` applied
    ///
    /// `version` replaces the current version when present; an update without
    /// a version keeps the last known one.
    pub fn patched(&self, fields: &StationFields, version: Option<u64>) -> Self {
        let mut next = self.clone();
        if let Some(lat) = fields.lat {
            next.lat = Some(lat);
        }
        if let Some(lon) = fields.lon {
            next.lon = Some(lon);
        }
        if let Some(brand) = &fields.brand {
            next.brand = Some(brand.clone());
        }
        if let Some(prices) = &fields.prices {
            next.prices
                .extend(prices.iter().map(|(fuel, price)| (fuel.clone(), *price)));
        }
        if let Some(version) = version {
            next.version = version;
        }
        next
    }

    /// Price for a fuel type, if currently sold
    #[inline]
    pub fn price(&self, fuel: &str) -> Option<f64> {
        self.prices.get(fuel).copied().flatten()
    }
}
