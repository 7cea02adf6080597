//! Change events delivered by the live update channel
//!
//! Payloads are JSON objects tagged by `type`:
//!
//! ```json
//! {"type": "added",   "id": "st-1", "version": 3, "fields": {"lat": 48.1, "lon": 11.5}}
//! {"type": "updated", "id": "st-1", "version": 4, "fields": {"prices": {"e5": 1.79}}}
//! {"type": "removed", "id": "st-1", "version": 5}
//! ```
//!
//! `version` is optional everywhere; `fields` is required for additions and
//! updates.

use crate::{DataError, Result, StationFields, StationId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeEvent {
    Added {
        id: StationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
        fields: StationFields,
    },
    Updated {
        id: StationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
        fields: StationFields,
    },
    Removed {
        id: StationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
    },
}

/// Parse and validate one channel payload
pub fn parse_event(payload: &str) -> Result<ChangeEvent> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(DataError::MalformedEvent("empty payload".to_string()));
    }
    serde_json::from_str(payload).map_err(|e| DataError::MalformedEvent(e.to_string()))
}

/// Ordering of two optional versions, where a missing version is always newer
fn compare_versions(newer: Option<u64>, older: Option<u64>) -> Ordering {
    match (newer, older) {
        (Some(a), Some(b)) => a.cmp(&b),
        (None, _) | (_, None) => Ordering::Greater,
    }
}

/// Whether `candidate` supersedes `current` under the "absent is newer" rule
#[inline]
pub fn is_newer(candidate: Option<u64>, current: Option<u64>) -> bool {
    compare_versions(candidate, current) == Ordering::Greater
}

/// Outcome of folding two queued events for the same station
#[derive(Debug, Clone, PartialEq)]
pub enum Coalesced {
    /// Applying this single event has the same effect as applying both
    Merged(ChangeEvent),
    /// The pair cannot be folded and must stay in order
    Both(ChangeEvent, ChangeEvent),
}

impl ChangeEvent {
    #[inline]
    pub fn id(&self) -> &StationId {
        match self {
            Self::Added { id, .. } | Self::Updated { id, .. } | Self::Removed { id, .. } => id,
        }
    }

    #[inline]
    pub fn version(&self) -> Option<u64> {
        match self {
            Self::Added { version, .. }
            | Self::Updated { version, .. }
            | Self::Removed { version, .. } => *version,
        }
    }

    /// Carried fields; removals have none
    #[inline]
    pub fn fields(&self) -> Option<&StationFields> {
        match self {
            Self::Added { fields, .. } | Self::Updated { fields, .. } => Some(fields),
            Self::Removed { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Updated { .. } => "updated",
            Self::Removed { .. } => "removed",
        }
    }

    /// Fold `newer`, received after `self` for the same station, into one
    /// event where possible
    ///
    /// A fold is only made when applying the merged event leaves every store
    /// state exactly as applying both would. The outcome of an event depends
    /// on the stored version, which is unknown here, so mixed versioned and
    /// unversioned pairs are kept apart.
    pub fn coalesce(self, newer: ChangeEvent) -> Coalesced {
        use ChangeEvent::*;

        match (self, newer) {
            // The addition may revive a tombstoned id and reset its removal version
            (older @ Added { .. }, newer @ Removed { .. }) => Coalesced::Both(older, newer),
            (older, Removed { id, version }) => {
                let version = match (older, version) {
                    (Removed { version: Some(a), .. }, Some(b)) => Some(a.max(b)),
                    (Removed { version: a, .. }, None) => a,
                    (_, version) => version,
                };
                Coalesced::Merged(Removed { id, version })
            }
            // A late update can never revive a removed station
            (older @ Removed { .. }, Updated { .. }) => Coalesced::Merged(older),
            (older @ Removed { .. }, newer @ Added { .. }) => Coalesced::Both(older, newer),
            // An update to an unknown id is dropped while the addition still applies
            (older @ Updated { .. }, newer @ Added { .. }) => {
                match (older.version(), newer.version()) {
                    (Some(a), Some(b)) if b > a => Coalesced::Merged(newer),
                    (None, None) => Coalesced::Merged(newer),
                    _ => Coalesced::Both(older, newer),
                }
            }
            (older, newer) => match (older.version(), newer.version()) {
                // Stale once `older` applied, and stale or orphaned otherwise
                (Some(a), Some(b)) if b <= a => Coalesced::Merged(older),
                (Some(_), Some(_)) => match (older, newer) {
                    (Added { .. }, newer @ Added { .. }) => Coalesced::Merged(newer),
                    (Updated { fields, .. }, newer @ Updated { .. })
                        if newer.fields().is_some_and(|f| f.covers(&fields)) =>
                    {
                        Coalesced::Merged(newer)
                    }
                    (older, newer) => Coalesced::Both(older, newer),
                },
                (None, None) => Coalesced::Merged(older.overlaid(newer)),
                _ => Coalesced::Both(older, newer),
            },
        }
    }

    /// `self` with the fields of an unversioned `newer` applied on top
    fn overlaid(self, newer: ChangeEvent) -> ChangeEvent {
        use ChangeEvent::*;

        match (self, newer) {
            (_, newer @ Added { .. }) => newer,
            (
                Added {
                    id,
                    version,
                    mut fields,
                },
                Updated { fields: newer, .. },
            ) => {
                fields.overlay(newer);
                Added {
                    id,
                    version,
                    fields,
                }
            }
            (
                Updated {
                    id,
                    version,
                    mut fields,
                },
                Updated { fields: newer, .. },
            ) => {
                fields.overlay(newer);
                Updated {
                    id,
                    version,
                    fields,
                }
            }
            (older, _) => older,
        }
    }
}
