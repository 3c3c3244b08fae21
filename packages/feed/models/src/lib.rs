#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Raw and normalized crime feed types.
//!
//! [`RawCrime`] mirrors the shape of one record from the UK Police
//! street-crime API; [`NormalizedEvent`] is the validated form that the
//! event store accepts. Normalization (including the malformed-record
//! checks) lives in `saferoute_feed`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A raw street-crime record as returned by the feed.
///
/// Every field the feed may omit is optional; normalization decides what is
/// fatal for an individual record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawCrime {
    /// Feed-unique record identifier.
    pub id: Option<serde_json::Value>,
    /// Stable cross-month identifier, when assigned.
    pub persistent_id: Option<String>,
    /// Category slug (e.g. `"violent-crime"`).
    pub category: Option<String>,
    /// `"YYYY-MM"` month string.
    pub month: Option<String>,
    /// Nested location block.
    pub location: Option<RawLocation>,
    /// Free-text context supplied by the force.
    pub context: Option<String>,
}

/// The nested `location` block of a raw crime record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawLocation {
    /// Latitude as a decimal string.
    pub latitude: Option<String>,
    /// Longitude as a decimal string.
    pub longitude: Option<String>,
    /// Nested street block.
    pub street: Option<RawStreet>,
}

/// The nested `street` block of a raw location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawStreet {
    /// Street-level location identifier.
    pub id: Option<i64>,
    /// Human-readable street description.
    pub name: Option<String>,
}

/// A crime event validated and normalized for the event store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    /// Globally unique identifier within the feed (dedup key).
    pub external_id: String,
    /// First day of the reporting month.
    pub month: NaiveDate,
    /// Category slug; unknown slugs are preserved here and normalized to
    /// `other` before aggregation.
    pub category: String,
    /// Latitude (WGS84).
    pub latitude: f64,
    /// Longitude (WGS84).
    pub longitude: f64,
    /// Police force the record came from.
    pub force_id: String,
    /// Output-area code, when present.
    pub output_area_code: Option<String>,
    /// Street-level location description.
    pub location_desc: String,
}
