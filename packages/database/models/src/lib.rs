#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Database row types and query parameter definitions.
//!
//! These types represent the shapes of data as stored in and retrieved from
//! the `PostGIS` database. They are distinct from the API response types in
//! `saferoute_server_models` and the normalized feed types in
//! `saferoute_feed_models`.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// A geographic bounding box in WGS84 coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Western longitude boundary.
    pub west: f64,
    /// Southern latitude boundary.
    pub south: f64,
    /// Eastern longitude boundary.
    pub east: f64,
    /// Northern latitude boundary.
    pub north: f64,
}

impl BoundingBox {
    /// Creates a new bounding box from the given coordinates.
    #[must_use]
    pub const fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// Returns whether the box is non-degenerate and inside the WGS84
    /// domain.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.west < self.east
            && self.south < self.north
            && (-180.0..=180.0).contains(&self.west)
            && (-180.0..=180.0).contains(&self.east)
            && (-90.0..=90.0).contains(&self.south)
            && (-90.0..=90.0).contains(&self.north)
    }

    /// Returns this box grown by `margin_deg` degrees on every side,
    /// clamped to the WGS84 domain.
    #[must_use]
    pub fn expanded(&self, margin_deg: f64) -> Self {
        Self {
            west: (self.west - margin_deg).max(-180.0),
            south: (self.south - margin_deg).max(-90.0),
            east: (self.east + margin_deg).min(180.0),
            north: (self.north + margin_deg).min(90.0),
        }
    }
}

/// A crime event row as retrieved from the database.
///
/// Events are immutable once ingested; the descriptive fields are opaque to
/// scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrimeEventRow {
    /// Primary key.
    pub id: i64,
    /// Globally unique identifier from the upstream feed (dedup key).
    pub external_id: String,
    /// First day of the month the event was reported for.
    pub month: NaiveDate,
    /// Category slug from the closed taxonomy.
    pub category: String,
    /// Longitude (WGS84).
    pub longitude: f64,
    /// Latitude (WGS84).
    pub latitude: f64,
    /// Police force identifier.
    pub force_id: String,
    /// Output-area (LSOA) code, when the feed provided one.
    pub output_area_code: Option<String>,
    /// Human-readable location description.
    pub location_desc: String,
}

/// A safety grid cell row: one `(h3_index, month)` aggregate bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyCellRecord {
    /// Authoritative `"{h3}_{YYYYMM}"` key.
    pub cell_id: String,
    /// H3 resolution-10 cell identifier (hex string).
    pub h3_index: String,
    /// First day of the bucket's month.
    pub month: NaiveDate,
    /// Raw event count in this bucket.
    pub crime_count_total: u64,
    /// Harm-weighted event count (base weights only; recency and
    /// time-of-day apply at query time).
    pub crime_count_weighted: f64,
    /// Per-category event counts; sums to `crime_count_total`.
    pub stats: BTreeMap<String, u64>,
    /// Last aggregation timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state of one `ingest_month` run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IngestionStatus {
    /// The run is in progress.
    Running,
    /// All tiles fetched and ingested.
    Success,
    /// Some tiles failed but at least one succeeded.
    Partial,
    /// No tiles could be ingested.
    Failed,
}

/// A row from the `ingestion_runs` bookkeeping table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRunRow {
    /// Primary key.
    pub id: i64,
    /// The month this run ingested.
    pub month: NaiveDate,
    /// Current lifecycle state.
    pub status: IngestionStatus,
    /// Events upserted by this run.
    pub records_ingested: u64,
    /// Malformed events skipped by this run.
    pub records_skipped: u64,
    /// Tiles fetched so far.
    pub tiles_processed: u32,
    /// Total tiles in the run.
    pub tiles_total: u32,
    /// Failure detail, when the run did not fully succeed.
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_validity() {
        assert!(BoundingBox::new(-1.46, 50.87, -1.32, 50.95).is_valid());
        // Degenerate: zero width.
        assert!(!BoundingBox::new(-1.4, 50.9, -1.4, 50.95).is_valid());
        // Inverted.
        assert!(!BoundingBox::new(-1.32, 50.87, -1.46, 50.95).is_valid());
        // Out of domain.
        assert!(!BoundingBox::new(-181.0, 50.87, -1.32, 50.95).is_valid());
    }

    #[test]
    fn bbox_expansion_clamps_to_wgs84() {
        let bbox = BoundingBox::new(-179.9, -89.9, 179.9, 89.9).expanded(1.0);
        assert!((bbox.west - -180.0).abs() < f64::EPSILON);
        assert!((bbox.south - -90.0).abs() < f64::EPSILON);
        assert!((bbox.east - 180.0).abs() < f64::EPSILON);
        assert!((bbox.north - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ingestion_status_round_trips() {
        for status in [
            IngestionStatus::Running,
            IngestionStatus::Success,
            IngestionStatus::Partial,
            IngestionStatus::Failed,
        ] {
            let text = status.to_string();
            assert_eq!(text.parse::<IngestionStatus>().unwrap(), status);
        }
    }
}
