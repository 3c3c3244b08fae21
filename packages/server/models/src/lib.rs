#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! API request and response types for the SafeRoute server.
//!
//! These types are serialized to JSON for the REST API. They are separate
//! from the database row types to allow independent evolution of the API
//! contract.

use std::collections::BTreeMap;

use saferoute_routes::ScoredRoute;
use saferoute_routing::TravelMode;
use serde::{Deserialize, Serialize};

/// `GET /api/health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiHealth {
    /// Whether the server considers itself healthy.
    pub healthy: bool,
    /// Server version.
    pub version: String,
}

/// Query parameters for `GET /api/v1/safety/snapshot`.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotQueryParams {
    /// Bounding box as `"min_lon,min_lat,max_lon,max_lat"`.
    pub bbox: String,
    /// Months of history, `[1, 24]`; server default when omitted.
    pub lookback_months: Option<u32>,
    /// Diurnal bucket: `night`, `morning`, `day`, or `evening`.
    pub time_of_day: Option<String>,
}

/// A WGS84 coordinate in request bodies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub lng: f64,
}

/// Scoring preferences in a safe-route request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutePreferencesBody {
    /// Months of history, `[1, 24]`; server default when omitted.
    pub lookback_months: Option<u32>,
    /// Diurnal bucket: `night`, `morning`, `day`, or `evening`.
    pub time_of_day: Option<String>,
    /// Per-category multiplicative modifiers applied after harm weight.
    pub category_weights: Option<BTreeMap<String, f64>>,
}

/// Body of `POST /api/v1/routes/safe`.
#[derive(Debug, Clone, Deserialize)]
pub struct SafeRouteRequest {
    /// Route origin.
    pub origin: Coordinate,
    /// Route destination.
    pub destination: Coordinate,
    /// Travel mode.
    pub mode: TravelMode,
    /// Optional scoring preferences.
    pub preferences: Option<RoutePreferencesBody>,
}

/// Response of `POST /api/v1/routes/safe`.
#[derive(Debug, Clone, Serialize)]
pub struct SafeRouteResponse {
    /// Scored candidates, safest first.
    pub routes: Vec<ScoredRoute>,
}

/// Body of `POST /api/v1/admin/ingest-month`.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestMonthRequest {
    /// Calendar year.
    pub year: i32,
    /// Calendar month, 1-12.
    pub month: u32,
    /// Re-ingest even if a previous run already succeeded.
    #[serde(default)]
    pub force: bool,
}

/// Body of `POST /api/v1/admin/rebuild-grid`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RebuildGridRequest {
    /// Number of months to rebuild; server default when omitted.
    pub months: Option<u32>,
}
