#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Crime feed client for the SafeRoute risk engine.
//!
//! Pulls monthly street-crime batches from a UK-Police-style API. The
//! operational bounding box is split into quadrant tiles to stay inside the
//! feed's polygon size limits; a tile answering 503 ("too many crimes") is
//! recursively split into sub-quadrants. Raw records are normalized into
//! [`NormalizedEvent`]s, skipping malformed records unless they exceed 10%
//! of a batch.

pub mod retry;

use chrono::NaiveDate;
use saferoute_database_models::BoundingBox;
use saferoute_feed_models::{NormalizedEvent, RawCrime};

/// Maximum recursive tile splitting depth before giving up on a tile.
const MAX_SPLIT_DEPTH: u32 = 4;

/// Fraction of a batch that may be malformed before ingestion aborts.
const MALFORMED_TOLERANCE: f64 = 0.10;

/// Per-request timeout against the feed.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Errors that can occur while pulling from the crime feed.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// The feed answered with an unusable status after retries.
    #[error("Crime feed unavailable: {message}")]
    Upstream {
        /// Description of the failure.
        message: String,
    },

    /// More than 10% of a batch failed normalization.
    #[error(
        "Crime feed returned a malformed batch: {malformed}/{total} records unusable \
         (sample: {sample})"
    )]
    MalformedBatch {
        /// Records that failed normalization.
        malformed: usize,
        /// Total records in the batch.
        total: usize,
        /// One example rejection reason.
        sample: String,
    },
}

/// A polygon tile submitted to the feed, as `(lat, lng)` vertices.
pub type Tile = Vec<(f64, f64)>;

/// Splits a bounding box into its four quadrant tiles.
///
/// The feed rejects large polygons, so the operational area is always
/// queried as at least four tiles.
#[must_use]
pub fn quadrant_tiles(bbox: &BoundingBox) -> Vec<Tile> {
    let mid_lat = (bbox.south + bbox.north) / 2.0;
    let mid_lng = (bbox.west + bbox.east) / 2.0;

    vec![
        // Bottom-left
        vec![
            (bbox.south, bbox.west),
            (mid_lat, bbox.west),
            (mid_lat, mid_lng),
            (bbox.south, mid_lng),
        ],
        // Bottom-right
        vec![
            (bbox.south, mid_lng),
            (mid_lat, mid_lng),
            (mid_lat, bbox.east),
            (bbox.south, bbox.east),
        ],
        // Top-left
        vec![
            (mid_lat, bbox.west),
            (bbox.north, bbox.west),
            (bbox.north, mid_lng),
            (mid_lat, mid_lng),
        ],
        // Top-right
        vec![
            (mid_lat, mid_lng),
            (bbox.north, mid_lng),
            (bbox.north, bbox.east),
            (mid_lat, bbox.east),
        ],
    ]
}

/// Splits a tile into four sub-quadrants around its centroid bbox.
fn split_tile(tile: &Tile) -> Vec<Tile> {
    let lats: Vec<f64> = tile.iter().map(|p| p.0).collect();
    let lngs: Vec<f64> = tile.iter().map(|p| p.1).collect();

    let south = lats.iter().copied().fold(f64::INFINITY, f64::min);
    let north = lats.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let west = lngs.iter().copied().fold(f64::INFINITY, f64::min);
    let east = lngs.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    quadrant_tiles(&BoundingBox::new(west, south, east, north))
}

/// Formats a tile for the feed's `poly` query parameter.
fn poly_param(tile: &Tile) -> String {
    tile.iter()
        .map(|(lat, lng)| format!("{lat},{lng}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Client for a UK-Police-style street-crime feed.
pub struct PoliceClient {
    client: reqwest::Client,
    base_url: String,
    force_id: String,
}

impl PoliceClient {
    /// Builds a client from `POLICE_API_BASE_URL` and `SAFEROUTE_FORCE_ID`
    /// (defaults: the public UK Police API and `hampshire`).
    ///
    /// # Errors
    ///
    /// Returns [`FeedError`] if the HTTP client fails to build.
    pub fn from_env() -> Result<Self, FeedError> {
        let base_url = std::env::var("POLICE_API_BASE_URL")
            .unwrap_or_else(|_| "https://data.police.uk/api".to_string());
        let force_id =
            std::env::var("SAFEROUTE_FORCE_ID").unwrap_or_else(|_| "hampshire".to_string());

        let client = reqwest::Client::builder()
            .user_agent("saferoute/0.1")
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url,
            force_id,
        })
    }

    /// Fetches all street crimes for one tile and month.
    ///
    /// Returns `None` when the feed signals the tile holds too many crimes
    /// (HTTP 503) and must be split; an empty vec when no data is published
    /// for the month (HTTP 404).
    ///
    /// # Errors
    ///
    /// Returns [`FeedError`] if the request fails after retries.
    async fn crimes_for_tile(
        &self,
        tile: &Tile,
        month: NaiveDate,
    ) -> Result<Option<Vec<RawCrime>>, FeedError> {
        let url = format!("{}/crimes-street/all-crime", self.base_url);
        let poly = poly_param(tile);
        let date = month.format("%Y-%m").to_string();

        let (status, body) = retry::send_json(|| {
            self.client
                .get(&url)
                .query(&[("poly", poly.as_str()), ("date", date.as_str())])
        })
        .await?;

        match (status, body) {
            (reqwest::StatusCode::SERVICE_UNAVAILABLE, _) => Ok(None),
            (reqwest::StatusCode::NOT_FOUND, _) => {
                log::info!("No crime data published for {date}");
                Ok(Some(Vec::new()))
            }
            (_, Some(value)) => {
                let crimes: Vec<RawCrime> = serde_json::from_value(value)?;
                Ok(Some(crimes))
            }
            (status, None) => Err(FeedError::Upstream {
                message: format!("HTTP {status} with empty body"),
            }),
        }
    }

    /// Fetches crimes for a tile, recursively splitting on 503.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError`] if any sub-tile request fails after retries.
    pub async fn crimes_with_split(
        &self,
        tile: &Tile,
        month: NaiveDate,
        depth: u32,
    ) -> Result<Vec<RawCrime>, FeedError> {
        if depth >= MAX_SPLIT_DEPTH {
            log::warn!("Max split depth {MAX_SPLIT_DEPTH} reached; some crimes may be missing");
            return Ok(Vec::new());
        }

        match self.crimes_for_tile(tile, month).await? {
            Some(crimes) => Ok(crimes),
            None => {
                log::info!("Tile too dense, splitting (depth {})", depth + 1);
                let mut all = Vec::new();
                for sub in split_tile(tile) {
                    let crimes = Box::pin(self.crimes_with_split(&sub, month, depth + 1)).await?;
                    all.extend(crimes);
                }
                Ok(all)
            }
        }
    }

    /// Fetches one month of crimes across all tiles of the operational
    /// bounding box.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError`] if any tile fails after retries.
    pub async fn fetch_month(
        &self,
        bbox: &BoundingBox,
        month: NaiveDate,
    ) -> Result<Vec<RawCrime>, FeedError> {
        let tiles = quadrant_tiles(bbox);
        let mut all = Vec::new();

        for (idx, tile) in tiles.iter().enumerate() {
            log::info!("Fetching tile {}/{} for {}", idx + 1, tiles.len(), month.format("%Y-%m"));
            let crimes = self.crimes_with_split(tile, month, 0).await?;
            log::info!("  {} crimes", crimes.len());
            all.extend(crimes);
        }

        Ok(all)
    }

    /// The police force identifier stamped onto normalized events.
    #[must_use]
    pub fn force_id(&self) -> &str {
        &self.force_id
    }
}

/// Normalizes one raw record, or explains why it is unusable.
fn normalize_crime(raw: &RawCrime, force_id: &str) -> Result<NormalizedEvent, String> {
    let external_id = match &raw.id {
        Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return Err("missing id".to_string()),
    };

    let month_str = raw.month.as_deref().ok_or("missing month")?;
    let month = NaiveDate::parse_from_str(&format!("{month_str}-01"), "%Y-%m-%d")
        .map_err(|_| format!("unparseable month {month_str:?}"))?;

    let location = raw.location.as_ref().ok_or("missing location")?;
    let latitude: f64 = location
        .latitude
        .as_deref()
        .and_then(|s| s.parse().ok())
        .ok_or("unparseable latitude")?;
    let longitude: f64 = location
        .longitude
        .as_deref()
        .and_then(|s| s.parse().ok())
        .ok_or("unparseable longitude")?;

    // The feed emits (0, 0) for records it could not geocode.
    if latitude == 0.0 || longitude == 0.0 {
        return Err("zero coordinates".to_string());
    }
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(format!("out-of-range coordinates ({latitude}, {longitude})"));
    }

    let category = raw
        .category
        .clone()
        .filter(|c| !c.is_empty())
        .ok_or("missing category")?;

    let location_desc = location
        .street
        .as_ref()
        .and_then(|s| s.name.clone())
        .unwrap_or_else(|| "Unknown location".to_string());

    Ok(NormalizedEvent {
        external_id,
        month,
        category,
        latitude,
        longitude,
        force_id: force_id.to_string(),
        output_area_code: raw.persistent_id.clone().filter(|p| !p.is_empty()),
        location_desc,
    })
}

/// The outcome of normalizing a raw batch.
#[derive(Debug, Clone)]
pub struct NormalizedBatch {
    /// Events that passed validation.
    pub events: Vec<NormalizedEvent>,
    /// Count of malformed records skipped.
    pub skipped: usize,
}

/// Normalizes a raw batch, skipping and counting malformed records.
///
/// # Errors
///
/// Returns [`FeedError::MalformedBatch`] when more than 10% of a non-empty
/// batch fails normalization; ingestion must not proceed on a feed that
/// broken.
pub fn normalize_batch(raws: &[RawCrime], force_id: &str) -> Result<NormalizedBatch, FeedError> {
    let mut events = Vec::with_capacity(raws.len());
    let mut skipped = 0usize;
    let mut sample: Option<String> = None;

    for raw in raws {
        match normalize_crime(raw, force_id) {
            Ok(event) => events.push(event),
            Err(reason) => {
                skipped += 1;
                if sample.is_none() {
                    sample = Some(reason.clone());
                }
                log::debug!("Skipping malformed crime record: {reason}");
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    if !raws.is_empty() && skipped as f64 / raws.len() as f64 > MALFORMED_TOLERANCE {
        return Err(FeedError::MalformedBatch {
            malformed: skipped,
            total: raws.len(),
            sample: sample.unwrap_or_else(|| "unknown".to_string()),
        });
    }

    if skipped > 0 {
        log::warn!("Skipped {skipped}/{} malformed crime records", raws.len());
    }

    Ok(NormalizedBatch { events, skipped })
}
