#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Routing provider client.
//!
//! Fetches candidate polylines from an `OpenRouteService`-style directions
//! API. The provider is a black box: it produces 1..N candidate routes
//! with per-route distance, duration, and turn-by-turn instructions, and
//! the scoring engine never second-guesses its geometry. Provider failures
//! surface as [`RoutingError::Upstream`] after capped retries; the engine
//! does not fabricate routes.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Maximum retry attempts against the provider.
const MAX_RETRIES: u32 = 3;

/// Backoff delays between attempts: 250ms, 1s, 4s.
const RETRY_DELAYS: [std::time::Duration; 3] = [
    std::time::Duration::from_millis(250),
    std::time::Duration::from_secs(1),
    std::time::Duration::from_secs(4),
];

/// Per-request timeout against the provider.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Number of alternative routes requested per query.
const ALTERNATIVE_COUNT: u32 = 3;

/// Errors raised by the routing provider client.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider failed after retries or returned garbage.
    #[error("Routing provider unavailable: {message}")]
    Upstream {
        /// Description of the failure.
        message: String,
    },

    /// The provider found no route between the endpoints.
    #[error("No routes found between the given points")]
    NoRoutes,
}

/// Supported travel modes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TravelMode {
    /// Walking routes.
    FootWalking,
    /// Regular bicycle routes.
    CyclingRegular,
}

/// One turn-by-turn instruction along a candidate route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteInstruction {
    /// Instruction text (e.g. "Turn left onto High Street").
    pub text: String,
    /// Distance covered by this step, in meters.
    pub distance_m: f64,
    /// Duration of this step, in seconds.
    pub duration_s: f64,
}

/// One candidate route produced by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRoute {
    /// Route polyline as ordered `[lon, lat]` vertices.
    pub polyline: Vec<[f64; 2]>,
    /// Total route distance in meters.
    pub distance_m: f64,
    /// Total route duration in seconds.
    pub duration_s: f64,
    /// Turn-by-turn instructions.
    pub instructions: Vec<RouteInstruction>,
}

/// Client for an `OpenRouteService`-style directions API.
pub struct RoutingClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RoutingClient {
    /// Builds a client from `ORS_API_URL` and `ORS_API_KEY`.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError`] if the HTTP client fails to build.
    pub fn from_env() -> Result<Self, RoutingError> {
        let base_url = std::env::var("ORS_API_URL")
            .unwrap_or_else(|_| "https://api.openrouteservice.org".to_string());
        let api_key = std::env::var("ORS_API_KEY").unwrap_or_default();

        let client = reqwest::Client::builder()
            .user_agent("saferoute/0.1")
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    /// Fetches candidate routes between two `(lon, lat)` points.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::NoRoutes`] if the provider answers with an
    /// empty feature set, or [`RoutingError::Upstream`] after retries are
    /// exhausted.
    pub async fn directions(
        &self,
        origin: [f64; 2],
        destination: [f64; 2],
        mode: TravelMode,
    ) -> Result<Vec<CandidateRoute>, RoutingError> {
        let url = format!("{}/v2/directions/{mode}/geojson", self.base_url);

        let body = serde_json::json!({
            "coordinates": [origin, destination],
            "instructions": true,
            "alternative_routes": {
                "target_count": ALTERNATIVE_COUNT,
                "share_factor": 0.6,
                "weight_factor": 1.4,
            },
        });

        let mut last_error = String::new();

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = RETRY_DELAYS[(attempt - 1) as usize];
                log::warn!("Routing retry {attempt}/{MAX_RETRIES} in {delay:?}...");
                tokio::time::sleep(delay).await;
            }

            let response = self
                .client
                .post(&url)
                .header("Authorization", &self.api_key)
                .json(&body)
                .send()
                .await;

            match response {
                Err(e) if e.is_timeout() || e.is_connect() => {
                    log::warn!("Routing provider transient error: {e}");
                    last_error = e.to_string();
                }
                Err(e) => return Err(RoutingError::Http(e)),
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let value: serde_json::Value =
                            response.json().await.map_err(RoutingError::Http)?;
                        return extract_candidates(&value);
                    }

                    // 400 means our request was malformed; retrying won't help.
                    if status == reqwest::StatusCode::BAD_REQUEST {
                        let text = response.text().await.unwrap_or_default();
                        return Err(RoutingError::Upstream {
                            message: format!("provider rejected request: {text}"),
                        });
                    }

                    log::warn!("Routing provider HTTP {status}");
                    last_error = format!("HTTP {status}");
                }
            }
        }

        Err(RoutingError::Upstream {
            message: format!("failed after {MAX_RETRIES} retries: {last_error}"),
        })
    }
}

/// Extracts candidate routes from a `GeoJSON` directions response.
fn extract_candidates(value: &serde_json::Value) -> Result<Vec<CandidateRoute>, RoutingError> {
    let features = value["features"].as_array().ok_or_else(|| {
        RoutingError::Upstream {
            message: "response missing features array".to_string(),
        }
    })?;

    let candidates: Vec<CandidateRoute> = features
        .iter()
        .filter_map(extract_candidate)
        .collect();

    if candidates.is_empty() {
        return Err(RoutingError::NoRoutes);
    }

    log::info!("Routing provider returned {} candidate route(s)", candidates.len());
    Ok(candidates)
}

/// Extracts one candidate from a `GeoJSON` feature, or `None` if the
/// feature is malformed.
fn extract_candidate(feature: &serde_json::Value) -> Option<CandidateRoute> {
    let coords = feature["geometry"]["coordinates"].as_array()?;
    let polyline: Vec<[f64; 2]> = coords
        .iter()
        .filter_map(|c| {
            let pair = c.as_array()?;
            Some([pair.first()?.as_f64()?, pair.get(1)?.as_f64()?])
        })
        .collect();

    if polyline.len() < 2 {
        return None;
    }

    let summary = &feature["properties"]["summary"];
    let distance_m = summary["distance"].as_f64().unwrap_or(0.0);
    let duration_s = summary["duration"].as_f64().unwrap_or(0.0);

    let instructions: Vec<RouteInstruction> = feature["properties"]["segments"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|segment| segment["steps"].as_array())
        .flatten()
        .filter_map(|step| {
            Some(RouteInstruction {
                text: step["instruction"].as_str()?.to_string(),
                distance_m: step["distance"].as_f64().unwrap_or(0.0),
                duration_s: step["duration"].as_f64().unwrap_or(0.0),
            })
        })
        .collect();

    Some(CandidateRoute {
        polyline,
        distance_m,
        duration_s,
        instructions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn travel_mode_slugs() {
        assert_eq!(TravelMode::FootWalking.to_string(), "foot-walking");
        assert_eq!(TravelMode::CyclingRegular.to_string(), "cycling-regular");
        assert_eq!(
            "foot-walking".parse::<TravelMode>().unwrap(),
            TravelMode::FootWalking
        );
        assert!("driving-car".parse::<TravelMode>().is_err());
    }

    #[test]
    fn extracts_candidates_from_geojson() {
        let value = serde_json::json!({
            "features": [{
                "geometry": {
                    "coordinates": [[-1.4049, 50.9079], [-1.4030, 50.9085], [-1.4010, 50.9090]],
                },
                "properties": {
                    "summary": { "distance": 312.5, "duration": 225.0 },
                    "segments": [{
                        "steps": [
                            { "instruction": "Head east", "distance": 150.0, "duration": 108.0 },
                            { "instruction": "Arrive at destination", "distance": 0.0, "duration": 0.0 },
                        ],
                    }],
                },
            }],
        });

        let candidates = extract_candidates(&value).unwrap();
        assert_eq!(candidates.len(), 1);

        let route = &candidates[0];
        assert_eq!(route.polyline.len(), 3);
        assert!((route.distance_m - 312.5).abs() < f64::EPSILON);
        assert!((route.duration_s - 225.0).abs() < f64::EPSILON);
        assert_eq!(route.instructions.len(), 2);
        assert_eq!(route.instructions[0].text, "Head east");
    }

    #[test]
    fn empty_features_is_no_routes() {
        let value = serde_json::json!({ "features": [] });
        assert!(matches!(extract_candidates(&value), Err(RoutingError::NoRoutes)));

        let missing = serde_json::json!({ "error": "boom" });
        assert!(matches!(
            extract_candidates(&missing),
            Err(RoutingError::Upstream { .. })
        ));
    }

    #[test]
    fn degenerate_polylines_are_dropped() {
        let value = serde_json::json!({
            "features": [{
                "geometry": { "coordinates": [[-1.4049, 50.9079]] },
                "properties": { "summary": { "distance": 0.0, "duration": 0.0 } },
            }],
        });
        assert!(matches!(extract_candidates(&value), Err(RoutingError::NoRoutes)));
    }
}
