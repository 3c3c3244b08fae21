//! HTTP handler functions for the SafeRoute API.

use actix_web::{HttpResponse, web};
use chrono::{Datelike, NaiveDate, Utc};
use saferoute_aggregator::AggregateError;
use saferoute_database::queries;
use saferoute_database_models::BoundingBox;
use saferoute_feed::FeedError;
use saferoute_routes::{RoutePreferences, RouteScoreError};
use saferoute_routing::RoutingError;
use saferoute_scoring::TimeOfDay;
use saferoute_server_models::{
    ApiHealth, IngestMonthRequest, RebuildGridRequest, SafeRouteRequest, SafeRouteResponse,
    SnapshotQueryParams,
};
use saferoute_snapshot::{SnapshotError, SnapshotRequest};

use crate::AppState;

/// Default number of months for an admin grid rebuild.
const DEFAULT_REBUILD_MONTHS: u32 = 12;

/// `GET /api/health`
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(ApiHealth {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// First day of the current month, UTC.
fn current_month() -> NaiveDate {
    let today = Utc::now().date_naive();
    today.with_day(1).unwrap_or(today)
}

/// Parses a bounding box string `"min_lon,min_lat,max_lon,max_lat"`.
fn parse_bbox(raw: &str) -> Option<BoundingBox> {
    let parts: Vec<f64> = raw.split(',').filter_map(|p| p.trim().parse().ok()).collect();
    if parts.len() == 4 {
        Some(BoundingBox::new(parts[0], parts[1], parts[2], parts[3]))
    } else {
        None
    }
}

/// Parses an optional `time_of_day` query value.
///
/// `Err` carries the rejection message for the 400 response.
fn parse_time_of_day(raw: Option<&str>) -> Result<Option<TimeOfDay>, String> {
    match raw {
        None => Ok(None),
        Some(value) => value.parse::<TimeOfDay>().map(Some).map_err(|_| {
            format!("unknown time_of_day {value:?}: expected night, morning, day, or evening")
        }),
    }
}

fn bad_request(message: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(serde_json::json!({ "error": message }))
}

fn internal_error(message: &str) -> HttpResponse {
    HttpResponse::InternalServerError().json(serde_json::json!({ "error": message }))
}

fn snapshot_error_response(error: &SnapshotError) -> HttpResponse {
    match error {
        SnapshotError::InvalidInput(message) => bad_request(message),
        SnapshotError::Db(e) => {
            log::error!("Snapshot query failed: {e}");
            internal_error("Failed to build safety snapshot")
        }
    }
}

fn route_error_response(error: &RouteScoreError) -> HttpResponse {
    match error {
        RouteScoreError::InvalidInput(message) => bad_request(message),
        RouteScoreError::Timeout => HttpResponse::GatewayTimeout().json(serde_json::json!({
            "error": "Route scoring deadline exceeded"
        })),
        RouteScoreError::Db(e) => {
            log::error!("Route scoring query failed: {e}");
            internal_error("Failed to score routes")
        }
    }
}

fn routing_error_response(error: &RoutingError) -> HttpResponse {
    match error {
        RoutingError::NoRoutes => HttpResponse::NotFound().json(serde_json::json!({
            "error": "No routes found between the given points"
        })),
        RoutingError::Http(e) => {
            log::error!("Routing provider request failed: {e}");
            HttpResponse::BadGateway().json(serde_json::json!({
                "error": "Routing provider unavailable"
            }))
        }
        RoutingError::Upstream { message } => {
            log::error!("Routing provider failed: {message}");
            HttpResponse::BadGateway().json(serde_json::json!({
                "error": "Routing provider unavailable"
            }))
        }
    }
}

fn aggregate_error_response(error: &AggregateError) -> HttpResponse {
    match error {
        AggregateError::Busy { scope } => HttpResponse::Conflict().json(serde_json::json!({
            "error": format!("Aggregation busy: {scope} is locked by another run")
        })),
        AggregateError::InvalidInput(message) => bad_request(message),
        AggregateError::Feed(e) => {
            log::error!("Crime feed failed: {e}");
            HttpResponse::BadGateway().json(serde_json::json!({
                "error": "Crime feed unavailable"
            }))
        }
        AggregateError::Db(e) => {
            log::error!("Aggregation failed: {e}");
            internal_error("Aggregation failed")
        }
        AggregateError::Grid(e) => {
            log::error!("Aggregation grid error: {e}");
            internal_error("Aggregation failed")
        }
    }
}

/// `GET /api/v1/safety/snapshot`
///
/// Returns safety grid cells for a bounding box with recency and optional
/// time-of-day weighting. Responses are cached per query fingerprint and
/// invalidated by grid-version bumps.
pub async fn safety_snapshot(
    state: web::Data<AppState>,
    params: web::Query<SnapshotQueryParams>,
) -> HttpResponse {
    let Some(bbox) = parse_bbox(&params.bbox) else {
        return bad_request(&format!(
            "invalid bbox {:?}: expected min_lon,min_lat,max_lon,max_lat",
            params.bbox
        ));
    };

    let time_of_day = match parse_time_of_day(params.time_of_day.as_deref()) {
        Ok(value) => value,
        Err(message) => return bad_request(&message),
    };

    let lookback = params.lookback_months.unwrap_or(state.default_lookback);
    let request = match SnapshotRequest::new(bbox, lookback, time_of_day) {
        Ok(request) => request,
        Err(e) => return snapshot_error_response(&e),
    };

    let month = current_month();

    let version = match queries::grid_version(state.db.as_ref()).await {
        Ok(version) => version,
        Err(e) => {
            log::error!("Failed to read grid version: {e}");
            return internal_error("Failed to build safety snapshot");
        }
    };

    let cache_key = saferoute_cache::fingerprint(
        "snapshot",
        &[
            format!("{},{},{},{}", bbox.west, bbox.south, bbox.east, bbox.north),
            lookback.to_string(),
            time_of_day.map_or_else(|| "none".to_string(), |t| t.to_string()),
            month.format("%Y-%m").to_string(),
        ],
    );

    if let Some(cached) = state.cache.get(&cache_key, version) {
        return HttpResponse::Ok().json(cached);
    }

    match saferoute_snapshot::build_snapshot(state.db.as_ref(), &request, month, &state.tables)
        .await
    {
        Ok(response) => match serde_json::to_value(&response) {
            Ok(value) => {
                state.cache.insert(cache_key, version, value.clone());
                HttpResponse::Ok().json(value)
            }
            Err(e) => {
                log::error!("Failed to serialize snapshot: {e}");
                internal_error("Failed to build safety snapshot")
            }
        },
        Err(e) => snapshot_error_response(&e),
    }
}

/// `POST /api/v1/routes/safe`
///
/// Fetches candidate routes from the routing provider and scores each
/// against the safety grid under the batch deadline.
pub async fn safe_routes(
    state: web::Data<AppState>,
    body: web::Json<SafeRouteRequest>,
) -> HttpResponse {
    let request = body.into_inner();

    for (name, coord) in [("origin", request.origin), ("destination", request.destination)] {
        if !(-90.0..=90.0).contains(&coord.lat) || !(-180.0..=180.0).contains(&coord.lng) {
            return bad_request(&format!(
                "{name} is outside the WGS84 domain: ({}, {})",
                coord.lat, coord.lng
            ));
        }
    }

    let body_prefs = request.preferences.unwrap_or_default();
    let time_of_day = match parse_time_of_day(body_prefs.time_of_day.as_deref()) {
        Ok(value) => value,
        Err(message) => return bad_request(&message),
    };

    let preferences = match RoutePreferences::new(
        body_prefs.lookback_months.unwrap_or(state.default_lookback),
        time_of_day,
        body_prefs.category_weights,
    ) {
        Ok(preferences) => preferences,
        Err(e) => return route_error_response(&e),
    };

    let candidates = match state
        .routing
        .directions(
            [request.origin.lng, request.origin.lat],
            [request.destination.lng, request.destination.lat],
            request.mode,
        )
        .await
    {
        Ok(candidates) => candidates,
        Err(e) => return routing_error_response(&e),
    };

    let month = current_month();

    let version = match queries::grid_version(state.db.as_ref()).await {
        Ok(version) => version,
        Err(e) => {
            log::error!("Failed to read grid version: {e}");
            return internal_error("Failed to score routes");
        }
    };

    // Key on the candidate polylines themselves: the same geometry under
    // the same preferences and grid always scores identically.
    let mut key_parts: Vec<String> = candidates
        .iter()
        .map(|c| serde_json::to_string(&c.polyline).unwrap_or_default())
        .collect();
    key_parts.push(preferences.lookback_months.to_string());
    key_parts.push(
        preferences
            .time_of_day
            .map_or_else(|| "none".to_string(), |t| t.to_string()),
    );
    key_parts.push(
        preferences
            .category_weights
            .as_ref()
            .map(|w| serde_json::to_string(w).unwrap_or_default())
            .unwrap_or_else(|| "none".to_string()),
    );
    key_parts.push(month.format("%Y-%m").to_string());
    let cache_key = saferoute_cache::fingerprint("route", &key_parts);

    if let Some(cached) = state.cache.get(&cache_key, version) {
        return HttpResponse::Ok().json(cached);
    }

    match saferoute_routes::score_candidates(
        state.db.as_ref(),
        &candidates,
        &preferences,
        month,
        &state.tables,
        state.route_deadline,
    )
    .await
    {
        Ok(routes) => {
            let response = SafeRouteResponse { routes };
            match serde_json::to_value(&response) {
                Ok(value) => {
                    state.cache.insert(cache_key, version, value.clone());
                    HttpResponse::Ok().json(value)
                }
                Err(e) => {
                    log::error!("Failed to serialize scored routes: {e}");
                    internal_error("Failed to score routes")
                }
            }
        }
        Err(e) => route_error_response(&e),
    }
}

/// `POST /api/v1/admin/ingest-latest`
///
/// Ingests the most recent month the feed publishes (the previous
/// calendar month; the current month is still accumulating upstream).
pub async fn ingest_latest(state: web::Data<AppState>) -> HttpResponse {
    let month = saferoute_scoring::month_floor_back(current_month(), 1);
    run_ingest(&state, month, false).await
}

/// `POST /api/v1/admin/ingest-month`
pub async fn ingest_month(
    state: web::Data<AppState>,
    body: web::Json<IngestMonthRequest>,
) -> HttpResponse {
    let Some(month) = NaiveDate::from_ymd_opt(body.year, body.month, 1) else {
        return bad_request(&format!("invalid month: {}-{}", body.year, body.month));
    };

    run_ingest(&state, month, body.force).await
}

async fn run_ingest(state: &web::Data<AppState>, month: NaiveDate, force: bool) -> HttpResponse {
    // Surface the malformed-batch failure distinctly: the feed answered
    // but its payload was unusable.
    match saferoute_aggregator::ingest_month(
        state.db.as_ref(),
        &state.feed,
        &state.tables,
        &state.bbox,
        month,
        force,
    )
    .await
    {
        Ok(summary) => HttpResponse::Ok().json(summary),
        Err(AggregateError::Feed(e @ FeedError::MalformedBatch { .. })) => {
            log::error!("Ingestion aborted: {e}");
            HttpResponse::BadGateway().json(serde_json::json!({ "error": e.to_string() }))
        }
        Err(e) => aggregate_error_response(&e),
    }
}

/// `POST /api/v1/admin/rebuild-grid`
pub async fn rebuild_grid(
    state: web::Data<AppState>,
    body: web::Json<RebuildGridRequest>,
) -> HttpResponse {
    let months = body.months.unwrap_or(DEFAULT_REBUILD_MONTHS);

    match saferoute_aggregator::rebuild(state.db.as_ref(), &state.tables, current_month(), months)
        .await
    {
        Ok(summary) => HttpResponse::Ok().json(summary),
        Err(e) => aggregate_error_response(&e),
    }
}

/// `GET /api/v1/admin/grid-health`
pub async fn grid_health(state: web::Data<AppState>) -> HttpResponse {
    match saferoute_aggregator::validate_grid(state.db.as_ref(), &state.tables).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => aggregate_error_response(&e),
    }
}
