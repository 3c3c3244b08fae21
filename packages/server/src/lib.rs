#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web API server for the SafeRoute risk engine.
//!
//! Serves the safety heatmap snapshot, safe-route scoring, and the admin
//! aggregation operations. Snapshot and route responses go through the
//! read-through query cache; the grid version stored in `PostGIS` decides
//! when cached entries are stale, so a rebuild on any process invalidates
//! readers on every process.

mod handlers;

use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use saferoute_cache::QueryCache;
use saferoute_database::{db, run_migrations};
use saferoute_database_models::BoundingBox;
use saferoute_feed::PoliceClient;
use saferoute_routing::RoutingClient;
use saferoute_scoring::ScoringTables;
use switchy_database::Database;

/// Default operational area: Southampton.
const DEFAULT_BBOX: &str = "50.85,-1.55,51.0,-1.3";

/// Default snapshot/route lookback when the query omits it.
const DEFAULT_LOOKBACK_MONTHS: u32 = 12;

/// Shared application state.
pub struct AppState {
    /// `PostGIS` database connection.
    pub db: Arc<dyn Database>,
    /// Read-through response cache.
    pub cache: Arc<QueryCache>,
    /// Harm and time-of-day weight tables.
    pub tables: Arc<ScoringTables>,
    /// Routing provider client.
    pub routing: Arc<RoutingClient>,
    /// Crime feed client.
    pub feed: Arc<PoliceClient>,
    /// Operational area used by ingestion.
    pub bbox: BoundingBox,
    /// Lookback applied when queries omit one.
    pub default_lookback: u32,
    /// Hard deadline for scoring a batch of route candidates.
    pub route_deadline: Duration,
}

/// Parses `SAFEROUTE_BBOX` (`"lat_min,lng_min,lat_max,lng_max"`).
fn bbox_from_env() -> BoundingBox {
    let raw = std::env::var("SAFEROUTE_BBOX").unwrap_or_else(|_| DEFAULT_BBOX.to_string());
    let parts: Vec<f64> = raw.split(',').filter_map(|p| p.trim().parse().ok()).collect();

    if parts.len() == 4 {
        let bbox = BoundingBox::new(parts[1], parts[0], parts[3], parts[2]);
        if bbox.is_valid() {
            return bbox;
        }
    }

    log::warn!("Invalid SAFEROUTE_BBOX {raw:?}, falling back to default");
    let parts: Vec<f64> = DEFAULT_BBOX.split(',').filter_map(|p| p.parse().ok()).collect();
    BoundingBox::new(parts[1], parts[0], parts[3], parts[2])
}

/// Starts the SafeRoute API server.
///
/// Connects to `PostGIS`, runs migrations, loads the scoring tables, and
/// serves until terminated.
///
/// # Errors
///
/// Returns an `std::io::Result` error if the HTTP server fails to bind or
/// encounters a runtime error.
///
/// # Panics
///
/// Panics if the database connection, migrations, scoring tables, or
/// upstream clients fail to initialize; the server is useless without
/// them.
pub async fn run_server() -> std::io::Result<()> {
    pretty_env_logger::init_custom_env("RUST_LOG");

    log::info!("Connecting to database...");
    let db_conn = db::connect_from_env()
        .await
        .expect("Failed to connect to database");

    log::info!("Running migrations...");
    run_migrations(db_conn.as_ref())
        .await
        .expect("Failed to run migrations");

    let tables = ScoringTables::from_env().expect("Failed to load scoring weight tables");
    let routing = RoutingClient::from_env().expect("Failed to build routing client");
    let feed = PoliceClient::from_env().expect("Failed to build crime feed client");

    let default_lookback = std::env::var("SAFEROUTE_LOOKBACK")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_LOOKBACK_MONTHS);

    let state = web::Data::new(AppState {
        db: Arc::from(db_conn),
        cache: Arc::new(QueryCache::from_env()),
        tables: Arc::new(tables),
        routing: Arc::new(routing),
        feed: Arc::new(feed),
        bbox: bbox_from_env(),
        default_lookback,
        route_deadline: saferoute_routes::deadline_from_env(),
    });

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    log::info!("Starting server on {bind_addr}:{port}");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .service(
                web::scope("/api")
                    .route("/health", web::get().to(handlers::health))
                    .service(
                        web::scope("/v1")
                            .route("/safety/snapshot", web::get().to(handlers::safety_snapshot))
                            .route("/routes/safe", web::post().to(handlers::safe_routes))
                            .service(
                                web::scope("/admin")
                                    .route(
                                        "/ingest-latest",
                                        web::post().to(handlers::ingest_latest),
                                    )
                                    .route("/ingest-month", web::post().to(handlers::ingest_month))
                                    .route("/rebuild-grid", web::post().to(handlers::rebuild_grid))
                                    .route("/grid-health", web::get().to(handlers::grid_health)),
                            ),
                    ),
            )
    })
    .bind((bind_addr, port))?
    .run()
    .await
}
