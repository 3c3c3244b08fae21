#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Admin CLI for the SafeRoute scoring engine.
//!
//! Exposes the idempotent aggregation operations for background-job
//! runners and operators: month ingestion, grid rebuilds, and grid-health
//! validation. Scheduling is external; this binary only does the work.

use std::time::Instant;

use chrono::{Datelike, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use saferoute_database::db;
use saferoute_database_models::BoundingBox;
use saferoute_feed::PoliceClient;
use saferoute_scoring::{ScoringTables, month_floor_back};

/// Default operational area: Southampton (`lat_min,lng_min,lat_max,lng_max`).
const DEFAULT_BBOX: &str = "50.85,-1.55,51.0,-1.3";

#[derive(Parser)]
#[command(name = "saferoute", about = "SafeRoute grid administration tool", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest the most recent month the crime feed publishes
    /// (the previous calendar month), then re-aggregate it
    IngestLatest {
        /// Re-ingest even if a previous run already succeeded
        #[arg(long)]
        force: bool,
    },
    /// Ingest a specific month, then re-aggregate it
    IngestMonth {
        /// Calendar year (e.g. 2025)
        year: i32,
        /// Calendar month, 1-12
        month: u32,
        /// Re-ingest even if a previous run already succeeded
        #[arg(long)]
        force: bool,
    },
    /// Rebuild the safety grid from stored events for the last N months
    RebuildGrid {
        /// Number of months to rebuild
        #[arg(long, default_value = "12")]
        months: u32,
    },
    /// Validate the aggregation invariants across the whole grid
    ValidateGridHealth,
}

/// Parses `SAFEROUTE_BBOX` (`"lat_min,lng_min,lat_max,lng_max"`).
fn bbox_from_env() -> Result<BoundingBox, String> {
    let raw = std::env::var("SAFEROUTE_BBOX").unwrap_or_else(|_| DEFAULT_BBOX.to_string());
    let parts: Vec<f64> = raw.split(',').filter_map(|p| p.trim().parse().ok()).collect();

    if parts.len() != 4 {
        return Err(format!(
            "invalid SAFEROUTE_BBOX {raw:?}: expected lat_min,lng_min,lat_max,lng_max"
        ));
    }

    let bbox = BoundingBox::new(parts[1], parts[0], parts[3], parts[2]);
    if bbox.is_valid() {
        Ok(bbox)
    } else {
        Err(format!("degenerate SAFEROUTE_BBOX: {raw}"))
    }
}

/// First day of the current month, UTC.
fn current_month() -> NaiveDate {
    let today = Utc::now().date_naive();
    today.with_day(1).unwrap_or(today)
}

async fn run_ingest(month: NaiveDate, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let db = db::connect_from_env().await?;
    saferoute_database::run_migrations(db.as_ref()).await?;

    let tables = ScoringTables::from_env()?;
    let client = PoliceClient::from_env()?;
    let bbox = bbox_from_env()?;

    let start = Instant::now();
    let summary =
        saferoute_aggregator::ingest_month(db.as_ref(), &client, &tables, &bbox, month, force)
            .await?;

    if summary.skipped {
        log::info!(
            "{} already ingested ({} records), skipped; use --force to re-ingest",
            month.format("%Y-%m"),
            summary.records_ingested,
        );
    } else {
        log::info!(
            "Ingested {}: {} records ({} skipped), {} cells, grid version {} in {:.1}s",
            month.format("%Y-%m"),
            summary.records_ingested,
            summary.records_skipped,
            summary.cells_written,
            summary.version,
            start.elapsed().as_secs_f64(),
        );
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init_custom_env("RUST_LOG");
    let cli = Cli::parse();

    match cli.command {
        Commands::IngestLatest { force } => {
            let month = month_floor_back(current_month(), 1);
            run_ingest(month, force).await?;
        }
        Commands::IngestMonth { year, month, force } => {
            let month = NaiveDate::from_ymd_opt(year, month, 1)
                .ok_or_else(|| format!("invalid month: {year}-{month}"))?;
            run_ingest(month, force).await?;
        }
        Commands::RebuildGrid { months } => {
            let db = db::connect_from_env().await?;
            saferoute_database::run_migrations(db.as_ref()).await?;
            let tables = ScoringTables::from_env()?;

            let start = Instant::now();
            let summary =
                saferoute_aggregator::rebuild(db.as_ref(), &tables, current_month(), months)
                    .await?;

            log::info!(
                "Rebuilt {} month(s): {} cells, grid version {} in {:.1}s",
                summary.months.len(),
                summary.cells_written,
                summary.version,
                start.elapsed().as_secs_f64(),
            );
        }
        Commands::ValidateGridHealth => {
            let db = db::connect_from_env().await?;
            saferoute_database::run_migrations(db.as_ref()).await?;
            let tables = ScoringTables::from_env()?;

            let report = saferoute_aggregator::validate_grid(db.as_ref(), &tables).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            if !report.is_healthy() {
                return Err("grid health validation found invariant violations".into());
            }
        }
    }

    Ok(())
}
