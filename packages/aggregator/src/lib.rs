#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Aggregation pipeline: crime events in, safety grid cells out.
//!
//! [`rebuild`] re-derives the `(h3, month)` buckets for the last N months
//! from the event store; [`ingest_month`] pulls one month from the crime
//! feed, upserts the events, and re-aggregates just that month. Both are
//! idempotent and bump the grid version on success so cached reads expire.
//!
//! Buckets hold *base* harm-weighted counts only. Recency and time-of-day
//! multipliers are applied at query time, so every temporal filter shares
//! one materialization.
//!
//! `PostgreSQL` advisory locks serialize conflicting aggregations: a rebuild
//! takes the whole-grid key plus every month it touches, a month ingestion
//! takes just its month key. The second acquirer gets [`AggregateError::Busy`].

use std::collections::BTreeMap;

use chrono::NaiveDate;
use saferoute_database::queries::{self, EVENT_PAGE_SIZE, GRID_LOCK_KEY, NewSafetyCell};
use saferoute_database::DbError;
use saferoute_database_models::{BoundingBox, CrimeEventRow, IngestionStatus};
use saferoute_feed::{FeedError, PoliceClient, normalize_batch, quadrant_tiles};
use saferoute_grid::GridError;
use saferoute_scoring::{CrimeCategory, ScoringTables, month_floor_back};
use serde::{Deserialize, Serialize};
use switchy_database::Database;

/// Page size used when streaming cells for grid-health validation.
const HEALTH_PAGE_SIZE: i64 = 5_000;

/// Float tolerance for the weighted-count conservation check.
const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Errors raised by aggregation operations.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    /// A conflicting aggregation holds the advisory lock.
    #[error("Aggregation busy: {scope} is locked by another run")]
    Busy {
        /// Which lock could not be acquired.
        scope: String,
    },

    /// Invalid operation input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Database failure.
    #[error(transparent)]
    Db(#[from] DbError),

    /// Crime feed failure.
    #[error(transparent)]
    Feed(#[from] FeedError),

    /// Grid index failure.
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// One in-memory `(h3, month)` bucket during a fold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellBucket {
    /// Raw event count.
    pub count: u64,
    /// Sum of harm weights over the bucket's events.
    pub weighted: f64,
    /// Per-category counts, keyed by canonical slug.
    pub stats: BTreeMap<String, u64>,
}

/// Folds events into `(h3_index, month)` buckets.
///
/// Event categories are normalized into the closed taxonomy *before*
/// counting, so an unknown slug lands in the `other` histogram bucket and
/// carries `other`'s harm weight. Events whose coordinates do not resolve
/// to a grid cell are skipped and counted.
///
/// Deterministic: the same events always produce the same buckets, which
/// is what makes rebuilds idempotent.
#[must_use]
pub fn fold_events(
    events: &[CrimeEventRow],
    tables: &ScoringTables,
) -> (BTreeMap<(String, NaiveDate), CellBucket>, u64) {
    let mut buckets: BTreeMap<(String, NaiveDate), CellBucket> = BTreeMap::new();
    let mut skipped = 0u64;

    for event in events {
        let Ok(cell) = saferoute_grid::cell_of(event.latitude, event.longitude) else {
            log::warn!(
                "Event {} has unusable coordinates ({}, {}), skipping",
                event.external_id,
                event.latitude,
                event.longitude,
            );
            skipped += 1;
            continue;
        };

        let category = CrimeCategory::from_slug(&event.category);

        let bucket = buckets
            .entry((cell.to_string(), event.month))
            .or_default();
        bucket.count += 1;
        bucket.weighted += tables.harm_weight(category);
        *bucket.stats.entry(category.to_string()).or_insert(0) += 1;
    }

    (buckets, skipped)
}

/// Streams one month's events from the store and replaces its cells.
///
/// Returns the number of cells written.
async fn aggregate_month(
    db: &dyn Database,
    tables: &ScoringTables,
    month: NaiveDate,
) -> Result<u64, AggregateError> {
    let mut buckets: BTreeMap<(String, NaiveDate), CellBucket> = BTreeMap::new();
    let mut after_id = 0i64;
    let mut scanned = 0u64;

    loop {
        let page = queries::events_in_month_page(db, month, after_id, EVENT_PAGE_SIZE).await?;
        if page.is_empty() {
            break;
        }

        after_id = page.last().map_or(after_id, |e| e.id);
        scanned += page.len() as u64;

        let (page_buckets, _skipped) = fold_events(&page, tables);
        for (key, bucket) in page_buckets {
            let merged = buckets.entry(key).or_default();
            merged.count += bucket.count;
            merged.weighted += bucket.weighted;
            for (cat, count) in bucket.stats {
                *merged.stats.entry(cat).or_insert(0) += count;
            }
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        if page.len() < EVENT_PAGE_SIZE as usize {
            break;
        }
    }

    let mut cells = Vec::with_capacity(buckets.len());
    for ((h3_index, bucket_month), bucket) in buckets {
        let cell = saferoute_grid::parse_cell(&h3_index)?;
        let ring = saferoute_grid::boundary_coords(cell);
        let wkt_coords = ring
            .iter()
            .map(|c| format!("{} {}", c[0], c[1]))
            .collect::<Vec<_>>()
            .join(", ");

        cells.push(NewSafetyCell {
            cell_id: saferoute_grid::cell_key(cell, bucket_month),
            h3_index,
            month: bucket_month,
            crime_count_total: bucket.count,
            crime_count_weighted: bucket.weighted,
            stats: bucket.stats,
            geom_wkt: format!("POLYGON(({wkt_coords}))"),
        });
    }

    let written = cells.len() as u64;
    queries::replace_cells_for_month(db, month, &cells).await?;

    log::info!(
        "Aggregated {} ({scanned} events -> {written} cells)",
        month.format("%Y-%m"),
    );

    Ok(written)
}

/// Outcome of a [`rebuild`] run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildSummary {
    /// Months re-aggregated, most recent first.
    pub months: Vec<NaiveDate>,
    /// Cells written across all months.
    pub cells_written: u64,
    /// Grid version after the rebuild.
    pub version: u64,
}

/// Deterministically rebuilds the safety grid for the last `months` months.
///
/// Each month is replaced inside its own transaction, so readers observe a
/// month either fully rebuilt or untouched. Cells for months outside the
/// window are left in place; queries gate on their month window instead.
///
/// # Errors
///
/// Returns [`AggregateError::Busy`] if another rebuild or a conflicting
/// month ingestion is running, or any database/grid failure.
pub async fn rebuild(
    db: &dyn Database,
    tables: &ScoringTables,
    current_month: NaiveDate,
    months: u32,
) -> Result<RebuildSummary, AggregateError> {
    if months == 0 {
        return Err(AggregateError::InvalidInput(
            "rebuild requires at least one month".to_string(),
        ));
    }

    let month_set: Vec<NaiveDate> = (0..months)
        .map(|k| month_floor_back(current_month, k))
        .collect();

    let mut held: Vec<i64> = Vec::with_capacity(month_set.len() + 1);

    let locked = queries::try_advisory_lock(db, GRID_LOCK_KEY).await?;
    if !locked {
        return Err(AggregateError::Busy {
            scope: "grid".to_string(),
        });
    }
    held.push(GRID_LOCK_KEY);

    for &month in &month_set {
        let key = queries::month_lock_key(month);
        if queries::try_advisory_lock(db, key).await? {
            held.push(key);
        } else {
            release_locks(db, &held).await;
            return Err(AggregateError::Busy {
                scope: format!("month {}", month.format("%Y-%m")),
            });
        }
    }

    let result = rebuild_locked(db, tables, &month_set).await;
    release_locks(db, &held).await;
    result
}

async fn rebuild_locked(
    db: &dyn Database,
    tables: &ScoringTables,
    month_set: &[NaiveDate],
) -> Result<RebuildSummary, AggregateError> {
    log::info!("Rebuilding safety grid for {} month(s)", month_set.len());

    let mut cells_written = 0u64;
    for &month in month_set {
        cells_written += aggregate_month(db, tables, month).await?;
    }

    let version = queries::bump_grid_version(db).await?;
    log::info!("Grid rebuild complete: {cells_written} cells, version {version}");

    Ok(RebuildSummary {
        months: month_set.to_vec(),
        cells_written,
        version,
    })
}

async fn release_locks(db: &dyn Database, keys: &[i64]) {
    for &key in keys {
        if let Err(e) = queries::advisory_unlock(db, key).await {
            log::error!("Failed to release advisory lock {key}: {e}");
        }
    }
}

/// Outcome of an [`ingest_month`] run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSummary {
    /// The ingested month.
    pub month: NaiveDate,
    /// Whether the run was skipped because a previous run already
    /// succeeded for this month.
    pub skipped: bool,
    /// Final run status.
    pub status: IngestionStatus,
    /// Events upserted.
    pub records_ingested: u64,
    /// Malformed records skipped.
    pub records_skipped: u64,
    /// Cells written by the re-aggregation.
    pub cells_written: u64,
    /// Grid version after the run (unchanged when skipped).
    pub version: u64,
}

/// Fetches one month from the crime feed, upserts its events, and
/// re-aggregates that month.
///
/// Idempotent: a month whose latest run already succeeded is skipped
/// unless `force` is set, and re-ingesting the same feed data produces an
/// identical cell set. Different months may be ingested concurrently; the
/// same month is guarded by its advisory lock.
///
/// # Errors
///
/// Returns [`AggregateError::Busy`] on lock conflict,
/// [`AggregateError::Feed`] when the feed fails after retries or more than
/// 10% of a batch is malformed, or any database/grid failure.
pub async fn ingest_month(
    db: &dyn Database,
    client: &PoliceClient,
    tables: &ScoringTables,
    bbox: &BoundingBox,
    month: NaiveDate,
    force: bool,
) -> Result<IngestSummary, AggregateError> {
    if !bbox.is_valid() {
        return Err(AggregateError::InvalidInput(format!(
            "degenerate operational bbox: {bbox:?}"
        )));
    }

    if !force {
        if let Some(run) = queries::latest_ingestion_run(db, month).await? {
            if run.status == IngestionStatus::Success {
                log::info!(
                    "Ingestion already completed for {}, skipping",
                    month.format("%Y-%m")
                );
                return Ok(IngestSummary {
                    month,
                    skipped: true,
                    status: IngestionStatus::Success,
                    records_ingested: run.records_ingested,
                    records_skipped: run.records_skipped,
                    cells_written: 0,
                    version: queries::grid_version(db).await?,
                });
            }
        }
    }

    let lock_key = queries::month_lock_key(month);
    if !queries::try_advisory_lock(db, lock_key).await? {
        return Err(AggregateError::Busy {
            scope: format!("month {}", month.format("%Y-%m")),
        });
    }

    let result = ingest_month_locked(db, client, tables, bbox, month).await;
    release_locks(db, &[lock_key]).await;
    result
}

async fn ingest_month_locked(
    db: &dyn Database,
    client: &PoliceClient,
    tables: &ScoringTables,
    bbox: &BoundingBox,
    month: NaiveDate,
) -> Result<IngestSummary, AggregateError> {
    log::info!("Starting ingestion for {}", month.format("%Y-%m"));

    let tiles = quadrant_tiles(bbox);
    #[allow(clippy::cast_possible_truncation)]
    let run_id = queries::create_ingestion_run(db, month, tiles.len() as u32).await?;

    let mut ingested = 0u64;
    let mut skipped = 0u64;
    let mut tiles_processed = 0u32;
    let mut tile_errors: Vec<String> = Vec::new();

    for (idx, tile) in tiles.iter().enumerate() {
        log::info!("Processing tile {}/{}", idx + 1, tiles.len());

        let raws = match client.crimes_with_split(tile, month, 0).await {
            Ok(raws) => raws,
            Err(e) => {
                log::error!("Tile {} failed: {e}", idx + 1);
                tile_errors.push(format!("tile {}: {e}", idx + 1));
                continue;
            }
        };

        // A batch that is mostly garbage aborts the whole run; the feed is
        // the source of truth and partial nonsense must not overwrite it.
        let batch = match normalize_batch(&raws, client.force_id()) {
            Ok(batch) => batch,
            Err(e) => {
                queries::finish_ingestion_run(
                    db,
                    run_id,
                    IngestionStatus::Failed,
                    Some(&e.to_string()),
                )
                .await?;
                return Err(e.into());
            }
        };

        ingested += queries::upsert_events(db, &batch.events).await?;
        skipped += batch.skipped as u64;
        tiles_processed += 1;

        queries::update_ingestion_progress(db, run_id, tiles_processed, ingested, skipped).await?;
    }

    #[allow(clippy::cast_possible_truncation)]
    let status = if tiles_processed == tiles.len() as u32 {
        IngestionStatus::Success
    } else if tiles_processed > 0 {
        IngestionStatus::Partial
    } else {
        IngestionStatus::Failed
    };

    if status == IngestionStatus::Failed {
        let message = tile_errors.join("; ");
        queries::finish_ingestion_run(db, run_id, status, Some(&message)).await?;
        return Err(AggregateError::Feed(FeedError::Upstream { message }));
    }

    let cells_written = aggregate_month(db, tables, month).await?;
    let version = queries::bump_grid_version(db).await?;

    let error_message = if tile_errors.is_empty() {
        None
    } else {
        Some(tile_errors.join("; "))
    };
    queries::finish_ingestion_run(db, run_id, status, error_message.as_deref()).await?;

    log::info!(
        "Ingestion complete for {}: status {status}, {ingested} ingested, {skipped} skipped, \
         {cells_written} cells, version {version}",
        month.format("%Y-%m"),
    );

    Ok(IngestSummary {
        month,
        skipped: false,
        status,
        records_ingested: ingested,
        records_skipped: skipped,
        cells_written,
        version,
    })
}

/// Grid-health report produced by [`validate_grid`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridHealthReport {
    /// Cells examined.
    pub cells_checked: u64,
    /// Cells whose `crime_count_total` disagrees with their histogram sum.
    pub count_mismatches: u64,
    /// Cells whose `crime_count_weighted` disagrees with the recomputed
    /// harm-weighted sum beyond tolerance.
    pub weighted_mismatches: u64,
    /// Cells whose `h3_index` is invalid or not at resolution 10.
    pub invalid_h3: u64,
    /// Cells whose `cell_id` does not match `"{h3}_{YYYYMM}"`.
    pub malformed_keys: u64,
}

impl GridHealthReport {
    /// Whether every checked cell satisfied the invariants.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.count_mismatches == 0
            && self.weighted_mismatches == 0
            && self.invalid_h3 == 0
            && self.malformed_keys == 0
    }
}

/// Streams the whole cell table and checks the aggregation invariants.
///
/// Violations are logged per cell and tallied; scoring paths exclude such
/// cells at read time, so validation never mutates anything.
///
/// # Errors
///
/// Returns [`AggregateError`] if the database scan fails.
pub async fn validate_grid(
    db: &dyn Database,
    tables: &ScoringTables,
) -> Result<GridHealthReport, AggregateError> {
    let mut report = GridHealthReport::default();
    let mut after = String::new();

    loop {
        let page = queries::cells_page(db, &after, HEALTH_PAGE_SIZE).await?;
        if page.is_empty() {
            break;
        }
        after = page.last().map_or_else(String::new, |c| c.cell_id.clone());

        for cell in &page {
            report.cells_checked += 1;

            let stats_total: u64 = cell.stats.values().sum();
            if stats_total != cell.crime_count_total {
                log::warn!(
                    "Cell {}: crime_count_total {} != histogram sum {stats_total}",
                    cell.cell_id,
                    cell.crime_count_total,
                );
                report.count_mismatches += 1;
            }

            let recomputed: f64 = cell
                .stats
                .iter()
                .map(|(slug, &count)| {
                    #[allow(clippy::cast_precision_loss)]
                    let count = count as f64;
                    tables.harm_weight(CrimeCategory::from_slug(slug)) * count
                })
                .sum();
            if (recomputed - cell.crime_count_weighted).abs() > WEIGHT_TOLERANCE {
                log::warn!(
                    "Cell {}: crime_count_weighted {} != recomputed {recomputed}",
                    cell.cell_id,
                    cell.crime_count_weighted,
                );
                report.weighted_mismatches += 1;
            }

            match saferoute_grid::parse_cell(&cell.h3_index) {
                Ok(parsed) => {
                    if saferoute_grid::cell_key(parsed, cell.month) != cell.cell_id {
                        log::warn!("Cell {}: key does not match h3/month", cell.cell_id);
                        report.malformed_keys += 1;
                    }
                }
                Err(e) => {
                    log::warn!("Cell {}: {e}", cell.cell_id);
                    report.invalid_h3 += 1;
                }
            }
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        if page.len() < HEALTH_PAGE_SIZE as usize {
            break;
        }
    }

    if report.is_healthy() {
        log::info!("Grid health OK: {} cells checked", report.cells_checked);
    } else {
        log::error!(
            "Grid health violations: {} count, {} weighted, {} h3, {} keys (of {} cells)",
            report.count_mismatches,
            report.weighted_mismatches,
            report.invalid_h3,
            report.malformed_keys,
            report.cells_checked,
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, lat: f64, lon: f64, category: &str, month: NaiveDate) -> CrimeEventRow {
        CrimeEventRow {
            id: 0,
            external_id: id.to_string(),
            month,
            category: category.to_string(),
            longitude: lon,
            latitude: lat,
            force_id: "hampshire".to_string(),
            output_area_code: None,
            location_desc: "On or near High Street".to_string(),
        }
    }

    fn june() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    #[test]
    fn fold_groups_by_cell_and_month() {
        let tables = ScoringTables::default();
        let may = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();

        // Two co-located events in June, one in May, one far away.
        let events = vec![
            event("a", 50.9079, -1.4049, "violent-crime", june()),
            event("b", 50.9079, -1.4049, "burglary", june()),
            event("c", 50.9079, -1.4049, "burglary", may),
            event("d", 50.9500, -1.3500, "drugs", june()),
        ];

        let (buckets, skipped) = fold_events(&events, &tables);
        assert_eq!(skipped, 0);
        assert_eq!(buckets.len(), 3);

        let cell = saferoute_grid::cell_of(50.9079, -1.4049).unwrap().to_string();
        let bucket = &buckets[&(cell.clone(), june())];
        assert_eq!(bucket.count, 2);
        assert!((bucket.weighted - 5.0).abs() < 1e-9);
        assert_eq!(bucket.stats["violent-crime"], 1);
        assert_eq!(bucket.stats["burglary"], 1);

        let may_bucket = &buckets[&(cell, may)];
        assert_eq!(may_bucket.count, 1);
        assert!((may_bucket.weighted - 2.0).abs() < 1e-9);
    }

    #[test]
    fn fold_conserves_counts_and_weights() {
        let tables = ScoringTables::default();
        let events: Vec<CrimeEventRow> = (0..200)
            .map(|i| {
                let category = match i % 4 {
                    0 => "violent-crime",
                    1 => "burglary",
                    2 => "anti-social-behaviour",
                    _ => "bicycle-theft",
                };
                #[allow(clippy::cast_precision_loss)]
                let jitter = f64::from(i) * 0.0004;
                event(&format!("e{i}"), 50.88 + jitter, -1.45 + jitter, category, june())
            })
            .collect();

        let (buckets, skipped) = fold_events(&events, &tables);
        assert_eq!(skipped, 0);

        let total: u64 = buckets.values().map(|b| b.count).sum();
        assert_eq!(total, 200);

        for bucket in buckets.values() {
            // crime_count_total == sum(stats.values())
            let histogram_sum: u64 = bucket.stats.values().sum();
            assert_eq!(bucket.count, histogram_sum);

            // crime_count_weighted == sum(harm * count) within tolerance
            let recomputed: f64 = bucket
                .stats
                .iter()
                .map(|(slug, &count)| {
                    #[allow(clippy::cast_precision_loss)]
                    let count = count as f64;
                    tables.harm_weight(CrimeCategory::from_slug(slug)) * count
                })
                .sum();
            assert!((recomputed - bucket.weighted).abs() < WEIGHT_TOLERANCE);
        }
    }

    #[test]
    fn fold_is_deterministic() {
        let tables = ScoringTables::default();
        let events: Vec<CrimeEventRow> = (0..1000)
            .map(|i| {
                let category = match i % 5 {
                    0 => "violent-crime",
                    1 => "burglary",
                    2 => "robbery",
                    3 => "shoplifting",
                    _ => "other-theft",
                };
                #[allow(clippy::cast_precision_loss)]
                let lat = 50.86 + f64::from(i % 37) * 0.002;
                #[allow(clippy::cast_precision_loss)]
                let lon = -1.52 + f64::from(i % 29) * 0.003;
                event(&format!("e{i}"), lat, lon, category, june())
            })
            .collect();

        let (first, _) = fold_events(&events, &tables);
        let (second, _) = fold_events(&events, &tables);
        assert_eq!(first, second);
    }

    #[test]
    fn fold_normalizes_unknown_categories_before_counting() {
        let tables = ScoringTables::default();
        let events = vec![
            event("a", 50.9079, -1.4049, "warp-core-breach", june()),
            event("b", 50.9079, -1.4049, "other-crime", june()),
        ];

        let (buckets, _) = fold_events(&events, &tables);
        let bucket = buckets.values().next().unwrap();

        // Both normalize to `other` before aggregation: the histogram never
        // leaks feed slugs outside the taxonomy.
        assert_eq!(bucket.stats.len(), 1);
        assert_eq!(bucket.stats["other"], 2);
        assert!((bucket.weighted - 2.0).abs() < 1e-9);
    }

    #[test]
    fn fold_skips_unresolvable_coordinates() {
        let tables = ScoringTables::default();
        let events = vec![
            event("good", 50.9079, -1.4049, "burglary", june()),
            event("bad", 95.0, -1.4049, "burglary", june()),
        ];

        let (buckets, skipped) = fold_events(&events, &tables);
        assert_eq!(skipped, 1);
        assert_eq!(buckets.values().map(|b| b.count).sum::<u64>(), 1);
    }
}
