//! Database query functions for the scoring engine.
//!
//! Spatial queries use `query_raw_params()` with `PostGIS` functions.
//! Months are bound as `YYYY-MM-DD` strings and cast with `::date`; the
//! `stats` histogram travels as JSON text cast with `::jsonb`.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use moosicbox_json_utils::database::ToValue as _;
use saferoute_database_models::{BoundingBox, CrimeEventRow, IngestionRunRow, IngestionStatus, SafetyCellRecord};
use saferoute_feed_models::NormalizedEvent;
use switchy_database::{Database, DatabaseValue};

use crate::DbError;

/// Rows fetched per page by the keyset-paginated event scan.
pub const EVENT_PAGE_SIZE: i64 = 10_000;

/// Advisory lock key for whole-grid rebuilds.
pub const GRID_LOCK_KEY: i64 = 0x5AFE_0000;

/// Formats a first-of-month date for a `::date` bind.
fn month_param(month: NaiveDate) -> DatabaseValue {
    DatabaseValue::String(month.format("%Y-%m-%d").to_string())
}

/// Parses a `month::text` column back into a [`NaiveDate`].
fn parse_month(row: &switchy_database::Row, column: &str) -> Result<NaiveDate, DbError> {
    let text: String = row
        .to_value(column)
        .map_err(|e| DbError::conversion(format!("Failed to read {column}: {e}")))?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .map_err(|e| DbError::conversion(format!("Failed to parse month {text:?}: {e}")))
}

/// Advisory lock key for one month's aggregation.
///
/// Derived from the calendar month so that `ingest_month` runs for
/// different months never contend.
#[must_use]
pub fn month_lock_key(month: NaiveDate) -> i64 {
    use chrono::Datelike;
    GRID_LOCK_KEY + i64::from(month.year()) * 100 + i64::from(month.month())
}

/// Attempts to take a session-level advisory lock without waiting.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn try_advisory_lock(db: &dyn Database, key: i64) -> Result<bool, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT pg_try_advisory_lock($1) AS locked",
            &[DatabaseValue::Int64(key)],
        )
        .await?;

    let locked = rows
        .first()
        .map(|row| row.to_value("locked").unwrap_or(false))
        .unwrap_or(false);

    Ok(locked)
}

/// Releases a session-level advisory lock.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn advisory_unlock(db: &dyn Database, key: i64) -> Result<(), DbError> {
    db.query_raw_params(
        "SELECT pg_advisory_unlock($1)",
        &[DatabaseValue::Int64(key)],
    )
    .await?;
    Ok(())
}

/// Opens a transaction on the connection.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn begin(db: &dyn Database) -> Result<(), DbError> {
    db.exec_raw_params("BEGIN", &[]).await?;
    Ok(())
}

/// Commits the open transaction.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn commit(db: &dyn Database) -> Result<(), DbError> {
    db.exec_raw_params("COMMIT", &[]).await?;
    Ok(())
}

/// Rolls back the open transaction.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn rollback(db: &dyn Database) -> Result<(), DbError> {
    db.exec_raw_params("ROLLBACK", &[]).await?;
    Ok(())
}

/// Inserts a batch of normalized events, idempotent on `external_id`.
///
/// Re-ingesting a month never duplicates; on conflict the feed's latest
/// fields overwrite what was stored (the feed is the source of truth).
/// Returns the number of rows written.
///
/// # Errors
///
/// Returns [`DbError`] if any database operation fails.
pub async fn upsert_events(
    db: &dyn Database,
    events: &[NormalizedEvent],
) -> Result<u64, DbError> {
    let mut written = 0u64;

    for event in events {
        let result = db
            .exec_raw_params(
                "INSERT INTO crime_events (
                    external_id, month, category, location,
                    force_id, output_area_code, location_desc
                ) VALUES (
                    $1, $2::date, $3,
                    ST_SetSRID(ST_MakePoint($4, $5), 4326),
                    $6, $7, $8
                )
                ON CONFLICT (external_id) DO UPDATE SET
                    month = EXCLUDED.month,
                    category = EXCLUDED.category,
                    location = EXCLUDED.location,
                    force_id = EXCLUDED.force_id,
                    output_area_code = EXCLUDED.output_area_code,
                    location_desc = EXCLUDED.location_desc",
                &[
                    DatabaseValue::String(event.external_id.clone()),
                    month_param(event.month),
                    DatabaseValue::String(event.category.clone()),
                    DatabaseValue::Real64(event.longitude),
                    DatabaseValue::Real64(event.latitude),
                    DatabaseValue::String(event.force_id.clone()),
                    event
                        .output_area_code
                        .as_ref()
                        .map_or(DatabaseValue::Null, |c| DatabaseValue::String(c.clone())),
                    DatabaseValue::String(event.location_desc.clone()),
                ],
            )
            .await?;

        written += result;
    }

    Ok(written)
}

/// Decodes one `crime_events` row (with `ST_X`/`ST_Y` projected columns).
fn decode_event_row(row: &switchy_database::Row) -> Result<CrimeEventRow, DbError> {
    Ok(CrimeEventRow {
        id: row.to_value("id").unwrap_or(0),
        external_id: row.to_value("external_id").unwrap_or_default(),
        month: parse_month(row, "month_text")?,
        category: row.to_value("category").unwrap_or_default(),
        longitude: row.to_value("longitude").unwrap_or(0.0),
        latitude: row.to_value("latitude").unwrap_or(0.0),
        force_id: row.to_value("force_id").unwrap_or_default(),
        output_area_code: row.to_value("output_area_code").unwrap_or(None),
        location_desc: row.to_value("location_desc").unwrap_or_default(),
    })
}

const EVENT_COLUMNS: &str = "id, external_id, month::text AS month_text, category,
        ST_X(location) AS longitude, ST_Y(location) AS latitude,
        force_id, output_area_code, location_desc";

/// Fetches one keyset page of events for a month, ordered by id.
///
/// Pass the last id of the previous page (or 0) as `after_id`; an empty or
/// short page means the scan is complete. Keeps aggregation memory flat
/// regardless of how many events a month holds.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn events_in_month_page(
    db: &dyn Database,
    month: NaiveDate,
    after_id: i64,
    limit: i64,
) -> Result<Vec<CrimeEventRow>, DbError> {
    let rows = db
        .query_raw_params(
            &format!(
                "SELECT {EVENT_COLUMNS}
                 FROM crime_events
                 WHERE month = $1::date AND id > $2
                 ORDER BY id ASC
                 LIMIT $3"
            ),
            &[
                month_param(month),
                DatabaseValue::Int64(after_id),
                DatabaseValue::Int64(limit),
            ],
        )
        .await?;

    rows.iter().map(decode_event_row).collect()
}

/// Queries events inside a bounding box between two months (inclusive).
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn events_in_bbox_between(
    db: &dyn Database,
    bbox: &BoundingBox,
    from_month: NaiveDate,
    to_month: NaiveDate,
) -> Result<Vec<CrimeEventRow>, DbError> {
    let rows = db
        .query_raw_params(
            &format!(
                "SELECT {EVENT_COLUMNS}
                 FROM crime_events
                 WHERE location && ST_MakeEnvelope($1, $2, $3, $4, 4326)
                   AND month >= $5::date AND month <= $6::date
                 ORDER BY id ASC"
            ),
            &[
                DatabaseValue::Real64(bbox.west),
                DatabaseValue::Real64(bbox.south),
                DatabaseValue::Real64(bbox.east),
                DatabaseValue::Real64(bbox.north),
                month_param(from_month),
                month_param(to_month),
            ],
        )
        .await?;

    rows.iter().map(decode_event_row).collect()
}

/// A safety cell ready for insertion, with its boundary as WKT.
#[derive(Debug, Clone)]
pub struct NewSafetyCell {
    /// Authoritative `"{h3}_{YYYYMM}"` key.
    pub cell_id: String,
    /// H3 cell hex string.
    pub h3_index: String,
    /// Bucket month.
    pub month: NaiveDate,
    /// Raw event count.
    pub crime_count_total: u64,
    /// Harm-weighted count (base weights only).
    pub crime_count_weighted: f64,
    /// Category histogram.
    pub stats: BTreeMap<String, u64>,
    /// Closed polygon boundary as WKT, in WGS84.
    pub geom_wkt: String,
}

/// Replaces all safety cells for one month inside a single transaction.
///
/// Readers either observe the previous month state or the new one, never a
/// mix. Cells with zero events are simply absent; queries treat absence as
/// zero.
///
/// # Errors
///
/// Returns [`DbError`] if any statement fails; the transaction is rolled
/// back before the error propagates.
pub async fn replace_cells_for_month(
    db: &dyn Database,
    month: NaiveDate,
    cells: &[NewSafetyCell],
) -> Result<(), DbError> {
    begin(db).await?;

    let result = replace_cells_inner(db, month, cells).await;

    match result {
        Ok(()) => commit(db).await,
        Err(e) => {
            if let Err(rollback_err) = rollback(db).await {
                log::error!("Rollback failed after cell replace error: {rollback_err}");
            }
            Err(e)
        }
    }
}

async fn replace_cells_inner(
    db: &dyn Database,
    month: NaiveDate,
    cells: &[NewSafetyCell],
) -> Result<(), DbError> {
    db.exec_raw_params(
        "DELETE FROM safety_cells WHERE month = $1::date",
        &[month_param(month)],
    )
    .await?;

    for cell in cells {
        let stats_json = serde_json::to_string(&cell.stats).map_err(|e| {
            DbError::conversion(format!("Failed to serialize stats for {}: {e}", cell.cell_id))
        })?;

        db.exec_raw_params(
            "INSERT INTO safety_cells (
                cell_id, h3_index, month, crime_count_total,
                crime_count_weighted, stats, geom, updated_at
            ) VALUES (
                $1, $2, $3::date, $4, $5, $6::jsonb,
                ST_GeomFromText($7, 4326), NOW()
            )
            ON CONFLICT (cell_id) DO UPDATE SET
                crime_count_total = EXCLUDED.crime_count_total,
                crime_count_weighted = EXCLUDED.crime_count_weighted,
                stats = EXCLUDED.stats,
                geom = EXCLUDED.geom,
                updated_at = NOW()",
            &[
                DatabaseValue::String(cell.cell_id.clone()),
                DatabaseValue::String(cell.h3_index.clone()),
                month_param(cell.month),
                DatabaseValue::Int64(i64::try_from(cell.crime_count_total).unwrap_or(i64::MAX)),
                DatabaseValue::Real64(cell.crime_count_weighted),
                DatabaseValue::String(stats_json),
                DatabaseValue::String(cell.geom_wkt.clone()),
            ],
        )
        .await?;
    }

    Ok(())
}

/// Decodes one `safety_cells` row.
fn decode_cell_row(row: &switchy_database::Row) -> Result<SafetyCellRecord, DbError> {
    let stats_text: String = row.to_value("stats_text").unwrap_or_else(|_| "{}".to_string());
    let stats: BTreeMap<String, u64> = serde_json::from_str(&stats_text)
        .map_err(|e| DbError::conversion(format!("Failed to parse cell stats {stats_text:?}: {e}")))?;

    let total: i64 = row.to_value("crime_count_total").unwrap_or(0);
    let updated_at: chrono::NaiveDateTime = row.to_value("updated_at").unwrap_or_default();

    Ok(SafetyCellRecord {
        cell_id: row.to_value("cell_id").unwrap_or_default(),
        h3_index: row.to_value("h3_index").unwrap_or_default(),
        month: parse_month(row, "month_text")?,
        crime_count_total: u64::try_from(total).unwrap_or(0),
        crime_count_weighted: row.to_value("crime_count_weighted").unwrap_or(0.0),
        stats,
        updated_at: chrono::DateTime::from_naive_utc_and_offset(updated_at, chrono::Utc),
    })
}

const CELL_COLUMNS: &str = "cell_id, h3_index, month::text AS month_text,
        crime_count_total, crime_count_weighted, stats::text AS stats_text, updated_at";

/// Queries safety cells intersecting a bounding box within a month window
/// (inclusive on both ends).
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn cells_in_bbox_between(
    db: &dyn Database,
    bbox: &BoundingBox,
    from_month: NaiveDate,
    to_month: NaiveDate,
) -> Result<Vec<SafetyCellRecord>, DbError> {
    let rows = db
        .query_raw_params(
            &format!(
                "SELECT {CELL_COLUMNS}
                 FROM safety_cells
                 WHERE geom && ST_MakeEnvelope($1, $2, $3, $4, 4326)
                   AND month >= $5::date AND month <= $6::date
                 ORDER BY cell_id ASC"
            ),
            &[
                DatabaseValue::Real64(bbox.west),
                DatabaseValue::Real64(bbox.south),
                DatabaseValue::Real64(bbox.east),
                DatabaseValue::Real64(bbox.north),
                month_param(from_month),
                month_param(to_month),
            ],
        )
        .await?;

    rows.iter().map(decode_cell_row).collect()
}

/// Fetches one keyset page of all safety cells, ordered by `cell_id`.
///
/// Used by grid-health validation to stream the whole table.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn cells_page(
    db: &dyn Database,
    after_cell_id: &str,
    limit: i64,
) -> Result<Vec<SafetyCellRecord>, DbError> {
    let rows = db
        .query_raw_params(
            &format!(
                "SELECT {CELL_COLUMNS}
                 FROM safety_cells
                 WHERE cell_id > $1
                 ORDER BY cell_id ASC
                 LIMIT $2"
            ),
            &[
                DatabaseValue::String(after_cell_id.to_string()),
                DatabaseValue::Int64(limit),
            ],
        )
        .await?;

    rows.iter().map(decode_cell_row).collect()
}

/// Returns the current grid version.
///
/// The version is bumped by every successful rebuild or month ingestion;
/// the cache layer treats entries produced under an older version as
/// misses.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn grid_version(db: &dyn Database) -> Result<u64, DbError> {
    let rows = db
        .query_raw_params("SELECT version FROM grid_meta WHERE id = 1", &[])
        .await?;

    let version: i64 = rows
        .first()
        .map(|row| row.to_value("version").unwrap_or(0))
        .unwrap_or(0);

    Ok(u64::try_from(version).unwrap_or(0))
}

/// Bumps the grid version and returns the new value.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn bump_grid_version(db: &dyn Database) -> Result<u64, DbError> {
    let rows = db
        .query_raw_params(
            "UPDATE grid_meta SET version = version + 1, rebuilt_at = NOW()
             WHERE id = 1
             RETURNING version",
            &[],
        )
        .await?;

    let version: i64 = rows
        .first()
        .map(|row| row.to_value("version").unwrap_or(0))
        .ok_or_else(|| DbError::conversion("grid_meta row missing"))?;

    Ok(u64::try_from(version).unwrap_or(0))
}

/// Decodes one `ingestion_runs` row.
fn decode_run_row(row: &switchy_database::Row) -> Result<IngestionRunRow, DbError> {
    let status_text: String = row.to_value("status").unwrap_or_default();
    let status = status_text
        .parse::<IngestionStatus>()
        .map_err(|_| DbError::conversion(format!("Unknown ingestion status: {status_text}")))?;

    let ingested: i32 = row.to_value("records_ingested").unwrap_or(0);
    let skipped: i32 = row.to_value("records_skipped").unwrap_or(0);
    let processed: i32 = row.to_value("tiles_processed").unwrap_or(0);
    let total: i32 = row.to_value("tiles_total").unwrap_or(0);

    Ok(IngestionRunRow {
        id: row.to_value("id").unwrap_or(0),
        month: parse_month(row, "month_text")?,
        status,
        records_ingested: u64::try_from(ingested).unwrap_or(0),
        records_skipped: u64::try_from(skipped).unwrap_or(0),
        tiles_processed: u32::try_from(processed).unwrap_or(0),
        tiles_total: u32::try_from(total).unwrap_or(0),
        error_message: row.to_value("error_message").unwrap_or(None),
    })
}

/// Returns the most recent ingestion run for a month, if any.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn latest_ingestion_run(
    db: &dyn Database,
    month: NaiveDate,
) -> Result<Option<IngestionRunRow>, DbError> {
    let rows = db
        .query_raw_params(
            "SELECT id, month::text AS month_text, status, records_ingested,
                    records_skipped, tiles_processed, tiles_total, error_message
             FROM ingestion_runs
             WHERE month = $1::date
             ORDER BY started_at DESC
             LIMIT 1",
            &[month_param(month)],
        )
        .await?;

    rows.first().map(decode_run_row).transpose()
}

/// Creates a new `running` ingestion run row and returns its id.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn create_ingestion_run(
    db: &dyn Database,
    month: NaiveDate,
    tiles_total: u32,
) -> Result<i64, DbError> {
    let rows = db
        .query_raw_params(
            "INSERT INTO ingestion_runs (month, status, tiles_total)
             VALUES ($1::date, $2, $3)
             RETURNING id",
            &[
                month_param(month),
                DatabaseValue::String(IngestionStatus::Running.to_string()),
                DatabaseValue::Int32(i32::try_from(tiles_total).unwrap_or(0)),
            ],
        )
        .await?;

    let id: i64 = rows
        .first()
        .map(|row| row.to_value("id").unwrap_or(0))
        .ok_or_else(|| DbError::conversion("Failed to get ingestion run id from insert"))?;

    Ok(id)
}

/// Updates tile/record progress on a running ingestion run.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn update_ingestion_progress(
    db: &dyn Database,
    run_id: i64,
    tiles_processed: u32,
    records_ingested: u64,
    records_skipped: u64,
) -> Result<(), DbError> {
    db.exec_raw_params(
        "UPDATE ingestion_runs SET
            tiles_processed = $2,
            records_ingested = $3,
            records_skipped = $4
         WHERE id = $1",
        &[
            DatabaseValue::Int64(run_id),
            DatabaseValue::Int32(i32::try_from(tiles_processed).unwrap_or(0)),
            DatabaseValue::Int32(i32::try_from(records_ingested).unwrap_or(i32::MAX)),
            DatabaseValue::Int32(i32::try_from(records_skipped).unwrap_or(i32::MAX)),
        ],
    )
    .await?;
    Ok(())
}

/// Marks an ingestion run finished with its final status.
///
/// # Errors
///
/// Returns [`DbError`] if the database operation fails.
pub async fn finish_ingestion_run(
    db: &dyn Database,
    run_id: i64,
    status: IngestionStatus,
    error_message: Option<&str>,
) -> Result<(), DbError> {
    db.exec_raw_params(
        "UPDATE ingestion_runs SET
            status = $2,
            finished_at = NOW(),
            error_message = $3
         WHERE id = $1",
        &[
            DatabaseValue::Int64(run_id),
            DatabaseValue::String(status.to_string()),
            error_message.map_or(DatabaseValue::Null, |m| {
                DatabaseValue::String(m.to_string())
            }),
        ],
    )
    .await?;
    Ok(())
}
