#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Safety heatmap snapshots.
//!
//! A snapshot is the read-side view of the grid over a bounding box and
//! month window: cells are grouped by H3 index across months, each member
//! weighted by recency (and optionally by the time-of-day prior), then
//! pushed through the shared risk function. The query month window spans
//! `months_ago ∈ [0, lookback]`, so a 12-month lookback reaches the 0.35
//! recency band.
//!
//! Recency and time-of-day never touch storage; the in-memory fold in
//! [`aggregate_cells`] is where all temporal weighting happens.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use saferoute_database::queries;
use saferoute_database::DbError;
use saferoute_database_models::{BoundingBox, SafetyCellRecord};
use saferoute_scoring::{
    CrimeCategory, RiskClass, ScoringTables, TimeOfDay, months_between, month_floor_back,
    recency_weight, risk_score, safety_score,
};
use serde::{Deserialize, Serialize};
use switchy_database::Database;

/// Bounds on the query lookback window, in months.
pub const MIN_LOOKBACK_MONTHS: u32 = 1;
/// Upper bound on the query lookback window.
pub const MAX_LOOKBACK_MONTHS: u32 = 24;

/// Float tolerance for the weighted-count consistency check at read time.
const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Errors raised by the snapshot service.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// The request failed validation; never reaches the database.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Database failure.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// A validated snapshot query.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRequest {
    /// Query bounding box (WGS84).
    pub bbox: BoundingBox,
    /// Number of months to look back, within `[1, 24]`.
    pub lookback_months: u32,
    /// Optional diurnal weighting bucket.
    pub time_of_day: Option<TimeOfDay>,
}

impl SnapshotRequest {
    /// Validates the raw query parameters.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::InvalidInput`] for a degenerate bbox or an
    /// out-of-range lookback.
    pub fn new(
        bbox: BoundingBox,
        lookback_months: u32,
        time_of_day: Option<TimeOfDay>,
    ) -> Result<Self, SnapshotError> {
        if !bbox.is_valid() {
            return Err(SnapshotError::InvalidInput(format!(
                "invalid bbox: {},{},{},{} (expected min_lon,min_lat,max_lon,max_lat)",
                bbox.west, bbox.south, bbox.east, bbox.north,
            )));
        }

        if !(MIN_LOOKBACK_MONTHS..=MAX_LOOKBACK_MONTHS).contains(&lookback_months) {
            return Err(SnapshotError::InvalidInput(format!(
                "lookback_months must be in [{MIN_LOOKBACK_MONTHS}, {MAX_LOOKBACK_MONTHS}], \
                 got {lookback_months}"
            )));
        }

        Ok(Self {
            bbox,
            lookback_months,
            time_of_day,
        })
    }
}

/// One H3 group after the temporal reduction, before scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct CellAggregate {
    /// H3 resolution-10 index.
    pub h3_index: String,
    /// Recency- and tod-weighted total across the group's months.
    pub weighted: f64,
    /// Raw event count (unweighted).
    pub crime_count: u64,
    /// Merged category histogram (unweighted).
    pub stats: BTreeMap<String, u64>,
    /// Number of `(cell, month)` members merged into this group.
    pub months_data: usize,
}

/// Returns whether a stored cell satisfies the read-time invariants.
///
/// A violating cell is logged and excluded from scoring; the snapshot
/// continues without it.
fn is_consistent(record: &SafetyCellRecord, tables: &ScoringTables) -> bool {
    let histogram_sum: u64 = record.stats.values().sum();
    if histogram_sum != record.crime_count_total {
        log::warn!(
            "Excluding inconsistent cell {}: total {} != histogram sum {histogram_sum}",
            record.cell_id,
            record.crime_count_total,
        );
        return false;
    }

    let recomputed: f64 = record
        .stats
        .iter()
        .map(|(slug, &count)| {
            #[allow(clippy::cast_precision_loss)]
            let count = count as f64;
            tables.harm_weight(CrimeCategory::from_slug(slug)) * count
        })
        .sum();
    if (recomputed - record.crime_count_weighted).abs() > WEIGHT_TOLERANCE {
        log::warn!(
            "Excluding inconsistent cell {}: weighted {} != recomputed {recomputed}",
            record.cell_id,
            record.crime_count_weighted,
        );
        return false;
    }

    if saferoute_grid::parse_cell(&record.h3_index).is_err() {
        log::warn!(
            "Excluding inconsistent cell {}: invalid h3 index {}",
            record.cell_id,
            record.h3_index,
        );
        return false;
    }

    true
}

/// Groups `(cell, month)` records by H3 index with temporal weighting.
///
/// For each member: `k = months_ago(month)`; the member's weighted value is
/// either the stored base weighted count or, when a time-of-day bucket or
/// category overrides are given, the histogram refolded through those
/// multipliers; the member contributes `value · recency_weight(k)` to its
/// group. Histograms merge unweighted. Members older than the lookback
/// window are ignored.
///
/// The route scorer shares this fold (with its per-category overrides), so
/// a hexagon and a route segment crossing it always weight a cell the same
/// way.
#[must_use]
pub fn aggregate_cells(
    records: &[SafetyCellRecord],
    current_month: NaiveDate,
    lookback_months: u32,
    time_of_day: Option<TimeOfDay>,
    overrides: Option<&BTreeMap<String, f64>>,
    tables: &ScoringTables,
) -> Vec<CellAggregate> {
    let mut groups: BTreeMap<String, CellAggregate> = BTreeMap::new();

    for record in records {
        let months_ago = months_between(record.month, current_month);
        if months_ago > lookback_months {
            continue;
        }

        if !is_consistent(record, tables) {
            continue;
        }

        let member_value = if time_of_day.is_some() || overrides.is_some() {
            tables.weighted_value(&record.stats, time_of_day, overrides)
        } else {
            record.crime_count_weighted
        };

        let group = groups
            .entry(record.h3_index.clone())
            .or_insert_with(|| CellAggregate {
                h3_index: record.h3_index.clone(),
                weighted: 0.0,
                crime_count: 0,
                stats: BTreeMap::new(),
                months_data: 0,
            });

        group.weighted += member_value * recency_weight(months_ago);
        group.crime_count += record.crime_count_total;
        group.months_data += 1;
        for (slug, &count) in &record.stats {
            if count > 0 {
                *group.stats.entry(slug.clone()).or_insert(0) += count;
            }
        }
    }

    groups.into_values().collect()
}

/// One scored heatmap cell in a snapshot response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCell {
    /// H3 resolution-10 index.
    pub id: String,
    /// Closed `GeoJSON` polygon of the cell boundary.
    pub geometry: geojson::Geometry,
    /// Safety score, 0-100, 1 decimal.
    pub safety_score: f64,
    /// Risk score, 0-1, 3 decimals.
    pub risk_score: f64,
    /// Risk classification.
    pub risk_class: RiskClass,
    /// Raw event count across the window.
    pub crime_count: u64,
    /// Recency/tod-weighted total, 2 decimals.
    pub crime_count_weighted: f64,
    /// Number of months with data for this cell.
    pub months_data: usize,
    /// Category histogram; zero-count categories omitted.
    pub crime_breakdown: BTreeMap<String, u64>,
}

/// Snapshot summary statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSummary {
    /// Number of cells returned.
    pub total_cells: usize,
    /// Sum of raw crime counts across cells.
    pub total_crimes: u64,
    /// Mean safety score, 1 decimal (100.0 when no cells).
    pub avg_safety_score: f64,
    /// H3 index of the riskiest cell (lexicographic tie-break).
    pub highest_risk_cell: Option<String>,
    /// H3 index of the safest cell (lexicographic tie-break).
    pub lowest_risk_cell: Option<String>,
}

/// Snapshot request metadata echoed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Query bbox as `[min_lon, min_lat, max_lon, max_lat]`.
    pub bbox: [f64; 4],
    /// Hexagon edge length in meters.
    pub cell_size_m: u32,
    /// Grid type identifier.
    pub grid_type: String,
    /// Requested lookback.
    pub lookback_months: u32,
    /// Requested time-of-day filter.
    pub time_filter: Option<TimeOfDay>,
    /// Months included in the window.
    pub months_included: u32,
}

/// A complete snapshot response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    /// Scored cells, riskiest first.
    pub cells: Vec<SnapshotCell>,
    /// Summary statistics.
    pub summary: SnapshotSummary,
    /// Request metadata.
    pub meta: SnapshotMeta,
}

/// Rounds to 3 decimals for the response contract.
fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Rounds to 2 decimals for the response contract.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Scores the aggregated groups and assembles the response.
///
/// Split from [`build_snapshot`] so the scoring path is testable without a
/// database.
#[must_use]
pub fn score_aggregates(
    aggregates: Vec<CellAggregate>,
    request: &SnapshotRequest,
) -> SnapshotResponse {
    let mut cells: Vec<SnapshotCell> = aggregates
        .into_iter()
        .filter_map(|agg| {
            // The index was validated during aggregation; a failure here
            // means the grid mutated under us, so drop the cell.
            let cell = saferoute_grid::parse_cell(&agg.h3_index).ok()?;
            let ring: Vec<Vec<f64>> = saferoute_grid::boundary_coords(cell)
                .into_iter()
                .map(|c| vec![c[0], c[1]])
                .collect();
            let geometry = geojson::Geometry::new(geojson::Value::Polygon(vec![ring]));

            let risk = risk_score(agg.weighted);
            let safety = safety_score(risk);

            Some(SnapshotCell {
                id: agg.h3_index,
                geometry,
                safety_score: safety,
                risk_score: round3(risk),
                risk_class: RiskClass::from_safety(safety),
                crime_count: agg.crime_count,
                crime_count_weighted: round2(agg.weighted),
                months_data: agg.months_data,
                crime_breakdown: agg.stats,
            })
        })
        .collect();

    // Riskiest first; lexicographic id as the deterministic tie-break.
    cells.sort_by(|a, b| {
        b.risk_score
            .partial_cmp(&a.risk_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });

    let total_crimes: u64 = cells.iter().map(|c| c.crime_count).sum();
    let avg_safety_score = if cells.is_empty() {
        100.0
    } else {
        #[allow(clippy::cast_precision_loss)]
        let mean = cells.iter().map(|c| c.safety_score).sum::<f64>() / cells.len() as f64;
        (mean * 10.0).round() / 10.0
    };

    let highest_risk_cell = cells.first().map(|c| c.id.clone());
    let lowest_risk_cell = cells
        .iter()
        .min_by(|a, b| {
            a.risk_score
                .partial_cmp(&b.risk_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|c| c.id.clone());

    let summary = SnapshotSummary {
        total_cells: cells.len(),
        total_crimes,
        avg_safety_score,
        highest_risk_cell,
        lowest_risk_cell,
    };

    let meta = SnapshotMeta {
        bbox: [
            request.bbox.west,
            request.bbox.south,
            request.bbox.east,
            request.bbox.north,
        ],
        cell_size_m: saferoute_grid::CELL_EDGE_METERS,
        grid_type: saferoute_grid::GRID_TYPE.to_string(),
        lookback_months: request.lookback_months,
        time_filter: request.time_of_day,
        months_included: request.lookback_months + 1,
    };

    SnapshotResponse {
        cells,
        summary,
        meta,
    }
}

/// Builds a safety snapshot for a bounding box and time window.
///
/// `current_month` is the first of the month "now" as seen by the caller;
/// passing it in keeps the output deterministic for a fixed grid state.
///
/// # Errors
///
/// Returns [`SnapshotError`] if the spatial query fails.
pub async fn build_snapshot(
    db: &dyn Database,
    request: &SnapshotRequest,
    current_month: NaiveDate,
    tables: &ScoringTables,
) -> Result<SnapshotResponse, SnapshotError> {
    let from_month = month_floor_back(current_month, request.lookback_months);
    let records =
        queries::cells_in_bbox_between(db, &request.bbox, from_month, current_month).await?;

    log::debug!(
        "Snapshot query matched {} cell-month rows in {}..{}",
        records.len(),
        from_month.format("%Y-%m"),
        current_month.format("%Y-%m"),
    );

    let aggregates = aggregate_cells(
        &records,
        current_month,
        request.lookback_months,
        request.time_of_day,
        None,
        tables,
    );

    Ok(score_aggregates(aggregates, request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bbox() -> BoundingBox {
        BoundingBox::new(-1.46, 50.87, -1.32, 50.95)
    }

    fn request(lookback: u32, tod: Option<TimeOfDay>) -> SnapshotRequest {
        SnapshotRequest::new(bbox(), lookback, tod).unwrap()
    }

    fn month(year: i32, month_num: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month_num, 1).unwrap()
    }

    fn h3_at(lat: f64, lon: f64) -> String {
        saferoute_grid::cell_of(lat, lon).unwrap().to_string()
    }

    fn record(
        h3_index: &str,
        record_month: NaiveDate,
        stats: &[(&str, u64)],
        tables: &ScoringTables,
    ) -> SafetyCellRecord {
        let stats: BTreeMap<String, u64> =
            stats.iter().map(|(k, v)| ((*k).to_string(), *v)).collect();
        let total = stats.values().sum();
        let weighted = tables.weighted_value(&stats, None, None);
        let cell = saferoute_grid::parse_cell(h3_index).unwrap();

        SafetyCellRecord {
            cell_id: saferoute_grid::cell_key(cell, record_month),
            h3_index: h3_index.to_string(),
            month: record_month,
            crime_count_total: total,
            crime_count_weighted: weighted,
            stats,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn request_validation() {
        assert!(SnapshotRequest::new(bbox(), 12, None).is_ok());
        assert!(matches!(
            SnapshotRequest::new(bbox(), 0, None),
            Err(SnapshotError::InvalidInput(_))
        ));
        assert!(matches!(
            SnapshotRequest::new(bbox(), 25, None),
            Err(SnapshotError::InvalidInput(_))
        ));
        assert!(matches!(
            SnapshotRequest::new(BoundingBox::new(-1.32, 50.87, -1.46, 50.95), 12, None),
            Err(SnapshotError::InvalidInput(_))
        ));
    }

    #[test]
    fn single_event_current_month() {
        let tables = ScoringTables::default();
        let now = month(2025, 7);
        let h3 = h3_at(50.9079, -1.4049);

        let records = vec![record(&h3, now, &[("violent-crime", 1)], &tables)];
        let aggregates = aggregate_cells(&records, now, 12, None, None, &tables);
        assert_eq!(aggregates.len(), 1);
        assert!((aggregates[0].weighted - 3.0).abs() < 1e-9);

        let response = score_aggregates(aggregates, &request(12, None));
        let cell = &response.cells[0];
        assert_eq!(cell.crime_count, 1);
        assert!((cell.risk_score - 0.12).abs() < 1e-3);
        assert!((cell.safety_score - 88.0).abs() < 0.1);
        assert_eq!(cell.risk_class, RiskClass::Low);
        assert_eq!(cell.months_data, 1);
    }

    #[test]
    fn night_filter_refolds_the_histogram() {
        let tables = ScoringTables::default();
        let now = month(2025, 7);
        let h3 = h3_at(50.9079, -1.4049);

        let records = vec![record(&h3, now, &[("violent-crime", 1)], &tables)];
        let aggregates = aggregate_cells(&records, now, 12, Some(TimeOfDay::Night), None, &tables);
        assert!((aggregates[0].weighted - 7.5).abs() < 1e-9);

        let response = score_aggregates(aggregates, &request(12, Some(TimeOfDay::Night)));
        assert!((response.cells[0].risk_score - 0.233).abs() < 1e-3);
        assert!((response.cells[0].safety_score - 76.7).abs() < 0.1);
    }

    #[test]
    fn recency_decay_at_window_edge() {
        let tables = ScoringTables::default();
        let now = month(2025, 7);
        let h3 = h3_at(50.9079, -1.4049);

        // One violent crime exactly twelve months ago, lookback 12.
        let records = vec![record(&h3, month(2024, 7), &[("violent-crime", 1)], &tables)];
        let aggregates = aggregate_cells(&records, now, 12, None, None, &tables);
        assert_eq!(aggregates.len(), 1);
        assert!((aggregates[0].weighted - 1.05).abs() < 1e-9);

        let response = score_aggregates(aggregates, &request(12, None));
        assert!((response.cells[0].risk_score - 0.042).abs() < 1e-3);
        assert!((response.cells[0].safety_score - 95.8).abs() < 0.1);
    }

    #[test]
    fn members_outside_the_window_are_ignored() {
        let tables = ScoringTables::default();
        let now = month(2025, 7);
        let h3 = h3_at(50.9079, -1.4049);

        let records = vec![
            record(&h3, month(2025, 7), &[("burglary", 1)], &tables),
            record(&h3, month(2025, 2), &[("burglary", 4)], &tables),
        ];

        // Lookback 3: the February member (5 months old) is out of window.
        let aggregates = aggregate_cells(&records, now, 3, None, None, &tables);
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].crime_count, 1);
        assert_eq!(aggregates[0].months_data, 1);
        assert!((aggregates[0].weighted - 2.0).abs() < 1e-9);
    }

    #[test]
    fn shrinking_lookback_cannot_increase_risk() {
        let tables = ScoringTables::default();
        let now = month(2025, 7);
        let h3 = h3_at(50.9079, -1.4049);

        let records: Vec<SafetyCellRecord> = (0..13)
            .map(|k| record(&h3, month_floor_back(now, k), &[("burglary", 3)], &tables))
            .collect();

        let wide = aggregate_cells(&records, now, 12, None, None, &tables);
        let narrow = aggregate_cells(&records, now, 3, None, None, &tables);

        let wide_risk = risk_score(wide[0].weighted);
        let narrow_risk = risk_score(narrow[0].weighted);
        assert!(narrow_risk <= wide_risk);
    }

    #[test]
    fn groups_merge_months_and_histograms() {
        let tables = ScoringTables::default();
        let now = month(2025, 7);
        let h3 = h3_at(50.9079, -1.4049);

        let records = vec![
            record(&h3, month(2025, 7), &[("burglary", 2), ("drugs", 1)], &tables),
            record(&h3, month(2025, 6), &[("burglary", 1)], &tables),
        ];

        let aggregates = aggregate_cells(&records, now, 12, None, None, &tables);
        assert_eq!(aggregates.len(), 1);

        let group = &aggregates[0];
        assert_eq!(group.crime_count, 4);
        assert_eq!(group.months_data, 2);
        assert_eq!(group.stats["burglary"], 3);
        assert_eq!(group.stats["drugs"], 1);

        // (2*2.0 + 1*1.2) * 1.00 + (1*2.0) * 0.95
        assert!((group.weighted - (5.2 + 1.9)).abs() < 1e-9);
    }

    #[test]
    fn inconsistent_cells_are_excluded_not_fatal() {
        let tables = ScoringTables::default();
        let now = month(2025, 7);
        let h3_good = h3_at(50.9079, -1.4049);
        let h3_bad = h3_at(50.9200, -1.3800);

        let good = record(&h3_good, now, &[("burglary", 1)], &tables);

        let mut broken_total = record(&h3_bad, now, &[("burglary", 2)], &tables);
        broken_total.crime_count_total = 99;

        let mut broken_weight = record(&h3_bad, now, &[("burglary", 2)], &tables);
        broken_weight.crime_count_weighted = 123.0;

        let mut broken_h3 = record(&h3_bad, now, &[("burglary", 2)], &tables);
        broken_h3.h3_index = "not-a-cell".to_string();

        let aggregates = aggregate_cells(
            &[good, broken_total, broken_weight, broken_h3],
            now,
            12,
            None,
            None,
            &tables,
        );

        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].h3_index, h3_good);
    }

    #[test]
    fn empty_window_scores_perfectly_safe() {
        let response = score_aggregates(Vec::new(), &request(12, None));
        assert_eq!(response.summary.total_cells, 0);
        assert!((response.summary.avg_safety_score - 100.0).abs() < f64::EPSILON);
        assert!(response.summary.highest_risk_cell.is_none());
        assert_eq!(response.meta.months_included, 13);
        assert_eq!(response.meta.cell_size_m, 73);
        assert_eq!(response.meta.grid_type, "h3_hexagonal");
    }

    #[test]
    fn summary_ties_break_lexicographically() {
        let tables = ScoringTables::default();
        let now = month(2025, 7);

        let mut indices = vec![h3_at(50.9079, -1.4049), h3_at(50.9200, -1.3800)];
        indices.sort();

        // Identical weights in both cells: the tie must break toward the
        // lexicographically smaller id on both ends.
        let records = vec![
            record(&indices[0], now, &[("burglary", 2)], &tables),
            record(&indices[1], now, &[("burglary", 2)], &tables),
        ];

        let response = score_aggregates(
            aggregate_cells(&records, now, 12, None, None, &tables),
            &request(12, None),
        );

        assert_eq!(response.summary.highest_risk_cell.as_ref(), Some(&indices[0]));
        assert_eq!(response.summary.lowest_risk_cell.as_ref(), Some(&indices[0]));
        assert_eq!(response.summary.total_crimes, 4);
    }

    #[test]
    fn cell_geometry_rings_are_closed() {
        let tables = ScoringTables::default();
        let now = month(2025, 7);
        let h3 = h3_at(50.9079, -1.4049);

        let records = vec![record(&h3, now, &[("burglary", 1)], &tables)];
        let response = score_aggregates(
            aggregate_cells(&records, now, 12, None, None, &tables),
            &request(12, None),
        );

        let geojson::Value::Polygon(rings) = &response.cells[0].geometry.value else {
            panic!("expected polygon geometry");
        };
        assert_eq!(rings.len(), 1);
        assert_eq!(rings[0].first(), rings[0].last());
        assert_eq!(rings[0].len(), 7);
    }
}
