#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Route safety scoring.
//!
//! A candidate polyline is cut into ~100m geodesic segments; each segment
//! is intersected (with a 50m buffer) against the safety grid through an
//! R-tree over projected cell envelopes; each intersecting H3 group is
//! weighted exactly as the snapshot service weights it; segment risk is
//! the mean over its groups and route risk is the mean over its segments,
//! pushed through the same shared risk function that scores heatmap cells.
//!
//! Batch scoring of provider candidates runs under a hard deadline:
//! candidates still outstanding when it expires are cancelled, and partial
//! results are returned if at least one candidate finished.

pub mod segmentation;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::NaiveDate;
use geo::{BoundingRect, Coord, Intersects, LineString, Polygon};
use geo::EuclideanDistance as _;
use rstar::{AABB, RTree, RTreeObject};
use saferoute_database::queries;
use saferoute_database::DbError;
use saferoute_database_models::{BoundingBox, SafetyCellRecord};
use saferoute_routing::{CandidateRoute, RouteInstruction};
use saferoute_scoring::{RiskClass, ScoringTables, TimeOfDay, month_floor_back, risk_score, safety_score};
use saferoute_snapshot::{CellAggregate, aggregate_cells};
use segmentation::{RouteSegment, segment_polyline};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use switchy_database::Database;

/// Target segment length in geodesic meters.
const SEGMENT_TARGET_M: f64 = 100.0;

/// Buffer applied around each segment when intersecting cells, in meters.
const INTERSECT_BUFFER_M: f64 = 50.0;

/// Raw weighted sum at which a segment becomes a hotspot.
const HOTSPOT_HIGH_THRESHOLD: f64 = 50.0;

/// Raw weighted sum above which a hotspot is critical.
const HOTSPOT_CRITICAL_THRESHOLD: f64 = 100.0;

/// Margin added to the polyline bbox when fetching cells, in meters.
/// Covers the segment buffer plus a full hexagon diameter.
const CELL_FETCH_MARGIN_M: f64 = 250.0;

/// Meters per degree of latitude (WGS84, mid-latitudes).
const M_PER_DEG_LAT: f64 = 110_540.0;

/// Meters per degree of longitude at the equator.
const M_PER_DEG_LON_EQUATOR: f64 = 111_320.0;

/// Default hard deadline for scoring a batch of candidates.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

/// Errors raised by the route scorer.
#[derive(Debug, thiserror::Error)]
pub enum RouteScoreError {
    /// The request failed validation; never reaches the database.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The scoring deadline elapsed with zero completed candidates.
    #[error("Route scoring deadline exceeded before any candidate completed")]
    Timeout,

    /// Database failure.
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Reads the batch deadline from `SAFEROUTE_ROUTE_DEADLINE_SECS`.
#[must_use]
pub fn deadline_from_env() -> Duration {
    std::env::var("SAFEROUTE_ROUTE_DEADLINE_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map_or(DEFAULT_DEADLINE, Duration::from_secs)
}

/// Validated query-time scoring preferences.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutePreferences {
    /// Months of history to weigh, within `[1, 24]`.
    pub lookback_months: u32,
    /// Optional diurnal weighting bucket.
    pub time_of_day: Option<TimeOfDay>,
    /// Per-category multiplicative modifiers, applied after harm weight.
    pub category_weights: Option<BTreeMap<String, f64>>,
}

impl RoutePreferences {
    /// Validates raw preference values.
    ///
    /// # Errors
    ///
    /// Returns [`RouteScoreError::InvalidInput`] for an out-of-range
    /// lookback or a negative category weight.
    pub fn new(
        lookback_months: u32,
        time_of_day: Option<TimeOfDay>,
        category_weights: Option<BTreeMap<String, f64>>,
    ) -> Result<Self, RouteScoreError> {
        if !(saferoute_snapshot::MIN_LOOKBACK_MONTHS..=saferoute_snapshot::MAX_LOOKBACK_MONTHS)
            .contains(&lookback_months)
        {
            return Err(RouteScoreError::InvalidInput(format!(
                "lookback_months must be in [1, 24], got {lookback_months}"
            )));
        }

        if let Some(weights) = &category_weights {
            for (slug, &weight) in weights {
                if weight < 0.0 {
                    return Err(RouteScoreError::InvalidInput(format!(
                        "negative category weight for {slug}: {weight}"
                    )));
                }
            }
        }

        Ok(Self {
            lookback_months,
            time_of_day,
            category_weights,
        })
    }
}

/// Severity of a route hotspot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HotspotLevel {
    /// Raw weighted sum in [50, 100].
    High,
    /// Raw weighted sum above 100.
    Critical,
}

/// Per-segment scoring output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentScore {
    /// Position along the route, contiguous from 0.
    pub segment_index: usize,
    /// Segment start as `[lon, lat]`.
    pub start_point: [f64; 2],
    /// Segment end as `[lon, lat]`.
    pub end_point: [f64; 2],
    /// Mean weighted value over intersecting cell groups, 3 decimals.
    pub risk_score: f64,
    /// Number of distinct H3 groups the buffered segment intersects.
    pub cell_count: usize,
}

/// A high-risk stretch of the route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteHotspot {
    /// Index of the offending segment.
    pub segment_index: usize,
    /// Segment midpoint as `[lon, lat]`.
    pub midpoint: [f64; 2],
    /// Hotspot severity.
    pub risk_level: HotspotLevel,
    /// Human-readable description.
    pub description: String,
    /// The segment's raw weighted sum, 3 decimals.
    pub risk_score: f64,
}

/// Aggregated scoring statistics for one route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStats {
    /// Sum of segment risks, 3 decimals.
    pub total_weighted_risk: f64,
    /// Largest segment risk, 3 decimals.
    pub max_segment_risk: f64,
    /// Mean segment risk (the route's `w`), 3 decimals.
    pub avg_segment_risk: f64,
    /// Number of segments.
    pub segment_count: usize,
    /// Per-segment scores.
    pub segments: Vec<SegmentScore>,
    /// High-risk stretches.
    pub hotspots: Vec<RouteHotspot>,
    /// Unweighted category histogram across all intersecting cells.
    pub crime_breakdown: BTreeMap<String, u64>,
    /// Distinct H3 groups intersected by any segment.
    pub cells_analyzed: usize,
}

/// The safety verdict for one polyline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteScore {
    /// Route risk in [0, 1], 3 decimals.
    pub risk_score: f64,
    /// Route safety, 0-100, 1 decimal.
    pub safety_score: f64,
    /// Risk classification.
    pub risk_class: RiskClass,
    /// Detailed statistics.
    pub stats: RouteStats,
}

/// One fully scored candidate route, ranked within its batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredRoute {
    /// 1-based rank within the batch, safest first.
    pub rank: usize,
    /// Whether this is the single recommended route of the batch.
    pub is_recommended: bool,
    /// Route safety, 0-100, 1 decimal.
    pub safety_score: f64,
    /// Risk classification.
    pub risk_class: RiskClass,
    /// Route risk in [0, 1], 3 decimals.
    pub risk_score: f64,
    /// Provider-reported distance in meters.
    pub distance_m: f64,
    /// Provider-reported duration in seconds.
    pub duration_s: f64,
    /// Route polyline as `GeoJSON`.
    pub geometry: geojson::Geometry,
    /// Provider turn-by-turn instructions.
    pub instructions: Vec<RouteInstruction>,
    /// Detailed statistics.
    pub stats: RouteStats,
}

/// Equirectangular projection centered on the route, in meters.
///
/// City-scale routes span a few kilometers, where this projection is
/// accurate to well under a meter; it lets the buffered intersection test
/// work in true meters instead of latitude-dependent degrees.
struct LocalProjection {
    ref_lon: f64,
    ref_lat: f64,
    m_per_deg_lon: f64,
}

impl LocalProjection {
    fn new(ref_lon: f64, ref_lat: f64) -> Self {
        Self {
            ref_lon,
            ref_lat,
            m_per_deg_lon: M_PER_DEG_LON_EQUATOR * ref_lat.to_radians().cos(),
        }
    }

    fn project(&self, point: [f64; 2]) -> Coord<f64> {
        Coord {
            x: (point[0] - self.ref_lon) * self.m_per_deg_lon,
            y: (point[1] - self.ref_lat) * M_PER_DEG_LAT,
        }
    }
}

/// A cell group's projected polygon stored in the R-tree.
struct IndexedCell {
    group: usize,
    envelope: AABB<[f64; 2]>,
    polygon: Polygon<f64>,
}

impl RTreeObject for IndexedCell {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Builds the projected R-tree over the cell groups.
fn build_cell_index(groups: &[CellAggregate], projection: &LocalProjection) -> RTree<IndexedCell> {
    let mut entries = Vec::with_capacity(groups.len());

    for (idx, group) in groups.iter().enumerate() {
        // Indices were validated during aggregation.
        let Ok(cell) = saferoute_grid::parse_cell(&group.h3_index) else {
            continue;
        };

        let ring: Vec<Coord<f64>> = saferoute_grid::boundary_coords(cell)
            .into_iter()
            .map(|c| projection.project(c))
            .collect();
        let polygon = Polygon::new(LineString::from(ring), Vec::new());

        let Some(rect) = polygon.bounding_rect() else {
            continue;
        };

        entries.push(IndexedCell {
            group: idx,
            envelope: AABB::from_corners(
                [rect.min().x, rect.min().y],
                [rect.max().x, rect.max().y],
            ),
            polygon,
        });
    }

    RTree::bulk_load(entries)
}

/// Returns the indices of groups whose cell intersects the buffered
/// segment.
fn intersecting_groups(
    segment: &RouteSegment,
    index: &RTree<IndexedCell>,
    projection: &LocalProjection,
) -> BTreeSet<usize> {
    let line: LineString<f64> = segment
        .points
        .iter()
        .map(|&p| projection.project(p))
        .collect();

    let Some(rect) = line.bounding_rect() else {
        return BTreeSet::new();
    };

    let query = AABB::from_corners(
        [
            rect.min().x - INTERSECT_BUFFER_M,
            rect.min().y - INTERSECT_BUFFER_M,
        ],
        [
            rect.max().x + INTERSECT_BUFFER_M,
            rect.max().y + INTERSECT_BUFFER_M,
        ],
    );

    index
        .locate_in_envelope_intersecting(&query)
        .filter(|entry| {
            line.intersects(&entry.polygon)
                || line.euclidean_distance(&entry.polygon) <= INTERSECT_BUFFER_M
        })
        .map(|entry| entry.group)
        .collect()
}

/// Mean segment risk: the route's `w` fed into the shared risk function.
fn route_risk(segment_risks: &[f64]) -> f64 {
    if segment_risks.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let mean = segment_risks.iter().sum::<f64>() / segment_risks.len() as f64;
    mean
}

/// Rounds to 3 decimals for the response contract.
fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Scores one polyline against a set of cell records.
///
/// Pure with respect to the database: callers supply the `(cell, month)`
/// records covering the route's surroundings. `current_month` anchors the
/// recency weighting.
///
/// # Errors
///
/// Returns [`RouteScoreError::InvalidInput`] for a degenerate polyline.
pub fn score_polyline(
    polyline: &[[f64; 2]],
    records: &[SafetyCellRecord],
    preferences: &RoutePreferences,
    current_month: NaiveDate,
    tables: &ScoringTables,
) -> Result<RouteScore, RouteScoreError> {
    let segments = segment_polyline(polyline, SEGMENT_TARGET_M)?;

    let groups = aggregate_cells(
        records,
        current_month,
        preferences.lookback_months,
        preferences.time_of_day,
        preferences.category_weights.as_ref(),
        tables,
    );

    // Center the projection on the route itself.
    #[allow(clippy::cast_precision_loss)]
    let (ref_lon, ref_lat) = {
        let n = polyline.len() as f64;
        let lon = polyline.iter().map(|p| p[0]).sum::<f64>() / n;
        let lat = polyline.iter().map(|p| p[1]).sum::<f64>() / n;
        (lon, lat)
    };
    let projection = LocalProjection::new(ref_lon, ref_lat);
    let index = build_cell_index(&groups, &projection);

    let mut segment_scores = Vec::with_capacity(segments.len());
    let mut segment_risks = Vec::with_capacity(segments.len());
    let mut hotspots = Vec::new();
    let mut hit_groups: BTreeSet<usize> = BTreeSet::new();

    for segment in &segments {
        let hits = intersecting_groups(segment, &index, &projection);

        let weighted_sum: f64 = hits.iter().map(|&idx| groups[idx].weighted).sum();
        #[allow(clippy::cast_precision_loss)]
        let segment_risk = if hits.is_empty() {
            0.0
        } else {
            weighted_sum / hits.len() as f64
        };

        if weighted_sum >= HOTSPOT_HIGH_THRESHOLD {
            let risk_level = if weighted_sum > HOTSPOT_CRITICAL_THRESHOLD {
                HotspotLevel::Critical
            } else {
                HotspotLevel::High
            };
            hotspots.push(RouteHotspot {
                segment_index: segment.index,
                midpoint: segment.midpoint(),
                risk_level,
                description: format!("High crime area detected (weighted count {weighted_sum:.1})"),
                risk_score: round3(weighted_sum),
            });
        }

        segment_scores.push(SegmentScore {
            segment_index: segment.index,
            start_point: segment.start(),
            end_point: segment.end(),
            risk_score: round3(segment_risk),
            cell_count: hits.len(),
        });
        segment_risks.push(segment_risk);
        hit_groups.extend(hits);
    }

    let mut crime_breakdown: BTreeMap<String, u64> = BTreeMap::new();
    for &idx in &hit_groups {
        for (slug, &count) in &groups[idx].stats {
            *crime_breakdown.entry(slug.clone()).or_insert(0) += count;
        }
    }

    let w_route = route_risk(&segment_risks);
    let risk = risk_score(w_route);
    let safety = safety_score(risk);

    let total: f64 = segment_risks.iter().sum();
    let max: f64 = segment_risks.iter().copied().fold(0.0, f64::max);

    Ok(RouteScore {
        risk_score: round3(risk),
        safety_score: safety,
        risk_class: RiskClass::from_safety(safety),
        stats: RouteStats {
            total_weighted_risk: round3(total),
            max_segment_risk: round3(max),
            avg_segment_risk: round3(w_route),
            segment_count: segment_scores.len(),
            segments: segment_scores,
            hotspots,
            crime_breakdown,
            cells_analyzed: hit_groups.len(),
        },
    })
}

/// Computes the cell-fetch bounding box for a polyline.
fn fetch_bbox(polyline: &[[f64; 2]]) -> BoundingBox {
    let mut west = f64::INFINITY;
    let mut south = f64::INFINITY;
    let mut east = f64::NEG_INFINITY;
    let mut north = f64::NEG_INFINITY;

    for point in polyline {
        west = west.min(point[0]);
        east = east.max(point[0]);
        south = south.min(point[1]);
        north = north.max(point[1]);
    }

    let mid_lat = (south + north) / 2.0;
    let margin_lat = CELL_FETCH_MARGIN_M / M_PER_DEG_LAT;
    let margin_lon =
        CELL_FETCH_MARGIN_M / (M_PER_DEG_LON_EQUATOR * mid_lat.to_radians().cos().max(0.01));

    BoundingBox::new(west, south, east, north).expanded(margin_lat.max(margin_lon))
}

/// Scores one provider candidate against the stored grid.
///
/// # Errors
///
/// Returns [`RouteScoreError`] for invalid polylines or database failures.
pub async fn score_route(
    db: &dyn Database,
    candidate: &CandidateRoute,
    preferences: &RoutePreferences,
    current_month: NaiveDate,
    tables: &ScoringTables,
) -> Result<ScoredRoute, RouteScoreError> {
    if candidate.polyline.len() < 2 {
        return Err(RouteScoreError::InvalidInput(
            "candidate polyline requires at least 2 vertices".to_string(),
        ));
    }

    let bbox = fetch_bbox(&candidate.polyline);
    let from_month = month_floor_back(current_month, preferences.lookback_months);
    let records = queries::cells_in_bbox_between(db, &bbox, from_month, current_month).await?;

    let score = score_polyline(
        &candidate.polyline,
        &records,
        preferences,
        current_month,
        tables,
    )?;

    let line: Vec<Vec<f64>> = candidate.polyline.iter().map(|p| vec![p[0], p[1]]).collect();

    Ok(ScoredRoute {
        rank: 0,
        is_recommended: false,
        safety_score: score.safety_score,
        risk_class: score.risk_class,
        risk_score: score.risk_score,
        distance_m: candidate.distance_m,
        duration_s: candidate.duration_s,
        geometry: geojson::Geometry::new(geojson::Value::LineString(line)),
        instructions: candidate.instructions.clone(),
        stats: score.stats,
    })
}

/// Ranks a scored batch: safest first, ties broken by shorter distance,
/// then shorter duration. Exactly one route (the first) is recommended.
pub fn rank_routes(routes: &mut [ScoredRoute]) {
    routes.sort_by(|a, b| {
        b.safety_score
            .partial_cmp(&a.safety_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.distance_m.total_cmp(&b.distance_m))
            .then_with(|| a.duration_s.total_cmp(&b.duration_s))
    });

    for (idx, route) in routes.iter_mut().enumerate() {
        route.rank = idx + 1;
        route.is_recommended = idx == 0;
    }
}

/// Scores a batch of provider candidates under a hard deadline.
///
/// Candidates are scored in order; when the deadline elapses, outstanding
/// candidates are cancelled (their in-flight queries are dropped) and the
/// completed ones are ranked and returned. If the deadline expires before
/// any candidate completes, the whole batch fails with
/// [`RouteScoreError::Timeout`].
///
/// # Errors
///
/// Returns [`RouteScoreError`] on invalid input, database failure, or a
/// zero-candidate timeout.
pub async fn score_candidates(
    db: &dyn Database,
    candidates: &[CandidateRoute],
    preferences: &RoutePreferences,
    current_month: NaiveDate,
    tables: &ScoringTables,
    deadline: Duration,
) -> Result<Vec<ScoredRoute>, RouteScoreError> {
    let deadline_at = tokio::time::Instant::now() + deadline;
    let mut scored: Vec<ScoredRoute> = Vec::with_capacity(candidates.len());

    for (idx, candidate) in candidates.iter().enumerate() {
        let result = tokio::time::timeout_at(
            deadline_at,
            score_route(db, candidate, preferences, current_month, tables),
        )
        .await;

        match result {
            Ok(route) => scored.push(route?),
            Err(_elapsed) => {
                log::warn!(
                    "Route scoring deadline elapsed after {idx}/{} candidates",
                    candidates.len(),
                );
                break;
            }
        }
    }

    if scored.is_empty() && !candidates.is_empty() {
        return Err(RouteScoreError::Timeout);
    }

    rank_routes(&mut scored);
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use saferoute_scoring::CrimeCategory;

    fn month(year: i32, month_num: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month_num, 1).unwrap()
    }

    fn now() -> NaiveDate {
        month(2025, 7)
    }

    fn record_with_stats(
        lat: f64,
        lon: f64,
        record_month: NaiveDate,
        stats: &[(&str, u64)],
        tables: &ScoringTables,
    ) -> SafetyCellRecord {
        let cell = saferoute_grid::cell_of(lat, lon).unwrap();
        let stats: BTreeMap<String, u64> =
            stats.iter().map(|(k, v)| ((*k).to_string(), *v)).collect();
        let total = stats.values().sum();
        let weighted = stats
            .iter()
            .map(|(slug, &count)| {
                #[allow(clippy::cast_precision_loss)]
                let count = count as f64;
                tables.harm_weight(CrimeCategory::from_slug(slug)) * count
            })
            .sum();

        SafetyCellRecord {
            cell_id: saferoute_grid::cell_key(cell, record_month),
            h3_index: cell.to_string(),
            month: record_month,
            crime_count_total: total,
            crime_count_weighted: weighted,
            stats,
            updated_at: Utc::now(),
        }
    }

    /// A tiny polyline hugging the center of the cell containing
    /// `(lat, lon)`: short enough to stay well inside the hexagon even
    /// after buffering.
    fn polyline_inside_cell(lat: f64, lon: f64) -> Vec<[f64; 2]> {
        let cell = saferoute_grid::cell_of(lat, lon).unwrap();
        let (center_lat, center_lon) = saferoute_grid::cell_center(cell);
        vec![
            [center_lon - 0.00004, center_lat],
            [center_lon + 0.00004, center_lat],
        ]
    }

    fn prefs() -> RoutePreferences {
        RoutePreferences::new(12, None, None).unwrap()
    }

    #[test]
    fn preference_validation() {
        assert!(RoutePreferences::new(12, None, None).is_ok());
        assert!(RoutePreferences::new(0, None, None).is_err());
        assert!(RoutePreferences::new(25, None, None).is_err());

        let mut negative = BTreeMap::new();
        negative.insert("burglary".to_string(), -1.0);
        assert!(RoutePreferences::new(12, None, Some(negative)).is_err());
    }

    #[test]
    fn route_with_no_nearby_cells_is_perfectly_safe() {
        let tables = ScoringTables::default();
        let score = score_polyline(
            &polyline_inside_cell(50.9079, -1.4049),
            &[],
            &prefs(),
            now(),
            &tables,
        )
        .unwrap();

        assert!((score.safety_score - 100.0).abs() < f64::EPSILON);
        assert!((score.risk_score - 0.0).abs() < f64::EPSILON);
        assert_eq!(score.risk_class, RiskClass::Low);
        assert!(score.stats.hotspots.is_empty());
        assert_eq!(score.stats.cells_analyzed, 0);
        assert_eq!(score.stats.segment_count, 1);
        assert_eq!(score.stats.segments[0].cell_count, 0);
    }

    #[test]
    fn single_cell_route_matches_the_cell_score() {
        let tables = ScoringTables::default();

        // violent-crime 36 (108.0) + drugs 1 (1.2): weighted 109.2, which
        // lands in the 0.8..0.95 band.
        let record = record_with_stats(
            50.9079,
            -1.4049,
            now(),
            &[("violent-crime", 36), ("drugs", 1)],
            &tables,
        );
        let records = vec![record];

        // Snapshot-side score of the same single cell.
        let aggregates = aggregate_cells(&records, now(), 12, None, None, &tables);
        let cell_risk = risk_score(aggregates[0].weighted);
        let cell_safety = safety_score(cell_risk);

        // Route-side score of a single-segment route in that cell.
        let score = score_polyline(
            &polyline_inside_cell(50.9079, -1.4049),
            &records,
            &prefs(),
            now(),
            &tables,
        )
        .unwrap();

        assert_eq!(score.stats.segment_count, 1);
        assert_eq!(score.stats.segments[0].cell_count, 1);
        assert!((score.stats.avg_segment_risk - 109.2).abs() < 1e-6);
        assert!((score.risk_score - (cell_risk * 1000.0).round() / 1000.0).abs() < 1e-9);
        assert!((score.safety_score - cell_safety).abs() < f64::EPSILON);
        assert!((score.safety_score - 18.6).abs() < 0.1);
        assert_eq!(score.risk_class, RiskClass::High);
    }

    #[test]
    fn averaging_over_segments_matches_the_piecewise_band() {
        // 20 segments: one at 100, ten at 5, three at 14, six at 0.
        let mut risks = vec![100.0];
        risks.extend(std::iter::repeat(5.0).take(10));
        risks.extend(std::iter::repeat(14.0).take(3));
        risks.extend(std::iter::repeat(0.0).take(6));

        let w = route_risk(&risks);
        assert!((w - 9.6).abs() < 1e-9);

        let risk = risk_score(w);
        assert!((risk - (0.2 + 0.2 * 4.6 / 15.0)).abs() < 1e-9);
        assert!((safety_score(risk) - 73.9).abs() < f64::EPSILON);
    }

    #[test]
    fn hotspot_thresholds() {
        let tables = ScoringTables::default();

        // 60 weighted: hotspot, high.
        let records = vec![record_with_stats(
            50.9079,
            -1.4049,
            now(),
            &[("burglary", 30)],
            &tables,
        )];
        let score = score_polyline(
            &polyline_inside_cell(50.9079, -1.4049),
            &records,
            &prefs(),
            now(),
            &tables,
        )
        .unwrap();
        assert_eq!(score.stats.hotspots.len(), 1);
        assert_eq!(score.stats.hotspots[0].risk_level, HotspotLevel::High);
        assert_eq!(score.stats.hotspots[0].segment_index, 0);

        // 150 weighted: critical.
        let records = vec![record_with_stats(
            50.9079,
            -1.4049,
            now(),
            &[("burglary", 75)],
            &tables,
        )];
        let score = score_polyline(
            &polyline_inside_cell(50.9079, -1.4049),
            &records,
            &prefs(),
            now(),
            &tables,
        )
        .unwrap();
        assert_eq!(score.stats.hotspots[0].risk_level, HotspotLevel::Critical);

        // 40 weighted: below the threshold.
        let records = vec![record_with_stats(
            50.9079,
            -1.4049,
            now(),
            &[("burglary", 20)],
            &tables,
        )];
        let score = score_polyline(
            &polyline_inside_cell(50.9079, -1.4049),
            &records,
            &prefs(),
            now(),
            &tables,
        )
        .unwrap();
        assert!(score.stats.hotspots.is_empty());
    }

    #[test]
    fn breakdown_merges_all_intersected_cells_unweighted() {
        let tables = ScoringTables::default();

        // Two months of the same cell: one group, histograms merged.
        let records = vec![
            record_with_stats(50.9079, -1.4049, now(), &[("burglary", 2)], &tables),
            record_with_stats(
                50.9079,
                -1.4049,
                month(2025, 6),
                &[("burglary", 1), ("drugs", 4)],
                &tables,
            ),
        ];

        let score = score_polyline(
            &polyline_inside_cell(50.9079, -1.4049),
            &records,
            &prefs(),
            now(),
            &tables,
        )
        .unwrap();

        assert_eq!(score.stats.cells_analyzed, 1);
        assert_eq!(score.stats.crime_breakdown["burglary"], 3);
        assert_eq!(score.stats.crime_breakdown["drugs"], 4);
    }

    #[test]
    fn category_overrides_scale_the_route_weight() {
        let tables = ScoringTables::default();
        let records = vec![record_with_stats(
            50.9079,
            -1.4049,
            now(),
            &[("burglary", 10)],
            &tables,
        )];

        let baseline = score_polyline(
            &polyline_inside_cell(50.9079, -1.4049),
            &records,
            &prefs(),
            now(),
            &tables,
        )
        .unwrap();

        let mut weights = BTreeMap::new();
        weights.insert("burglary".to_string(), 0.5);
        let halved_prefs = RoutePreferences::new(12, None, Some(weights)).unwrap();

        let halved = score_polyline(
            &polyline_inside_cell(50.9079, -1.4049),
            &records,
            &halved_prefs,
            now(),
            &tables,
        )
        .unwrap();

        assert!(
            (halved.stats.avg_segment_risk - baseline.stats.avg_segment_risk / 2.0).abs() < 1e-6
        );
    }

    #[test]
    fn ranking_orders_by_safety_then_distance_then_duration() {
        let empty_stats = RouteStats {
            total_weighted_risk: 0.0,
            max_segment_risk: 0.0,
            avg_segment_risk: 0.0,
            segment_count: 0,
            segments: Vec::new(),
            hotspots: Vec::new(),
            crime_breakdown: BTreeMap::new(),
            cells_analyzed: 0,
        };
        let route = |safety: f64, distance: f64, duration: f64| ScoredRoute {
            rank: 0,
            is_recommended: false,
            safety_score: safety,
            risk_class: RiskClass::from_safety(safety),
            risk_score: 0.0,
            distance_m: distance,
            duration_s: duration,
            geometry: geojson::Geometry::new(geojson::Value::LineString(vec![
                vec![-1.4049, 50.9079],
                vec![-1.4030, 50.9085],
            ])),
            instructions: Vec::new(),
            stats: empty_stats.clone(),
        };

        let mut routes = vec![
            route(80.0, 900.0, 700.0),
            route(92.5, 1200.0, 950.0),
            route(92.5, 1100.0, 990.0),
            route(92.5, 1100.0, 940.0),
        ];
        rank_routes(&mut routes);

        // Safest first; among the 92.5 ties the shorter distance wins, and
        // among equal distances the shorter duration.
        assert!((routes[0].distance_m - 1100.0).abs() < f64::EPSILON);
        assert!((routes[0].duration_s - 940.0).abs() < f64::EPSILON);
        assert!(routes[0].is_recommended);
        assert_eq!(routes[0].rank, 1);

        assert!((routes[1].duration_s - 990.0).abs() < f64::EPSILON);
        assert!((routes[2].distance_m - 1200.0).abs() < f64::EPSILON);
        assert!((routes[3].safety_score - 80.0).abs() < f64::EPSILON);
        assert_eq!(routes[3].rank, 4);
        assert!(routes.iter().filter(|r| r.is_recommended).count() == 1);
    }

    #[test]
    fn fetch_bbox_covers_the_polyline_with_margin() {
        let polyline = vec![[-1.42, 50.90], [-1.40, 50.92]];
        let bbox = fetch_bbox(&polyline);

        assert!(bbox.west < -1.42);
        assert!(bbox.east > -1.40);
        assert!(bbox.south < 50.90);
        assert!(bbox.north > 50.92);

        // Margin should be roughly 250m in degrees, not wildly larger.
        assert!(bbox.west > -1.43);
        assert!(bbox.north < 50.93);
    }
}
