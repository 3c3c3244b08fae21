//! Polyline segmentation into ~100m scoring atoms.
//!
//! Segments are cut by true geodesic (haversine) length, not by a degree
//! threshold: at Southampton's latitude a degree constant would be ~11%
//! off. A new segment starts whenever the accumulated sub-polyline reaches
//! the target length; the remainder forms the final segment.

use geo::HaversineDistance as _;
use geo::Point;

use crate::RouteScoreError;

/// One ~100m slice of a route polyline: the scoring atom for routes.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSegment {
    /// Position of this segment along the route, contiguous from 0.
    pub index: usize,
    /// Ordered `[lon, lat]` vertices, including both endpoints.
    pub points: Vec<[f64; 2]>,
    /// Geodesic length in meters.
    pub length_m: f64,
}

impl RouteSegment {
    /// First vertex of the segment.
    #[must_use]
    pub fn start(&self) -> [f64; 2] {
        self.points[0]
    }

    /// Last vertex of the segment.
    #[must_use]
    pub fn end(&self) -> [f64; 2] {
        self.points[self.points.len() - 1]
    }

    /// The point halfway along the segment by geodesic length.
    #[must_use]
    pub fn midpoint(&self) -> [f64; 2] {
        let half = self.length_m / 2.0;
        let mut walked = 0.0;

        for pair in self.points.windows(2) {
            let edge = haversine_m(pair[0], pair[1]);
            if edge > 0.0 && walked + edge >= half {
                let fraction = (half - walked) / edge;
                return [
                    pair[0][0] + (pair[1][0] - pair[0][0]) * fraction,
                    pair[0][1] + (pair[1][1] - pair[0][1]) * fraction,
                ];
            }
            walked += edge;
        }

        self.end()
    }
}

/// Geodesic distance between two `[lon, lat]` points, in meters.
#[must_use]
pub fn haversine_m(a: [f64; 2], b: [f64; 2]) -> f64 {
    Point::new(a[0], a[1]).haversine_distance(&Point::new(b[0], b[1]))
}

/// Splits a polyline into segments of roughly `target_m` geodesic meters.
///
/// Consecutive duplicate vertices are dropped first. A polyline shorter
/// than the target produces a single segment covering the whole route.
///
/// # Errors
///
/// Returns [`RouteScoreError::InvalidInput`] when fewer than two distinct
/// vertices remain (including the degenerate "two identical points" case).
pub fn segment_polyline(
    polyline: &[[f64; 2]],
    target_m: f64,
) -> Result<Vec<RouteSegment>, RouteScoreError> {
    if polyline.len() < 2 {
        return Err(RouteScoreError::InvalidInput(
            "polyline requires at least 2 vertices".to_string(),
        ));
    }

    let mut cleaned: Vec<[f64; 2]> = Vec::with_capacity(polyline.len());
    for &point in polyline {
        if !(-180.0..=180.0).contains(&point[0]) || !(-90.0..=90.0).contains(&point[1]) {
            return Err(RouteScoreError::InvalidInput(format!(
                "polyline vertex out of WGS84 domain: ({}, {})",
                point[0], point[1],
            )));
        }
        if cleaned.last() != Some(&point) {
            cleaned.push(point);
        }
    }

    if cleaned.len() < 2 {
        return Err(RouteScoreError::InvalidInput(
            "polyline requires at least 2 distinct vertices".to_string(),
        ));
    }

    let mut segments: Vec<RouteSegment> = Vec::new();
    let mut current: Vec<[f64; 2]> = vec![cleaned[0]];
    let mut accumulated = 0.0;

    for pair in cleaned.windows(2) {
        accumulated += haversine_m(pair[0], pair[1]);
        current.push(pair[1]);

        if accumulated >= target_m {
            segments.push(RouteSegment {
                index: segments.len(),
                points: std::mem::replace(&mut current, vec![pair[1]]),
                length_m: accumulated,
            });
            accumulated = 0.0;
        }
    }

    if current.len() > 1 {
        segments.push(RouteSegment {
            index: segments.len(),
            points: current,
            length_m: accumulated,
        });
    }

    Ok(segments)
}
