#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! H3 grid index for the SafeRoute risk engine.
//!
//! Thin wrapper around [`h3o`] pinning everything to resolution 10 (~73m
//! edge, ~13,781 m² hexagons). Resolution 9 cells would be too coarse
//! (~193m edge) and resolution 11 too fine (~28m), so any cell identifier
//! at another resolution is rejected as a configuration error.
//!
//! Also owns the `(h3_index, month)` composite cell key used as the
//! authoritative identifier of every safety grid bucket.

use chrono::{Datelike, NaiveDate};
use geo::{LineString, Polygon};
use h3o::{CellIndex, LatLng, Resolution};

/// The single grid resolution used across the entire engine.
pub const GRID_RESOLUTION: Resolution = Resolution::Ten;

/// Approximate edge length of a resolution-10 hexagon, in meters.
/// Reported to snapshot consumers as `cell_size_m`.
pub const CELL_EDGE_METERS: u32 = 73;

/// Grid type identifier reported in snapshot metadata.
pub const GRID_TYPE: &str = "h3_hexagonal";

/// Errors raised by grid index operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    /// Latitude or longitude outside the WGS84 domain.
    #[error("Invalid WGS84 coordinate: ({lat}, {lon})")]
    InvalidCoordinate {
        /// Latitude that was rejected.
        lat: String,
        /// Longitude that was rejected.
        lon: String,
    },

    /// A string did not parse as an H3 cell index.
    #[error("Invalid H3 cell index: {0}")]
    InvalidCell(String),

    /// A cell parsed but is not at resolution 10.
    #[error("H3 cell {cell} is at resolution {resolution}, expected 10")]
    WrongResolution {
        /// The offending cell, as its hex string.
        cell: String,
        /// The resolution the cell is actually at.
        resolution: u8,
    },

    /// A `"{h3}_{YYYYMM}"` cell key failed to parse.
    #[error("Malformed cell id: {0}")]
    MalformedCellId(String),
}

/// Returns the resolution-10 cell containing a WGS84 point.
///
/// # Errors
///
/// Returns [`GridError::InvalidCoordinate`] if the point is outside the
/// WGS84 domain.
pub fn cell_of(lat: f64, lon: f64) -> Result<CellIndex, GridError> {
    let coord = LatLng::new(lat, lon).map_err(|_| GridError::InvalidCoordinate {
        lat: lat.to_string(),
        lon: lon.to_string(),
    })?;
    Ok(coord.to_cell(GRID_RESOLUTION))
}

/// Parses an H3 cell index from its hex string and checks the resolution.
///
/// # Errors
///
/// Returns [`GridError::InvalidCell`] if the string is not a cell index, or
/// [`GridError::WrongResolution`] if it is not at resolution 10.
pub fn parse_cell(value: &str) -> Result<CellIndex, GridError> {
    let cell: CellIndex = value
        .parse()
        .map_err(|_| GridError::InvalidCell(value.to_string()))?;
    require_grid_resolution(cell)?;
    Ok(cell)
}

/// Returns the resolution of a cell as a plain integer.
#[must_use]
pub fn resolution(cell: CellIndex) -> u8 {
    u8::from(cell.resolution())
}

/// Rejects cells that are not at the engine's fixed resolution.
///
/// # Errors
///
/// Returns [`GridError::WrongResolution`] for any other resolution.
pub fn require_grid_resolution(cell: CellIndex) -> Result<(), GridError> {
    if cell.resolution() == GRID_RESOLUTION {
        Ok(())
    } else {
        Err(GridError::WrongResolution {
            cell: cell.to_string(),
            resolution: resolution(cell),
        })
    }
}

/// Returns whether two cells share an edge.
///
/// A cell is never its own neighbor; cells at different resolutions are
/// never neighbors.
#[must_use]
pub fn are_neighbors(a: CellIndex, b: CellIndex) -> bool {
    a.is_neighbor_with(b).unwrap_or(false)
}

/// Returns the cell boundary as a closed `(lon, lat)` coordinate ring.
///
/// The first coordinate is repeated as the last, as required by the
/// `GeoJSON` polygon contract. Hexagons produce 7 coordinates; the rare
/// pentagon produces 6.
#[must_use]
pub fn boundary_coords(cell: CellIndex) -> Vec<[f64; 2]> {
    let boundary = cell.boundary();
    let mut coords: Vec<[f64; 2]> = boundary.iter().map(|v| [v.lng(), v.lat()]).collect();
    if let Some(&first) = coords.first() {
        coords.push(first);
    }
    coords
}

/// Returns the cell boundary as a [`geo::Polygon`] in WGS84.
#[must_use]
pub fn boundary_polygon(cell: CellIndex) -> Polygon<f64> {
    let ring: Vec<(f64, f64)> = boundary_coords(cell)
        .into_iter()
        .map(|c| (c[0], c[1]))
        .collect();
    Polygon::new(LineString::from(ring), Vec::new())
}

/// Returns the center of a cell as a `(lat, lon)` pair.
#[must_use]
pub fn cell_center(cell: CellIndex) -> (f64, f64) {
    let center = LatLng::from(cell);
    (center.lat(), center.lng())
}

/// Builds the authoritative `"{h3}_{YYYYMM}"` key for a `(cell, month)`
/// bucket.
#[must_use]
pub fn cell_key(cell: CellIndex, month: NaiveDate) -> String {
    format!("{cell}_{:04}{:02}", month.year(), month.month())
}

/// Parses a `"{h3}_{YYYYMM}"` key back into its cell and month.
///
/// # Errors
///
/// Returns [`GridError::MalformedCellId`] if the key does not match the
/// format, or a cell/resolution error if the H3 part is invalid.
pub fn parse_cell_key(key: &str) -> Result<(CellIndex, NaiveDate), GridError> {
    let malformed = || GridError::MalformedCellId(key.to_string());

    let (h3_part, month_part) = key.rsplit_once('_').ok_or_else(malformed)?;
    if month_part.len() != 6 || !month_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }

    let year: i32 = month_part[..4].parse().map_err(|_| malformed())?;
    let month_num: u32 = month_part[4..].parse().map_err(|_| malformed())?;
    let month = NaiveDate::from_ymd_opt(year, month_num, 1).ok_or_else(malformed)?;

    let cell = parse_cell(h3_part)?;
    Ok((cell, month))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Civic Centre, Southampton.
    const LAT: f64 = 50.9079;
    const LON: f64 = -1.4049;

    #[test]
    fn cell_of_produces_resolution_ten() {
        let cell = cell_of(LAT, LON).unwrap();
        assert_eq!(resolution(cell), 10);
        assert!(require_grid_resolution(cell).is_ok());
    }

    #[test]
    fn cell_of_rejects_out_of_range_coordinates() {
        assert!(matches!(
            cell_of(123.0, 0.0),
            Err(GridError::InvalidCoordinate { .. })
        ));
        assert!(matches!(
            cell_of(0.0, 999.0),
            Err(GridError::InvalidCoordinate { .. })
        ));
    }

    #[test]
    fn parse_cell_round_trips() {
        let cell = cell_of(LAT, LON).unwrap();
        let parsed = parse_cell(&cell.to_string()).unwrap();
        assert_eq!(cell, parsed);
    }

    #[test]
    fn parse_cell_rejects_wrong_resolution() {
        let coarse = LatLng::new(LAT, LON).unwrap().to_cell(Resolution::Nine);
        assert!(matches!(
            parse_cell(&coarse.to_string()),
            Err(GridError::WrongResolution { resolution: 9, .. })
        ));
        assert!(matches!(
            parse_cell("not-a-cell"),
            Err(GridError::InvalidCell(_))
        ));
    }

    #[test]
    fn boundary_ring_is_closed() {
        let cell = cell_of(LAT, LON).unwrap();
        let coords = boundary_coords(cell);

        // Hexagon: 6 vertices plus the repeated first.
        assert_eq!(coords.len(), 7);
        assert_eq!(coords.first(), coords.last());

        for c in &coords {
            assert!((-180.0..=180.0).contains(&c[0]));
            assert!((-90.0..=90.0).contains(&c[1]));
        }
    }

    #[test]
    fn boundary_polygon_matches_the_coordinate_ring() {
        let cell = cell_of(LAT, LON).unwrap();
        let polygon = boundary_polygon(cell);
        let coords = boundary_coords(cell);

        let exterior: Vec<[f64; 2]> = polygon.exterior().coords().map(|c| [c.x, c.y]).collect();
        assert_eq!(exterior, coords);
        assert!(polygon.interiors().is_empty());
    }

    #[test]
    fn neighbor_detection() {
        let cell = cell_of(LAT, LON).unwrap();
        let ring: Vec<CellIndex> = cell.grid_disk::<Vec<_>>(1);

        let mut neighbors = 0;
        for other in ring {
            if other == cell {
                assert!(!are_neighbors(cell, other));
            } else if are_neighbors(cell, other) {
                neighbors += 1;
            }
        }
        assert_eq!(neighbors, 6);
    }

    #[test]
    fn cell_key_round_trips() {
        let cell = cell_of(LAT, LON).unwrap();
        let month = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();

        let key = cell_key(cell, month);
        assert!(key.ends_with("_202503"));

        let (parsed_cell, parsed_month) = parse_cell_key(&key).unwrap();
        assert_eq!(parsed_cell, cell);
        assert_eq!(parsed_month, month);
    }

    #[test]
    fn malformed_cell_keys_are_rejected() {
        for key in ["", "abc", "891e204d89fffff", "891e204d89fffff_20253", "891e204d89fffff_2025AB"] {
            assert!(parse_cell_key(key).is_err(), "expected {key:?} to fail");
        }
    }
}
