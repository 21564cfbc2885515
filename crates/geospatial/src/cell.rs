//! Hexagonal spatial cell index.
//!
//! Coordinates are placed on an equirectangular plane (x = lon, y = lat, in
//! degrees) and bucketed into pointy-top hexagons addressed by axial
//! coordinates `(q, r)`. The hexagon edge length halves with every
//! resolution step:
//!
//! ```text
//! resolution   edge (deg)   approx. edge at 37N
//!     0          12.0          ~1070 km
//!     4           0.75           ~67 km
//!     8           0.047          ~4.2 km
//!    12           0.0029         ~260 m
//!    15           0.00037         ~33 m
//! ```
//!
//! Cell assignment is a pure function of `(lat, lon, resolution)`, so the
//! same input always yields the same cell.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpatialError};

/// Finest supported resolution.
pub const MAX_RESOLUTION: u8 = 15;

/// Edge length of a resolution-0 hexagon, in degrees.
const BASE_EDGE_DEGREES: f64 = 12.0;

const AXIS_BITS: u32 = 30;
const AXIS_MASK: u64 = (1 << AXIS_BITS) - 1;
const AXIS_OFFSET: i64 = 1 << (AXIS_BITS - 1);

const SQRT_3: f64 = 1.732_050_807_568_877_2;

/// Axial offsets of the six neighbours, clockwise from east.
const NEIGHBOR_OFFSETS: [(i32, i32); 6] = [(1, 0), (1, -1), (0, -1), (-1, 0), (-1, 1), (0, 1)];

/// A hexagonal cell at a given resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SpatialCell {
    resolution: u8,
    q: i32,
    r: i32,
}

/// Edge length in degrees of hexagons at `resolution`.
pub fn edge_degrees(resolution: u8) -> f64 {
    BASE_EDGE_DEGREES / f64::from(1u32 << resolution.min(MAX_RESOLUTION))
}

/// Map a coordinate to its cell at `resolution`.
pub fn assign_cell(lat: f64, lon: f64, resolution: u8) -> Result<SpatialCell> {
    if resolution > MAX_RESOLUTION {
        return Err(SpatialError::InvalidResolution(resolution));
    }
    if !lat.is_finite() || !lon.is_finite() || lat.abs() > 90.0 || lon.abs() > 180.0 {
        return Err(SpatialError::InvalidCoordinate { lat, lon });
    }

    let size = edge_degrees(resolution);
    let qf = (SQRT_3 / 3.0 * lon - lat / 3.0) / size;
    let rf = (2.0 / 3.0 * lat) / size;
    let (q, r) = axial_round(qf, rf);

    Ok(SpatialCell { resolution, q, r })
}

/// Round fractional axial coordinates to the containing hexagon.
fn axial_round(qf: f64, rf: f64) -> (i32, i32) {
    let sf = -qf - rf;
    let (mut q, mut r, s) = (qf.round(), rf.round(), sf.round());

    let dq = (q - qf).abs();
    let dr = (r - rf).abs();
    let ds = (s - sf).abs();

    if dq > dr && dq > ds {
        q = -r - s;
    } else if dr > ds {
        r = -q - s;
    }

    (q as i32, r as i32)
}

impl SpatialCell {
    pub fn resolution(&self) -> u8 {
        self.resolution
    }

    /// Axial coordinates `(q, r)`.
    pub fn axial(&self) -> (i32, i32) {
        (self.q, self.r)
    }

    /// Packed 64-bit identifier: 4 bits resolution, 30 bits q, 30 bits r.
    pub fn id(&self) -> u64 {
        let q = ((i64::from(self.q) + AXIS_OFFSET) as u64) & AXIS_MASK;
        let r = ((i64::from(self.r) + AXIS_OFFSET) as u64) & AXIS_MASK;
        (u64::from(self.resolution) << (2 * AXIS_BITS)) | (q << AXIS_BITS) | r
    }

    /// Rebuild a cell from its packed identifier.
    pub fn from_id(id: u64) -> Result<Self> {
        let resolution = (id >> (2 * AXIS_BITS)) as u8;
        if resolution > MAX_RESOLUTION {
            return Err(SpatialError::InvalidCellId(format!("{id:016x}")));
        }
        let q = (((id >> AXIS_BITS) & AXIS_MASK) as i64 - AXIS_OFFSET) as i32;
        let r = ((id & AXIS_MASK) as i64 - AXIS_OFFSET) as i32;
        Ok(Self { resolution, q, r })
    }

    /// Center of the hexagon as (lat, lon).
    pub fn center(&self) -> (f64, f64) {
        let size = edge_degrees(self.resolution);
        let (q, r) = (f64::from(self.q), f64::from(self.r));
        let lon = size * (SQRT_3 * q + SQRT_3 / 2.0 * r);
        let lat = size * (1.5 * r);
        (lat, lon)
    }

    /// The six cells sharing an edge with this one.
    pub fn neighbors(&self) -> [SpatialCell; 6] {
        NEIGHBOR_OFFSETS.map(|(dq, dr)| SpatialCell {
            resolution: self.resolution,
            q: self.q + dq,
            r: self.r + dr,
        })
    }

    /// All cells within `k` steps, this cell included.
    pub fn disk(&self, k: u32) -> Vec<SpatialCell> {
        let k = k as i32;
        let mut cells = Vec::with_capacity((3 * k * (k + 1) + 1) as usize);
        for dq in -k..=k {
            let lo = (-k).max(-dq - k);
            let hi = k.min(-dq + k);
            for dr in lo..=hi {
                cells.push(SpatialCell {
                    resolution: self.resolution,
                    q: self.q + dq,
                    r: self.r + dr,
                });
            }
        }
        cells
    }

    /// Number of hexagon steps between two cells of the same resolution.
    pub fn grid_distance(&self, other: &SpatialCell) -> u32 {
        let dq = self.q - other.q;
        let dr = self.r - other.r;
        ((dq.abs() + dr.abs() + (dq + dr).abs()) / 2) as u32
    }

    /// The cell at `resolution` that contains this cell's center.
    pub fn at_resolution(&self, resolution: u8) -> Result<SpatialCell> {
        let (lat, lon) = self.center();
        assign_cell(lat.clamp(-90.0, 90.0), lon.clamp(-180.0, 180.0), resolution)
    }
}

impl PartialOrd for SpatialCell {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SpatialCell {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id().cmp(&other.id())
    }
}

impl fmt::Display for SpatialCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.id())
    }
}

impl FromStr for SpatialCell {
    type Err = SpatialError;

    fn from_str(s: &str) -> Result<Self> {
        let id = u64::from_str_radix(s, 16).map_err(|_| SpatialError::InvalidCellId(s.to_string()))?;
        Self::from_id(id)
    }
}

impl From<SpatialCell> for String {
    fn from(cell: SpatialCell) -> Self {
        cell.to_string()
    }
}

impl TryFrom<String> for SpatialCell {
    type Error = SpatialError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_is_deterministic() {
        let a = assign_cell(37.7749, -122.4194, 8).unwrap();
        for _ in 0..100 {
            assert_eq!(assign_cell(37.7749, -122.4194, 8).unwrap(), a);
        }
    }

    #[test]
    fn test_nearby_points_share_cell() {
        let a = assign_cell(37.77490, -122.41940, 8).unwrap();
        let b = assign_cell(37.77495, -122.41945, 8).unwrap();
        assert_eq!(a, b);

        let far = assign_cell(34.0522, -118.2437, 8).unwrap();
        assert_ne!(a, far);
    }

    #[test]
    fn test_center_maps_back_to_cell() {
        for res in [0, 3, 8, 12, 15] {
            let cell = assign_cell(36.7783, -119.4179, res).unwrap();
            let (lat, lon) = cell.center();
            assert_eq!(assign_cell(lat, lon, res).unwrap(), cell, "res {res}");
        }
    }

    #[test]
    fn test_center_is_within_one_edge() {
        let (lat, lon) = (38.44, -121.37);
        let cell = assign_cell(lat, lon, 10).unwrap();
        let (clat, clon) = cell.center();
        let d = ((clat - lat).powi(2) + (clon - lon).powi(2)).sqrt();
        assert!(d <= edge_degrees(10) + 1e-12);
    }

    #[test]
    fn test_id_roundtrip_and_display() {
        let cell = assign_cell(-33.86, 151.21, 15).unwrap();
        assert_eq!(SpatialCell::from_id(cell.id()).unwrap(), cell);

        let text = cell.to_string();
        assert_eq!(text.len(), 16);
        assert_eq!(text.parse::<SpatialCell>().unwrap(), cell);
    }

    #[test]
    fn test_neighbors_are_one_step_away() {
        let cell = assign_cell(37.0, -120.0, 6).unwrap();
        for n in cell.neighbors() {
            assert_eq!(cell.grid_distance(&n), 1);
        }
        assert_eq!(cell.disk(1).len(), 7);
        assert_eq!(cell.disk(2).len(), 19);
        assert!(cell.disk(2).iter().all(|c| cell.grid_distance(c) <= 2));
    }

    #[test]
    fn test_rejects_invalid_input() {
        assert!(matches!(
            assign_cell(91.0, 0.0, 5),
            Err(SpatialError::InvalidCoordinate { .. })
        ));
        assert!(matches!(
            assign_cell(f64::NAN, 0.0, 5),
            Err(SpatialError::InvalidCoordinate { .. })
        ));
        assert!(matches!(
            assign_cell(0.0, 0.0, 16),
            Err(SpatialError::InvalidResolution(16))
        ));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let cell = assign_cell(37.0, -120.0, 8).unwrap();
        let json = serde_json::to_string(&cell).unwrap();
        assert_eq!(json, format!("\"{cell}\""));
        let back: SpatialCell = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cell);
    }

    #[test]
    fn test_at_resolution_contains_fine_cell() {
        let fine = assign_cell(37.2, -119.8, 10).unwrap();
        let coarse = fine.at_resolution(4).unwrap();
        assert_eq!(coarse.resolution(), 4);
        let direct = assign_cell(37.2, -119.8, 4).unwrap();
        assert!(coarse == direct || coarse.grid_distance(&direct) <= 1);
    }
}
