//! Geographic bounding box types and operations.

use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

/// Tolerance applied to every coordinate boundary comparison.
///
/// Points within this distance (in degrees) of an edge count as on the edge,
/// so values that round-trip through text never flicker across a boundary.
pub const COORD_EPSILON: f64 = 1e-9;

/// A geographic bounding box in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Create a new bounding box from corner coordinates.
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// The State of California, as used by the CalFIRE coordinate checks.
    pub fn california() -> Self {
        Self::new(-124.5, 32.5, -114.0, 42.0)
    }

    /// Parse a "min_lon,min_lat,max_lon,max_lat" string.
    pub fn from_bbox_string(s: &str) -> CommonResult<Self> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(CommonError::InvalidBboxFormat(s.to_string()));
        }

        let parse = |p: &str| {
            p.parse::<f64>()
                .map_err(|_| CommonError::InvalidNumber(p.to_string()))
        };

        Ok(Self {
            min_lon: parse(parts[0])?,
            min_lat: parse(parts[1])?,
            max_lon: parse(parts[2])?,
            max_lat: parse(parts[3])?,
        })
    }

    /// Width in degrees of longitude.
    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    /// Height in degrees of latitude.
    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }

    /// Check if this bbox intersects another (shared edges count).
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon <= other.max_lon + COORD_EPSILON
            && self.max_lon >= other.min_lon - COORD_EPSILON
            && self.min_lat <= other.max_lat + COORD_EPSILON
            && self.max_lat >= other.min_lat - COORD_EPSILON
    }

    /// Check if a point is contained within this bbox, edges included.
    pub fn contains_point(&self, lat: f64, lon: f64) -> bool {
        lon >= self.min_lon - COORD_EPSILON
            && lon <= self.max_lon + COORD_EPSILON
            && lat >= self.min_lat - COORD_EPSILON
            && lat <= self.max_lat + COORD_EPSILON
    }

    /// Grow the box so it covers the given point.
    pub fn extend(&mut self, lat: f64, lon: f64) {
        self.min_lon = self.min_lon.min(lon);
        self.max_lon = self.max_lon.max(lon);
        self.min_lat = self.min_lat.min(lat);
        self.max_lat = self.max_lat.max(lat);
    }

    /// Degenerate box around a single point.
    pub fn from_point(lat: f64, lon: f64) -> Self {
        Self::new(lon, lat, lon, lat)
    }

    /// Center point as (lat, lon).
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lon + self.max_lon) / 2.0,
        )
    }
}
