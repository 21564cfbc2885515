//! Geospatial enrichment primitives.
//!
//! - Hexagonal spatial cell index (`assign_cell`)
//! - Point-in-polygon and distance predicates
//! - Reference polygon index bucketed by coarse cell, and the spatial join
//! - Windowed hotspot detection
//! - Aggregate analytics (group rollups, trends, coverage, damage severity)

pub mod analytics;
pub mod cell;
pub mod error;
pub mod geometry;
pub mod hotspot;
pub mod join;
pub mod reference;

// Re-exports
pub use analytics::{
    aggregate_by, damage_severity_score, estimated_area_km2, spatial_coverage, yearly_trends,
    Coverage, GroupAggregate, YearTrend,
};
pub use cell::{assign_cell, edge_degrees, SpatialCell, MAX_RESOLUTION};
pub use error::{Result, SpatialError};
pub use geometry::{haversine_m, point_in_polygon};
pub use hotspot::{detect_hotspots, severity_weight, Hotspot, HotspotConfig, HotspotMetric, HotspotObservation};
pub use join::{spatial_join, JoinResult};
pub use reference::{ReferenceIndex, ReferencePolygon, DEFAULT_COARSE_RESOLUTION};
