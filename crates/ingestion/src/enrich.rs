//! Geospatial enrichment of accepted records.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use fire_common::RawRecord;
use geospatial::{
    assign_cell, estimated_area_km2, spatial_join, JoinResult, ReferenceIndex, SpatialCell,
    DEFAULT_COARSE_RESOLUTION,
};
use validation::ValidationResult;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Resolution of the cell attached to each record
    #[serde(default = "default_resolution")]
    pub resolution: u8,
    /// Resolution of the reference bucket cells and of `coarse_cell`
    #[serde(default = "default_coarse_resolution")]
    pub coarse_resolution: u8,
    /// Nearest-polygon search radius for points outside every polygon
    #[serde(default = "default_buffer_m")]
    pub buffer_m: f64,
    /// GeoJSON FeatureCollection of reference polygons
    #[serde(default)]
    pub reference_path: Option<PathBuf>,
    /// Field holding burned acres, used for the area estimate
    #[serde(default = "default_area_field")]
    pub area_field: String,
}

fn default_resolution() -> u8 {
    9
}

fn default_coarse_resolution() -> u8 {
    DEFAULT_COARSE_RESOLUTION
}

fn default_buffer_m() -> f64 {
    1_000.0
}

fn default_area_field() -> String {
    "acres".to_string()
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            coarse_resolution: default_coarse_resolution(),
            buffer_m: default_buffer_m(),
            reference_path: None,
            area_field: default_area_field(),
        }
    }
}

impl EnrichmentConfig {
    /// Load the configured reference polygons, if any.
    pub fn load_reference(&self) -> Result<Option<Arc<ReferenceIndex>>> {
        match &self.reference_path {
            Some(path) => Ok(Some(Arc::new(ReferenceIndex::from_path(path, self.coarse_resolution)?))),
            None => Ok(None),
        }
    }
}

/// Where an enriched record came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub sequence: u64,
    pub retry_count: u32,
    pub ingested_at: DateTime<Utc>,
    pub enriched_at: DateTime<Utc>,
}

/// An accepted record with its spatial context attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub record: RawRecord,
    pub validation: ValidationResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell: Option<SpatialCell>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coarse_cell: Option<SpatialCell>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_area_km2: Option<f64>,
    pub provenance: Provenance,
}

/// Attaches cells and reference polygons to records.
#[derive(Debug, Clone)]
pub struct Enricher {
    config: EnrichmentConfig,
    reference: Option<Arc<ReferenceIndex>>,
}

impl Enricher {
    pub fn new(config: EnrichmentConfig, reference: Option<Arc<ReferenceIndex>>) -> Self {
        Self { config, reference }
    }

    pub fn config(&self) -> &EnrichmentConfig {
        &self.config
    }

    /// Enrich one record. Records without usable coordinates keep empty
    /// spatial fields rather than failing.
    pub fn enrich(&self, record: RawRecord, validation: ValidationResult) -> EnrichedRecord {
        let coords = record.coordinates();

        let (cell, coarse_cell) = match coords {
            Some((lat, lon)) => (
                assign_cell(lat, lon, self.config.resolution).ok(),
                assign_cell(lat, lon, self.config.coarse_resolution).ok(),
            ),
            None => (None, None),
        };

        let join = match (coords, &self.reference) {
            (Some((lat, lon)), Some(index)) => spatial_join(lat, lon, index, self.config.buffer_m),
            _ => None,
        };

        if coords.is_some() && cell.is_none() {
            debug!(record = %record.id, "Coordinates could not be mapped to a cell");
        }

        let estimated_area_km2 = record.get_f64(&self.config.area_field).map(estimated_area_km2);

        let provenance = Provenance {
            source: record.source.clone(),
            sequence: record.sequence,
            retry_count: record.retry_count,
            ingested_at: record.ingested_at,
            enriched_at: Utc::now(),
        };

        EnrichedRecord {
            record,
            validation,
            cell,
            coarse_cell,
            join,
            estimated_area_km2,
            provenance,
        }
    }
}
