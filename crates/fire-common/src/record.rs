//! The raw record shape every connector produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::geometry::Geometry;

/// Flattened attribute map of a record. Keys are lower-case.
pub type RecordFields = Map<String, Value>;

const LAT_FIELDS: [&str; 3] = ["latitude", "lat", "y"];
const LON_FIELDS: [&str; 4] = ["longitude", "lon", "lng", "x"];

/// One unit of ingested data, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Stable identifier (source id field when present, else `source:sequence`)
    pub id: String,
    /// Name of the source that produced the record
    pub source: String,
    /// Position of the record within its source, starting at 0
    pub sequence: u64,
    pub ingested_at: DateTime<Utc>,
    pub fields: RecordFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
    /// Set when the source item could not be parsed; holds the parse error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub malformed: Option<String>,
    /// Retries spent fetching the record from its source
    #[serde(default)]
    pub retry_count: u32,
}

impl RawRecord {
    /// Create a record, lower-casing every field name.
    pub fn new(source: impl Into<String>, sequence: u64, fields: RecordFields) -> Self {
        let source = source.into();
        let fields = fields
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        Self {
            id: format!("{source}:{sequence}"),
            source,
            sequence,
            ingested_at: Utc::now(),
            fields,
            geometry: None,
            malformed: None,
            retry_count: 0,
        }
    }

    /// Create a record for an item that failed to parse.
    ///
    /// The unparsed text is kept under the `raw` field for inspection.
    pub fn malformed(
        source: impl Into<String>,
        sequence: u64,
        raw: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let mut fields = RecordFields::new();
        fields.insert("raw".to_string(), Value::String(raw.into()));
        let mut record = Self::new(source, sequence, fields);
        record.malformed = Some(reason.into());
        record
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_geometry(mut self, geometry: Option<Geometry>) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn is_malformed(&self) -> bool {
        self.malformed.is_some()
    }

    /// Look up a field, treating JSON null as absent.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields
            .get(&field.to_lowercase())
            .filter(|v| !v.is_null())
    }

    /// Numeric view of a field; numeric strings are accepted.
    pub fn get_f64(&self, field: &str) -> Option<f64> {
        value_as_f64(self.get(field)?)
    }

    /// String view of a field; numbers and booleans are rendered as text.
    pub fn get_str(&self, field: &str) -> Option<String> {
        match self.get(field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Record location as (lat, lon).
    ///
    /// Explicit latitude/longitude attributes win over geometry.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        let lat = LAT_FIELDS.iter().find_map(|f| self.get_f64(f));
        let lon = LON_FIELDS.iter().find_map(|f| self.get_f64(f));
        match (lat, lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => self.geometry.as_ref()?.representative_point(),
        }
    }
}

/// Interpret a JSON value as a float.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
