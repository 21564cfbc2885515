//! Timestamp parsing for heterogeneous source formats.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::{CommonError, CommonResult};

/// Parse a timestamp field as found in CalFIRE feeds.
///
/// Accepts RFC 3339 strings, naive `YYYY-MM-DDTHH:MM:SS` / `YYYY-MM-DD HH:MM:SS`
/// (assumed UTC), bare dates, and numbers as epoch milliseconds (the ArcGIS
/// REST convention).
pub fn parse_timestamp(value: &Value) -> CommonResult<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let millis = n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| CommonError::InvalidTimestamp(n.to_string()))?;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| CommonError::InvalidTimestamp(n.to_string()))
        }
        Value::String(s) => parse_timestamp_str(s),
        other => Err(CommonError::InvalidTimestamp(other.to_string())),
    }
}

fn parse_timestamp_str(s: &str) -> CommonResult<DateTime<Utc>> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&ndt));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(ndt) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&ndt));
        }
    }

    Err(CommonError::InvalidTimestamp(s.to_string()))
}
