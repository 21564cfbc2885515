//! Common types shared across the wildfire ingestion workspace.

pub mod bbox;
pub mod error;
pub mod geometry;
pub mod record;
pub mod time;

pub use bbox::{BoundingBox, COORD_EPSILON};
pub use error::{CommonError, CommonResult};
pub use geometry::Geometry;
pub use record::{RawRecord, RecordFields};
pub use time::parse_timestamp;
