//! Core domain model for the comic archive ELT: raw payloads, validated records,
//! quarantined payloads, plus the schema validator and text cleaner.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub mod cleaning;
pub mod validation;

pub use cleaning::{clean, clean_text};
pub use validation::{validate, validate_one, FieldIssue, ValidationError};

pub const CRATE_NAME: &str = "comics-core";

/// Untyped JSON object exactly as returned by the archive API.
pub type RawPayload = Map<String, JsonValue>;

/// Highest `num` currently persisted; `None` while the raw table is empty.
pub type Watermark = Option<i64>;

/// Record columns in declared order. The loader creates and fills the raw
/// table in this order and validation errors are reported in it.
pub const RECORD_FIELDS: [&str; 10] = [
    "month",
    "num",
    "year",
    "news",
    "safe_title",
    "transcript",
    "alt",
    "img",
    "title",
    "day",
];

/// Validated comic. `num` is the natural key.
///
/// `transcript` and `alt` are nullable because the cleaner maps empty text to
/// absence; validation always produces `Some`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComicRecord {
    pub month: i64,
    pub num: i64,
    pub year: i64,
    pub news: String,
    pub safe_title: String,
    pub transcript: Option<String>,
    pub alt: Option<String>,
    pub img: String,
    pub title: String,
    pub day: i64,
}

/// A payload diverted to quarantine together with the reason it was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidRecord {
    pub record: RawPayload,
    pub error: String,
}

impl InvalidRecord {
    /// The payload's `num` when it carries a usable one, for logging.
    pub fn num_hint(&self) -> Option<i64> {
        self.record.get("num").and_then(JsonValue::as_i64)
    }
}
