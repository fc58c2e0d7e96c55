//! Explicit field-by-field schema validation of raw API payloads.

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info};

use crate::{ComicRecord, InvalidRecord, RawPayload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: &'static str,
    pub reason: String,
}

/// Every field of one payload that failed coercion, in declared field order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", render_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<FieldIssue>,
}

fn render_issues(issues: &[FieldIssue]) -> String {
    let noun = if issues.len() == 1 { "error" } else { "errors" };
    let details = issues
        .iter()
        .map(|issue| format!("{}: {}", issue.field, issue.reason))
        .collect::<Vec<_>>()
        .join("; ");
    format!("{} validation {noun} for ComicRecord; {details}", issues.len())
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn coerce_int(payload: &RawPayload, field: &'static str) -> Result<i64, String> {
    match payload.get(field) {
        None => Err("field required".to_string()),
        Some(JsonValue::Number(n)) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            match n.as_f64() {
                Some(f) if f.is_finite() && f.fract() == 0.0 => {
                    if f >= i64::MIN as f64 && f < i64::MAX as f64 {
                        Ok(f as i64)
                    } else {
                        Err(format!("integer out of range: {n}"))
                    }
                }
                _ => Err(format!("expected integer, got fractional number {n}")),
            }
        }
        Some(JsonValue::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("expected integer, got string {s:?}")),
        Some(other) => Err(format!("expected integer, got {}", json_kind(other))),
    }
}

fn coerce_str(payload: &RawPayload, field: &'static str) -> Result<String, String> {
    match payload.get(field) {
        None => Err("field required".to_string()),
        Some(JsonValue::String(s)) => Ok(s.clone()),
        Some(other) => Err(format!("expected string, got {}", json_kind(other))),
    }
}

struct Collector {
    issues: Vec<FieldIssue>,
}

impl Collector {
    fn take<T>(&mut self, field: &'static str, result: Result<T, String>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(reason) => {
                self.issues.push(FieldIssue { field, reason });
                None
            }
        }
    }
}

/// Coerce one payload into a [`ComicRecord`], reporting every failing field.
pub fn validate_one(payload: &RawPayload) -> Result<ComicRecord, ValidationError> {
    let mut c = Collector { issues: Vec::new() };

    let month = c.take("month", coerce_int(payload, "month"));
    let num = c.take("num", coerce_int(payload, "num"));
    let year = c.take("year", coerce_int(payload, "year"));
    let news = c.take("news", coerce_str(payload, "news"));
    let safe_title = c.take("safe_title", coerce_str(payload, "safe_title"));
    let transcript = c.take("transcript", coerce_str(payload, "transcript"));
    let alt = c.take("alt", coerce_str(payload, "alt"));
    let img = c.take("img", coerce_str(payload, "img"));
    let title = c.take("title", coerce_str(payload, "title"));
    let day = c.take("day", coerce_int(payload, "day"));

    match (
        month, num, year, news, safe_title, transcript, alt, img, title, day,
    ) {
        (
            Some(month),
            Some(num),
            Some(year),
            Some(news),
            Some(safe_title),
            Some(transcript),
            Some(alt),
            Some(img),
            Some(title),
            Some(day),
        ) => Ok(ComicRecord {
            month,
            num,
            year,
            news,
            safe_title,
            transcript: Some(transcript),
            alt: Some(alt),
            img,
            title,
            day,
        }),
        _ => Err(ValidationError { issues: c.issues }),
    }
}

/// Partition payloads into typed records and quarantined payloads.
///
/// Input order is preserved on both sides and a failing payload never stops
/// the rest of the batch.
pub fn validate(payloads: Vec<RawPayload>) -> (Vec<ComicRecord>, Vec<InvalidRecord>) {
    let total = payloads.len();
    let mut valid = Vec::with_capacity(total);
    let mut invalid = Vec::new();

    for payload in payloads {
        match validate_one(&payload) {
            Ok(record) => valid.push(record),
            Err(err) => {
                let rejected = InvalidRecord {
                    record: payload,
                    error: err.to_string(),
                };
                error!(num = ?rejected.num_hint(), error = %rejected.error, "invalid comic payload");
                invalid.push(rejected);
            }
        }
    }

    info!(total, valid = valid.len(), invalid = invalid.len(), "completed validation");
    (valid, invalid)
}
