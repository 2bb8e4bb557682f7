// Serde helpers for model fields that may come from the API in multiple formats.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer};

/// Deserializes attachments from either a JSON array of strings or a serialized
/// JSON string "[\"a.pdf\", ...]" (older backend rows store the latter).
pub fn deserialize_attachments<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum AttachmentFormat {
        Array(Vec<String>),
        String(String),
    }

    let value = Option::<AttachmentFormat>::deserialize(deserializer)?;
    match value {
        None => Ok(Vec::new()),
        Some(AttachmentFormat::Array(v)) => Ok(v),
        Some(AttachmentFormat::String(s)) => {
            let s = s.trim();
            if s.is_empty() || s == "[]" {
                return Ok(Vec::new());
            }
            serde_json::from_str(s).map_err(serde::de::Error::custom)
        }
    }
}

/// Normalizes a date that may arrive as "2025-08-25", "2025-08-25T00:00:00Z"
/// or a full RFC3339 timestamp into a plain calendar-date string.
pub fn normalize_calendar_date(raw: &str) -> Option<String> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date.format("%Y-%m-%d").to_string());
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive().format("%Y-%m-%d").to_string());
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(ts.date().format("%Y-%m-%d").to_string());
    }
    None
}

/// Converts an RFC3339 timestamp (with or without an explicit offset) into
/// epoch milliseconds. Returns None for anything unparseable.
pub fn parse_epoch_ms(raw: &str) -> Option<i64> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.timestamp_millis());
    }
    // PostgREST emits timestamps without offsets for `timestamp` columns.
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(ts.and_utc().timestamp_millis());
    }
    None
}
