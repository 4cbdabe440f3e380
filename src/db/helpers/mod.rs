use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::db::models::Metadata;

/// Upper bound on bound parameters per `IN (...)` query.
pub const SQL_CHUNK: usize = 500;

/// Fixed-width RFC 3339 so timestamps sort lexicographically in SQL.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn serialize_metadata(metadata: &Metadata) -> Result<String> {
    serde_json::to_string(metadata).context("failed to serialize metadata")
}

/// Stored metadata that is empty, unparseable or not an object reads as `{}`.
pub fn deserialize_metadata(raw: &str) -> Metadata {
    if raw.is_empty() {
        return Metadata::new();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => Metadata::new(),
    }
}

/// JSON round trip, so incoming maps compare equal to what a later read returns.
pub fn canonical_metadata(metadata: Metadata) -> Result<Metadata> {
    let serialized = serialize_metadata(&metadata)?;
    Ok(deserialize_metadata(&serialized))
}

pub fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

/// Non-empty ids in first-seen order, without duplicates.
pub fn distinct_ids<S: AsRef<str>>(ids: &[S]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.iter()
        .map(|id| id.as_ref())
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}
