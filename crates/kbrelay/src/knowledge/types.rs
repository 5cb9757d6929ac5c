//! Knowledge base data types
//!
//! Records are schemaless field/value mappings fetched from the external
//! source. A `CacheEntry` is the immutable snapshot of one dataset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// A single knowledge record: field name to printable value.
///
/// Field order follows the source document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Iterate fields in source order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lower-cased text of the full record, used for keyword scoring
    pub fn search_text(&self) -> String {
        serde_json::to_string(&self.0)
            .unwrap_or_default()
            .to_lowercase()
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Render a field value for humans: strings without quotes, null as empty
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Snapshot of one dataset as of its last successful fetch
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub records: Arc<Vec<Record>>,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: Arc::new(records),
            fetched_at: Utc::now(),
        }
    }

    /// Whether the entry is younger than `ttl` at `now`
    pub fn is_fresh_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now.signed_duration_since(self.fetched_at) < ttl,
            // TTL too large to represent: never expires
            Err(_) => true,
        }
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.is_fresh_at(Utc::now(), ttl)
    }
}

/// How a cache lookup was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from a fresh entry without I/O
    Hit,
    /// A refresh succeeded and replaced the entry
    Refreshed,
    /// The refresh failed; the previous entry was served
    Stale,
}

/// Records returned by a cache lookup
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub records: Arc<Vec<Record>>,
    pub fetched_at: DateTime<Utc>,
    pub outcome: CacheOutcome,
}

impl CacheLookup {
    pub fn new(entry: &CacheEntry, outcome: CacheOutcome) -> Self {
        Self {
            records: Arc::clone(&entry.records),
            fetched_at: entry.fetched_at,
            outcome,
        }
    }
}

/// A record paired with its keyword score for one retrieval call
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: Record,
    pub score: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_record_preserves_field_order() {
        let r = record(json!({"zeta": 1, "alpha": "two", "mid": null}));
        let keys: Vec<&str> = r.fields().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_search_text_is_lowercase() {
        let r = record(json!({"Title": "Clownfish AND Anemone"}));
        assert_eq!(r.search_text(), r#"{"title":"clownfish and anemone"}"#);
    }

    #[test]
    fn test_display_value() {
        assert_eq!(display_value(&json!("plain")), "plain");
        assert_eq!(display_value(&json!(12)), "12");
        assert_eq!(display_value(&json!(true)), "true");
        assert_eq!(display_value(&Value::Null), "");
    }

    #[test]
    fn test_entry_freshness() {
        let mut entry = CacheEntry::new(vec![]);
        let now = entry.fetched_at;
        assert!(entry.is_fresh_at(now, Duration::from_secs(60)));
        assert!(!entry.is_fresh_at(now, Duration::ZERO));

        entry.fetched_at = now - chrono::Duration::seconds(120);
        assert!(!entry.is_fresh_at(now, Duration::from_secs(60)));
        assert!(entry.is_fresh_at(now, Duration::from_secs(600)));
    }

    #[test]
    fn test_lookup_shares_records() {
        let entry = CacheEntry::new(vec![record(json!({"a": 1}))]);
        let lookup = CacheLookup::new(&entry, CacheOutcome::Hit);
        assert!(Arc::ptr_eq(&lookup.records, &entry.records));
        assert_eq!(lookup.outcome, CacheOutcome::Hit);
    }
}
