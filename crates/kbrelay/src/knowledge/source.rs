//! External knowledge sources
//!
//! A source returns the full record set of one dataset. The HTTP source
//! expects a JSON object mapping group names to arrays of flat records and
//! flattens the groups, in document order, into a single sequence.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::KnowledgeConfig;
use crate::error::{RelayError, Result};
use crate::knowledge::types::Record;

/// Trait for anything that can produce the records of a dataset
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// Fetch every record of `dataset`
    ///
    /// Failures are reported as `RelayError::SourceUnavailable`.
    async fn fetch(&self, dataset: &str) -> Result<Vec<Record>>;

    /// Source name for logging
    fn name(&self) -> &'static str;
}

/// Knowledge source backed by one unauthenticated GET endpoint per dataset
#[derive(Debug, Clone)]
pub struct HttpKnowledgeSource {
    client: Client,
    urls: HashMap<String, String>,
}

impl HttpKnowledgeSource {
    /// Build a source from the configured datasets
    pub fn new(config: &KnowledgeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to create HTTP client: {e}")))?;

        let urls = config
            .datasets
            .iter()
            .map(|d| (d.id.clone(), d.url.clone()))
            .collect();

        Ok(Self::with_client(client, urls))
    }

    pub fn with_client(client: Client, urls: HashMap<String, String>) -> Self {
        Self { client, urls }
    }

    fn unavailable(dataset: &str, reason: impl Into<String>) -> RelayError {
        RelayError::SourceUnavailable {
            dataset: dataset.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl KnowledgeSource for HttpKnowledgeSource {
    async fn fetch(&self, dataset: &str) -> Result<Vec<Record>> {
        let url = self
            .urls
            .get(dataset)
            .ok_or_else(|| Self::unavailable(dataset, "dataset is not configured"))?;

        debug!(dataset, %url, "Fetching knowledge dataset");

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                Self::unavailable(dataset, format!("request timed out: {e}"))
            } else {
                Self::unavailable(dataset, format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::unavailable(dataset, format!("HTTP error {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Self::unavailable(dataset, format!("invalid JSON body: {e}")))?;

        flatten_groups(dataset, body)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Flatten `{ group: [record, ...], ... }` into one ordered record list.
///
/// Group names are dropped. Non-array groups and non-object items are
/// skipped with a warning rather than failing the whole dataset.
pub fn flatten_groups(dataset: &str, body: Value) -> Result<Vec<Record>> {
    let Value::Object(groups) = body else {
        return Err(RelayError::SourceUnavailable {
            dataset: dataset.to_string(),
            reason: "expected a JSON object of record groups".to_string(),
        });
    };

    let mut records = Vec::new();
    for (group, items) in groups {
        let Value::Array(items) = items else {
            warn!(dataset, group = %group, "Skipping non-array record group");
            continue;
        };
        for item in items {
            match item {
                Value::Object(fields) => records.push(Record::new(fields)),
                other => {
                    warn!(dataset, group = %group, "Skipping non-object record: {other}");
                }
            }
        }
    }

    debug!(dataset, count = records.len(), "Flattened knowledge dataset");
    Ok(records)
}
