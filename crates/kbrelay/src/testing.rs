//! Test utilities for kbrelay - in-memory knowledge sources
//!
//! `ScriptedSource` replays a fixed sequence of fetch outcomes and counts
//! how many fetches were issued, which is what the cache tests assert on.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::knowledge::source::KnowledgeSource;
use crate::knowledge::types::Record;

/// One scripted fetch outcome: record objects, or a failure reason
pub type ScriptStep = std::result::Result<Vec<Value>, String>;

/// Knowledge source that replays scripted outcomes in order.
///
/// The last step repeats once the script is exhausted.
#[derive(Debug)]
pub struct ScriptedSource {
    steps: Mutex<Vec<ScriptStep>>,
    fetches: AtomicUsize,
    delay: Duration,
}

impl ScriptedSource {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps),
            fetches: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Always succeed with the same records
    pub fn always(records: Vec<Value>) -> Self {
        Self::new(vec![Ok(records)])
    }

    /// Always fail with `reason`
    pub fn failing(reason: &str) -> Self {
        Self::new(vec![Err(reason.to_string())])
    }

    /// Sleep before answering each fetch
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of fetches issued so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> ScriptStep {
        let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        if steps.len() > 1 {
            steps.remove(0)
        } else {
            steps
                .first()
                .cloned()
                .unwrap_or_else(|| Err("script is empty".to_string()))
        }
    }
}

#[async_trait]
impl KnowledgeSource for ScriptedSource {
    async fn fetch(&self, dataset: &str) -> Result<Vec<Record>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.next_step() {
            Ok(values) => Ok(values
                .into_iter()
                .filter_map(|v| match v {
                    Value::Object(fields) => Some(Record::new(fields)),
                    _ => None,
                })
                .collect()),
            Err(reason) => Err(RelayError::SourceUnavailable {
                dataset: dataset.to_string(),
                reason,
            }),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scripted_source_replays_in_order() {
        let source = ScriptedSource::new(vec![
            Ok(vec![json!({"a": 1})]),
            Err("down".to_string()),
        ]);

        assert_eq!(source.fetch("x").await.unwrap().len(), 1);
        assert!(source.fetch("x").await.is_err());
        // Last step repeats
        assert!(source.fetch("x").await.is_err());
        assert_eq!(source.fetch_count(), 3);
    }

    #[tokio::test]
    async fn scripted_source_skips_non_objects() {
        let source = ScriptedSource::always(vec![json!({"a": 1}), json!("nope")]);
        assert_eq!(source.fetch("x").await.unwrap().len(), 1);
    }
}
