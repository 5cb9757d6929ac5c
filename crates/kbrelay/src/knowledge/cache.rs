//! Time-boxed knowledge cache with stale fallback
//!
//! Each dataset owns one immutable `CacheEntry`. A lookup serves the entry
//! while it is younger than the dataset's TTL; otherwise it refreshes from
//! the `KnowledgeSource`. When a refresh fails the previous entry is served
//! (graceful degradation); with nothing cached the failure propagates.
//!
//! Refreshes are single-flight: concurrent misses on one dataset join the
//! same in-flight fetch instead of issuing parallel requests.

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::KnowledgeConfig;
use crate::error::{RelayError, Result};
use crate::knowledge::source::KnowledgeSource;
use crate::knowledge::types::{CacheEntry, CacheLookup, CacheOutcome};

type RefreshResult = std::result::Result<Arc<CacheEntry>, String>;
type RefreshFuture = Shared<BoxFuture<'static, RefreshResult>>;

#[derive(Default)]
struct DatasetSlot {
    entry: Option<Arc<CacheEntry>>,
    in_flight: Option<(u64, RefreshFuture)>,
    next_refresh_id: u64,
}

/// Process-lifetime cache of knowledge datasets
pub struct RefreshableCache {
    source: Arc<dyn KnowledgeSource>,
    default_ttl: Duration,
    ttls: HashMap<String, Duration>,
    slots: DashMap<String, DatasetSlot>,
}

impl RefreshableCache {
    /// Create a cache where every dataset uses `ttl`
    pub fn new(source: Arc<dyn KnowledgeSource>, ttl: Duration) -> Self {
        Self {
            source,
            default_ttl: ttl,
            ttls: HashMap::new(),
            slots: DashMap::new(),
        }
    }

    /// Create a cache with per-dataset TTLs from configuration
    pub fn from_config(source: Arc<dyn KnowledgeSource>, config: &KnowledgeConfig) -> Self {
        let ttls = config
            .datasets
            .iter()
            .map(|d| (d.id.clone(), config.ttl_for(&d.id)))
            .collect();

        Self {
            source,
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            ttls,
            slots: DashMap::new(),
        }
    }

    /// TTL applied to `dataset`
    pub fn ttl(&self, dataset: &str) -> Duration {
        self.ttls.get(dataset).copied().unwrap_or(self.default_ttl)
    }

    /// Get the records of `dataset`, refreshing if the entry is missing or expired.
    ///
    /// Fails with `RelayError::SourceUnavailable` only when the refresh failed
    /// and no entry of any age exists.
    pub async fn get(&self, dataset: &str) -> Result<CacheLookup> {
        let ttl = self.ttl(dataset);

        let (refresh_id, refresh) = {
            let mut slot = self.slots.entry(dataset.to_string()).or_default();

            if let Some(entry) = slot.entry.as_ref().filter(|e| e.is_fresh(ttl)) {
                debug!(dataset, "Knowledge cache hit");
                return Ok(CacheLookup::new(entry, CacheOutcome::Hit));
            }

            match slot.in_flight.clone() {
                Some(joined) => {
                    debug!(dataset, "Joining in-flight knowledge refresh");
                    joined
                }
                None => {
                    let id = slot.next_refresh_id;
                    slot.next_refresh_id += 1;
                    let fut = self.start_refresh(dataset);
                    slot.in_flight = Some((id, fut.clone()));
                    (id, fut)
                }
            }
        };

        let result = refresh.await;

        let mut slot = self.slots.entry(dataset.to_string()).or_default();
        let owns_refresh = matches!(slot.in_flight, Some((id, _)) if id == refresh_id);
        if owns_refresh {
            slot.in_flight = None;
        }

        match result {
            Ok(entry) => {
                if owns_refresh {
                    info!(
                        dataset,
                        records = entry.records.len(),
                        "Knowledge dataset refreshed"
                    );
                    slot.entry = Some(Arc::clone(&entry));
                }
                Ok(CacheLookup::new(&entry, CacheOutcome::Refreshed))
            }
            Err(reason) => match &slot.entry {
                Some(previous) => {
                    warn!(
                        dataset,
                        error = %reason,
                        fetched_at = %previous.fetched_at,
                        "Knowledge refresh failed, serving stale records"
                    );
                    Ok(CacheLookup::new(previous, CacheOutcome::Stale))
                }
                None => Err(RelayError::SourceUnavailable {
                    dataset: dataset.to_string(),
                    reason,
                }),
            },
        }
    }

    /// Drop the cached entry so the next lookup refetches.
    ///
    /// A refresh already in flight still answers its waiters but no longer
    /// installs its result.
    pub fn invalidate(&self, dataset: &str) {
        if let Some(mut slot) = self.slots.get_mut(dataset) {
            slot.entry = None;
            slot.in_flight = None;
            debug!(dataset, "Knowledge cache entry invalidated");
        }
    }

    fn start_refresh(&self, dataset: &str) -> RefreshFuture {
        let source = Arc::clone(&self.source);
        let dataset = dataset.to_string();

        async move {
            debug!(dataset = %dataset, source = source.name(), "Refreshing knowledge dataset");
            match source.fetch(&dataset).await {
                Ok(records) => Ok(Arc::new(CacheEntry::new(records))),
                Err(RelayError::SourceUnavailable { reason, .. }) => Err(reason),
                Err(e) => Err(e.to_string()),
            }
        }
        .boxed()
        .shared()
    }
}
