//! Build/dependency cache keyed by `(component, stack, lockfile hash)`.
//!
//! Concurrent requests for one key collapse into a single populate call. The
//! first caller drives a shared future; everyone else awaits the same future
//! and receives its result. Failed populates are evicted so the next request
//! tries again.

use std::collections::HashMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use dispatch_core::{CacheKey, METRICS};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

use crate::error::{CacheError, JobError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Output of the populate step (install logs).
    pub output: String,
    pub populated_at: DateTime<Utc>,
}

type Populate = Shared<BoxFuture<'static, Result<CacheEntry, CacheError>>>;

enum Slot {
    Ready(CacheEntry),
    Pending(Populate),
}

#[derive(Default)]
pub struct BuildCache {
    slots: Mutex<HashMap<CacheKey, Slot>>,
}

impl BuildCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for `key`, running `populate` only if no entry exists
    /// and no populate for the key is already in flight.
    pub async fn get_or_populate<F, Fut>(
        &self,
        key: &CacheKey,
        populate: F,
    ) -> Result<CacheEntry, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, JobError>> + Send + 'static,
    {
        let (pending, leader) = {
            let mut slots = self.slots.lock().await;

            let failed = matches!(
                slots.get(key),
                Some(Slot::Pending(p)) if matches!(p.peek(), Some(Err(_)))
            );
            if failed {
                slots.remove(key);
            }

            match slots.get(key) {
                Some(Slot::Ready(entry)) => {
                    METRICS.inc_cache_hits();
                    tracing::debug!(key = %key, "cache hit");
                    return Ok(entry.clone());
                }
                Some(Slot::Pending(pending)) => {
                    METRICS.inc_cache_hits();
                    tracing::debug!(key = %key, "joining in-flight cache populate");
                    (pending.clone(), false)
                }
                None => {
                    METRICS.inc_cache_misses();
                    tracing::debug!(key = %key, "cache miss; populating");
                    let pending = populate_future(key.clone(), populate());
                    slots.insert(key.clone(), Slot::Pending(pending.clone()));
                    (pending, true)
                }
            }
        };

        let result = pending.await;

        if leader {
            let mut slots = self.slots.lock().await;
            match &result {
                Ok(entry) => {
                    slots.insert(key.clone(), Slot::Ready(entry.clone()));
                }
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "cache populate failed");
                    slots.remove(key);
                }
            }
        }
        result
    }

    /// Whether a completed entry exists for `key`.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        matches!(self.slots.lock().await.get(key), Some(Slot::Ready(_)))
    }

    pub async fn len(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn populate_future<Fut>(key: CacheKey, work: Fut) -> Populate
where
    Fut: Future<Output = Result<String, JobError>> + Send + 'static,
{
    async move {
        match work.await {
            Ok(output) => Ok(CacheEntry {
                key,
                output,
                populated_at: Utc::now(),
            }),
            Err(err) => Err(CacheError {
                key: key.to_string(),
                reason: err.message().to_string(),
            }),
        }
    }
    .boxed()
    .shared()
}
