use std::{hash::Hash, sync::Arc, time::Duration};

use moka::future::Cache;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Process-local record of keys whose work is done, plus one lock per key.
///
/// Best-effort only: it resets on restart and is not shared between workers,
/// so callers still check storage before writing.
#[derive(Clone)]
pub struct ProcessedKeys<K> {
    processed: Cache<K, ()>,
    locks: Cache<K, Arc<Semaphore>>,
}

impl<K> ProcessedKeys<K>
where K: Hash + Eq + Clone + Send + Sync + 'static
{
    /// Processed keys are forgotten after `ttl`; locks after `ttl` without use.
    pub fn new(ttl: Duration) -> Self {
        Self {
            processed: Cache::builder().time_to_live(ttl).build(),
            locks: Cache::builder().time_to_idle(ttl).build(),
        }
    }

    pub fn contains(&self, key: &K) -> bool { self.processed.contains_key(key) }

    /// Wait until no other holder works on `key`.
    pub async fn lock(&self, key: &K) -> Result<OwnedSemaphorePermit, AcquireError> {
        let semaphore =
            self.locks.get_with(key.clone(), async { Arc::new(Semaphore::new(1)) }).await;
        semaphore.acquire_owned().await
    }

    pub async fn mark_processed(&self, key: K) { self.processed.insert(key, ()).await }
}
