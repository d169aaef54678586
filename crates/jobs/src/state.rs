use ci_insights_core::config::ProcessingConfig;
use ci_insights_gitlab::refs::BranchCache;

use crate::{dedup::ProcessedKeys, throttle::RecalculateThrottle};

/// In-memory services shared by every handler of a worker process.
pub struct ProcessingState {
    /// Resolved (project id, commit sha) ancestries.
    pub commit_parents: ProcessedKeys<(u64, String)>,
    /// (project id, job run id) pairs whose in-progress snapshot is settled.
    pub in_progress_jobs: ProcessedKeys<(u64, u64)>,
    pub recalculate: RecalculateThrottle,
    pub branches: BranchCache,
}

impl ProcessingState {
    pub fn new(config: &ProcessingConfig) -> Self {
        Self {
            commit_parents: ProcessedKeys::new(config.dedup_ttl()),
            in_progress_jobs: ProcessedKeys::new(config.dedup_ttl()),
            recalculate: RecalculateThrottle::new(config.recalculate_interval()),
            branches: BranchCache::new(),
        }
    }
}
