use std::time::Duration;

use moka::{
    future::Cache,
    ops::compute::{CompResult, Op},
};
use time::OffsetDateTime;

/// Limits statistics recalculation to once per interval per (project, job).
pub struct RecalculateThrottle {
    interval: Duration,
    last_enqueued: Cache<(u64, String), OffsetDateTime>,
}

impl RecalculateThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_enqueued: Cache::builder().time_to_live(interval).build() }
    }

    /// Whether a recalculation should be enqueued at `now`, recording it if so.
    pub async fn should_enqueue(
        &self,
        project_id: u64,
        job_id: &str,
        now: OffsetDateTime,
    ) -> bool {
        let interval = self.interval;
        let result = self
            .last_enqueued
            .entry((project_id, job_id.to_string()))
            .and_compute_with(|entry| {
                let op = match entry {
                    Some(last) if now - *last.value() < interval => Op::Nop,
                    _ => Op::Put(now),
                };
                std::future::ready(op)
            })
            .await;
        matches!(result, CompResult::Inserted(_) | CompResult::ReplacedWith(_))
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[tokio::test]
    async fn test_once_per_hour() {
        let throttle = RecalculateThrottle::new(Duration::from_secs(3600));
        let start = datetime!(2024-05-01 10:00 UTC);
        let cases: &[(u64, &str, time::Duration, bool)] = &[
            (1, "unit-tests", time::Duration::ZERO, true),
            (1, "unit-tests", time::Duration::minutes(1), false),
            (1, "unit-tests", time::Duration::minutes(59), false),
            (1, "lint", time::Duration::minutes(59), true),
            (2, "unit-tests", time::Duration::minutes(59), true),
            (1, "unit-tests", time::Duration::minutes(60), true),
            (1, "unit-tests", time::Duration::minutes(61), false),
            (1, "unit-tests", time::Duration::minutes(120), true),
        ];
        for &(project_id, job_id, offset, expected) in cases {
            assert_eq!(
                throttle.should_enqueue(project_id, job_id, start + offset).await,
                expected,
                "{project_id} {job_id} +{offset}"
            );
        }
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let throttle = RecalculateThrottle::new(Duration::from_millis(50));
        let now = OffsetDateTime::now_utc();
        for job_run in 0..100u64 {
            assert!(throttle.should_enqueue(job_run, "unit-tests", now).await);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        throttle.last_enqueued.run_pending_tasks().await;
        assert_eq!(throttle.last_enqueued.entry_count(), 0);
    }
}
