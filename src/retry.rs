//! Per-node retry policy with deterministic, replayable jitter.
//!
//! Backoff follows `min(base · 2^attempt, max) + uniform(0, base)` where the
//! jitter draw comes from the work item's seeded RNG — so two runs with the
//! same seed sleep for identical durations, and replay reproduces the original
//! attempt sequence.

use std::sync::Arc;
use std::time::Duration;

use crate::node::NodeError;
use crate::rng::DetRng;

/// Predicate deciding whether a node error is worth another attempt.
pub type RetryClassifier = Arc<dyn Fn(&NodeError) -> bool + Send + Sync>;

/// Retry configuration declared per node.
///
/// `max_attempts == 1` disables retry entirely: one initial attempt, no
/// retries. Exhausting the budget surfaces as
/// [`RunError::MaxAttemptsExceeded`](crate::errors::RunError::MaxAttemptsExceeded).
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempt budget, including the first attempt. Must be ≥ 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Cap on the exponential component. Must be ≥ `base_delay`.
    pub max_delay: Duration,
    pub retry_on: RetryClassifier,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            retry_on: Arc::new(NodeError::is_retryable),
        }
    }
}

impl RetryPolicy {
    /// Policy with `max_attempts` attempts and the default classifier.
    #[must_use]
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max.max(base);
        self
    }

    #[must_use]
    pub fn with_classifier(
        mut self,
        retry_on: impl Fn(&NodeError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_on = Arc::new(retry_on);
        self
    }

    /// Whether a failed attempt number `attempt` (0-based) may be retried.
    #[must_use]
    pub fn should_retry(&self, attempt: u32, error: &NodeError) -> bool {
        attempt + 1 < self.max_attempts && (self.retry_on)(error)
    }

    /// Backoff before re-running a failed attempt (0-based), jittered from the
    /// work item's deterministic RNG.
    pub fn backoff_delay(&self, attempt: u32, rng: &mut DetRng) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let exp = base_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(max_ms);
        let jitter = rng.next_range(base_ms);
        Duration::from_millis(exp + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ordering::compute_order_key;
    use crate::types::{NodeId, RunId};

    fn rng() -> DetRng {
        DetRng::for_work_item(
            1,
            &RunId::from("run"),
            compute_order_key(&NodeId::from("n"), 0),
        )
    }

    #[test]
    fn single_attempt_never_retries() {
        let policy = RetryPolicy::default();
        let err = NodeError::Timeout {
            elapsed: Duration::from_secs(1),
        };
        assert!(!policy.should_retry(0, &err));
    }

    #[test]
    fn classifier_gates_retry() {
        let policy = RetryPolicy::attempts(3);
        let retryable = NodeError::Timeout {
            elapsed: Duration::from_secs(1),
        };
        let fatal = NodeError::ValidationFailed("bad input".into());
        assert!(policy.should_retry(0, &retryable));
        assert!(policy.should_retry(1, &retryable));
        assert!(!policy.should_retry(2, &retryable));
        assert!(!policy.should_retry(0, &fatal));
    }

    #[test]
    fn backoff_is_deterministic_and_bounded() {
        let policy = RetryPolicy::attempts(5)
            .with_delays(Duration::from_millis(10), Duration::from_millis(100));
        let mut a = rng();
        let mut b = rng();
        for attempt in 0..4 {
            let da = policy.backoff_delay(attempt, &mut a);
            let db = policy.backoff_delay(attempt, &mut b);
            assert_eq!(da, db);
            let exp = (10u64 * 2u64.pow(attempt)).min(100);
            assert!(da.as_millis() as u64 >= exp);
            assert!((da.as_millis() as u64) < exp + 10);
        }
    }
}
