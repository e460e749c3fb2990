// Completion counters for one fetch run and the failure-rate heuristics that
// infer DRM protection from them.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::HarvestError;
use crate::config::FetcherConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TallySnapshot {
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl TallySnapshot {
    pub fn failure_ratio(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.failed as f64 / self.completed as f64
        }
    }

    pub fn success_ratio(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.completed as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct FetchTally {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl FetchTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TallySnapshot {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        TallySnapshot {
            completed: succeeded + failed,
            succeeded,
            failed,
        }
    }
}

/// Thresholds applied to a [`FetchTally`].
#[derive(Debug, Clone, Copy)]
pub struct AbortPolicy {
    pub early_window: usize,
    pub sustained_min_completed: usize,
    pub sustained_failure_ratio: f64,
    pub min_success_ratio: f64,
}

impl From<&FetcherConfig> for AbortPolicy {
    fn from(config: &FetcherConfig) -> Self {
        Self {
            early_window: config.early_abort_window,
            sustained_min_completed: config.sustained_abort_min_completed,
            sustained_failure_ratio: config.sustained_abort_failure_ratio,
            min_success_ratio: config.min_success_ratio,
        }
    }
}

impl AbortPolicy {
    /// Checked after every completion while jobs are still running.
    pub fn check_running(&self, tally: &TallySnapshot) -> Result<(), HarvestError> {
        if self.early_window > 0 && tally.completed >= self.early_window && tally.succeeded == 0 {
            return Err(HarvestError::drm_protected(
                tally.completed,
                tally.failed,
                format!("the first {} segment downloads all failed", self.early_window),
            ));
        }

        if tally.completed >= self.sustained_min_completed
            && tally.failure_ratio() > self.sustained_failure_ratio
        {
            return Err(HarvestError::drm_protected(
                tally.completed,
                tally.failed,
                format!(
                    "{:.0}% of {} segment downloads failed",
                    tally.failure_ratio() * 100.0,
                    tally.completed
                ),
            ));
        }

        Ok(())
    }

    /// Checked once every job has settled.
    pub fn check_settled(&self, tally: &TallySnapshot) -> Result<(), HarvestError> {
        if tally.completed > 0 && tally.success_ratio() < self.min_success_ratio {
            return Err(HarvestError::drm_protected(
                tally.completed,
                tally.failed,
                format!(
                    "only {} of {} segments downloaded",
                    tally.succeeded, tally.completed
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AbortPolicy {
        AbortPolicy::from(&FetcherConfig::default())
    }

    fn tally(succeeded: usize, failed: usize) -> TallySnapshot {
        TallySnapshot {
            completed: succeeded + failed,
            succeeded,
            failed,
        }
    }

    #[test]
    fn ten_leading_failures_abort() {
        assert!(policy().check_running(&tally(0, 9)).is_ok());
        let err = policy().check_running(&tally(0, 10)).unwrap_err();
        assert!(matches!(
            err,
            HarvestError::ContentDrmProtected {
                completed: 10,
                failed: 10,
                ..
            }
        ));
    }

    #[test]
    fn one_early_success_defers_to_sustained_ratio() {
        assert!(policy().check_running(&tally(1, 9)).is_ok());
        assert!(policy().check_running(&tally(1, 18)).is_ok());
        // 20 completed, 19 failed: 0.95 is not above the threshold.
        assert!(policy().check_running(&tally(1, 19)).is_ok());
        // 40 completed, 39 failed: 0.975.
        assert!(policy().check_running(&tally(1, 39)).is_err());
    }

    #[test]
    fn settled_success_ratio_floor() {
        assert!(policy().check_settled(&tally(1, 10)).is_err());
        assert!(policy().check_settled(&tally(1, 9)).is_ok());
        assert!(policy().check_settled(&tally(24, 1)).is_ok());
    }

    #[test]
    fn counters_are_shared_across_threads() {
        let tally = std::sync::Arc::new(FetchTally::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let tally = std::sync::Arc::clone(&tally);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        if i % 2 == 0 {
                            tally.record_success();
                        } else {
                            tally.record_failure();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tally.snapshot(), TallySnapshot {
            completed: 100,
            succeeded: 50,
            failed: 50,
        });
    }
}
