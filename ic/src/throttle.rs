//! Leading-edge throttle for the prune passes

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Lets an action through at most once per interval
pub(crate) struct Throttle {
    interval_ms: i64,
    last_run: Mutex<Option<i64>>,
}

impl Throttle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval_ms: i64::try_from(interval.as_millis()).unwrap_or(i64::MAX),
            last_run: Mutex::new(None),
        }
    }

    /// Claim a run at `now`; false if the previous run is too recent
    pub(crate) fn try_begin(&self, now: i64) -> bool {
        let mut last_run = self.last_run.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = *last_run
            && now - last < self.interval_ms
        {
            return false;
        }
        *last_run = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_run_always_passes() {
        let throttle = Throttle::new(Duration::from_millis(100));
        assert!(throttle.try_begin(5));
    }

    #[test]
    fn test_runs_within_interval_are_dropped() {
        let throttle = Throttle::new(Duration::from_millis(100));
        assert!(throttle.try_begin(1_000));
        assert!(!throttle.try_begin(1_050));
        assert!(!throttle.try_begin(1_099));
        assert!(throttle.try_begin(1_100));
        assert!(!throttle.try_begin(1_150));
    }

    #[test]
    fn test_zero_interval_never_throttles() {
        let throttle = Throttle::new(Duration::ZERO);
        assert!(throttle.try_begin(1));
        assert!(throttle.try_begin(1));
    }
}
