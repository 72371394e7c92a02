use std::time::Duration;

use tokio::time::Instant;

/// Two-state circuit breaker guarding one named downstream dependency.
///
/// The breaker does no I/O and makes no policy decisions: callers decide
/// which failures count against the tracked dependency (task bodies tag
/// their errors), and the breaker only keeps the counter/deadline machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    open: bool,
    reset_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            dependency: dependency.into(),
            threshold,
            cooldown,
            consecutive_failures: 0,
            open: false,
            reset_at: None,
        }
    }

    /// Gate check, evaluated lazily: crossing the reset deadline closes the
    /// breaker and zeroes the counter. Returns false while open — the gated
    /// operation must be skipped for this tick.
    pub fn allow(&mut self, now: Instant) -> bool {
        if self.open {
            match self.reset_at {
                Some(reset_at) if now > reset_at => {
                    tracing::info!("Resetting {} circuit breaker", self.dependency);
                    self.open = false;
                    self.reset_at = None;
                    self.consecutive_failures = 0;
                }
                _ => return false,
            }
        }
        true
    }

    /// Record a failure attributed to the tracked dependency. Opens the
    /// breaker once the threshold is reached; returns true when this call
    /// was the one that opened it.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures += 1;
        if !self.open && self.consecutive_failures >= self.threshold {
            self.open = true;
            self.reset_at = Some(now + self.cooldown);
            tracing::warn!(
                "Circuit breaker opened for {} - pausing gated work for {}s",
                self.dependency,
                self.cooldown.as_secs()
            );
            return true;
        }
        false
    }

    /// A success anywhere zeroes the failure counter immediately, regardless
    /// of open/closed state. Does not close an open breaker early.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("model", 5, Duration::from_secs(300))
    }

    #[test]
    fn opens_after_threshold_failures() {
        let mut b = breaker();
        let now = Instant::now();
        for _ in 0..4 {
            assert!(!b.record_failure(now));
            assert!(!b.is_open());
        }
        assert!(b.record_failure(now));
        assert!(b.is_open());
        assert!(!b.allow(now));
    }

    #[test]
    fn stays_open_until_deadline_then_closes_and_zeroes() {
        let mut b = breaker();
        let now = Instant::now();
        for _ in 0..5 {
            b.record_failure(now);
        }
        assert!(!b.allow(now + Duration::from_secs(299)));
        assert!(b.is_open());

        // First gated check past the deadline closes it
        assert!(b.allow(now + Duration::from_secs(301)));
        assert!(!b.is_open());
        assert_eq!(b.failure_count(), 0);
    }

    #[test]
    fn success_resets_counter_without_closing() {
        let mut b = breaker();
        let now = Instant::now();
        for _ in 0..3 {
            b.record_failure(now);
        }
        b.record_success();
        assert_eq!(b.failure_count(), 0);

        for _ in 0..5 {
            b.record_failure(now);
        }
        assert!(b.is_open());
        b.record_success();
        // Counter zeroed, but the breaker stays open until the deadline
        assert_eq!(b.failure_count(), 0);
        assert!(b.is_open());
        assert!(!b.allow(now + Duration::from_secs(1)));
    }
}
