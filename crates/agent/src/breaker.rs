use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

/// Shared failure accounting for the completion service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CircuitState {
    pub consecutive_failures: u32,
    pub open_until: Option<Instant>,
}

impl CircuitState {
    pub fn is_open_at(&self, now: Instant) -> bool {
        self.open_until.is_some_and(|until| now < until)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    /// Cooldown elapsed; the next call will be let through.
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub retry_in: Option<Duration>,
}

/// Verdict for a caller about to start a completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerGate {
    Proceed,
    Reject { retry_in: Duration },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    Counted { consecutive_failures: u32 },
    /// This failure tripped the breaker.
    Opened { consecutive_failures: u32 },
    /// Another request already tripped it.
    AlreadyOpen,
}

impl FailureOutcome {
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Counted { .. })
    }
}

/// Process-local breaker: Closed until `threshold` consecutive failures, then
/// Open for `cooldown`. The first check after the cooldown resets it to Closed
/// before letting the call through, so a failing trial call has to accumulate
/// `threshold` failures again to re-open.
///
/// State lives behind a std mutex that is never held across an await, so an
/// increment and its threshold check are always observed together.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self { threshold: threshold.max(1), cooldown, state: Mutex::new(CircuitState::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Admission check that also performs the half-open transition.
    pub fn check(&self) -> BreakerGate {
        let now = Instant::now();
        let mut state = self.lock();
        match state.open_until {
            Some(until) if now < until => BreakerGate::Reject { retry_in: until - now },
            Some(_) => {
                state.open_until = None;
                state.consecutive_failures = 0;
                info!(
                    event_name = "agent.breaker.half_open",
                    "circuit cooldown elapsed, letting the next call through"
                );
                BreakerGate::Proceed
            }
            None => BreakerGate::Proceed,
        }
    }

    /// Read-only view; never transitions state.
    pub fn is_open(&self) -> bool {
        self.lock().is_open_at(Instant::now())
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.consecutive_failures > 0 || state.open_until.is_some() {
            info!(
                event_name = "agent.breaker.reset",
                previous_failures = state.consecutive_failures,
                "completion succeeded, failure count reset"
            );
        }
        *state = CircuitState::default();
    }

    pub fn record_failure(&self) -> FailureOutcome {
        let now = Instant::now();
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        if state.is_open_at(now) {
            return FailureOutcome::AlreadyOpen;
        }

        if state.consecutive_failures >= self.threshold {
            state.open_until = Some(now + self.cooldown);
            warn!(
                event_name = "agent.breaker.opened",
                consecutive_failures = state.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "circuit opened after repeated completion failures"
            );
            return FailureOutcome::Opened { consecutive_failures: state.consecutive_failures };
        }

        FailureOutcome::Counted { consecutive_failures: state.consecutive_failures }
    }

    pub fn state(&self) -> CircuitState {
        *self.lock()
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let state = self.lock();
        let (status, retry_in) = match state.open_until {
            Some(until) if now < until => (CircuitStatus::Open, Some(until - now)),
            Some(_) => (CircuitStatus::HalfOpen, None),
            None => (CircuitStatus::Closed, None),
        };
        CircuitSnapshot { status, consecutive_failures: state.consecutive_failures, retry_in }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{BreakerGate, CircuitBreaker, CircuitStatus, FailureOutcome};

    #[tokio::test(start_paused = true)]
    async fn opens_exactly_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));

        assert_eq!(breaker.record_failure(), FailureOutcome::Counted { consecutive_failures: 1 });
        assert_eq!(breaker.record_failure(), FailureOutcome::Counted { consecutive_failures: 2 });
        assert!(!breaker.is_open());
        assert_eq!(breaker.record_failure(), FailureOutcome::Opened { consecutive_failures: 3 });
        assert!(breaker.is_open());
        assert_eq!(breaker.record_failure(), FailureOutcome::AlreadyOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_until_cooldown_then_half_opens() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.record_failure();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.check(), BreakerGate::Reject { retry_in: Duration::from_secs(20) });
        assert_eq!(breaker.snapshot().status, CircuitStatus::Open);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!breaker.is_open(), "open only while now < open_until");
        assert_eq!(breaker.snapshot().status, CircuitStatus::HalfOpen);

        assert_eq!(breaker.check(), BreakerGate::Proceed);
        let state = breaker.state();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.open_until, None);
        assert_eq!(breaker.snapshot().status, CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_call_needs_full_threshold_to_reopen() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(5));
        breaker.record_failure();
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(breaker.check(), BreakerGate::Proceed);
        assert_eq!(breaker.record_failure(), FailureOutcome::Counted { consecutive_failures: 1 });
        assert!(breaker.record_failure().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();

        assert_eq!(breaker.state().consecutive_failures, 0);
        assert_eq!(breaker.record_failure(), FailureOutcome::Counted { consecutive_failures: 1 });
    }

    #[tokio::test]
    async fn concurrent_failures_open_once() {
        let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(30)));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let breaker = Arc::clone(&breaker);
            handles.push(tokio::spawn(async move { breaker.record_failure() }));
        }

        let mut opened = 0;
        for handle in handles {
            if matches!(handle.await.expect("join"), FailureOutcome::Opened { .. }) {
                opened += 1;
            }
        }

        assert_eq!(opened, 1);
        assert_eq!(breaker.state().consecutive_failures, 20);
    }
}
