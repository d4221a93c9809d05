//! Per-service circuit breaker.
//!
//! ```text
//! Closed ──(threshold failures in window)──► Open ──(cool-down)──► HalfOpen
//!   ▲                                          ▲                     │
//!   └────────────(trial succeeds)──────────────┼─────────────────────┤
//!                                              └──(trial fails)──────┘
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::ServiceError;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected without reaching the service
    Open,
    /// One trial call is testing whether the service recovered
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within `rolling_window` that open the breaker
    pub failure_threshold: u32,
    /// Window over which failures are counted
    pub rolling_window: Duration,
    /// How long the breaker stays open before admitting a trial call
    pub cooldown: Duration,
    /// Consecutive successes in `Closed` that clear the failure window
    pub reset_after_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            rolling_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            reset_after_successes: 1,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    success_streak: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker guarding one downstream service.
///
/// All state lives behind a single mutex that is never held across an await.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                success_streak: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current state. An open breaker whose cool-down elapsed still reports
    /// `Open` until a caller claims the trial.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Asks permission to make one call.
    ///
    /// Fails with [`ServiceError::CircuitOpen`] while open, or while a
    /// half-open trial is already in flight. The returned permit must be
    /// resolved with [`BreakerPermit::success`] or [`BreakerPermit::failure`];
    /// dropping an unresolved trial permit counts as a failure.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, ServiceError> {
        let mut inner = self.lock();
        let trial = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.cooldown);
                if !cooled {
                    return Err(ServiceError::CircuitOpen);
                }
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                tracing::info!(service = %self.service, "circuit breaker half-open, admitting trial call");
                true
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(ServiceError::CircuitOpen);
                }
                inner.trial_in_flight = true;
                true
            }
        };
        Ok(BreakerPermit {
            breaker: self,
            trial,
            resolved: false,
        })
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen if trial => {
                inner.state = BreakerState::Closed;
                inner.failures.clear();
                inner.success_streak = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                tracing::info!(service = %self.service, "circuit breaker closed");
            }
            BreakerState::Closed => {
                inner.success_streak += 1;
                if inner.success_streak >= self.config.reset_after_successes {
                    inner.failures.clear();
                    inner.success_streak = 0;
                }
            }
            // A call admitted before the breaker opened; it says nothing
            // about the current trial.
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen if trial => {
                self.open(&mut inner);
            }
            BreakerState::Closed => {
                let now = Instant::now();
                inner.success_streak = 0;
                inner.failures.push_back(now);
                while let Some(oldest) = inner.failures.front() {
                    if now.duration_since(*oldest) > self.config.rolling_window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            _ => {}
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.failures.clear();
        inner.success_streak = 0;
        inner.trial_in_flight = false;
        metrics::counter!("circuit_breaker_opened_total", "service" => self.service.clone())
            .increment(1);
        tracing::warn!(
            service = %self.service,
            cooldown_ms = self.config.cooldown.as_millis() as u64,
            "circuit breaker opened"
        );
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Permission to make one call through a [`CircuitBreaker`].
#[derive(Debug)]
#[must_use = "a permit must be resolved with success() or failure()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl BreakerPermit<'_> {
    /// Returns true if this permit is the half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.on_failure(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "payment-service",
            BreakerConfig {
                failure_threshold: 3,
                rolling_window: Duration::from_secs(60),
                cooldown: Duration::from_secs(10),
                reset_after_successes: 1,
            },
        )
    }

    fn fail(b: &CircuitBreaker, times: usize) {
        for _ in 0..times {
            b.try_acquire().unwrap().failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let b = breaker();
        fail(&b, 2);
        assert_eq!(b.state(), BreakerState::Closed);
        fail(&b, 1);
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.try_acquire().unwrap_err(), ServiceError::CircuitOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_failure_window() {
        let b = breaker();
        fail(&b, 2);
        b.try_acquire().unwrap().success();
        fail(&b, 2);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_failures_leave_the_window() {
        let b = breaker();
        fail(&b, 2);
        tokio::time::advance(Duration::from_secs(61)).await;
        fail(&b, 1);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_cooldown() {
        let b = breaker();
        fail(&b, 3);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(b.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = b.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(b.state(), BreakerState::HalfOpen);

        // Concurrent callers are turned away while the trial runs.
        assert_eq!(b.try_acquire().unwrap_err(), ServiceError::CircuitOpen);

        trial.success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(!b.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let b = breaker();
        fail(&b, 3);
        tokio::time::advance(Duration::from_secs(10)).await;

        b.try_acquire().unwrap().failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.try_acquire().is_err());

        // The cool-down restarts from the failed trial.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(b.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_counts_as_failure() {
        let b = breaker();
        fail(&b, 3);
        tokio::time::advance(Duration::from_secs(10)).await;

        drop(b.try_acquire().unwrap());
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_closed_permit_is_ignored() {
        let b = breaker();
        fail(&b, 2);
        drop(b.try_acquire().unwrap());
        assert_eq!(b.state(), BreakerState::Closed);
    }
}
