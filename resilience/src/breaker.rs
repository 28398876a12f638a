//! Three-state circuit breaker.
//!
//! ```text
//! CLOSED ──(failure_threshold consecutive failures)──▶ OPEN
//! OPEN ──(recovery timeout elapsed, next check)──▶ HALF_OPEN
//! HALF_OPEN ──(trial succeeds)──▶ CLOSED
//! HALF_OPEN ──(trial fails)──▶ OPEN (fresh recovery timer)
//! ```
//!
//! State only changes through [`CircuitBreaker::can_execute`],
//! [`CircuitBreaker::record_success`] and [`CircuitBreaker::record_failure`].
//! [`CircuitBreaker::acquire`] wraps admission in a [`Permit`] so a caller
//! that is cancelled mid-call still settles its outcome.
//! Timing uses [`tokio::time::Instant`] so paused-clock tests can advance it.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_recovery_timeout_secs() -> u64 {
    30
}

const fn default_half_open_max_calls() -> u32 {
    1
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable thresholds for one breaker instance.
///
/// Defaults suit a cheap dependency (5 failures, 30s recovery). Expensive
/// resources usually want a lower threshold and a longer recovery window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakerConfigError {
    #[error("failure_threshold must be at least 1")]
    ZeroFailureThreshold,
    #[error("half_open_max_calls must be at least 1")]
    ZeroHalfOpenCalls,
}

impl BreakerConfig {
    #[must_use]
    pub const fn new(failure_threshold: u32, recovery_timeout_secs: u64) -> Self {
        Self {
            failure_threshold,
            recovery_timeout_secs,
            half_open_max_calls: default_half_open_max_calls(),
        }
    }

    #[must_use]
    pub const fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    #[must_use]
    pub const fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), BreakerConfigError> {
        if self.failure_threshold == 0 {
            return Err(BreakerConfigError::ZeroFailureThreshold);
        }
        if self.half_open_max_calls == 0 {
            return Err(BreakerConfigError::ZeroHalfOpenCalls);
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker, suitable for a health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerHealth {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
    pub config: BreakerConfig,
}

/// Outcome of [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    #[error("circuit '{name}' is open")]
    Open {
        name: String,
        retry_after: Option<Duration>,
    },
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u64,
    /// Trial calls admitted since entering HALF_OPEN.
    half_open_calls: u32,
    last_failure_at: Option<DateTime<Utc>>,
    state_changed_at: Instant,
    state_changed_wall: DateTime<Utc>,
}

impl Inner {
    fn transition(&mut self, name: &str, to: BreakerState) {
        let from = self.state;
        self.state = to;
        self.state_changed_at = Instant::now();
        self.state_changed_wall = Utc::now();
        self.half_open_calls = 0;
        match to {
            BreakerState::Open => tracing::warn!(
                breaker = name,
                %from,
                failures = self.failure_count,
                "circuit opened"
            ),
            BreakerState::HalfOpen => {
                tracing::info!(breaker = name, %from, "circuit half-open, admitting trial calls");
            }
            BreakerState::Closed => tracing::info!(breaker = name, %from, "circuit closed"),
        }
    }
}

/// Guards one unreliable resource.
///
/// Safe to share behind an `Arc`; every method takes `&self` and holds the
/// internal lock only for bookkeeping, never across an await.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                last_failure_at: None,
                state_changed_at: Instant::now(),
                state_changed_wall: Utc::now(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Bookkeeping never panics mid-update, so a poisoned guard is still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask for permission to call the protected resource.
    ///
    /// In OPEN this is where the recovery timer is checked; the first check
    /// after it elapses moves to HALF_OPEN and is itself the first trial call.
    /// Trial slots that go unreported for a whole recovery window are
    /// treated as abandoned and the window starts over.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if inner.state_changed_at.elapsed() < self.config.recovery_timeout() {
                    return false;
                }
                inner.transition(&self.name, BreakerState::HalfOpen);
                inner.half_open_calls = 1;
                true
            }
            BreakerState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else if inner.state_changed_at.elapsed() >= self.config.recovery_timeout() {
                    tracing::debug!(breaker = %self.name, "half-open trial never reported");
                    inner.transition(&self.name, BreakerState::HalfOpen);
                    inner.half_open_calls = 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Admission as a [`Permit`]; `None` when the circuit refuses the call.
    pub fn acquire(&self) -> Option<Permit<'_>> {
        self.can_execute().then(|| Permit {
            breaker: self,
            settled: false,
        })
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.success_count = inner.success_count.saturating_add(1);
        match inner.state {
            BreakerState::Closed => inner.failure_count = 0,
            BreakerState::HalfOpen => {
                inner.failure_count = 0;
                inner.transition(&self.name, BreakerState::Closed);
            }
            // A call admitted before the circuit opened finished late.
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure_at = Some(Utc::now());
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                if inner.failure_count >= self.config.failure_threshold {
                    inner.transition(&self.name, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                inner.transition(&self.name, BreakerState::Open);
            }
            // Late failure from a call admitted before opening; the timer stays put.
            BreakerState::Open => {}
        }
    }

    /// Stored state. Does not apply the OPEN → HALF_OPEN time check.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    #[must_use]
    pub fn success_count(&self) -> u64 {
        self.lock().success_count
    }

    /// Time left before an OPEN circuit admits a trial call.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.lock();
        match inner.state {
            BreakerState::Open => Some(
                self.config
                    .recovery_timeout()
                    .saturating_sub(inner.state_changed_at.elapsed()),
            ),
            BreakerState::Closed | BreakerState::HalfOpen => None,
        }
    }

    #[must_use]
    pub fn health(&self) -> BreakerHealth {
        let inner = self.lock();
        BreakerHealth {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
            state_changed_at: inner.state_changed_wall,
            config: self.config,
        }
    }

    /// Run `op` under the breaker, counting any `Err` as a failure.
    ///
    /// `op` is only invoked once the call is admitted. Callers that need
    /// finer classification (e.g. treating a well-formed error reply as a
    /// healthy resource) use [`CircuitBreaker::acquire`] directly.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(permit) = self.acquire() else {
            return Err(CallError::Open {
                name: self.name.clone(),
                retry_after: self.retry_after(),
            });
        };
        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(CallError::Inner(e))
            }
        }
    }
}

/// One admitted call. Dropping it unsettled records a failure.
#[must_use = "an unsettled permit counts as a failure when dropped"]
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Permit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(breaker = %self.breaker.name, "call abandoned before completion");
            self.breaker.record_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new("test", BreakerConfig::new(threshold, recovery_secs))
    }

    #[test]
    fn test_starts_closed() {
        let b = breaker(3, 60);
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.can_execute());
        assert_eq!(b.failure_count(), 0);
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let b = breaker(3, 60);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_execute());
    }

    #[test]
    fn test_success_in_closed_resets_consecutive_failures() {
        let b = breaker(3, 60);
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.failure_count(), 0);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_open_rejects_quickly() {
        let b = breaker(1, 60);
        b.record_failure();
        let started = std::time::Instant::now();
        assert!(!b.can_execute());
        assert!(started.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_timeout_moves_to_half_open_on_next_check() {
        let b = breaker(3, 60);
        for _ in 0..3 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!b.can_execute());
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        // Elapsed time alone does not change the stored state.
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.can_execute());
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trial_calls() {
        let config = BreakerConfig::new(1, 10).with_half_open_max_calls(2);
        let b = CircuitBreaker::new("test", config);
        b.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(b.can_execute());
        assert!(b.can_execute());
        assert!(!b.can_execute());
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes_and_resets() {
        let b = breaker(3, 60);
        for _ in 0..3 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(b.can_execute());

        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failure_count(), 0);
        assert!(b.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_timer() {
        let b = breaker(3, 60);
        for _ in 0..3 {
            b.record_failure();
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(b.can_execute());

        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.can_execute());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!b.can_execute(), "timer must restart from the reopen");
        let retry = b.retry_after().unwrap();
        assert_eq!(retry, Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(b.can_execute());
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_stray_success_while_open_only_counts_telemetry() {
        let b = breaker(2, 60);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.failure_count(), 2);

        b.record_success();
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.failure_count(), 2);
        assert_eq!(b.success_count(), 1);
    }

    #[test]
    fn test_stray_failure_while_open_keeps_count() {
        let b = breaker(2, 60);
        b.record_failure();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.failure_count(), 2);
        assert!(b.health().last_failure_at.is_some());
    }

    #[test]
    fn test_retry_after_none_when_closed() {
        let b = breaker(3, 60);
        assert!(b.retry_after().is_none());
    }

    #[test]
    fn test_health_snapshot_serializes() {
        let b = CircuitBreaker::new("analysis", BreakerConfig::new(3, 60));
        b.record_failure();
        let json = serde_json::to_value(b.health()).unwrap();
        assert_eq!(json["name"], "analysis");
        assert_eq!(json["state"], "CLOSED");
        assert_eq!(json["failure_count"], 1);
        assert_eq!(json["config"]["failure_threshold"], 3);
        assert_eq!(json["config"]["recovery_timeout_secs"], 60);
        assert!(json["last_failure_at"].is_string());
    }

    #[test]
    fn test_instances_are_independent() {
        let analysis = CircuitBreaker::new("analysis", BreakerConfig::new(3, 60));
        let cache = CircuitBreaker::new("cache", BreakerConfig::new(5, 30));
        for _ in 0..3 {
            analysis.record_failure();
            cache.record_failure();
        }
        assert_eq!(analysis.state(), BreakerState::Open);
        assert_eq!(cache.state(), BreakerState::Closed);
    }

    #[test]
    fn test_config_defaults_from_empty_toml_like_input() {
        let config: BreakerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, BreakerConfig::default());
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.recovery_timeout(), Duration::from_secs(30));
        assert_eq!(config.half_open_max_calls, 1);
    }

    #[test]
    fn test_config_validation() {
        assert_eq!(
            BreakerConfig::new(0, 10).validate(),
            Err(BreakerConfigError::ZeroFailureThreshold)
        );
        assert_eq!(
            BreakerConfig::new(1, 10).with_half_open_max_calls(0).validate(),
            Err(BreakerConfigError::ZeroHalfOpenCalls)
        );
        assert!(BreakerConfig::new(3, 60).validate().is_ok());
    }

    #[tokio::test]
    async fn test_call_counts_errors_and_short_circuits() {
        let b = breaker(2, 60);
        let r: Result<(), CallError<&str>> = b.call(|| async { Err("boom") }).await;
        assert!(matches!(r, Err(CallError::Inner("boom"))));
        let _ = b.call(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(b.state(), BreakerState::Open);

        let mut invoked = false;
        let r = b
            .call(|| {
                invoked = true;
                async { Ok::<_, &str>(1) }
            })
            .await;
        assert!(!invoked, "a refused call never reaches the resource");
        match r {
            Err(CallError::Open { name, retry_after }) => {
                assert_eq!(name, "test");
                assert!(retry_after.is_some());
            }
            other => panic!("expected Open, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_records_success() {
        let b = breaker(2, 60);
        let value = b.call(|| async { Ok::<_, ()>(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(b.success_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_half_open_trial_reopens() {
        let b = breaker(1, 10);
        b.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;

        let trial = b.call(std::future::pending::<Result<(), ()>>);
        let timed_out = tokio::time::timeout(Duration::from_millis(10), trial).await;
        assert!(timed_out.is_err());
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(b.can_execute());
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreported_half_open_trial_expires() {
        let b = breaker(1, 10);
        b.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(b.can_execute());
        assert!(!b.can_execute());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(b.can_execute(), "a lost trial slot is handed out again");
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn test_permit_settles_once() {
        let b = breaker(2, 60);
        b.acquire().unwrap().success();
        assert_eq!(b.success_count(), 1);
        assert_eq!(b.failure_count(), 0);

        b.acquire().unwrap().failure();
        assert_eq!(b.failure_count(), 1);

        drop(b.acquire().unwrap());
        assert_eq!(b.failure_count(), 2);
        assert_eq!(b.state(), BreakerState::Open);

        let last_failure = b.health().last_failure_at;
        assert!(b.acquire().is_none());
        assert_eq!(b.health().last_failure_at, last_failure, "a refused admission records nothing");
    }
}
