//! Circuit breaker guarding calls to an unreliable dependency.
//!
//! ```text
//!   Closed ──(volume reached and error % ≥ threshold)──▶ Open
//!     ▲                                                   │
//!     │ success_threshold consecutive successes           │ recovery_timeout elapsed,
//!     │                                                   │ checked on next call
//!   HalfOpen ◀────────────────────────────────────────────┘
//!     │
//!     └──(any failure)──▶ Open
//! ```
//!
//! State lives behind one async mutex per breaker. The guarded operation runs
//! outside the lock: the lock is held only to admit the call and again to record
//! its outcome.
//!
//! Half-open trial calls each hold a permit from a semaphore sized to
//! `test_request_volume`. The permit is released when the call finishes or its
//! future is dropped, so a cancelled trial never pins a slot.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use herald_observability::Gauge;

/// Thresholds for a [`CircuitBreaker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failure percentage (0-100) that opens a closed breaker.
    pub error_percentage: f64,
    /// Minimum requests before the error percentage is evaluated. Also the
    /// number of trial calls allowed in flight while half-open.
    pub test_request_volume: u32,
    /// How long an open breaker rejects calls before probing again.
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_percentage: 50.0,
            test_request_volume: 10,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_error_percentage(mut self, error_percentage: f64) -> Self {
        self.error_percentage = error_percentage.clamp(0.0, 100.0);
        self
    }

    pub fn with_test_request_volume(mut self, volume: u32) -> Self {
        self.test_request_volume = volume.max(1);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Reject thresholds the state machine cannot satisfy.
    pub fn validate(&self) -> Result<(), InvalidCircuitConfig> {
        if !(self.error_percentage > 0.0 && self.error_percentage <= 100.0) {
            return Err(InvalidCircuitConfig::ErrorPercentage(self.error_percentage));
        }
        if self.test_request_volume == 0 || self.success_threshold == 0 {
            return Err(InvalidCircuitConfig::ZeroThreshold);
        }
        if self.success_threshold > self.test_request_volume {
            return Err(InvalidCircuitConfig::SuccessThresholdAboveVolume {
                success_threshold: self.success_threshold,
                test_request_volume: self.test_request_volume,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidCircuitConfig {
    #[error("error percentage must be in (0, 100], got {0}")]
    ErrorPercentage(f64),

    #[error("test request volume and success threshold must be at least 1")]
    ZeroThreshold,

    #[error(
        "success threshold {success_threshold} exceeds test request volume {test_request_volume}"
    )]
    SuccessThresholdAboveVolume {
        success_threshold: u32,
        test_request_volume: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Value published on the health gauge.
    pub fn health_value(self) -> i64 {
        match self {
            Self::Closed => 2,
            Self::HalfOpen => 1,
            Self::Open => 0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Counters for the current measurement window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitMetrics {
    pub failure_count: u64,
    pub success_count: u64,
    pub total_requests: u64,
    pub consecutive_successes: u32,
    pub last_failure_time: Option<Instant>,
    pub last_success_time: Option<Instant>,
}

impl CircuitMetrics {
    /// Failure percentage (0-100) over the window.
    pub fn error_percentage(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.total_requests as f64 * 100.0
        }
    }
}

/// How many times the breaker has entered each state since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionCounts {
    pub opened: u64,
    pub half_opened: u64,
    pub closed: u64,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub metrics: CircuitMetrics,
    pub transitions: TransitionCounts,
}

/// Returned instead of running the operation while the breaker is open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker '{name}' is open")]
pub struct CircuitOpenError {
    pub name: String,
}

/// Outcome of [`CircuitBreaker::call`] when it does not succeed.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error(transparent)]
    Open(CircuitOpenError),

    #[error(transparent)]
    Failed(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    metrics: CircuitMetrics,
    transitions: TransitionCounts,
    /// Trial slots for the current half-open period; replaced on every
    /// transition so permits from an earlier period release into a dead pool.
    trial_slots: Arc<Semaphore>,
}

/// Per-dependency call guard.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    health: Arc<Gauge>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let health = Arc::new(Gauge::new());
        health.set(CircuitState::Closed.health_value());
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                metrics: CircuitMetrics::default(),
                transitions: TransitionCounts::default(),
                trial_slots: Arc::new(Semaphore::new(0)),
            }),
            health,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Health gauge: closed = 2, half_open = 1, open = 0.
    pub fn health_gauge(&self) -> Arc<Gauge> {
        Arc::clone(&self.health)
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock().await;
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            metrics: inner.metrics.clone(),
            transitions: inner.transitions,
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// While open the operation is not invoked and `CircuitError::Open` is
    /// returned. An `Err` from the operation counts as a failure; `Ok` counts as
    /// a success.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        // Held until the outcome is recorded; dropping the future releases it.
        let _trial = self.admit().await.map_err(CircuitError::Open)?;

        match operation().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                self.record_failure().await;
                Err(CircuitError::Failed(err))
            }
        }
    }

    /// Force the breaker closed and clear its metrics.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Force the breaker open; the recovery timeout starts now.
    pub async fn force_open(&self) {
        let mut inner = self.inner.lock().await;
        self.transition(&mut inner, CircuitState::Open);
        inner.metrics.last_failure_time = Some(Instant::now());
    }

    /// Admit a call. Half-open admissions return the trial permit the caller
    /// holds for the duration of the call.
    async fn admit(&self) -> Result<Option<OwnedSemaphorePermit>, CircuitOpenError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                let recovered = inner
                    .metrics
                    .last_failure_time
                    .is_none_or(|at| at.elapsed() > self.config.recovery_timeout);
                if !recovered {
                    return Err(self.open_error());
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                self.take_trial_slot(&inner).map(Some)
            }
            CircuitState::HalfOpen => self.take_trial_slot(&inner).map(Some),
        }
    }

    fn take_trial_slot(
        &self,
        inner: &BreakerState,
    ) -> Result<OwnedSemaphorePermit, CircuitOpenError> {
        Arc::clone(&inner.trial_slots)
            .try_acquire_owned()
            .map_err(|_| self.open_error())
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        let metrics = &mut inner.metrics;
        metrics.success_count += 1;
        metrics.total_requests += 1;
        metrics.consecutive_successes += 1;
        metrics.last_success_time = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                if inner.metrics.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Closed => self.evaluate_closed(&mut inner),
            CircuitState::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        let metrics = &mut inner.metrics;
        metrics.failure_count += 1;
        metrics.total_requests += 1;
        metrics.consecutive_successes = 0;

        match inner.state {
            CircuitState::HalfOpen => {
                self.transition(&mut inner, CircuitState::Open);
                inner.metrics.last_failure_time = Some(Instant::now());
            }
            CircuitState::Closed => {
                inner.metrics.last_failure_time = Some(Instant::now());
                self.evaluate_closed(&mut inner);
            }
            // A call admitted before the breaker opened; the open timer keeps running.
            CircuitState::Open => {}
        }
    }

    fn evaluate_closed(&self, inner: &mut BreakerState) {
        let metrics = &inner.metrics;
        if metrics.total_requests >= u64::from(self.config.test_request_volume)
            && metrics.error_percentage() >= self.config.error_percentage
        {
            self.transition(inner, CircuitState::Open);
            inner.metrics.last_failure_time.get_or_insert_with(Instant::now);
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        match to {
            CircuitState::Open => {
                inner.transitions.opened += 1;
                inner.trial_slots = Arc::new(Semaphore::new(0));
            }
            CircuitState::HalfOpen => {
                inner.transitions.half_opened += 1;
                inner.metrics = CircuitMetrics::default();
                let slots = (self.config.test_request_volume as usize).min(Semaphore::MAX_PERMITS);
                inner.trial_slots = Arc::new(Semaphore::new(slots));
            }
            CircuitState::Closed => {
                inner.transitions.closed += 1;
                inner.metrics = CircuitMetrics::default();
                inner.trial_slots = Arc::new(Semaphore::new(0));
            }
        }
        self.health.set(to.health_value());

        match to {
            CircuitState::Open => warn!(circuit = %self.name, %from, "circuit breaker opened"),
            CircuitState::HalfOpen => info!(circuit = %self.name, %from, "circuit breaker half-open"),
            CircuitState::Closed => info!(circuit = %self.name, %from, "circuit breaker closed"),
        }
    }

    fn open_error(&self) -> CircuitOpenError {
        CircuitOpenError {
            name: self.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn breaker(recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "broker",
            CircuitBreakerConfig::default()
                .with_test_request_volume(10)
                .with_error_percentage(50.0)
                .with_recovery_timeout(recovery)
                .with_success_threshold(3),
        )
    }

    async fn drive(cb: &CircuitBreaker, outcomes: &[bool]) {
        for ok in outcomes {
            let ok = *ok;
            let _ = cb
                .call(|| async move { if ok { Ok(()) } else { Err("boom") } })
                .await;
        }
    }

    #[tokio::test]
    async fn six_failures_in_ten_opens() {
        let cb = breaker(Duration::from_secs(30));
        drive(&cb, &[false, true, false, true, false, true, false, true, false, false]).await;

        assert_eq!(cb.state().await, CircuitState::Open);
        assert_eq!(cb.health_gauge().get(), 0);
    }

    #[tokio::test]
    async fn four_failures_in_ten_stays_closed() {
        let cb = breaker(Duration::from_secs(30));
        drive(&cb, &[false, true, true, false, true, true, false, true, false, true]).await;

        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.health_gauge().get(), 2);
    }

    #[tokio::test]
    async fn open_breaker_does_not_invoke_operation() {
        let cb = breaker(Duration::from_secs(30));
        cb.force_open().await;

        let mut invoked = false;
        let result: Result<(), CircuitError<&str>> = cb
            .call(|| {
                invoked = true;
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Open(_))));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn recovers_through_half_open() {
        let cb = breaker(Duration::from_millis(40));
        drive(&cb, &[false; 10]).await;
        assert_eq!(cb.state().await, CircuitState::Open);

        let rejected: Result<(), CircuitError<&str>> = cb.call(|| async { Ok(()) }).await;
        assert!(rejected.unwrap_err().is_open());

        tokio::time::sleep(Duration::from_millis(60)).await;

        drive(&cb, &[true]).await;
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        assert_eq!(cb.health_gauge().get(), 1);

        drive(&cb, &[true, true]).await;
        let snapshot = cb.snapshot().await;
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.metrics, CircuitMetrics::default());
    }

    #[tokio::test]
    async fn failure_while_half_open_reopens() {
        let cb = breaker(Duration::from_millis(20));
        cb.force_open().await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        drive(&cb, &[true, false]).await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn open_snapshot_keeps_the_failures_that_tripped_it() {
        let cb = breaker(Duration::from_secs(30));
        drive(&cb, &[false; 10]).await;

        let snapshot = cb.snapshot().await;
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.metrics.failure_count, 10);
        assert_eq!(snapshot.metrics.total_requests, 10);
        assert!(snapshot.metrics.last_failure_time.is_some());
    }

    #[tokio::test]
    async fn half_open_caps_concurrent_trial_calls() {
        let cb = Arc::new(CircuitBreaker::new(
            "limited",
            CircuitBreakerConfig::default()
                .with_test_request_volume(2)
                .with_recovery_timeout(Duration::from_millis(10))
                .with_success_threshold(2),
        ));
        cb.force_open().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let release = Arc::new(tokio::sync::Notify::new());
        let mut held = Vec::new();
        for _ in 0..2 {
            let cb = Arc::clone(&cb);
            let release = Arc::clone(&release);
            held.push(tokio::spawn(async move {
                cb.call(|| async move {
                    release.notified().await;
                    Ok::<_, &str>(())
                })
                .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let third: Result<(), CircuitError<&str>> = cb.call(|| async { Ok(()) }).await;
        assert!(third.unwrap_err().is_open());

        release.notify_waiters();
        for call in held {
            assert!(call.await.unwrap().is_ok());
        }
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn finished_trial_calls_free_their_slots() {
        // Fails validation, yet sequential trials must still close it: the
        // slots bound concurrency, not the number of trial calls.
        let cb = CircuitBreaker::new(
            "sequential",
            CircuitBreakerConfig::default()
                .with_test_request_volume(2)
                .with_recovery_timeout(Duration::from_millis(10))
                .with_success_threshold(3),
        );
        cb.force_open().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        drive(&cb, &[true, true]).await;
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        drive(&cb, &[true]).await;
        assert_eq!(cb.state().await, CircuitState::Closed);

        // Healthy traffic keeps flowing after the close.
        let later: Result<(), CircuitError<&str>> = cb.call(|| async { Ok(()) }).await;
        assert!(later.is_ok());
    }

    #[tokio::test]
    async fn cancelled_trial_call_releases_its_slot() {
        let cb = CircuitBreaker::new(
            "cancelled",
            CircuitBreakerConfig::default()
                .with_test_request_volume(1)
                .with_recovery_timeout(Duration::from_millis(10))
                .with_success_threshold(1),
        );
        cb.force_open().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let hung = tokio::time::timeout(
            Duration::from_millis(20),
            cb.call(|| async {
                std::future::pending::<()>().await;
                Ok::<_, &str>(())
            }),
        )
        .await;
        assert!(hung.is_err());
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        let healthy: Result<(), CircuitError<&str>> = cb.call(|| async { Ok(()) }).await;
        assert!(healthy.is_ok());
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[test]
    fn success_threshold_above_volume_is_rejected() {
        let config = CircuitBreakerConfig::default()
            .with_test_request_volume(2)
            .with_success_threshold(3);
        assert_eq!(
            config.validate(),
            Err(InvalidCircuitConfig::SuccessThresholdAboveVolume {
                success_threshold: 3,
                test_request_volume: 2,
            })
        );
        assert!(CircuitBreakerConfig::default().validate().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_failures_open_exactly_once() {
        let cb = Arc::new(breaker(Duration::from_secs(30)));
        let start = Arc::new(tokio::sync::Barrier::new(32));

        let calls: Vec<_> = (0..32)
            .map(|_| {
                let cb = Arc::clone(&cb);
                let start = Arc::clone(&start);
                tokio::spawn(async move {
                    start.wait().await;
                    cb.call(|| async {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Err::<(), _>("boom")
                    })
                    .await
                })
            })
            .collect();
        for call in futures::future::join_all(calls).await {
            assert!(call.unwrap().is_err());
        }

        let snapshot = cb.snapshot().await;
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.transitions.opened, 1);
        assert_eq!(snapshot.transitions.closed, 0);
        assert_eq!(cb.health_gauge().get(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_successes_close_exactly_once() {
        let cb = Arc::new(breaker(Duration::from_millis(10)));
        cb.force_open().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let start = Arc::new(tokio::sync::Barrier::new(32));

        let calls: Vec<_> = (0..32)
            .map(|_| {
                let cb = Arc::clone(&cb);
                let start = Arc::clone(&start);
                tokio::spawn(async move {
                    start.wait().await;
                    cb.call(|| async {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok::<_, &str>(())
                    })
                    .await
                })
            })
            .collect();
        let admitted = futures::future::join_all(calls)
            .await
            .into_iter()
            .filter(|call| matches!(call, Ok(Ok(()))))
            .count();
        assert!(admitted >= 3);

        let snapshot = cb.snapshot().await;
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.transitions.half_opened, 1);
        assert_eq!(snapshot.transitions.closed, 1);
        assert_eq!(cb.health_gauge().get(), 2);
    }

    #[tokio::test]
    async fn reset_closes_and_clears() {
        let cb = breaker(Duration::from_secs(30));
        drive(&cb, &[false; 10]).await;
        cb.reset().await;

        let snapshot = cb.snapshot().await;
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.metrics.total_requests, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: after exactly `test_request_volume` calls the breaker is
        /// open iff the failure share reached `error_percentage`, in any order.
        #[test]
        fn threshold_depends_only_on_failure_share(outcomes in prop::collection::vec(any::<bool>(), 10)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let state = runtime.block_on(async {
                let cb = breaker(Duration::from_secs(30));
                drive(&cb, &outcomes).await;
                cb.state().await
            });

            let failures = outcomes.iter().filter(|ok| !**ok).count();
            let expected = if failures * 100 >= 50 * 10 { CircuitState::Open } else { CircuitState::Closed };
            prop_assert_eq!(state, expected);
        }
    }
}
