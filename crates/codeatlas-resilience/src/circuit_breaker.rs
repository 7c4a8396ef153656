// ABOUTME: Circuit breaker guarding one protected resource (store, external API, parser pool)
// ABOUTME: Sliding failure window, per-call timeout, and fallback chaining

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerOptions;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - requests allowed
    Closed,
    /// Failing - requests blocked until the recovery timeout elapses
    Open,
    /// Testing if the resource recovered - a trial request is allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "Half-Open"),
        }
    }
}

/// Immutable snapshot of breaker counters, serializable for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    /// Failures currently inside the monitoring window
    pub failures: u32,
    pub successes: u64,
    pub total_requests: u64,
    /// Time since the most recent failure, in milliseconds
    pub last_failure_age_ms: Option<u64>,
}

/// Diagnostic payload carried by [`CircuitBreakerError`].
#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetails {
    pub message: String,
    pub state: CircuitState,
    pub failures: u32,
    pub success_rate: f64,
    pub time_since_last_failure_ms: Option<u64>,
    pub stats: CircuitBreakerStats,
    /// Fallback failure, when both the primary and the fallback failed
    pub fallback_error: Option<String>,
}

/// Raised when the circuit is open with no usable fallback, or when both the
/// primary operation and its fallback failed.
///
/// Carries enough structured state to diagnose why the circuit opened
/// without reproducing the failure.
#[derive(Error, Debug)]
#[error("{}", .details.message)]
pub struct CircuitBreakerError {
    pub details: ErrorDetails,
    pub options: CircuitBreakerOptions,
}

struct Inner {
    state: CircuitState,
    /// Monotonic timestamps of recent failures, pruned to the window
    failure_times: Vec<Instant>,
    last_failure: Option<Instant>,
    successes: u64,
    total_requests: u64,
}

enum Gate {
    /// Call may proceed (Closed, or the Half-Open trial)
    Allow,
    /// Circuit is open and the recovery timeout has not elapsed
    Reject(ErrorDetails),
}

/// Stateful gate wrapping every call against one protected resource.
///
/// One breaker per resource, constructed once and injected wherever that
/// resource's operations are wrapped; all operations share one failure
/// domain, so a burst of failures on one operation fails fast for the rest.
pub struct CircuitBreaker {
    name: String,
    options: CircuitBreakerOptions,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, options: CircuitBreakerOptions) -> Self {
        Self {
            name: name.into(),
            options,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_times: Vec::new(),
                last_failure: None,
                successes: 0,
                total_requests: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &CircuitBreakerOptions {
        &self.options
    }

    /// Current circuit state, after pruning the failure window.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Execute `op` through the breaker. The operation runs under the
    /// configured request timeout; a timeout counts as an ordinary failure.
    ///
    /// When the circuit is open the operation is not invoked and a
    /// [`CircuitBreakerError`] is returned instead.
    pub async fn execute<T, F, Fut>(&self, op: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match self.gate() {
            Gate::Allow => {}
            Gate::Reject(details) => {
                debug!(breaker = %self.name, "Circuit open, blocking request");
                return Err(anyhow::Error::new(CircuitBreakerError {
                    details,
                    options: self.options.clone(),
                }));
            }
        }
        match self.run_with_timeout(op).await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Like [`execute`](Self::execute), but with a fallback attempted when
    /// the circuit is open or the primary fails. If the fallback also fails,
    /// the returned [`CircuitBreakerError`] describes both failures.
    pub async fn execute_with_fallback<T, F, Fut, FB, FbFut>(
        &self,
        op: F,
        fallback: FB,
    ) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        FB: FnOnce() -> FbFut,
        FbFut: Future<Output = anyhow::Result<T>>,
    {
        let primary_error = match self.gate() {
            Gate::Allow => match self.run_with_timeout(op).await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(e) => {
                    self.record_failure();
                    warn!(
                        breaker = %self.name,
                        error = %e,
                        "Primary operation failed, attempting fallback"
                    );
                    e
                }
            },
            Gate::Reject(details) => {
                warn!(breaker = %self.name, "Circuit open, using fallback");
                anyhow::Error::new(CircuitBreakerError {
                    details,
                    options: self.options.clone(),
                })
            }
        };

        match fallback().await {
            Ok(value) => Ok(value),
            Err(fb_err) => {
                let mut details = self.error_details(format!(
                    "Circuit breaker '{}': primary and fallback both failed: {}",
                    self.name, primary_error
                ));
                details.fallback_error = Some(fb_err.to_string());
                Err(anyhow::Error::new(CircuitBreakerError {
                    details,
                    options: self.options.clone(),
                }))
            }
        }
    }

    /// Immutable snapshot of the breaker counters.
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        Self::prune(&mut inner, self.options.monitoring_window());
        Self::snapshot(&inner)
    }

    /// Return the breaker to `Closed` with every counter zeroed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_times.clear();
        inner.last_failure = None;
        inner.successes = 0;
        inner.total_requests = 0;
        info!(breaker = %self.name, "Circuit breaker reset to initial state");
    }

    async fn run_with_timeout<T, F, Fut>(&self, op: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.options.request_timeout(), op()).await {
            Ok(result) => result,
            Err(elapsed) => Err(anyhow::Error::new(elapsed)),
        }
    }

    /// Admission check: bumps `total_requests`, prunes the failure window,
    /// and decides whether the call may proceed. No await happens while the
    /// lock is held.
    fn gate(&self) -> Gate {
        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        Self::prune(&mut inner, self.options.monitoring_window());

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Gate::Allow,
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .map(|t| t.elapsed() >= self.options.recovery_timeout())
                    .unwrap_or(true);
                if recovered {
                    info!(
                        breaker = %self.name,
                        "Circuit breaker: Open -> Half-Open (testing recovery)"
                    );
                    inner.state = CircuitState::HalfOpen;
                    Gate::Allow
                } else {
                    let details = Self::details_locked(
                        &inner,
                        format!(
                            "Circuit breaker '{}' is open ({} failures, threshold {})",
                            self.name,
                            inner.failure_times.len(),
                            self.options.failure_threshold
                        ),
                    );
                    Gate::Reject(details)
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.successes += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                info!(
                    breaker = %self.name,
                    "Circuit breaker: Half-Open -> Closed (recovered)"
                );
                inner.state = CircuitState::Closed;
                inner.failure_times.clear();
                inner.last_failure = None;
            }
            CircuitState::Closed => {}
            CircuitState::Open => {
                // A stale in-flight call finished after the circuit opened
                inner.state = CircuitState::Closed;
                inner.failure_times.clear();
                inner.last_failure = None;
            }
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.failure_times.push(now);
        inner.last_failure = Some(now);
        Self::prune(&mut inner, self.options.monitoring_window());
        let failures = inner.failure_times.len() as u32;

        match inner.state {
            CircuitState::HalfOpen => {
                // A failed trial re-opens immediately, without waiting for
                // the windowed count to re-cross the threshold.
                warn!(
                    breaker = %self.name,
                    failures,
                    "Circuit breaker: Half-Open -> Open (trial failed)"
                );
                inner.state = CircuitState::Open;
            }
            CircuitState::Closed => {
                if failures >= self.options.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures,
                        threshold = self.options.failure_threshold,
                        "Circuit breaker: Closed -> Open"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {
                debug!(breaker = %self.name, "Circuit already open, failure recorded");
            }
        }
    }

    fn prune(inner: &mut Inner, window: Duration) {
        inner.failure_times.retain(|t| t.elapsed() < window);
    }

    fn snapshot(inner: &Inner) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: inner.state,
            failures: inner.failure_times.len() as u32,
            successes: inner.successes,
            total_requests: inner.total_requests,
            last_failure_age_ms: inner.last_failure.map(|t| t.elapsed().as_millis() as u64),
        }
    }

    fn details_locked(inner: &Inner, message: String) -> ErrorDetails {
        let stats = Self::snapshot(inner);
        let success_rate = if inner.total_requests > 0 {
            inner.successes as f64 / inner.total_requests as f64
        } else {
            0.0
        };
        ErrorDetails {
            message,
            state: inner.state,
            failures: stats.failures,
            success_rate,
            time_since_last_failure_ms: stats.last_failure_age_ms,
            stats,
            fallback_error: None,
        }
    }

    fn error_details(&self, message: String) -> ErrorDetails {
        let inner = self.inner.lock();
        Self::details_locked(&inner, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn options(threshold: u32, recovery_ms: u64, window_ms: u64) -> CircuitBreakerOptions {
        CircuitBreakerOptions {
            failure_threshold: threshold,
            recovery_timeout_ms: recovery_ms,
            request_timeout_ms: 1_000,
            monitoring_window_ms: window_ms,
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(|| async { Err::<(), _>(anyhow::anyhow!("boom")) })
            .await;
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new("store", options(3, 10_000, 60_000));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_invoking_operation() {
        let breaker = CircuitBreaker::new("store", options(2, 10_000, 60_000));
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let err = breaker
            .execute(|| async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let cb = err.downcast_ref::<CircuitBreakerError>().unwrap();
        assert_eq!(cb.details.state, CircuitState::Open);
        assert_eq!(cb.details.failures, 2);
    }

    #[tokio::test]
    async fn recovery_timeout_allows_one_trial_call() {
        let breaker = CircuitBreaker::new("store", options(2, 50, 60_000));
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        breaker
            .execute(|| async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn half_open_success_closes_and_clears_failures() {
        let breaker = CircuitBreaker::new("store", options(2, 20, 60_000));
        fail(&breaker).await;
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        breaker
            .execute(|| async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap();
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_circuit() {
        let breaker = CircuitBreaker::new("store", options(3, 20, 60_000));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        // Trial call fails: straight back to Open, no threshold re-count
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn failures_outside_window_do_not_trip() {
        let breaker = CircuitBreaker::new("store", options(3, 10_000, 50));
        fail(&breaker).await;
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        // The first two failures have aged out of the window
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failures, 1);
    }

    #[tokio::test]
    async fn request_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new(
            "store",
            CircuitBreakerOptions {
                failure_threshold: 1,
                recovery_timeout_ms: 10_000,
                request_timeout_ms: 20,
                monitoring_window_ms: 60_000,
            },
        );
        let err = breaker
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<tokio::time::error::Elapsed>().is_some());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn fallback_used_when_circuit_open() {
        let breaker = CircuitBreaker::new("store", options(1, 10_000, 60_000));
        fail(&breaker).await;
        let value = breaker
            .execute_with_fallback(
                || async { Ok::<_, anyhow::Error>("primary") },
                || async { Ok::<_, anyhow::Error>("cached") },
            )
            .await
            .unwrap();
        assert_eq!(value, "cached");
    }

    #[tokio::test]
    async fn double_failure_reports_both_errors() {
        let breaker = CircuitBreaker::new("store", options(5, 10_000, 60_000));
        let err = breaker
            .execute_with_fallback(
                || async { Err::<(), _>(anyhow::anyhow!("primary down")) },
                || async { Err::<(), _>(anyhow::anyhow!("cache cold")) },
            )
            .await
            .unwrap_err();
        let cb = err.downcast_ref::<CircuitBreakerError>().unwrap();
        assert!(cb.details.message.contains("primary down"));
        assert_eq!(cb.details.fallback_error.as_deref(), Some("cache cold"));
    }

    #[tokio::test]
    async fn reset_returns_to_closed_with_zeroed_counters() {
        let breaker = CircuitBreaker::new("store", options(2, 10_000, 60_000));
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.successes, 0);
        assert_eq!(stats.total_requests, 0);
    }

    #[tokio::test]
    async fn stats_track_totals() {
        let breaker = CircuitBreaker::new("store", options(10, 10_000, 60_000));
        breaker
            .execute(|| async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap();
        fail(&breaker).await;
        let stats = breaker.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert!(stats.last_failure_age_ms.is_some());
    }
}
