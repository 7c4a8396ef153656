// ABOUTME: Retry engine with exponential backoff + jitter
// ABOUTME: Never-erring execute paths that capture every outcome in RetryResult

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;

/// Callback invoked between attempts: `(error, attempt, upcoming_delay)`.
pub type RetryCallback = Arc<dyn Fn(&anyhow::Error, u32, Duration) + Send + Sync>;

/// Coarse failure kinds for the retry predicate.
///
/// Deliberately simpler than the error classifier's taxonomy: the retrier
/// only needs "is this worth trying again", not a full response plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Timeout,
    Io,
    Database,
    Other,
    /// Matches every failure
    Any,
}

impl FailureKind {
    /// Extract the kind of an error by probing its chain.
    pub fn of(error: &anyhow::Error) -> FailureKind {
        if let Some(e) = error.downcast_ref::<codeatlas_core::CodeAtlasError>() {
            use codeatlas_core::CodeAtlasError as E;
            return match e {
                E::Network { .. } | E::ExternalService(_) | E::RateLimited(_) => {
                    FailureKind::Network
                }
                E::Io(_) | E::FileNotFound(_) | E::PermissionDenied(_) => FailureKind::Io,
                E::Database(_) => FailureKind::Database,
                _ => FailureKind::Other,
            };
        }
        if error.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return FailureKind::Timeout;
        }
        if let Some(io) = error.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind as K;
            return match io.kind() {
                K::ConnectionRefused
                | K::ConnectionReset
                | K::ConnectionAborted
                | K::NotConnected
                | K::BrokenPipe => FailureKind::Network,
                K::TimedOut => FailureKind::Timeout,
                _ => FailureKind::Io,
            };
        }
        FailureKind::Other
    }
}

/// Outcome of a retried operation. `execute` never returns `Err`; terminal
/// failure is reported here instead.
#[derive(Debug)]
pub struct RetryResult<T> {
    pub success: bool,
    pub value: Option<T>,
    /// Attempts made, 1-indexed
    pub attempts: u32,
    /// Total time slept between attempts
    pub total_delay: Duration,
    pub last_error: Option<anyhow::Error>,
}

impl<T> RetryResult<T> {
    /// Collapse into a `Result`, synthesizing an error if the failure left
    /// no captured exception behind.
    pub fn into_result(self) -> anyhow::Result<T> {
        if self.success {
            // success always carries a value
            self.value
                .ok_or_else(|| anyhow::anyhow!("retry succeeded without a value"))
        } else {
            let attempts = self.attempts;
            Err(self
                .last_error
                .unwrap_or_else(|| anyhow::anyhow!("operation failed after {attempts} attempts")))
        }
    }
}

/// Cumulative counters across every call on one [`Retrier`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryStats {
    pub operations: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub total_delay_ms: u64,
}

/// Delay before retrying after `attempt` (1-indexed) has failed:
/// `min(initial * multiplier^(attempt-1), max)`, optionally perturbed by a
/// uniform offset of +/- `delay * jitter_factor`, clamped to >= 0.
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let base = config.initial_delay_ms as f64 * config.backoff_multiplier.powi(exponent as i32);
    let mut delay_ms = base.min(config.max_delay_ms as f64);
    if config.jitter {
        let amplitude = delay_ms * config.jitter_factor;
        let offset = (fastrand::f64() * 2.0 - 1.0) * amplitude;
        delay_ms = (delay_ms + offset).max(0.0);
    }
    Duration::from_millis(delay_ms as u64)
}

/// Executes an operation up to `max_attempts` times with backoff between
/// attempts. One instance per protected resource; stats accumulate across
/// its lifetime.
pub struct Retrier {
    config: RetryConfig,
    stats: Mutex<RetryStats>,
}

enum Verdict {
    Retry(Duration),
    GiveUp,
}

impl Retrier {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(RetryStats::default()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Cumulative stats across every `execute`/`execute_async` call.
    pub fn stats(&self) -> RetryStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = RetryStats::default();
    }

    /// Synchronous retry loop with a blocking sleep between attempts.
    pub fn execute<T, F>(&self, mut op: F) -> RetryResult<T>
    where
        F: FnMut() -> anyhow::Result<T>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        let mut total_delay = Duration::ZERO;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return self.finish_success(value, attempt, total_delay),
                Err(e) => match self.verdict(&e, attempt, max_attempts) {
                    Verdict::GiveUp => return self.finish_failure(e, attempt, total_delay),
                    Verdict::Retry(delay) => {
                        self.notify_retry(&e, attempt, delay);
                        std::thread::sleep(delay);
                        total_delay += delay;
                    }
                },
            }
        }
    }

    /// Asynchronous retry loop; the sleep is a cancellable `tokio` sleep.
    pub async fn execute_async<T, F, Fut>(&self, mut op: F) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        let mut total_delay = Duration::ZERO;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return self.finish_success(value, attempt, total_delay),
                Err(e) => match self.verdict(&e, attempt, max_attempts) {
                    Verdict::GiveUp => return self.finish_failure(e, attempt, total_delay),
                    Verdict::Retry(delay) => {
                        self.notify_retry(&e, attempt, delay);
                        tokio::time::sleep(delay).await;
                        total_delay += delay;
                    }
                },
            }
        }
    }

    fn retryable(&self, error: &anyhow::Error) -> bool {
        if self.config.retryable.contains(&FailureKind::Any) {
            return true;
        }
        self.config.retryable.contains(&FailureKind::of(error))
    }

    fn verdict(&self, error: &anyhow::Error, attempt: u32, max_attempts: u32) -> Verdict {
        if attempt >= max_attempts || !self.retryable(error) {
            Verdict::GiveUp
        } else {
            Verdict::Retry(calculate_delay(&self.config, attempt))
        }
    }

    fn notify_retry(&self, error: &anyhow::Error, attempt: u32, delay: Duration) {
        warn!(
            attempt,
            max_attempts = self.config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Operation failed, retrying"
        );
        if let Some(cb) = &self.config.on_retry {
            // A misbehaving callback must not abort the retry loop
            if catch_unwind(AssertUnwindSafe(|| cb(error, attempt, delay))).is_err() {
                warn!(attempt, "on_retry callback panicked, ignoring");
            }
        }
    }

    fn finish_success<T>(&self, value: T, attempts: u32, total_delay: Duration) -> RetryResult<T> {
        let mut stats = self.stats.lock();
        stats.operations += 1;
        stats.successes += 1;
        stats.retries += u64::from(attempts - 1);
        stats.total_delay_ms += total_delay.as_millis() as u64;
        RetryResult {
            success: true,
            value: Some(value),
            attempts,
            total_delay,
            last_error: None,
        }
    }

    fn finish_failure<T>(
        &self,
        error: anyhow::Error,
        attempts: u32,
        total_delay: Duration,
    ) -> RetryResult<T> {
        let mut stats = self.stats.lock();
        stats.operations += 1;
        stats.failures += 1;
        stats.retries += u64::from(attempts - 1);
        stats.total_delay_ms += total_delay.as_millis() as u64;
        RetryResult {
            success: false,
            value: None,
            attempts,
            total_delay,
            last_error: Some(error),
        }
    }
}

/// One-shot form: wrap `op` in a private [`Retrier`] and collapse the
/// outcome into a `Result`.
pub fn retry<T, F>(config: RetryConfig, op: F) -> anyhow::Result<T>
where
    F: FnMut() -> anyhow::Result<T>,
{
    Retrier::new(config).execute(op).into_result()
}

/// Async one-shot form of [`retry`].
pub async fn retry_async<T, F, Fut>(config: RetryConfig, op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    Retrier::new(config).execute_async(op).await.into_result()
}
