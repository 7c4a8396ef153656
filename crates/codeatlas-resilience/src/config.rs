// ABOUTME: Configuration structures for the resilience layer
// ABOUTME: Circuit breaker and retry tuning with serde-backed defaults

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::retry::{FailureKind, RetryCallback};

/// Circuit breaker tuning for one protected resource.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerOptions {
    /// Failures within the monitoring window before the circuit opens
    /// (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time the circuit stays open before a half-open trial (default: 30s)
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_ms: u64,

    /// Deadline applied to each wrapped call (default: 30s)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Sliding window for counting failures; older failures are pruned
    /// (default: 300s)
    #[serde(default = "default_monitoring_window")]
    pub monitoring_window_ms: u64,
}

impl CircuitBreakerOptions {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn monitoring_window(&self) -> Duration {
        Duration::from_millis(self.monitoring_window_ms)
    }
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout(),
            request_timeout_ms: default_request_timeout(),
            monitoring_window_ms: default_monitoring_window(),
        }
    }
}

/// Retry tuning for one [`Retrier`](crate::retry::Retrier).
///
/// The retryability predicate is a deliberately simple kind set, independent
/// of the error classifier: the retrier decides *whether* to try again, the
/// classifier decides *how the failure is reported*.
#[derive(Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Total attempts including the first (default: 3, clamped to >= 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 100ms)
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Upper bound on any single delay (default: 30s)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Geometric growth factor between attempts (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Perturb each delay to avoid synchronized retry storms (default: true)
    #[serde(default = "default_jitter")]
    pub jitter: bool,

    /// Relative jitter amplitude, +/- delay * factor (default: 0.1)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Failure kinds worth retrying; `FailureKind::Any` matches everything
    #[serde(default = "default_retryable")]
    pub retryable: HashSet<FailureKind>,

    /// Invoked as `on_retry(error, attempt, delay)` before each sleep;
    /// panics from it are swallowed
    #[serde(skip)]
    pub on_retry: Option<RetryCallback>,
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            jitter_factor: default_jitter_factor(),
            retryable: default_retryable(),
            on_retry: None,
        }
    }
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay_ms", &self.initial_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .field("jitter_factor", &self.jitter_factor)
            .field("retryable", &self.retryable)
            .field("on_retry", &self.on_retry.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

// Default value functions
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout() -> u64 {
    30_000
}
fn default_request_timeout() -> u64 {
    30_000
}
fn default_monitoring_window() -> u64 {
    300_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    100
}
fn default_max_delay() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> bool {
    true
}
fn default_jitter_factor() -> f64 {
    0.1
}
fn default_retryable() -> HashSet<FailureKind> {
    HashSet::from([FailureKind::Any])
}
