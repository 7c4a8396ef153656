// ABOUTME: Pre-built breaker and retry configurations per protected resource class
// ABOUTME: Documented defaults, not hard contracts

use std::collections::HashSet;

use crate::config::{CircuitBreakerOptions, RetryConfig};
use crate::retry::FailureKind;

/// Breaker tuned for the SQLite analysis store: trips quickly, recovers
/// quickly, tolerates long statements.
pub fn database_breaker_options() -> CircuitBreakerOptions {
    CircuitBreakerOptions {
        failure_threshold: 3,
        recovery_timeout_ms: 5_000,
        request_timeout_ms: 60_000,
        monitoring_window_ms: 120_000,
    }
}

/// Breaker for external HTTP services (embedding providers, registries).
pub fn external_api_breaker_options() -> CircuitBreakerOptions {
    CircuitBreakerOptions {
        failure_threshold: 5,
        recovery_timeout_ms: 30_000,
        request_timeout_ms: 30_000,
        monitoring_window_ms: 300_000,
    }
}

/// Breaker for the parser pool: source files that break the parser keep
/// breaking it, so the window stays short.
pub fn parsing_breaker_options() -> CircuitBreakerOptions {
    CircuitBreakerOptions {
        failure_threshold: 3,
        recovery_timeout_ms: 5_000,
        request_timeout_ms: 60_000,
        monitoring_window_ms: 120_000,
    }
}

/// Retry for store calls: any failure kind is worth one more try (lock
/// contention shows up as generic database errors).
pub fn database_retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 100,
        max_delay_ms: 5_000,
        retryable: HashSet::from([FailureKind::Any]),
        ..RetryConfig::default()
    }
}

/// Retry for external API calls: only network-shaped failures.
pub fn api_retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        initial_delay_ms: 500,
        max_delay_ms: 30_000,
        retryable: HashSet::from([FailureKind::Network, FailureKind::Timeout]),
        ..RetryConfig::default()
    }
}

/// Retry for file operations: I/O failures only, short delays.
pub fn file_retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 50,
        max_delay_ms: 1_000,
        retryable: HashSet::from([FailureKind::Io]),
        ..RetryConfig::default()
    }
}
