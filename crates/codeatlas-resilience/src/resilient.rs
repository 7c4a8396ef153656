// ABOUTME: Uniform resilience wrapper for every operation of a protected resource
// ABOUTME: One shared circuit breaker per resource, one structured log line per failure

use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitBreakerStats};
use crate::classify::{Context, ErrorClassifier, Severity};

/// Applies one shared [`CircuitBreaker`] uniformly across every public
/// operation of a protected resource (the analysis store, an embedding
/// provider, the parser pool).
///
/// All operations share one failure domain: a burst of failures on one
/// operation fails fast for the rest, by design. The classifier is used
/// purely to pick a log level here; it never alters control flow, and the
/// original error is always re-raised unchanged.
///
/// Constructed explicitly and injected, never a process global.
#[derive(Clone)]
pub struct ResilientOperation {
    resource: String,
    breaker: Arc<CircuitBreaker>,
    classifier: Arc<ErrorClassifier>,
}

impl ResilientOperation {
    pub fn new(
        resource: impl Into<String>,
        breaker: Arc<CircuitBreaker>,
        classifier: Arc<ErrorClassifier>,
    ) -> Self {
        Self {
            resource: resource.into(),
            breaker,
            classifier,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Run `op` through the resource's shared breaker.
    pub async fn execute<T, F, Fut>(&self, name: &str, op: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let result = self.breaker.execute(op).await;
        self.observe(name, result)
    }

    /// Run `op` with `fallback` attempted when the circuit is open or the
    /// primary fails.
    pub async fn execute_with_fallback<T, F, Fut, FB, FbFut>(
        &self,
        name: &str,
        op: F,
        fallback: FB,
    ) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        FB: FnOnce() -> FbFut,
        FbFut: Future<Output = anyhow::Result<T>>,
    {
        let result = self.breaker.execute_with_fallback(op, fallback).await;
        self.observe(name, result)
    }

    /// Operator introspection hook for the resource's breaker.
    pub fn stats(&self) -> CircuitBreakerStats {
        self.breaker.stats()
    }

    /// Operator-initiated recovery hook.
    pub fn reset(&self) {
        self.breaker.reset()
    }

    fn observe<T>(&self, name: &str, result: anyhow::Result<T>) -> anyhow::Result<T> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if err.downcast_ref::<CircuitBreakerError>().is_some() {
            error!(
                resource = %self.resource,
                operation = name,
                error = %err,
                "Circuit breaker rejected operation"
            );
            return Err(err);
        }

        let mut context = Context::new();
        context.insert("operation".into(), json!(name));
        context.insert("resource".into(), json!(self.resource));
        let classification = self.classifier.classify(&err, &context);
        let category = format!("{:?}", classification.category);
        match classification.severity {
            Severity::Critical | Severity::High => error!(
                resource = %self.resource,
                operation = name,
                category = %category,
                retryable = classification.is_retryable,
                error = %err,
                "Operation failed"
            ),
            Severity::Medium => warn!(
                resource = %self.resource,
                operation = name,
                category = %category,
                retryable = classification.is_retryable,
                error = %err,
                "Operation failed"
            ),
            Severity::Low => info!(
                resource = %self.resource,
                operation = name,
                category = %category,
                retryable = classification.is_retryable,
                error = %err,
                "Operation failed"
            ),
        }
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn resilient(threshold: u32) -> ResilientOperation {
        let options = CircuitBreakerOptions {
            failure_threshold: threshold,
            recovery_timeout_ms: 10_000,
            request_timeout_ms: 1_000,
            monitoring_window_ms: 60_000,
        };
        ResilientOperation::new(
            "analysis-store",
            Arc::new(CircuitBreaker::new("analysis-store", options)),
            Arc::new(ErrorClassifier::new()),
        )
    }

    #[tokio::test]
    async fn passes_value_through_on_success() {
        let wrapper = resilient(3);
        let rows = wrapper
            .execute("fetch_symbols", || async { Ok::<_, anyhow::Error>(vec![1, 2]) })
            .await
            .unwrap();
        assert_eq!(rows, vec![1, 2]);
        assert_eq!(wrapper.stats().successes, 1);
    }

    #[tokio::test]
    async fn original_error_reraised_unchanged() {
        let wrapper = resilient(5);
        let err = wrapper
            .execute("fetch_symbols", || async {
                Err::<(), _>(anyhow::Error::new(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "missing table",
                )))
            })
            .await
            .unwrap_err();
        let io = err.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn operations_share_one_failure_domain() {
        let wrapper = resilient(2);
        for _ in 0..2 {
            let _ = wrapper
                .execute("record_import", || async {
                    Err::<(), _>(anyhow::anyhow!("disk error"))
                })
                .await;
        }
        // Unrelated operation on the same resource now fails fast
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let err = wrapper
            .execute("fetch_patterns", || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(err.downcast_ref::<CircuitBreakerError>().is_some());
    }

    #[tokio::test]
    async fn reset_recovers_a_tripped_resource() {
        let wrapper = resilient(1);
        let _ = wrapper
            .execute("record_symbol", || async {
                Err::<(), _>(anyhow::anyhow!("boom"))
            })
            .await;
        wrapper.reset();
        wrapper
            .execute("record_symbol", || async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap();
    }
}
