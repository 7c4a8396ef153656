// ABOUTME: Error classification: maps a failure to a structured response plan
// ABOUTME: Custom classifiers, an error-code table, then pattern matching over kinds/messages/codes

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

use codeatlas_core::{CodeAtlasError, ErrorCode};

/// Caller-supplied enrichment echoed into every classification's `details`.
pub type Context = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network blip; retry with backoff, trips the breaker
    Transient,
    /// Missing resource or bad input; never retried
    Permanent,
    /// Rate-limited or service down; retryable, trips the breaker
    CircuitBreaker,
    /// Validation failure; never retried, always surfaced
    ClientError,
    /// Disk full, out of memory; fail fast
    SystemError,
    /// Conservative default
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Immediate,
    ExponentialBackoff,
    LinearBackoff,
    NoRetry,
    Delayed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    UseCache,
    UseDefault,
    DegradeGracefully,
    FailFast,
    QueueForLater,
    NotifyUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Runtime kind of a failure, extracted by probing the error chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    ExternalService,
    RateLimited,
    BreakerOpen,
    FileNotFound,
    PermissionDenied,
    Validation,
    Config,
    Platform,
    Database,
    Parse,
    Serialization,
    Io,
    Timeout,
    Other,
}

impl ErrorKind {
    pub fn of(error: &anyhow::Error) -> ErrorKind {
        if let Some(e) = error.downcast_ref::<CodeAtlasError>() {
            return match e.code() {
                ErrorCode::NetworkError => ErrorKind::Network,
                ErrorCode::ExternalServiceError => ErrorKind::ExternalService,
                ErrorCode::RateLimited => ErrorKind::RateLimited,
                ErrorCode::BreakerOpen => ErrorKind::BreakerOpen,
                ErrorCode::FileNotFound => ErrorKind::FileNotFound,
                ErrorCode::PermissionDenied => ErrorKind::PermissionDenied,
                ErrorCode::ValidationError => ErrorKind::Validation,
                ErrorCode::ConfigError => ErrorKind::Config,
                ErrorCode::PlatformError => ErrorKind::Platform,
                ErrorCode::DatabaseError => ErrorKind::Database,
                ErrorCode::ParseError => ErrorKind::Parse,
                ErrorCode::SerializationError => ErrorKind::Serialization,
                ErrorCode::IoError => ErrorKind::Io,
                ErrorCode::InvalidOperation => ErrorKind::Other,
            };
        }
        if error.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return ErrorKind::Timeout;
        }
        if let Some(io) = error.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind as K;
            return match io.kind() {
                K::NotFound => ErrorKind::FileNotFound,
                K::PermissionDenied => ErrorKind::PermissionDenied,
                K::ConnectionRefused
                | K::ConnectionReset
                | K::ConnectionAborted
                | K::NotConnected
                | K::BrokenPipe => ErrorKind::Network,
                K::TimedOut => ErrorKind::Timeout,
                _ => ErrorKind::Io,
            };
        }
        if error.downcast_ref::<serde_json::Error>().is_some() {
            return ErrorKind::Serialization;
        }
        ErrorKind::Other
    }
}

/// Numeric code probe: HTTP status or OS errno, whichever the error carries.
fn numeric_code(error: &anyhow::Error) -> Option<i32> {
    if let Some(e) = error.downcast_ref::<CodeAtlasError>() {
        return e.status_code();
    }
    if let Some(io) = error.downcast_ref::<std::io::Error>() {
        return io.raw_os_error();
    }
    None
}

/// Structured response plan for one failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub is_retryable: bool,
    pub retry_strategy: RetryStrategy,
    /// Advisory only; not wired into any retrier's own attempt budget
    pub max_retries: u32,
    pub should_trip_breaker: bool,
    pub fallback_action: FallbackAction,
    pub user_notification_required: bool,
    pub severity: Severity,
    /// Which rule matched, plus the caller-supplied context
    pub details: serde_json::Map<String, Value>,
}

impl ErrorClassification {
    fn new(category: ErrorCategory) -> Self {
        Self {
            category,
            is_retryable: false,
            retry_strategy: RetryStrategy::NoRetry,
            max_retries: 0,
            should_trip_breaker: false,
            fallback_action: FallbackAction::NotifyUser,
            user_notification_required: false,
            severity: Severity::Medium,
            details: serde_json::Map::new(),
        }
    }

    pub fn transient() -> Self {
        Self {
            is_retryable: true,
            retry_strategy: RetryStrategy::ExponentialBackoff,
            max_retries: 5,
            should_trip_breaker: true,
            fallback_action: FallbackAction::DegradeGracefully,
            ..Self::new(ErrorCategory::Transient)
        }
    }

    pub fn rate_limited() -> Self {
        Self {
            is_retryable: true,
            retry_strategy: RetryStrategy::Delayed,
            max_retries: 3,
            should_trip_breaker: true,
            fallback_action: FallbackAction::QueueForLater,
            ..Self::new(ErrorCategory::CircuitBreaker)
        }
    }

    /// The breaker is already open; do not re-trip it.
    pub fn breaker_open() -> Self {
        Self {
            fallback_action: FallbackAction::DegradeGracefully,
            severity: Severity::High,
            ..Self::new(ErrorCategory::CircuitBreaker)
        }
    }

    pub fn permanent() -> Self {
        Self {
            fallback_action: FallbackAction::UseDefault,
            ..Self::new(ErrorCategory::Permanent)
        }
    }

    pub fn client_error() -> Self {
        Self {
            fallback_action: FallbackAction::NotifyUser,
            user_notification_required: true,
            ..Self::new(ErrorCategory::ClientError)
        }
    }

    pub fn system_error() -> Self {
        Self {
            should_trip_breaker: true,
            fallback_action: FallbackAction::FailFast,
            severity: Severity::Critical,
            ..Self::new(ErrorCategory::SystemError)
        }
    }

    pub fn unknown() -> Self {
        Self {
            fallback_action: FallbackAction::NotifyUser,
            user_notification_required: true,
            ..Self::new(ErrorCategory::Unknown)
        }
    }
}

/// Matcher set: an error matches a pattern if its kind is in `kinds`, OR
/// any regex matches the lower-cased message, OR its numeric code is in
/// `codes`. First registered match wins.
pub struct ErrorPattern {
    pub name: &'static str,
    pub kinds: Vec<ErrorKind>,
    pub message_patterns: Vec<Regex>,
    pub codes: Vec<i32>,
    pub classification: ErrorClassification,
}

impl ErrorPattern {
    fn matches(&self, kind: ErrorKind, message: &str, code: Option<i32>) -> bool {
        if self.kinds.contains(&kind) {
            return true;
        }
        if self.message_patterns.iter().any(|re| re.is_match(message)) {
            return true;
        }
        code.is_some_and(|c| self.codes.contains(&c))
    }
}

/// Custom classification hook, checked before any pattern matching.
pub type CustomClassifier =
    Arc<dyn Fn(&anyhow::Error, &Context) -> Option<ErrorClassification> + Send + Sync>;

/// Pure decision function from failure to response plan.
///
/// Order: custom classifiers, then the explicit error-code table for
/// structured domain errors, then the built-in pattern list, then the
/// conservative unknown default.
pub struct ErrorClassifier {
    custom: Vec<CustomClassifier>,
    patterns: Vec<ErrorPattern>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self {
            custom: Vec::new(),
            patterns: built_in_patterns(),
        }
    }

    /// Prepend a pattern so it is checked before the built-ins.
    pub fn add_pattern(&mut self, pattern: ErrorPattern) {
        self.patterns.insert(0, pattern);
    }

    /// Register a custom classifier, checked before any pattern matching,
    /// in registration order. A panicking classifier is skipped.
    pub fn add_classifier(&mut self, classifier: CustomClassifier) {
        self.custom.push(classifier);
    }

    pub fn classify(&self, error: &anyhow::Error, context: &Context) -> ErrorClassification {
        for (index, classifier) in self.custom.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| classifier(error, context))) {
                Ok(Some(mut classification)) => {
                    self.finish(&mut classification, error, context, json!("custom"));
                    classification
                        .details
                        .insert("classifier_index".into(), json!(index));
                    return classification;
                }
                Ok(None) => {}
                Err(_) => {
                    warn!(index, "Custom classifier panicked, skipping");
                }
            }
        }

        if let Some(domain) = error.downcast_ref::<CodeAtlasError>() {
            let mut classification = classify_code(domain.code());
            self.finish(&mut classification, error, context, json!("error_code"));
            classification
                .details
                .insert("error_code".into(), json!(domain.code().to_string()));
            return classification;
        }

        let kind = ErrorKind::of(error);
        let message = error.to_string().to_lowercase();
        let code = numeric_code(error);
        for pattern in &self.patterns {
            if pattern.matches(kind, &message, code) {
                let mut classification = pattern.classification.clone();
                self.finish(&mut classification, error, context, json!("pattern"));
                classification
                    .details
                    .insert("pattern".into(), json!(pattern.name));
                return classification;
            }
        }

        let mut classification = ErrorClassification::unknown();
        self.finish(&mut classification, error, context, json!("default"));
        classification
    }

    pub fn is_retryable(&self, error: &anyhow::Error) -> bool {
        self.classify(error, &Context::new()).is_retryable
    }

    pub fn should_trip_breaker(&self, error: &anyhow::Error) -> bool {
        self.classify(error, &Context::new()).should_trip_breaker
    }

    pub fn retry_strategy(&self, error: &anyhow::Error) -> RetryStrategy {
        self.classify(error, &Context::new()).retry_strategy
    }

    fn finish(
        &self,
        classification: &mut ErrorClassification,
        error: &anyhow::Error,
        context: &Context,
        matched_by: Value,
    ) {
        classification.details.insert("matched_by".into(), matched_by);
        classification
            .details
            .insert("message".into(), json!(error.to_string()));
        classification
            .details
            .insert("context".into(), Value::Object(context.clone()));
    }
}

/// Fixed table for structured domain errors carrying an explicit code.
fn classify_code(code: ErrorCode) -> ErrorClassification {
    match code {
        ErrorCode::NetworkError | ErrorCode::ExternalServiceError => {
            ErrorClassification::transient()
        }
        ErrorCode::RateLimited => ErrorClassification::rate_limited(),
        ErrorCode::BreakerOpen => ErrorClassification::breaker_open(),
        ErrorCode::FileNotFound | ErrorCode::PermissionDenied | ErrorCode::IoError => {
            ErrorClassification::permanent()
        }
        ErrorCode::ValidationError => ErrorClassification::client_error(),
        ErrorCode::ConfigError => ErrorClassification {
            severity: Severity::High,
            ..ErrorClassification::permanent()
        },
        ErrorCode::PlatformError => ErrorClassification::system_error(),
        // Unrecognized codes get the conservative default
        _ => ErrorClassification::unknown(),
    }
}

fn re(pattern: &str) -> Regex {
    // Patterns are compile-time constants; invalid ones are a programmer error
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid built-in pattern {pattern:?}: {e}"))
}

fn built_in_patterns() -> Vec<ErrorPattern> {
    vec![
        ErrorPattern {
            name: "rate_limit",
            kinds: vec![ErrorKind::RateLimited],
            message_patterns: vec![re("rate limit"), re("too many requests")],
            codes: vec![429],
            classification: ErrorClassification::rate_limited(),
        },
        ErrorPattern {
            name: "network",
            kinds: vec![ErrorKind::Network, ErrorKind::Timeout, ErrorKind::ExternalService],
            message_patterns: vec![
                re("connection refused"),
                re("connection reset"),
                re("timed out"),
                re("timeout"),
                re("unreachable"),
                re("broken pipe"),
                re("dns"),
            ],
            codes: vec![408, 502, 503, 504],
            classification: ErrorClassification::transient(),
        },
        ErrorPattern {
            name: "not_found",
            kinds: vec![ErrorKind::FileNotFound],
            message_patterns: vec![re("not found"), re("no such file")],
            codes: vec![404],
            classification: ErrorClassification::permanent(),
        },
        ErrorPattern {
            name: "permission",
            kinds: vec![ErrorKind::PermissionDenied],
            message_patterns: vec![re("permission denied"), re("access denied")],
            codes: vec![401, 403],
            classification: ErrorClassification::permanent(),
        },
        ErrorPattern {
            name: "validation",
            kinds: vec![ErrorKind::Validation],
            message_patterns: vec![re("invalid"), re("validation failed"), re("malformed")],
            codes: vec![400, 422],
            classification: ErrorClassification::client_error(),
        },
        ErrorPattern {
            name: "system",
            kinds: vec![ErrorKind::Platform],
            message_patterns: vec![
                re("disk full"),
                re("no space left"),
                re("out of memory"),
                re("cannot allocate"),
            ],
            // ENOMEM, ENOSPC
            codes: vec![12, 28],
            classification: ErrorClassification::system_error(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new()
    }

    fn io_err(kind: std::io::ErrorKind, msg: &str) -> anyhow::Error {
        anyhow::Error::new(std::io::Error::new(kind, msg.to_string()))
    }

    #[test]
    fn connection_error_is_transient_with_backoff() {
        let c = classifier();
        let classification = c.classify(
            &io_err(std::io::ErrorKind::ConnectionRefused, "connection refused"),
            &Context::new(),
        );
        assert_eq!(classification.category, ErrorCategory::Transient);
        assert!(classification.is_retryable);
        assert_eq!(
            classification.retry_strategy,
            RetryStrategy::ExponentialBackoff
        );
        assert!(classification.should_trip_breaker);
    }

    #[test]
    fn file_not_found_is_permanent() {
        let c = classifier();
        let classification = c.classify(
            &io_err(std::io::ErrorKind::NotFound, "no such file"),
            &Context::new(),
        );
        assert_eq!(classification.category, ErrorCategory::Permanent);
        assert!(!classification.is_retryable);
    }

    #[test]
    fn rate_limited_domain_error_uses_code_table() {
        let c = classifier();
        let err = anyhow::Error::new(CodeAtlasError::RateLimited("slow down".into()));
        let classification = c.classify(&err, &Context::new());
        assert_eq!(classification.category, ErrorCategory::CircuitBreaker);
        assert!(classification.is_retryable);
        assert_eq!(classification.max_retries, 3);
        assert!(classification.should_trip_breaker);
        assert_eq!(classification.fallback_action, FallbackAction::QueueForLater);
        assert_eq!(classification.details["matched_by"], json!("error_code"));
    }

    #[test]
    fn breaker_open_does_not_retrip() {
        let c = classifier();
        let err = anyhow::Error::new(CodeAtlasError::BreakerOpen("analysis-store".into()));
        let classification = c.classify(&err, &Context::new());
        assert!(!classification.is_retryable);
        assert!(!classification.should_trip_breaker);
    }

    #[test]
    fn platform_error_is_critical_fail_fast() {
        let c = classifier();
        let err = anyhow::Error::new(CodeAtlasError::Platform("mmap failed".into()));
        let classification = c.classify(&err, &Context::new());
        assert_eq!(classification.category, ErrorCategory::SystemError);
        assert_eq!(classification.severity, Severity::Critical);
        assert_eq!(classification.fallback_action, FallbackAction::FailFast);
        assert!(!classification.is_retryable);
    }

    #[test]
    fn unmatched_error_falls_back_to_unknown() {
        let c = classifier();
        let classification = c.classify(&anyhow::anyhow!("???"), &Context::new());
        assert_eq!(classification.category, ErrorCategory::Unknown);
        assert!(!classification.is_retryable);
        assert_eq!(classification.severity, Severity::Medium);
        assert_eq!(classification.fallback_action, FallbackAction::NotifyUser);
    }

    #[test]
    fn context_is_echoed_into_details() {
        let c = classifier();
        let mut ctx = Context::new();
        ctx.insert("operation".into(), json!("record_symbol"));
        let classification = c.classify(&anyhow::anyhow!("???"), &ctx);
        assert_eq!(
            classification.details["context"]["operation"],
            json!("record_symbol")
        );
    }

    #[test]
    fn custom_classifier_wins_over_patterns() {
        let mut c = classifier();
        c.add_classifier(Arc::new(|error, _| {
            error
                .to_string()
                .contains("quota")
                .then(ErrorClassification::rate_limited)
        }));
        let classification = c.classify(&anyhow::anyhow!("quota exhausted"), &Context::new());
        assert_eq!(classification.category, ErrorCategory::CircuitBreaker);
        assert_eq!(classification.details["matched_by"], json!("custom"));
    }

    #[test]
    fn panicking_custom_classifier_is_skipped() {
        let mut c = classifier();
        c.add_classifier(Arc::new(|_, _| panic!("bad classifier")));
        let classification = c.classify(
            &io_err(std::io::ErrorKind::ConnectionRefused, "connection refused"),
            &Context::new(),
        );
        // Classification still completes via the built-in patterns
        assert_eq!(classification.category, ErrorCategory::Transient);
    }

    #[test]
    fn added_pattern_checked_before_built_ins() {
        let mut c = classifier();
        c.add_pattern(ErrorPattern {
            name: "lock_contention",
            kinds: vec![],
            message_patterns: vec![re("database is locked")],
            codes: vec![],
            classification: ErrorClassification::transient(),
        });
        let classification = c.classify(&anyhow::anyhow!("database is locked"), &Context::new());
        assert_eq!(classification.details["pattern"], json!("lock_contention"));
        assert!(classification.is_retryable);
    }

    #[test]
    fn numeric_code_matches_pattern() {
        let c = classifier();
        let err = anyhow::Error::new(CodeAtlasError::Network {
            message: "bad gateway".into(),
            status: Some(502),
        });
        // Domain errors hit the code table first; a bare io error with an
        // errno exercises the numeric probe instead.
        let classification = c.classify(&err, &Context::new());
        assert_eq!(classification.category, ErrorCategory::Transient);

        let nospace = anyhow::Error::new(std::io::Error::from_raw_os_error(28));
        let classification = c.classify(&nospace, &Context::new());
        assert_eq!(classification.category, ErrorCategory::SystemError);
    }

    #[test]
    fn convenience_wrappers_agree_with_classify() {
        let c = classifier();
        let err = io_err(std::io::ErrorKind::ConnectionRefused, "connection refused");
        assert!(c.is_retryable(&err));
        assert!(c.should_trip_breaker(&err));
        assert_eq!(c.retry_strategy(&err), RetryStrategy::ExponentialBackoff);
    }
}
