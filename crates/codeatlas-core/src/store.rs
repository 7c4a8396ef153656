use crate::Result;
use async_trait::async_trait;
use serde_json::Value;

/// A single row returned by the store, column name to value.
pub type Row = serde_json::Map<String, Value>;

/// Boundary trait for the SQLite-backed persistence layer.
///
/// The analysis store (symbols, imports, dependency edges, patterns,
/// embeddings) lives behind this trait; the resilience layer only ever sees
/// it as a named resource whose operations can fail.
#[async_trait]
pub trait SqliteStore: Send + Sync {
    /// Run a statement, returning the number of affected rows.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Fetch at most one row.
    async fn fetch_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>>;

    /// Fetch every matching row.
    async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;
}
