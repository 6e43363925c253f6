//! Connection pool abstraction
//!
//! The registry never talks to a driver directly. A `PoolConnector` turns
//! `ConnectionParameters` into a `ConnectionPool`, and a pool hands out
//! `SessionConnection`s that sessions run statements on.

use crate::database::params::ConnectionParameters;
use crate::database::value::SqlValue;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Result of a statement that modifies data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryResult {
    /// Number of rows affected by the statement
    pub rows_affected: u64,
    /// Last inserted ID (if the backend reports one)
    pub last_insert_id: Option<i64>,
}

/// Per-checkout options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// When false, statements run inside a transaction that is only
    /// persisted by an explicit commit
    pub auto_commit: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { auto_commit: true }
    }
}

/// Builds pools from connection parameters
#[async_trait]
pub trait PoolConnector: Send + Sync {
    /// Create a pool for `database_id`
    ///
    /// Implementations should not block on establishing connections; the
    /// registry calls this while holding its lock.
    async fn connect(
        &self,
        database_id: &str,
        parameters: &ConnectionParameters,
    ) -> Result<Arc<dyn ConnectionPool>>;
}

/// A pool of physical connections to one database
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    fn database_id(&self) -> &str;

    fn parameters(&self) -> &ConnectionParameters;

    /// Check out a connection
    async fn acquire(&self, options: SessionOptions) -> Result<Box<dyn SessionConnection>>;

    /// Close every connection, including ones still checked out
    async fn force_close_all(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Access the concrete pool for downcasting
    fn as_any(&self) -> &dyn std::any::Any;
}

/// A checked-out connection
#[async_trait]
pub trait SessionConnection: Send {
    async fn execute(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<QueryResult>;

    async fn fetch_all(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<JsonValue>>;

    async fn fetch_optional(&mut self, sql: &str, params: Vec<SqlValue>)
        -> Result<Option<JsonValue>>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// Return the connection to its pool, discarding uncommitted work
    ///
    /// Calling `close` more than once is a no-op.
    async fn close(&mut self) -> Result<()>;
}
