//! sqlx-backed pools for PostgreSQL, MySQL and SQLite
//!
//! One `AnyPool` per database identifier. The backend is chosen from the
//! connection URL at runtime, so a single connector serves every
//! identifier in the registry.

use crate::database::params::{Backend, ConnectionParameters};
use crate::database::pool::{
    ConnectionPool, PoolConnector, QueryResult, SessionConnection, SessionOptions,
};
use crate::database::value::SqlValue;
use crate::error::{Error, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::{Map, Value as JsonValue};
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, AnyPool, Column, Row, Transaction, ValueRef};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_LOGIN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

static DRIVERS: Lazy<()> = Lazy::new(sqlx::any::install_default_drivers);

/// Default `PoolConnector` built on `sqlx::AnyPool`
///
/// Pools are created lazily: no connection is opened until the first
/// session checks one out.
#[derive(Debug, Clone)]
pub struct SqlxConnector {
    close_grace: Duration,
}

impl SqlxConnector {
    pub fn new() -> Self {
        Self {
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }

    /// How long a forced close waits for checked-out connections
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    fn pool_options(parameters: &ConnectionParameters, backend: Backend) -> AnyPoolOptions {
        let mut options = AnyPoolOptions::new()
            .max_connections(
                parameters
                    .max_active_connections
                    .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            )
            .acquire_timeout(Duration::from_secs(
                parameters.login_timeout.unwrap_or(DEFAULT_LOGIN_TIMEOUT_SECS),
            ));

        if let Some(statement) = parameters
            .isolation_level
            .and_then(|level| level.session_statement(backend))
        {
            options = options.after_connect(move |conn, _meta| {
                let statement = statement.clone();
                Box::pin(async move {
                    sqlx::query(&statement).execute(&mut *conn).await?;
                    Ok(())
                })
            });
        }

        options
    }
}

impl Default for SqlxConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PoolConnector for SqlxConnector {
    async fn connect(
        &self,
        database_id: &str,
        parameters: &ConnectionParameters,
    ) -> Result<Arc<dyn ConnectionPool>> {
        Lazy::force(&DRIVERS);

        parameters.validate(database_id)?;
        let backend = parameters.backend()?;
        let url = parameters.connect_url()?;

        if parameters.max_checkout_time.is_some() || parameters.max_idle_connections.is_some() {
            log::debug!(
                "Database '{}': checkout time and idle connection limits are not enforced by the sqlx pool",
                database_id
            );
        }

        let pool = Self::pool_options(parameters, backend)
            .connect_lazy(&url)
            .map_err(Error::from)?;

        log::info!(
            "Created {} pool for database '{}' ({})",
            backend.as_str(),
            database_id,
            parameters.masked_url()
        );

        Ok(Arc::new(SqlxPool {
            database_id: database_id.to_string(),
            parameters: parameters.clone(),
            backend,
            pool,
            close_grace: self.close_grace,
        }))
    }
}

/// Pool for one database identifier
pub struct SqlxPool {
    database_id: String,
    parameters: ConnectionParameters,
    backend: Backend,
    pool: AnyPool,
    close_grace: Duration,
}

impl SqlxPool {
    /// Get reference to the underlying pool
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }
}

#[async_trait]
impl ConnectionPool for SqlxPool {
    fn database_id(&self) -> &str {
        &self.database_id
    }

    fn parameters(&self) -> &ConnectionParameters {
        &self.parameters
    }

    async fn acquire(&self, options: SessionOptions) -> Result<Box<dyn SessionConnection>> {
        let link = if options.auto_commit {
            Link::Direct(self.pool.acquire().await?)
        } else {
            Link::Transactional {
                pool: self.pool.clone(),
                tx: None,
            }
        };

        Ok(Box::new(SqlxConnection {
            database_id: self.database_id.clone(),
            link,
        }))
    }

    async fn force_close_all(&self) -> Result<()> {
        if self.pool.is_closed() {
            return Ok(());
        }

        // close() waits for checked-out connections to come back
        if tokio::time::timeout(self.close_grace, self.pool.close())
            .await
            .is_err()
        {
            log::warn!(
                "Pool for database '{}' still had connections in use after {:?}; abandoning them",
                self.database_id,
                self.close_grace
            );
        } else {
            log::debug!("Closed pool for database '{}'", self.database_id);
        }

        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

enum Link {
    Direct(PoolConnection<Any>),
    Transactional {
        pool: AnyPool,
        tx: Option<Transaction<'static, Any>>,
    },
    Closed,
}

/// A connection checked out of a `SqlxPool`
///
/// Non auto-commit connections open a transaction on the first statement
/// and again after every commit or rollback.
pub struct SqlxConnection {
    database_id: String,
    link: Link,
}

impl SqlxConnection {
    async fn connection(&mut self) -> Result<&mut AnyConnection> {
        match &mut self.link {
            Link::Direct(conn) => Ok(&mut **conn),
            Link::Transactional { pool, tx } => {
                if tx.is_none() {
                    *tx = Some(pool.begin().await?);
                }
                match tx {
                    Some(tx) => Ok(&mut **tx),
                    None => Err(Error::database_transaction("transaction was not started")),
                }
            }
            Link::Closed => Err(Error::session_closed(format!(
                "connection to '{}' has been returned to the pool",
                self.database_id
            ))),
        }
    }

    fn take_transaction(&mut self) -> Result<Option<Transaction<'static, Any>>> {
        match &mut self.link {
            Link::Direct(_) => Ok(None),
            Link::Transactional { tx, .. } => Ok(tx.take()),
            Link::Closed => Err(Error::session_closed(format!(
                "connection to '{}' has been returned to the pool",
                self.database_id
            ))),
        }
    }
}

#[async_trait]
impl SessionConnection for SqlxConnection {
    async fn execute(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<QueryResult> {
        #[cfg(debug_assertions)]
        {
            log::debug!("[{}] EXECUTE: {}", self.database_id, sql);
            log::debug!("  Parameters: {:?}", params);
        }

        let conn = self.connection().await?;
        let result = bind_all(sqlx::query(sql), params).execute(conn).await?;

        Ok(QueryResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id(),
        })
    }

    async fn fetch_all(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<JsonValue>> {
        #[cfg(debug_assertions)]
        {
            log::debug!("[{}] FETCH_ALL: {}", self.database_id, sql);
            log::debug!("  Parameters: {:?}", params);
        }

        let conn = self.connection().await?;
        let rows = bind_all(sqlx::query(sql), params).fetch_all(conn).await?;

        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Option<JsonValue>> {
        #[cfg(debug_assertions)]
        {
            log::debug!("[{}] FETCH_OPTIONAL: {}", self.database_id, sql);
            log::debug!("  Parameters: {:?}", params);
        }

        let conn = self.connection().await?;
        let row = bind_all(sqlx::query(sql), params)
            .fetch_optional(conn)
            .await?;

        Ok(row.as_ref().map(row_to_json))
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.take_transaction()? {
            tx.commit()
                .await
                .map_err(|e| Error::database_transaction(format!("commit failed: {}", e)))?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.take_transaction()? {
            tx.rollback()
                .await
                .map_err(|e| Error::database_transaction(format!("rollback failed: {}", e)))?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.link, Link::Closed) {
            Link::Transactional { tx: Some(tx), .. } => {
                log::debug!(
                    "Rolling back uncommitted work on '{}' before release",
                    self.database_id
                );
                tx.rollback()
                    .await
                    .map_err(|e| Error::database_transaction(format!("rollback failed: {}", e)))
            }
            // dropping a PoolConnection returns it to the pool
            _ => Ok(()),
        }
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: Vec<SqlValue>,
) -> Query<'q, Any, AnyArguments<'q>> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(b) => query.bind(b),
            SqlValue::Int(i) => query.bind(i),
            SqlValue::BigInt(i) => query.bind(i),
            SqlValue::Double(f) => query.bind(f),
            SqlValue::String(s) => query.bind(s),
            SqlValue::Bytes(b) => query.bind(b),
            SqlValue::Json(j) => query.bind(j.to_string()),
        };
    }
    query
}

/// Convert a row to a JSON object keyed by column name
fn row_to_json(row: &AnyRow) -> JsonValue {
    let mut object = Map::new();

    for (index, column) in row.columns().iter().enumerate() {
        let is_null = row
            .try_get_raw(index)
            .map(|value| value.is_null())
            .unwrap_or(true);

        let value = if is_null {
            JsonValue::Null
        } else if let Ok(v) = row.try_get::<i64, _>(index) {
            JsonValue::from(v)
        } else if let Ok(v) = row.try_get::<f64, _>(index) {
            serde_json::Number::from_f64(v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null)
        } else if let Ok(v) = row.try_get::<bool, _>(index) {
            JsonValue::Bool(v)
        } else if let Ok(v) = row.try_get::<String, _>(index) {
            JsonValue::String(v)
        } else if let Ok(v) = row.try_get::<Vec<u8>, _>(index) {
            JsonValue::Array(v.into_iter().map(JsonValue::from).collect())
        } else {
            JsonValue::Null
        };

        object.insert(column.name().to_string(), value);
    }

    JsonValue::Object(object)
}
