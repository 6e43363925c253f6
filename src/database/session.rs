//! Sessions: one unit of query work on one checked-out connection

use crate::database::factory::{SessionInfo, SessionInterceptor, StatementEvent};
use crate::database::mappings::StatementMappings;
use crate::database::pool::{QueryResult, SessionConnection};
use crate::database::value::SqlValue;
use crate::error::{Error, Result};
use serde_json::Value as JsonValue;
use std::sync::Arc;

type Interceptors = Arc<Vec<Arc<dyn SessionInterceptor>>>;

/// An open session
///
/// Call [`Session::close`] when done. A session dropped without being
/// closed still returns its connection to the pool, but interceptors are
/// not notified and uncommitted work is discarded by the driver.
pub struct Session {
    info: SessionInfo,
    connection: Option<Box<dyn SessionConnection>>,
    mappings: Arc<StatementMappings>,
    interceptors: Interceptors,
}

impl Session {
    pub(crate) fn new(
        database_id: String,
        connection: Box<dyn SessionConnection>,
        mappings: Arc<StatementMappings>,
        interceptors: Interceptors,
        auto_commit: bool,
    ) -> Self {
        let info = SessionInfo {
            session_id: uuid::Uuid::new_v4().to_string(),
            database_id,
            auto_commit,
        };

        log::debug!("Opened session {} on '{}'", info.session_id, info.database_id);

        Self {
            info,
            connection: Some(connection),
            mappings,
            interceptors,
        }
    }

    pub fn id(&self) -> &str {
        &self.info.session_id
    }

    pub fn database_id(&self) -> &str {
        &self.info.database_id
    }

    pub fn auto_commit(&self) -> bool {
        self.info.auto_commit
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn mappings(&self) -> &Arc<StatementMappings> {
        &self.mappings
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_none()
    }

    pub async fn execute(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<QueryResult> {
        self.ensure_open()?;
        run_interceptors(&self.info, &self.interceptors, None, sql, &params).await?;
        self.connection()?.execute(sql, params).await
    }

    pub async fn fetch_all(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<JsonValue>> {
        self.ensure_open()?;
        run_interceptors(&self.info, &self.interceptors, None, sql, &params).await?;
        self.connection()?.fetch_all(sql, params).await
    }

    pub async fn fetch_optional(
        &mut self,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Option<JsonValue>> {
        self.ensure_open()?;
        run_interceptors(&self.info, &self.interceptors, None, sql, &params).await?;
        self.connection()?.fetch_optional(sql, params).await
    }

    /// Run a mapped statement that modifies data
    pub async fn execute_named(&mut self, name: &str, params: Vec<SqlValue>) -> Result<QueryResult> {
        let mappings = self.mappings.clone();
        let sql = lookup(&mappings, name)?;
        self.ensure_open()?;
        run_interceptors(&self.info, &self.interceptors, Some(name), sql, &params).await?;
        self.connection()?.execute(sql, params).await
    }

    pub async fn fetch_named(&mut self, name: &str, params: Vec<SqlValue>) -> Result<Vec<JsonValue>> {
        let mappings = self.mappings.clone();
        let sql = lookup(&mappings, name)?;
        self.ensure_open()?;
        run_interceptors(&self.info, &self.interceptors, Some(name), sql, &params).await?;
        self.connection()?.fetch_all(sql, params).await
    }

    pub async fn fetch_optional_named(
        &mut self,
        name: &str,
        params: Vec<SqlValue>,
    ) -> Result<Option<JsonValue>> {
        let mappings = self.mappings.clone();
        let sql = lookup(&mappings, name)?;
        self.ensure_open()?;
        run_interceptors(&self.info, &self.interceptors, Some(name), sql, &params).await?;
        self.connection()?.fetch_optional(sql, params).await
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.connection()?.commit().await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.connection()?.rollback().await
    }

    /// Release the connection back to its pool
    pub async fn close(mut self) -> Result<()> {
        self.release().await
    }

    pub(crate) async fn notify_open(&mut self) -> Result<()> {
        for interceptor in self.interceptors.iter() {
            interceptor.on_open(&self.info).await.map_err(|e| {
                e.with_context(format!(
                    "Interceptor '{}' refused to open a session on '{}'",
                    interceptor.name(),
                    self.info.database_id
                ))
            })?;
        }
        Ok(())
    }

    /// Release after a failed open; errors are only logged
    pub(crate) async fn discard(&mut self) {
        if let Err(e) = self.release().await {
            log::warn!(
                "Failed to release connection of discarded session {}: {}",
                self.info.session_id,
                e
            );
        }
    }

    async fn release(&mut self) -> Result<()> {
        let Some(mut connection) = self.connection.take() else {
            return Ok(());
        };

        for interceptor in self.interceptors.iter() {
            interceptor.on_close(&self.info).await;
        }

        log::debug!(
            "Closing session {} on '{}'",
            self.info.session_id,
            self.info.database_id
        );
        connection.close().await
    }

    fn connection(&mut self) -> Result<&mut Box<dyn SessionConnection>> {
        let session_id = &self.info.session_id;
        self.connection
            .as_mut()
            .ok_or_else(|| Error::session_closed(session_id.clone()))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.connection.is_none() {
            return Err(Error::session_closed(self.info.session_id.clone()));
        }
        Ok(())
    }
}

async fn run_interceptors(
    info: &SessionInfo,
    interceptors: &[Arc<dyn SessionInterceptor>],
    statement_name: Option<&str>,
    sql: &str,
    params: &[SqlValue],
) -> Result<()> {
    let event = StatementEvent {
        session: info,
        statement_name,
        sql,
        params,
    };

    for interceptor in interceptors {
        interceptor.before_statement(&event).await.map_err(|e| {
            e.with_context(format!(
                "Interceptor '{}' rejected a statement on '{}'",
                interceptor.name(),
                info.database_id
            ))
        })?;
    }

    Ok(())
}

fn lookup<'m>(mappings: &'m StatementMappings, name: &str) -> Result<&'m str> {
    mappings
        .sql(name)
        .ok_or_else(|| Error::statement_not_found(name.to_string()))
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.connection.is_some() {
            log::warn!(
                "Session {} on '{}' dropped without close; releasing its connection",
                self.info.session_id,
                self.info.database_id
            );
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.info.session_id)
            .field("database_id", &self.info.database_id)
            .field("auto_commit", &self.info.auto_commit)
            .field("closed", &self.is_closed())
            .finish()
    }
}
