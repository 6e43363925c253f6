//! Session factories
//!
//! A `SessionFactory` is derived from exactly one pool. It is assembled by a
//! `SessionFactoryBuilder`, which factory initialization hooks receive
//! already bound to the pool they must use.

use crate::database::mappings::{MappedStatement, StatementMappings};
use crate::database::pool::{ConnectionPool, SessionOptions};
use crate::database::session::Session;
use crate::database::value::SqlValue;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Identity of a session, passed to interceptors
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub database_id: String,
    pub auto_commit: bool,
}

/// A statement about to run on a session
#[derive(Debug)]
pub struct StatementEvent<'a> {
    pub session: &'a SessionInfo,
    /// Mapping name when run through `execute_named`/`fetch_named`
    pub statement_name: Option<&'a str>,
    pub sql: &'a str,
    pub params: &'a [SqlValue],
}

/// Plugin invoked around session activity
///
/// Interceptors run in ascending `priority()` order. An error returned from
/// `before_statement` aborts the statement.
#[async_trait]
pub trait SessionInterceptor: Send + Sync + 'static {
    fn name(&self) -> &'static str {
        "unnamed"
    }

    /// Lower numbers run first
    fn priority(&self) -> i32 {
        0
    }

    async fn on_open(&self, _session: &SessionInfo) -> Result<()> {
        Ok(())
    }

    async fn before_statement(&self, _statement: &StatementEvent<'_>) -> Result<()> {
        Ok(())
    }

    async fn on_close(&self, _session: &SessionInfo) {}
}

/// Assembles a `SessionFactory` for one pool
///
/// The pool is fixed when the builder is created; hooks can only add
/// mappings, interceptors and defaults.
pub struct SessionFactoryBuilder {
    database_id: String,
    pool: Arc<dyn ConnectionPool>,
    mappings: Option<Arc<StatementMappings>>,
    extra_mappings: Vec<Arc<StatementMappings>>,
    extra_statements: Vec<(String, String)>,
    interceptors: Vec<Arc<dyn SessionInterceptor>>,
    auto_commit: bool,
    properties: HashMap<String, String>,
}

impl SessionFactoryBuilder {
    pub fn new(database_id: impl Into<String>, pool: Arc<dyn ConnectionPool>) -> Self {
        let auto_commit = pool.parameters().auto_commit.unwrap_or(true);
        Self {
            database_id: database_id.into(),
            pool,
            mappings: None,
            extra_mappings: Vec::new(),
            extra_statements: Vec::new(),
            interceptors: Vec::new(),
            auto_commit,
            properties: HashMap::new(),
        }
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    /// The pool this factory will be derived from
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    /// Use `mappings` as the factory's statement set, shared as-is
    pub fn set_mappings(&mut self, mappings: Arc<StatementMappings>) -> &mut Self {
        self.mappings = Some(mappings);
        self
    }

    /// Merge another statement set in at build time
    pub fn add_mappings(&mut self, mappings: Arc<StatementMappings>) -> &mut Self {
        self.extra_mappings.push(mappings);
        self
    }

    pub fn add_statement(&mut self, name: impl Into<String>, sql: impl Into<String>) -> &mut Self {
        self.extra_statements.push((name.into(), sql.into()));
        self
    }

    pub fn add_interceptor<I>(&mut self, interceptor: I) -> &mut Self
    where
        I: SessionInterceptor,
    {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Default auto-commit mode for sessions from this factory
    pub fn set_auto_commit(&mut self, auto_commit: bool) -> &mut Self {
        self.auto_commit = auto_commit;
        self
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<SessionFactory> {
        if self.pool.is_closed() {
            return Err(Error::database_pool(format!(
                "pool for database '{}' is closed",
                self.database_id
            )));
        }

        let mappings = if self.extra_mappings.is_empty() && self.extra_statements.is_empty() {
            self.mappings
                .unwrap_or_else(|| Arc::new(StatementMappings::new()))
        } else {
            let mut merged = self
                .mappings
                .as_deref()
                .cloned()
                .unwrap_or_default();

            for extra in &self.extra_mappings {
                merged.merge(extra)?;
            }
            for (name, sql) in self.extra_statements {
                merged.insert(MappedStatement {
                    name,
                    sql,
                    source: PathBuf::from("<inline>"),
                })?;
            }

            Arc::new(merged)
        };

        let mut interceptors = self.interceptors;
        interceptors.sort_by_key(|i| i.priority());

        log::debug!(
            "Built session factory for '{}' ({} statements, {} interceptors)",
            self.database_id,
            mappings.len(),
            interceptors.len()
        );

        Ok(SessionFactory {
            database_id: self.database_id,
            pool: self.pool,
            mappings,
            interceptors: Arc::new(interceptors),
            auto_commit: self.auto_commit,
            properties: self.properties,
        })
    }
}

/// Opens sessions on one pool
pub struct SessionFactory {
    database_id: String,
    pool: Arc<dyn ConnectionPool>,
    mappings: Arc<StatementMappings>,
    interceptors: Arc<Vec<Arc<dyn SessionInterceptor>>>,
    auto_commit: bool,
    properties: HashMap<String, String>,
}

impl SessionFactory {
    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    pub fn mappings(&self) -> &Arc<StatementMappings> {
        &self.mappings
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    /// Open a session with the factory's default auto-commit mode
    pub async fn open_session(&self) -> Result<Session> {
        self.open_session_with(self.auto_commit).await
    }

    pub async fn open_session_with(&self, auto_commit: bool) -> Result<Session> {
        let connection = self.pool.acquire(SessionOptions { auto_commit }).await?;

        let mut session = Session::new(
            self.database_id.clone(),
            connection,
            self.mappings.clone(),
            self.interceptors.clone(),
            auto_commit,
        );

        if let Err(e) = session.notify_open().await {
            session.discard().await;
            return Err(e);
        }

        Ok(session)
    }
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("database_id", &self.database_id)
            .field("statements", &self.mappings.len())
            .field("interceptors", &self.interceptors.len())
            .field("auto_commit", &self.auto_commit)
            .finish()
    }
}
