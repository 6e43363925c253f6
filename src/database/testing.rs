//! In-memory pool fakes for unit tests

use crate::database::params::ConnectionParameters;
use crate::database::pool::{
    ConnectionPool, PoolConnector, QueryResult, SessionConnection, SessionOptions,
};
use crate::database::value::SqlValue;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub connects: AtomicUsize,
    pub acquires: AtomicUsize,
    pub session_closes: AtomicUsize,
    pub pool_closes: AtomicUsize,
    pub statements: AtomicUsize,
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub(crate) struct FakeConnector {
    counters: Arc<Counters>,
    fail_connect: Arc<AtomicBool>,
    connect_delay: Duration,
    fail_close: bool,
}

impl FakeConnector {
    pub fn new(counters: Arc<Counters>) -> Self {
        Self {
            counters,
            fail_connect: Arc::new(AtomicBool::new(false)),
            connect_delay: Duration::ZERO,
            fail_close: false,
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Sessions from this connector fail when closed
    pub fn with_failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PoolConnector for FakeConnector {
    async fn connect(
        &self,
        database_id: &str,
        parameters: &ConnectionParameters,
    ) -> Result<Arc<dyn ConnectionPool>> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::database_connection("connection refused"));
        }
        parameters.validate(database_id)?;

        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakePool {
            database_id: database_id.to_string(),
            parameters: parameters.clone(),
            counters: self.counters.clone(),
            closed: AtomicBool::new(false),
            fail_close: self.fail_close,
        }))
    }
}

pub(crate) struct FakePool {
    database_id: String,
    parameters: ConnectionParameters,
    counters: Arc<Counters>,
    closed: AtomicBool,
    fail_close: bool,
}

#[async_trait]
impl ConnectionPool for FakePool {
    fn database_id(&self) -> &str {
        &self.database_id
    }

    fn parameters(&self) -> &ConnectionParameters {
        &self.parameters
    }

    async fn acquire(&self, _options: SessionOptions) -> Result<Box<dyn SessionConnection>> {
        if self.is_closed() {
            return Err(Error::database_pool("pool closed"));
        }
        self.counters.acquires.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            counters: self.counters.clone(),
            closed: false,
            fail_close: self.fail_close,
        }))
    }

    async fn force_close_all(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.pool_closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Echoes statements back as rows: `{"sql": .., "params": [..]}`
pub(crate) struct FakeConnection {
    counters: Arc<Counters>,
    closed: bool,
    fail_close: bool,
}

impl FakeConnection {
    fn run(&mut self, sql: &str, params: &[SqlValue]) -> Result<JsonValue> {
        if self.closed {
            return Err(Error::session_closed("fake connection"));
        }
        if sql.contains("FAIL") {
            return Err(Error::database_query(format!("rejected: {}", sql)));
        }
        self.counters.statements.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            "sql": sql,
            "params": params.iter().map(SqlValue::to_json).collect::<Vec<_>>(),
        }))
    }
}

#[async_trait]
impl SessionConnection for FakeConnection {
    async fn execute(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<QueryResult> {
        self.run(sql, &params)?;
        Ok(QueryResult {
            rows_affected: 1,
            last_insert_id: None,
        })
    }

    async fn fetch_all(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<JsonValue>> {
        Ok(vec![self.run(sql, &params)?])
    }

    async fn fetch_optional(
        &mut self,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Option<JsonValue>> {
        Ok(Some(self.run(sql, &params)?))
    }

    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.counters.session_closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(Error::database_connection("connection reset during close"));
        }
        Ok(())
    }
}
