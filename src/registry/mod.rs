//! Registry of lazily created pools and session factories
//!
//! One entry per database identifier. The first request for an identifier
//! builds its pool (and, when asked for, its session factory) through the
//! configured hooks; later requests reuse them until the entry is closed or
//! evicted by the [`Reaper`] after sitting idle.
//!
//! Construction is serialized per identifier, never across the whole map:
//! the entry map is only locked to look up, insert, or remove entries, so a
//! slow hook for one identifier does not hold up any other.

pub mod hooks;
pub mod reaper;

mod entry;
mod scope;

use crate::config::RegistryConfig;
use crate::database::adapters::SqlxConnector;
use crate::database::factory::{SessionFactory, SessionFactoryBuilder};
use crate::database::params::{ConnectionParameters, PoolSettings};
use crate::database::pool::{ConnectionPool, PoolConnector};
use crate::database::session::Session;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use entry::PoolEntry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::Mutex;

pub use hooks::{
    ConfiguredPoolInitializer, HookContext, MappingInitializer, PoolInitializer,
    SessionFactoryInitializer,
};
pub use reaper::Reaper;

tokio::task_local! {
    /// Identifiers whose hooks are running on the current task
    static BUILDING: Vec<String>;
}

/// Lock serializing construction for one identifier
type BuildSlot = Arc<Mutex<()>>;

/// Shared state the reaper sweeps through a weak reference
pub(crate) struct RegistryInner {
    entries: Mutex<HashMap<String, PoolEntry>>,
    building: Mutex<HashMap<String, BuildSlot>>,
    config: Arc<RegistryConfig>,
    connector: Arc<dyn PoolConnector>,
    pool_initializer: Arc<dyn PoolInitializer>,
    factory_initializer: Option<Arc<dyn SessionFactoryInitializer>>,
    handle: Weak<DatabaseRegistry>,
}

impl RegistryInner {
    fn hook_context(&self, database_id: &str) -> HookContext {
        HookContext::new(
            database_id,
            Arc::clone(&self.config),
            Weak::clone(&self.handle),
        )
    }

    async fn cached_pool(&self, database_id: &str) -> Option<Arc<dyn ConnectionPool>> {
        let mut entries = self.entries.lock().await;
        entries.get_mut(database_id).map(|entry| {
            entry.touch();
            Arc::clone(&entry.pool)
        })
    }

    async fn cached_factory(&self, database_id: &str) -> Option<Arc<SessionFactory>> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(database_id)?;
        let factory = Arc::clone(entry.factory.as_ref()?);
        entry.touch();
        Some(factory)
    }

    async fn acquire_slot(&self, database_id: &str) -> BuildSlot {
        let mut building = self.building.lock().await;
        Arc::clone(
            building
                .entry(database_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Drop the slot once no other caller is waiting on it
    async fn release_slot(&self, database_id: &str, slot: BuildSlot) {
        let mut building = self.building.lock().await;
        let unused = match building.get(database_id) {
            // one reference in the map, one here
            Some(current) => Arc::ptr_eq(current, &slot) && Arc::strong_count(&slot) == 2,
            None => false,
        };
        if unused {
            building.remove(database_id);
        }
    }

    /// Run construction code with `database_id` marked as being built
    async fn while_building<T, F>(&self, database_id: &str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut ids = BUILDING.try_with(|ids| ids.clone()).unwrap_or_default();
        ids.push(database_id.to_string());
        BUILDING.scope(ids, work).await
    }

    /// A hook asking for its own identifier would wait on itself forever
    fn check_reentry(database_id: &str) -> Result<()> {
        let reentered = BUILDING
            .try_with(|ids| ids.iter().any(|id| id == database_id))
            .unwrap_or(false);

        if reentered {
            return Err(Error::configuration(format!(
                "Initialization hook requested database '{}' while it is being built",
                database_id
            )));
        }
        Ok(())
    }

    async fn create_pool(
        &self,
        database_id: &str,
        parameters: Option<&ConnectionParameters>,
        slot: &BuildSlot,
    ) -> Result<Arc<dyn ConnectionPool>> {
        Self::check_reentry(database_id)?;
        let _building = slot.lock().await;

        // another caller may have finished while we waited
        if let Some(pool) = self.cached_pool(database_id).await {
            return Ok(pool);
        }

        let pool = self
            .while_building(database_id, self.build_pool(database_id, parameters))
            .await?;
        self.entries.lock().await.insert(
            database_id.to_string(),
            PoolEntry::new(Arc::clone(&pool), self.config.idle_threshold()),
        );

        log::info!("Registered pool for database '{}'", database_id);
        Ok(pool)
    }

    async fn create_factory(
        &self,
        database_id: &str,
        parameters: Option<&ConnectionParameters>,
        slot: &BuildSlot,
    ) -> Result<Arc<SessionFactory>> {
        Self::check_reentry(database_id)?;
        let _building = slot.lock().await;

        loop {
            let existing = {
                let mut entries = self.entries.lock().await;
                match entries.get_mut(database_id) {
                    Some(entry) => {
                        entry.touch();
                        if let Some(factory) = &entry.factory {
                            return Ok(Arc::clone(factory));
                        }
                        Some(Arc::clone(&entry.pool))
                    }
                    None => None,
                }
            };

            let (pool, fresh_pool) = match existing {
                Some(pool) => (pool, false),
                None => (
                    self.while_building(database_id, self.build_pool(database_id, parameters))
                        .await?,
                    true,
                ),
            };

            let factory = match self
                .while_building(database_id, self.build_factory(database_id, Arc::clone(&pool)))
                .await
            {
                Ok(factory) => Arc::new(factory),
                Err(_) if !fresh_pool && pool.is_closed() => {
                    log::debug!(
                        "Pool for '{}' was closed while its factory was built; retrying",
                        database_id
                    );
                    continue;
                }
                Err(e) => {
                    if fresh_pool {
                        close_quietly(database_id, &pool).await;
                    }
                    return Err(e);
                }
            };

            let mut entries = self.entries.lock().await;
            let current = entries
                .get(database_id)
                .map(|entry| Arc::ptr_eq(&entry.pool, &pool));

            match current {
                Some(true) => {
                    if let Some(entry) = entries.get_mut(database_id) {
                        entry.factory = Some(Arc::clone(&factory));
                        entry.touch();
                    }
                }
                None if fresh_pool => {
                    let mut entry = PoolEntry::new(pool, self.config.idle_threshold());
                    entry.factory = Some(Arc::clone(&factory));
                    entries.insert(database_id.to_string(), entry);
                }
                _ => {
                    // closed or evicted under us
                    drop(entries);
                    if fresh_pool {
                        close_quietly(database_id, &pool).await;
                    }
                    log::debug!(
                        "Entry for '{}' changed while its factory was built; retrying",
                        database_id
                    );
                    continue;
                }
            }

            log::info!("Registered session factory for database '{}'", database_id);
            return Ok(factory);
        }
    }

    async fn build_pool(
        &self,
        database_id: &str,
        parameters: Option<&ConnectionParameters>,
    ) -> Result<Arc<dyn ConnectionPool>> {
        let parameters = match parameters {
            Some(parameters) => parameters.clone(),
            None => {
                let context = self.hook_context(database_id);
                let mut settings = PoolSettings::new();
                self.pool_initializer
                    .init(database_id, &mut settings, &context)
                    .await
                    .map_err(|e| initialization_error(database_id, e))?;

                if !settings.is_configured() {
                    return Err(Error::configuration(format!(
                        "No connection URL configured for database '{}'",
                        database_id
                    )));
                }
                settings.build()?
            }
        };

        parameters.validate(database_id)?;

        log::debug!(
            "Creating pool for database '{}' ({})",
            database_id,
            parameters.masked_url()
        );

        self.connector
            .connect(database_id, &parameters)
            .await
            .map_err(|e| initialization_error(database_id, e))
    }

    async fn build_factory(
        &self,
        database_id: &str,
        pool: Arc<dyn ConnectionPool>,
    ) -> Result<SessionFactory> {
        let mut builder = SessionFactoryBuilder::new(database_id, pool);

        if let Some(initializer) = &self.factory_initializer {
            let context = self.hook_context(database_id);
            initializer
                .init(database_id, &mut builder, &context)
                .await
                .map_err(|e| initialization_error(database_id, e))?;
        }

        builder
            .build()
            .map_err(|e| initialization_error(database_id, e))
    }
}

/// Configuration problems surface as-is; anything else is wrapped
fn initialization_error(database_id: &str, error: Error) -> Error {
    let passes_through = match &error {
        Error::Configuration(_) | Error::Initialization { .. } => true,
        Error::WithContext { source, .. } => matches!(**source, Error::Configuration(_)),
        _ => false,
    };

    if passes_through {
        error
    } else {
        Error::initialization(database_id, error)
    }
}

async fn close_quietly(database_id: &str, pool: &Arc<dyn ConnectionPool>) {
    if let Err(e) = pool.force_close_all().await {
        log::warn!(
            "Failed to close pool for '{}' after failed construction: {}",
            database_id,
            e
        );
    }
}

/// Per-entry snapshot returned by [`DatabaseRegistry::stats`]
#[derive(Debug, Clone)]
pub struct EntryStats {
    pub database_id: String,
    pub has_factory: bool,
    pub idle_secs: u64,
    pub idle_threshold_secs: u64,
    pub created_at: DateTime<Utc>,
}

/// Statistics about the database registry
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of cached identifiers
    pub total_databases: usize,
    /// Cached identifiers, sorted
    pub database_names: Vec<String>,
    pub entries: Vec<EntryStats>,
}

/// Process-wide registry of pools and session factories
pub struct DatabaseRegistry {
    inner: Arc<RegistryInner>,
    reaper: Reaper,
}

impl DatabaseRegistry {
    /// Start building a registry over `config`
    pub fn builder(config: RegistryConfig) -> RegistryBuilder {
        RegistryBuilder::new(config)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    pub async fn has_pool(&self, database_id: &str) -> bool {
        self.inner.entries.lock().await.contains_key(database_id)
    }

    pub async fn has_factory(&self, database_id: &str) -> bool {
        self.inner
            .entries
            .lock()
            .await
            .get(database_id)
            .map(|entry| entry.factory.is_some())
            .unwrap_or(false)
    }

    /// Get the pool for `database_id`, creating it on first use
    ///
    /// `parameters` are only consulted when no pool is cached; without them
    /// the pool hook configures the new pool.
    pub async fn get_pool(
        &self,
        database_id: &str,
        parameters: Option<&ConnectionParameters>,
    ) -> Result<Arc<dyn ConnectionPool>> {
        if let Some(pool) = self.inner.cached_pool(database_id).await {
            log::debug!("Pool cache hit for '{}'", database_id);
            return Ok(pool);
        }

        let slot = self.inner.acquire_slot(database_id).await;
        let result = self.inner.create_pool(database_id, parameters, &slot).await;
        self.inner.release_slot(database_id, slot).await;
        result
    }

    /// Get the session factory for `database_id`, creating it on first use
    ///
    /// The factory is derived from the identifier's cached pool when one
    /// exists. A fresh pool and its factory are inserted together, and
    /// concurrent callers for one identifier all receive the same factory.
    pub async fn get_session_factory(
        &self,
        database_id: &str,
        parameters: Option<&ConnectionParameters>,
    ) -> Result<Arc<SessionFactory>> {
        if let Some(factory) = self.inner.cached_factory(database_id).await {
            log::debug!("Session factory cache hit for '{}'", database_id);
            return Ok(factory);
        }

        let slot = self.inner.acquire_slot(database_id).await;
        let result = self.inner.create_factory(database_id, parameters, &slot).await;
        self.inner.release_slot(database_id, slot).await;
        result
    }

    /// Open a session on `database_id`
    ///
    /// The session is opened once the factory is registered, outside any
    /// registry lock.
    pub async fn get_session(
        &self,
        database_id: &str,
        parameters: Option<&ConnectionParameters>,
    ) -> Result<Session> {
        let factory = self.get_session_factory(database_id, parameters).await?;
        factory.open_session().await
    }

    /// Remove and close one entry; returns whether it existed
    pub async fn close(&self, database_id: &str) -> bool {
        let removed = self.inner.entries.lock().await.remove(database_id);

        match removed {
            Some(entry) => {
                entry.close(database_id).await;
                true
            }
            None => false,
        }
    }

    /// Remove and close every entry; returns how many were closed
    pub async fn close_all(&self) -> usize {
        let drained: Vec<(String, PoolEntry)> = self.inner.entries.lock().await.drain().collect();
        let count = drained.len();

        for (database_id, entry) in drained {
            entry.close(&database_id).await;
        }

        if count > 0 {
            log::info!("Closed {} database pool(s)", count);
        }
        count
    }

    /// Run one eviction sweep now; returns the evicted identifiers
    pub async fn evict_idle(&self) -> Vec<String> {
        Reaper::sweep_once(&self.inner).await
    }

    /// Cached identifiers, sorted
    pub async fn list_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.entries.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn stats(&self) -> RegistryStats {
        let now = Instant::now();
        let entries = self.inner.entries.lock().await;

        let mut stats: Vec<EntryStats> = entries
            .iter()
            .map(|(database_id, entry)| EntryStats {
                database_id: database_id.clone(),
                has_factory: entry.factory.is_some(),
                idle_secs: entry.idle_for(now).as_secs(),
                idle_threshold_secs: entry.idle_threshold.as_secs(),
                created_at: entry.created_at,
            })
            .collect();
        stats.sort_by(|a, b| a.database_id.cmp(&b.database_id));

        RegistryStats {
            total_databases: stats.len(),
            database_names: stats.iter().map(|s| s.database_id.clone()).collect(),
            entries: stats,
        }
    }

    /// Stop the reaper and close every entry
    pub async fn shutdown(&self) {
        self.reaper.join().await;
        let closed = self.close_all().await;
        log::info!("Database registry shut down ({} pool(s) closed)", closed);
    }
}

impl Drop for DatabaseRegistry {
    fn drop(&mut self) {
        self.reaper.stop();
    }
}

impl std::fmt::Debug for DatabaseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseRegistry")
            .field("refresh_period", &self.inner.config.refresh_period)
            .field("idle_timeout", &self.inner.config.idle_timeout)
            .field("reaper_running", &self.reaper.is_running())
            .finish()
    }
}

/// Assembles a [`DatabaseRegistry`]
///
/// Defaults: [`SqlxConnector`], [`ConfiguredPoolInitializer`], and a
/// [`MappingInitializer`] when the configuration lists mapper locations.
pub struct RegistryBuilder {
    config: RegistryConfig,
    connector: Option<Arc<dyn PoolConnector>>,
    pool_initializer: Option<Arc<dyn PoolInitializer>>,
    factory_initializer: Option<Arc<dyn SessionFactoryInitializer>>,
}

impl RegistryBuilder {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            connector: None,
            pool_initializer: None,
            factory_initializer: None,
        }
    }

    pub fn connector<C>(mut self, connector: C) -> Self
    where
        C: PoolConnector + 'static,
    {
        self.connector = Some(Arc::new(connector));
        self
    }

    pub fn pool_initializer<I>(mut self, initializer: I) -> Self
    where
        I: PoolInitializer + 'static,
    {
        self.pool_initializer = Some(Arc::new(initializer));
        self
    }

    /// Use a closure as the pool hook
    pub fn on_pool_init<F>(self, hook: F) -> Self
    where
        F: Fn(&str, &mut PoolSettings, &HookContext) -> Result<()> + Send + Sync + 'static,
    {
        self.pool_initializer(hook)
    }

    pub fn factory_initializer<I>(mut self, initializer: I) -> Self
    where
        I: SessionFactoryInitializer + 'static,
    {
        self.factory_initializer = Some(Arc::new(initializer));
        self
    }

    /// Use a closure as the session factory hook
    pub fn on_factory_init<F>(self, hook: F) -> Self
    where
        F: Fn(&str, &mut SessionFactoryBuilder, &HookContext) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.factory_initializer(hook)
    }

    /// Build the registry and start its reaper
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Arc<DatabaseRegistry>> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::internal(
                "DatabaseRegistry must be built inside a tokio runtime",
            ));
        }

        self.config.validate()?;

        let factory_initializer = self.factory_initializer.or_else(|| {
            if self.config.mapper_locations.is_empty() {
                None
            } else {
                let initializer: Arc<dyn SessionFactoryInitializer> =
                    Arc::new(MappingInitializer::from_config(&self.config));
                Some(initializer)
            }
        });

        let refresh_interval = self.config.refresh_interval();
        let idle_timeout = self.config.idle_timeout;
        let config = Arc::new(self.config);
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(SqlxConnector::new()));
        let pool_initializer = self
            .pool_initializer
            .unwrap_or_else(|| Arc::new(ConfiguredPoolInitializer));

        let registry = Arc::new_cyclic(|handle| {
            let inner = Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                building: Mutex::new(HashMap::new()),
                config,
                connector,
                pool_initializer,
                factory_initializer,
                handle: Weak::clone(handle),
            });
            let reaper = Reaper::start(Arc::downgrade(&inner), refresh_interval);
            DatabaseRegistry { inner, reaper }
        });

        log::info!(
            "Database registry ready (refresh {:?}, idle timeout {}s)",
            refresh_interval,
            idle_timeout
        );

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing::{Counters, FakeConnector};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn sqlite_params(name: &str) -> ConnectionParameters {
        ConnectionParameters::new(format!("sqlite://{}.db", name))
    }

    fn registry_with(
        config: RegistryConfig,
        connector: FakeConnector,
    ) -> Arc<DatabaseRegistry> {
        DatabaseRegistry::builder(config)
            .connector(connector)
            .build()
            .unwrap()
    }

    /// Registry whose pool hook counts invocations and serves any identifier
    fn counting_registry(
        counters: &Arc<Counters>,
        hook_calls: &Arc<AtomicUsize>,
        delay: Duration,
    ) -> Arc<DatabaseRegistry> {
        let calls = Arc::clone(hook_calls);
        DatabaseRegistry::builder(RegistryConfig::new())
            .connector(FakeConnector::new(Arc::clone(counters)).with_connect_delay(delay))
            .on_pool_init(move |id, pool, _ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                pool.set_url(format!("postgres://localhost/{}", id))
                    .set_max_active_connections(4);
                Ok(())
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_runtime() {
        let err = DatabaseRegistry::builder(RegistryConfig::new())
            .build()
            .unwrap_err();
        assert_eq!(err.error_code(), "E_INTERNAL");
    }

    #[tokio::test]
    async fn test_registry_creation() {
        let registry = registry_with(RegistryConfig::new(), FakeConnector::new(Counters::new()));
        let stats = registry.stats().await;

        assert_eq!(stats.total_databases, 0);
        assert!(stats.database_names.is_empty());
        assert!(!registry.has_pool("main").await);
        assert!(!registry.has_factory("main").await);
        assert!(registry.reaper().is_running());
    }

    #[tokio::test]
    async fn test_get_pool_caches_first_parameters() {
        let counters = Counters::new();
        let registry = registry_with(RegistryConfig::new(), FakeConnector::new(counters.clone()));

        let first = registry.get_pool("x", Some(&sqlite_params("x"))).await.unwrap();
        let second = registry.get_pool("x", None).await.unwrap();
        let third = registry.get_pool("x", Some(&sqlite_params("other"))).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(third.parameters().url, "sqlite://x.db");
        assert_eq!(Counters::get(&counters.connects), 1);
        assert!(registry.has_pool("x").await);
        assert!(!registry.has_factory("x").await);
    }

    #[tokio::test]
    async fn test_configured_parameters_are_used_without_hook() {
        let counters = Counters::new();
        let config = RegistryConfig::new().with_database("main", sqlite_params("main"));
        let registry = registry_with(config, FakeConnector::new(counters.clone()));

        let pool = registry.get_pool("main", None).await.unwrap();
        assert_eq!(pool.parameters().url, "sqlite://main.db");
    }

    #[tokio::test]
    async fn test_unknown_identifier_is_configuration_error() {
        let counters = Counters::new();
        let registry = registry_with(RegistryConfig::new(), FakeConnector::new(counters.clone()));

        let err = registry.get_session("nowhere", None).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(!registry.has_pool("nowhere").await);
        assert_eq!(Counters::get(&counters.connects), 0);
    }

    #[tokio::test]
    async fn test_hook_without_url_is_configuration_error() {
        let registry = DatabaseRegistry::builder(RegistryConfig::new())
            .connector(FakeConnector::new(Counters::new()))
            .on_pool_init(|_id, pool, _ctx| {
                pool.set_username("nobody");
                Ok(())
            })
            .build()
            .unwrap();

        let err = registry.get_pool("blank", None).await.err().unwrap();
        assert!(matches!(err, Error::Configuration(ref msg) if msg.contains("blank")));
    }

    #[tokio::test]
    async fn test_failed_construction_is_not_cached() {
        let counters = Counters::new();
        let connector = FakeConnector::new(counters.clone());
        connector.set_fail_connect(true);
        let config = RegistryConfig::new().with_database("flaky", sqlite_params("flaky"));
        let registry = registry_with(config, connector.clone());

        let err = registry.get_session_factory("flaky", None).await.unwrap_err();
        assert!(matches!(err, Error::Initialization { ref database_id, .. } if database_id == "flaky"));
        assert!(err.is_retryable());
        assert!(!registry.has_pool("flaky").await);

        connector.set_fail_connect(false);
        registry.get_session_factory("flaky", None).await.unwrap();
        assert!(registry.has_factory("flaky").await);
        assert_eq!(Counters::get(&counters.connects), 1);
    }

    #[tokio::test]
    async fn test_factory_hook_failure_closes_fresh_pool() {
        let counters = Counters::new();
        let registry = DatabaseRegistry::builder(
            RegistryConfig::new().with_database("bad", sqlite_params("bad")),
        )
        .connector(FakeConnector::new(counters.clone()))
        .on_factory_init(|_id, _factory, _ctx| Err(Error::database_query("mapper exploded")))
        .build()
        .unwrap();

        let err = registry.get_session_factory("bad", None).await.unwrap_err();
        assert_eq!(err.error_code(), "E_INITIALIZATION");
        assert!(!registry.has_pool("bad").await);
        assert_eq!(Counters::get(&counters.pool_closes), 1);
    }

    #[tokio::test]
    async fn test_factory_is_derived_from_cached_pool() {
        let counters = Counters::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let seen_in_hook = Arc::clone(&seen);

        let registry = DatabaseRegistry::builder(
            RegistryConfig::new().with_database("shared", sqlite_params("shared")),
        )
        .connector(FakeConnector::new(counters.clone()))
        .on_factory_init(move |id, factory, ctx| {
            seen_in_hook
                .lock()
                .unwrap()
                .push(format!("{}:{}", id, factory.pool().parameters().url));
            assert_eq!(ctx.database_id(), id);
            factory.set_property("tenant", id);
            Ok(())
        })
        .build()
        .unwrap();

        let pool = registry.get_pool("shared", None).await.unwrap();
        let factory = registry.get_session_factory("shared", None).await.unwrap();
        let again = registry.get_session_factory("shared", None).await.unwrap();

        assert!(Arc::ptr_eq(factory.pool(), &pool));
        assert!(Arc::ptr_eq(&factory, &again));
        assert_eq!(factory.property("tenant"), Some("shared"));
        assert_eq!(*seen.lock().unwrap(), vec!["shared:sqlite://shared.db".to_string()]);
        assert_eq!(Counters::get(&counters.connects), 1);
    }

    #[tokio::test]
    async fn test_close_discards_entry() {
        let counters = Counters::new();
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(&counters, &hook_calls, Duration::ZERO);

        let session = registry.get_session("a", None).await.unwrap();
        session.close().await.unwrap();
        assert!(registry.has_factory("a").await);

        assert!(registry.close("a").await);
        assert!(!registry.has_pool("a").await);
        assert!(!registry.has_factory("a").await);
        assert_eq!(Counters::get(&counters.pool_closes), 1);
        assert!(!registry.close("a").await);

        registry.get_pool("a", None).await.unwrap();
        assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_close_all() {
        let counters = Counters::new();
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(&counters, &hook_calls, Duration::ZERO);

        registry.get_pool("a", None).await.unwrap();
        registry.get_session_factory("b", None).await.unwrap();
        registry.get_session_factory("c", None).await.unwrap();

        assert_eq!(registry.list_databases().await, vec!["a", "b", "c"]);
        assert_eq!(registry.close_all().await, 3);
        assert!(registry.list_databases().await.is_empty());
        assert_eq!(Counters::get(&counters.pool_closes), 3);
        assert_eq!(registry.close_all().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_builds_once() {
        let counters = Counters::new();
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(&counters, &hook_calls, Duration::from_millis(20));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.get_session_factory("shared", None).await.unwrap()
            }));
        }

        let mut factories = Vec::new();
        for handle in handles {
            factories.push(handle.await.unwrap());
        }

        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert_eq!(Counters::get(&counters.connects), 1);
        assert!(factories.iter().all(|f| Arc::ptr_eq(f, &factories[0])));
    }

    #[tokio::test]
    async fn test_stats_report_entries() {
        let counters = Counters::new();
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(&counters, &hook_calls, Duration::ZERO);

        registry.get_pool("pool_only", None).await.unwrap();
        registry.get_session_factory("full", None).await.unwrap();

        let stats = registry.stats().await;
        assert_eq!(stats.total_databases, 2);
        assert_eq!(stats.database_names, vec!["full", "pool_only"]);
        assert!(stats.entries[0].has_factory);
        assert!(!stats.entries[1].has_factory);
        assert_eq!(stats.entries[1].idle_threshold_secs, 3600);
    }

    #[tokio::test]
    async fn test_shutdown_stops_reaper_and_closes() {
        let counters = Counters::new();
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(&counters, &hook_calls, Duration::ZERO);

        registry.get_session_factory("a", None).await.unwrap();
        registry.shutdown().await;

        assert!(!registry.reaper().is_running());
        assert!(!registry.has_pool("a").await);
        assert_eq!(Counters::get(&counters.pool_closes), 1);
    }

    #[tokio::test]
    async fn test_mapping_initializer_is_default_factory_hook() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("q.sql"), "-- name: one\nSELECT 1").unwrap();

        let config = RegistryConfig::new()
            .with_database("a", sqlite_params("a"))
            .with_database("b", sqlite_params("b"))
            .with_mapper_location(dir.path());
        let registry = registry_with(config, FakeConnector::new(Counters::new()));

        let a = registry.get_session_factory("a", None).await.unwrap();
        let b = registry.get_session_factory("b", None).await.unwrap();

        assert!(a.mappings().contains("one"));
        assert!(Arc::ptr_eq(a.mappings(), b.mappings()));
    }

    #[tokio::test]
    async fn test_invalid_explicit_parameters_are_configuration_errors() {
        let counters = Counters::new();
        let registry = registry_with(RegistryConfig::new(), FakeConnector::new(counters.clone()));

        let err = registry
            .get_pool("c", Some(&ConnectionParameters::new("redis://cache")))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(ref msg) if msg.contains("'c'")));

        let zero = ConnectionParameters::new("postgres://db/c").with_max_active_connections(0);
        let err = registry.get_session_factory("c", Some(&zero)).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        assert!(!registry.has_pool("c").await);
        assert_eq!(Counters::get(&counters.connects), 0);
    }

    /// Resolves a tenant's database by asking the primary database
    struct TenantDirectory;

    #[async_trait::async_trait]
    impl PoolInitializer for TenantDirectory {
        async fn init(
            &self,
            database_id: &str,
            pool: &mut PoolSettings,
            context: &HookContext,
        ) -> Result<()> {
            if database_id == "primary" {
                pool.set_url("postgres://localhost/primary");
                return Ok(());
            }

            let registry = context
                .registry()
                .ok_or_else(|| Error::internal("registry dropped"))?;
            let mut session = registry.get_session("primary", None).await?;
            // the fake connection echoes bound parameters back
            let row = session
                .fetch_optional("SELECT db_name FROM tenants WHERE id = ?", vec![database_id.into()])
                .await?;
            session.close().await?;

            let name = row
                .and_then(|row| row["params"][0].as_str().map(str::to_string))
                .ok_or_else(|| Error::configuration(format!("Unknown tenant '{}'", database_id)))?;
            pool.set_url(format!("postgres://localhost/{}_db", name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pool_hook_can_use_another_database() {
        let counters = Counters::new();
        let registry = DatabaseRegistry::builder(RegistryConfig::new())
            .connector(FakeConnector::new(counters.clone()))
            .pool_initializer(TenantDirectory)
            .build()
            .unwrap();

        let session = tokio::time::timeout(
            Duration::from_secs(3),
            registry.get_session("tenant", None),
        )
        .await
        .expect("pool hook blocked the registry")
        .unwrap();
        session.close().await.unwrap();

        let pool = registry.get_pool("tenant", None).await.unwrap();
        assert_eq!(pool.parameters().url, "postgres://localhost/tenant_db");
        assert_eq!(registry.list_databases().await, vec!["primary", "tenant"]);
        assert_eq!(Counters::get(&counters.connects), 2);
    }

    /// Pool hook that asks the registry for the identifier it is building
    struct SelfReferential;

    #[async_trait::async_trait]
    impl PoolInitializer for SelfReferential {
        async fn init(
            &self,
            database_id: &str,
            _pool: &mut PoolSettings,
            context: &HookContext,
        ) -> Result<()> {
            let registry = context
                .registry()
                .ok_or_else(|| Error::internal("registry dropped"))?;
            registry.get_pool(database_id, None).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pool_hook_requesting_itself_is_rejected() {
        let registry = DatabaseRegistry::builder(RegistryConfig::new())
            .connector(FakeConnector::new(Counters::new()))
            .pool_initializer(SelfReferential)
            .build()
            .unwrap();

        for _ in 0..2 {
            let err = tokio::time::timeout(Duration::from_secs(3), registry.get_pool("loop", None))
                .await
                .expect("pool hook waited on itself")
                .err()
                .unwrap();
            assert!(matches!(err, Error::Configuration(ref msg) if msg.contains("'loop'")));
        }
        assert!(!registry.has_pool("loop").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_construction_does_not_block_other_databases() {
        let counters = Counters::new();
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(&counters, &hook_calls, Duration::from_millis(300));

        registry.get_pool("ready", None).await.unwrap();

        let slow = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get_pool("slow", None).await.map(|_| ()) })
        };
        while hook_calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let names = tokio::time::timeout(Duration::from_millis(100), registry.list_databases())
            .await
            .unwrap();
        assert_eq!(names, vec!["ready"]);
        let ready = tokio::time::timeout(Duration::from_millis(100), registry.get_pool("ready", None))
            .await
            .unwrap();
        assert!(ready.is_ok());

        slow.await.unwrap().unwrap();
        assert!(registry.has_pool("slow").await);
    }

    /// Factory hook slow enough for a close to land while it runs
    struct SlowFactoryHook {
        calls: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl SessionFactoryInitializer for SlowFactoryHook {
        async fn init(
            &self,
            _database_id: &str,
            _factory: &mut SessionFactoryBuilder,
            _context: &HookContext,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_during_factory_construction() {
        let counters = Counters::new();
        let factory_calls = Arc::new(AtomicUsize::new(0));
        let registry = DatabaseRegistry::builder(
            RegistryConfig::new().with_database("a", sqlite_params("a")),
        )
        .connector(FakeConnector::new(counters.clone()).with_connect_delay(Duration::from_millis(20)))
        .factory_initializer(SlowFactoryHook {
            calls: Arc::clone(&factory_calls),
            delay: Duration::from_millis(200),
        })
        .build()
        .unwrap();

        let first_pool = registry.get_pool("a", None).await.unwrap();

        let building = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get_session_factory("a", None).await })
        };
        while factory_calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(registry.close("a").await);
        assert!(first_pool.is_closed());
        assert!(!registry.has_pool("a").await);

        // the in-flight request rebuilds instead of caching the closed pool
        let factory = building.await.unwrap().unwrap();
        assert!(!factory.pool().is_closed());
        assert!(!Arc::ptr_eq(factory.pool(), &first_pool));

        let cached = registry.get_session_factory("a", None).await.unwrap();
        assert!(Arc::ptr_eq(&factory, &cached));
        assert_eq!(factory_calls.load(Ordering::SeqCst), 2);
        assert_eq!(Counters::get(&counters.connects), 2);
        assert_eq!(Counters::get(&counters.pool_closes), 1);

        let session = registry.get_session("a", None).await.unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_during_pool_construction() {
        let counters = Counters::new();
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let registry = counting_registry(&counters, &hook_calls, Duration::from_millis(100));

        let building = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get_session_factory("b", None).await })
        };
        while hook_calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // nothing is registered until construction finishes
        assert!(!registry.close("b").await);

        let factory = building.await.unwrap().unwrap();
        assert!(registry.has_factory("b").await);
        assert!(!factory.pool().is_closed());

        assert!(registry.close("b").await);
        assert!(factory.pool().is_closed());
        assert_eq!(Counters::get(&counters.pool_closes), 1);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }
}
