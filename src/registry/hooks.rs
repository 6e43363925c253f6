//! Initialization hooks
//!
//! The registry calls a `PoolInitializer` when it must build a pool for an
//! identifier it has no parameters for, and a `SessionFactoryInitializer`
//! when it must build a session factory. Both run under a lock held for
//! that identifier only. Through [`HookContext::registry`] a hook may use
//! other identifiers, e.g. to read a tenant's connection details from the
//! primary database; asking for the identifier being built fails with a
//! configuration error.
//!
//! Plain closures implement both traits:
//!
//! ```rust,ignore
//! RegistryBuilder::new(config)
//!     .on_pool_init(|id, pool, _ctx| {
//!         pool.set_url(format!("postgres://db.internal/{}", id));
//!         Ok(())
//!     })
//!     .on_factory_init(|_id, factory, _ctx| {
//!         factory.set_property("schema", "tenant");
//!         Ok(())
//!     });
//! ```

use crate::config::RegistryConfig;
use crate::database::factory::SessionFactoryBuilder;
use crate::database::mappings::StatementMappings;
use crate::database::params::{ConnectionParameters, PoolSettings};
use crate::error::{Error, Result};
use crate::registry::DatabaseRegistry;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

/// What a hook may read while it configures a pool or factory
#[derive(Debug, Clone)]
pub struct HookContext {
    database_id: String,
    config: Arc<RegistryConfig>,
    registry: Weak<DatabaseRegistry>,
}

impl HookContext {
    pub(crate) fn new(
        database_id: &str,
        config: Arc<RegistryConfig>,
        registry: Weak<DatabaseRegistry>,
    ) -> Self {
        Self {
            database_id: database_id.to_string(),
            config,
            registry,
        }
    }

    /// The registry running this hook; `None` once it has been dropped
    pub fn registry(&self) -> Option<Arc<DatabaseRegistry>> {
        self.registry.upgrade()
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Parameters configured for this identifier, if any
    pub fn parameters(&self) -> Option<&ConnectionParameters> {
        self.config.parameters(&self.database_id)
    }
}

/// Configures a new, empty pool for an identifier
#[async_trait]
pub trait PoolInitializer: Send + Sync {
    async fn init(
        &self,
        database_id: &str,
        pool: &mut PoolSettings,
        context: &HookContext,
    ) -> Result<()>;
}

/// Configures a new session factory bound to an identifier's pool
#[async_trait]
pub trait SessionFactoryInitializer: Send + Sync {
    async fn init(
        &self,
        database_id: &str,
        factory: &mut SessionFactoryBuilder,
        context: &HookContext,
    ) -> Result<()>;
}

#[async_trait]
impl<F> PoolInitializer for F
where
    F: Fn(&str, &mut PoolSettings, &HookContext) -> Result<()> + Send + Sync,
{
    async fn init(
        &self,
        database_id: &str,
        pool: &mut PoolSettings,
        context: &HookContext,
    ) -> Result<()> {
        self(database_id, pool, context)
    }
}

#[async_trait]
impl<F> SessionFactoryInitializer for F
where
    F: Fn(&str, &mut SessionFactoryBuilder, &HookContext) -> Result<()> + Send + Sync,
{
    async fn init(
        &self,
        database_id: &str,
        factory: &mut SessionFactoryBuilder,
        context: &HookContext,
    ) -> Result<()> {
        self(database_id, factory, context)
    }
}

/// Default pool hook: copies the identifier's `[mdbs.databases.<id>]` table
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfiguredPoolInitializer;

#[async_trait]
impl PoolInitializer for ConfiguredPoolInitializer {
    async fn init(
        &self,
        database_id: &str,
        pool: &mut PoolSettings,
        context: &HookContext,
    ) -> Result<()> {
        let parameters = context.parameters().ok_or_else(|| {
            Error::configuration(format!(
                "No connection parameters configured for database '{}'",
                database_id
            ))
        })?;

        pool.apply(parameters);
        Ok(())
    }
}

/// Factory hook attaching statement mappings discovered from disk
///
/// Discovery runs once, on first use; every factory initialized through
/// the same `MappingInitializer` shares the resulting `StatementMappings`.
#[derive(Debug)]
pub struct MappingInitializer {
    locations: Vec<PathBuf>,
    mappings: OnceCell<Arc<StatementMappings>>,
}

impl MappingInitializer {
    pub fn new<I, P>(locations: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            locations: locations.into_iter().map(Into::into).collect(),
            mappings: OnceCell::new(),
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(config.mapper_locations.iter().cloned())
    }

    pub fn locations(&self) -> &[PathBuf] {
        &self.locations
    }

    /// Discovered mappings, loading them on first call
    pub fn mappings(&self) -> Result<Arc<StatementMappings>> {
        self.mappings
            .get_or_try_init(|| StatementMappings::discover(&self.locations).map(Arc::new))
            .cloned()
    }
}

#[async_trait]
impl SessionFactoryInitializer for MappingInitializer {
    async fn init(
        &self,
        database_id: &str,
        factory: &mut SessionFactoryBuilder,
        _context: &HookContext,
    ) -> Result<()> {
        let mappings = self.mappings()?;
        log::debug!(
            "Attaching {} mapped statements to '{}'",
            mappings.len(),
            database_id
        );
        factory.set_mappings(mappings);
        Ok(())
    }
}
