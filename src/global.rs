//! Global registry access
//!
//! One [`DatabaseRegistry`] per process, installed once with [`DBS::init`]
//! and handed out afterwards. Libraries that prefer explicit plumbing can
//! take the `Arc` from [`DBS::registry`] and pass it down.

use crate::database::session::Session;
use crate::error::{Error, Result};
use crate::registry::{DatabaseRegistry, RegistryBuilder};
use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use std::sync::Arc;

/// Global database registry
static REGISTRY: OnceCell<Arc<DatabaseRegistry>> = OnceCell::new();

/// Global database registry access point
pub struct DBS;

impl DBS {
    /// Build the registry and install it as the process-wide instance
    ///
    /// Fails with [`Error::AlreadyInitialized`] when a registry is already
    /// installed; the builder is dropped without starting anything.
    ///
    /// # Examples
    /// ```rust,ignore
    /// let config = RegistryConfig::load()?;
    /// DBS::init(DatabaseRegistry::builder(config)).await?;
    ///
    /// let orders = DBS::registry()?.get_session("orders", None).await?;
    /// ```
    pub async fn init(builder: RegistryBuilder) -> Result<Arc<DatabaseRegistry>> {
        if REGISTRY.get().is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let mut created = false;
        let registry = REGISTRY.get_or_try_init(|| {
            created = true;
            builder.build()
        })?;

        // lost a race with a concurrent init
        if !created {
            return Err(Error::AlreadyInitialized);
        }

        log::info!("Global database registry initialized");
        Ok(Arc::clone(registry))
    }

    /// The installed registry
    pub fn registry() -> Result<Arc<DatabaseRegistry>> {
        REGISTRY
            .get()
            .cloned()
            .ok_or_else(|| Error::internal("Database registry not initialized; call DBS::init first"))
    }

    pub fn try_registry() -> Option<Arc<DatabaseRegistry>> {
        REGISTRY.get().cloned()
    }

    pub fn is_initialized() -> bool {
        REGISTRY.get().is_some()
    }

    /// [`DatabaseRegistry::with_session`] on the installed registry
    pub async fn with_session<T, E, F>(database_id: &str, work: F) -> std::result::Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut Session) -> BoxFuture<'s, std::result::Result<T, E>>,
        E: From<Error>,
    {
        let registry = Self::registry()?;
        registry.with_session(database_id, work).await
    }

    /// Shut the installed registry down
    ///
    /// The instance stays installed (a `OnceCell` cannot be reset) but holds
    /// no pools and its reaper is stopped. Later requests recreate entries
    /// on demand but nothing evicts them.
    pub async fn shutdown() -> Result<()> {
        match REGISTRY.get() {
            Some(registry) => {
                registry.shutdown().await;
                Ok(())
            }
            None => {
                log::debug!("DBS::shutdown called before init");
                Ok(())
            }
        }
    }
}
