//! RustF multi-database registry
//!
//! Named database pools and session factories for RustF applications:
//! - pools and factories created lazily on first use, through hooks
//! - one cached pool and factory per database identifier
//! - idle entries evicted by a background reaper
//! - scoped sessions that are always closed (`with_session`)
//! - named SQL statements loaded from mapper files

// Enforce error handling best practices
#![cfg_attr(
    not(test),
    warn(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo,
    )
)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used,))]

pub mod config;
pub mod database;
pub mod error;
pub mod registry;

// Global registry access
pub mod global;

// Re-export main types for public API
pub use config::{Environment, RegistryConfig};
pub use database::{
    Backend, ConnectionParameters, ConnectionPool, IsolationLevel, PoolConnector, PoolSettings,
    QueryResult, Session, SessionFactory, SessionFactoryBuilder, SessionInterceptor, SqlValue,
    SqlxConnector, StatementMappings,
};
pub use error::{Error, ErrorChain, ErrorContext, Result};
pub use global::DBS;
pub use registry::{
    ConfiguredPoolInitializer, DatabaseRegistry, HookContext, MappingInitializer,
    PoolInitializer, Reaper, RegistryBuilder, RegistryStats, SessionFactoryInitializer,
};

/// Commonly used imports
pub mod prelude {
    pub use crate::config::RegistryConfig;
    pub use crate::database::{ConnectionParameters, PoolSettings, Session, SqlValue};
    pub use crate::error::{Error, Result};
    pub use crate::global::DBS;
    pub use crate::registry::{DatabaseRegistry, HookContext, RegistryBuilder};
    pub use futures::future::BoxFuture;
}
