//! Pools, session factories and sessions
//!
//! Everything the registry caches for one database identifier lives here:
//! the connection parameters it was built from, the pool, the session
//! factory derived from that pool, and the sessions the factory opens.

pub mod adapters;
pub mod factory;
pub mod mappings;
pub mod params;
pub mod pool;
pub mod session;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use adapters::{SqlxConnection, SqlxConnector, SqlxPool};
pub use factory::{
    SessionFactory, SessionFactoryBuilder, SessionInfo, SessionInterceptor, StatementEvent,
};
pub use mappings::{MappedStatement, StatementMappings};
pub use params::{Backend, ConnectionParameters, IsolationLevel, PoolSettings};
pub use pool::{ConnectionPool, PoolConnector, QueryResult, SessionConnection, SessionOptions};
pub use session::Session;
pub use value::SqlValue;
