//! Pool connector implementations

pub mod any;

pub use any::{SqlxConnection, SqlxConnector, SqlxPool};
