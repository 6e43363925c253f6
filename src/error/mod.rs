use thiserror::Error;

pub mod context;

pub type Result<T> = std::result::Result<T, Error>;

/// Boxed cause carried by initialization and work failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// Re-export context helpers
pub use context::{ErrorChain, ErrorContext, OptionExt};

/// Main error type for the multi-database registry
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid connection parameters for a database identifier
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Pool or session factory construction failed
    #[error("Failed to initialize database '{database_id}': {source}")]
    Initialization {
        database_id: String,
        #[source]
        source: BoxError,
    },

    /// Caller-supplied session work failed with a foreign error
    #[error("Session work failed: {0}")]
    Work(#[source] BoxError),

    // Database-specific errors
    #[error("Database connection error: {0}")]
    DatabaseConnection(String),

    #[error("Database query error: {0}")]
    DatabaseQuery(String),

    #[error("Database transaction error: {0}")]
    DatabaseTransaction(String),

    #[error("Database pool error: {0}")]
    DatabasePool(String),

    #[error("Session is closed: {0}")]
    SessionClosed(String),

    #[error("Statement not found: {0}")]
    StatementNotFound(String),

    #[error("Database registry has already been initialized")]
    AlreadyInitialized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    // Error with context chain
    #[error("{message}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                Self::DatabasePool(err.to_string())
            }
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Configuration(_) => {
                Self::DatabaseConnection(err.to_string())
            }
            other => Self::DatabaseQuery(other.to_string()),
        }
    }
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Wrap a construction failure for `database_id`, keeping the cause
    pub fn initialization(database_id: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Initialization {
            database_id: database_id.into(),
            source: source.into(),
        }
    }

    pub fn work(source: impl Into<BoxError>) -> Self {
        Self::Work(source.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    // Database error constructors
    pub fn database_connection(msg: impl Into<String>) -> Self {
        Self::DatabaseConnection(msg.into())
    }

    pub fn database_query(msg: impl Into<String>) -> Self {
        Self::DatabaseQuery(msg.into())
    }

    pub fn database_transaction(msg: impl Into<String>) -> Self {
        Self::DatabaseTransaction(msg.into())
    }

    pub fn database_pool(msg: impl Into<String>) -> Self {
        Self::DatabasePool(msg.into())
    }

    pub fn session_closed(msg: impl Into<String>) -> Self {
        Self::SessionClosed(msg.into())
    }

    pub fn statement_not_found(name: impl Into<String>) -> Self {
        Self::StatementNotFound(name.into())
    }

    // Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::DatabaseConnection(_) | Error::DatabasePool(_) | Error::Initialization { .. } => {
                true
            }
            Error::WithContext { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Get error code for logs and API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "E_CONFIGURATION",
            Error::Initialization { .. } => "E_INITIALIZATION",
            Error::Work(_) => "E_WORK",
            Error::DatabaseConnection(_) => "E_DB_CONNECTION",
            Error::DatabaseQuery(_) => "E_DB_QUERY",
            Error::DatabaseTransaction(_) => "E_DB_TRANSACTION",
            Error::DatabasePool(_) => "E_DB_POOL",
            Error::SessionClosed(_) => "E_SESSION_CLOSED",
            Error::StatementNotFound(_) => "E_STATEMENT_NOT_FOUND",
            Error::AlreadyInitialized => "E_ALREADY_INITIALIZED",
            Error::Io(_) => "E_IO",
            Error::Json(_) => "E_JSON",
            Error::Internal(_) => "E_INTERNAL",
            Error::WithContext { source, .. } => source.error_code(),
        }
    }
}
