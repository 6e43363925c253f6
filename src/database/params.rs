//! Connection parameters for one logical database
//!
//! `ConnectionParameters` is the immutable record a pool is built from.
//! `PoolSettings` is the mutable, not yet configured form handed to pool
//! initialization hooks; it becomes a `ConnectionParameters` once a URL has
//! been assigned.

use crate::error::{Error, OptionExt, Result};
use serde::de;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Database backends the default connector can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Postgres,
    MySql,
    Sqlite,
}

impl Backend {
    /// Resolve a backend from a URL scheme, accepting `jdbc:` prefixed URLs
    pub fn from_url(url: &str) -> Option<Self> {
        let url = strip_jdbc(url);
        let scheme = url.split(':').next()?.to_ascii_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => Some(Backend::Postgres),
            "mysql" | "mariadb" => Some(Backend::MySql),
            "sqlite" => Some(Backend::Sqlite),
            _ => None,
        }
    }

    /// Resolve a backend from a driver name or a well-known driver class
    pub fn from_driver(driver: &str) -> Option<Self> {
        match driver.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" | "org.postgresql.driver" => Some(Backend::Postgres),
            "mysql" | "mariadb" | "com.mysql.jdbc.driver" | "com.mysql.cj.jdbc.driver"
            | "org.mariadb.jdbc.driver" => Some(Backend::MySql),
            "sqlite" | "sqlite3" | "org.sqlite.jdbc" => Some(Backend::Sqlite),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Postgres => "postgres",
            Backend::MySql => "mysql",
            Backend::Sqlite => "sqlite",
        }
    }
}

/// Default transaction isolation applied to every physical connection
///
/// Deserializes from a level name (`read_committed`, `READ_COMMITTED`,
/// `TRANSACTION_READ_COMMITTED`) or from the JDBC constant (1, 2, 4, 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Level for a `java.sql.Connection.TRANSACTION_*` constant
    pub fn from_jdbc_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(IsolationLevel::ReadUncommitted),
            2 => Some(IsolationLevel::ReadCommitted),
            4 => Some(IsolationLevel::RepeatableRead),
            8 => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Statement run after connecting to make this level the session default
    ///
    /// SQLite only distinguishes read-uncommitted (shared cache) from its
    /// serializable default, so other levels yield no statement there.
    pub fn session_statement(&self, backend: Backend) -> Option<String> {
        match backend {
            Backend::Postgres => Some(format!(
                "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}",
                self.as_sql()
            )),
            Backend::MySql => Some(format!(
                "SET SESSION TRANSACTION ISOLATION LEVEL {}",
                self.as_sql()
            )),
            Backend::Sqlite => match self {
                IsolationLevel::ReadUncommitted => Some("PRAGMA read_uncommitted = 1".to_string()),
                _ => None,
            },
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized
            .strip_prefix("transaction_")
            .unwrap_or(&normalized)
        {
            "read_uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            _ => Err(Error::configuration(format!(
                "Unknown transaction isolation level: {}",
                s
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for IsolationLevel {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Code(i64),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Code(code) => IsolationLevel::from_jdbc_code(code).ok_or_else(|| {
                de::Error::custom(format!("unsupported transaction isolation code {}", code))
            }),
            Raw::Name(name) => name.parse().map_err(de::Error::custom),
        }
    }
}

/// Immutable connection parameters for one database identifier
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// Driver name or class; inferred from the URL scheme when absent
    #[serde(default)]
    pub driver: Option<String>,

    /// Connection URL (required)
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Auto-commit default for sessions opened on this pool
    #[serde(default)]
    pub auto_commit: Option<bool>,

    #[serde(default, alias = "default_transaction_isolation_level")]
    pub isolation_level: Option<IsolationLevel>,

    #[serde(default, alias = "maximum_active_connections")]
    pub max_active_connections: Option<u32>,

    /// Seconds to wait for a connection to be established
    #[serde(default)]
    pub login_timeout: Option<u64>,

    /// Milliseconds a connection may stay checked out
    #[serde(default, alias = "maximum_checkout_time")]
    pub max_checkout_time: Option<u64>,

    #[serde(default, alias = "maximum_idle_connections")]
    pub max_idle_connections: Option<u32>,
}

impl ConnectionParameters {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            driver: None,
            url: url.into(),
            username: None,
            password: None,
            auto_commit: None,
            isolation_level: None,
            max_active_connections: None,
            login_timeout: None,
            max_checkout_time: None,
            max_idle_connections: None,
        }
    }

    /// Start from an empty, hook-style settings object
    pub fn builder() -> PoolSettings {
        PoolSettings::new()
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = Some(auto_commit);
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn with_max_active_connections(mut self, max: u32) -> Self {
        self.max_active_connections = Some(max);
        self
    }

    pub fn with_login_timeout(mut self, seconds: u64) -> Self {
        self.login_timeout = Some(seconds);
        self
    }

    pub fn with_max_checkout_time(mut self, millis: u64) -> Self {
        self.max_checkout_time = Some(millis);
        self
    }

    pub fn with_max_idle_connections(mut self, max: u32) -> Self {
        self.max_idle_connections = Some(max);
        self
    }

    /// Backend implied by the URL, checked against an explicit driver
    pub fn backend(&self) -> Result<Backend> {
        let from_url = Backend::from_url(&self.url).or_configuration_with(|| {
            format!(
                "Unsupported database URL scheme: {}",
                mask_password(&self.url)
            )
        })?;

        if let Some(driver) = &self.driver {
            let from_driver = Backend::from_driver(driver)
                .or_configuration_with(|| format!("Unknown database driver: {}", driver))?;
            if from_driver != from_url {
                return Err(Error::configuration(format!(
                    "Driver '{}' does not match URL scheme '{}'",
                    driver,
                    from_url.as_str()
                )));
            }
        }

        Ok(from_url)
    }

    /// Check the parameters can be handed to a connector
    pub fn validate(&self, database_id: &str) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::configuration(format!(
                "Database '{}' has an empty connection URL",
                database_id
            )));
        }

        if self.max_active_connections == Some(0) {
            return Err(Error::configuration(format!(
                "Database '{}' allows zero active connections",
                database_id
            )));
        }

        self.backend().map_err(|e| {
            let cause = match e {
                Error::Configuration(message) => message,
                other => other.to_string(),
            };
            Error::configuration(format!(
                "Invalid parameters for database '{}': {}",
                database_id, cause
            ))
        })?;

        Ok(())
    }

    /// URL handed to the driver: `jdbc:` prefix removed, credentials merged in
    pub fn connect_url(&self) -> Result<String> {
        let raw = strip_jdbc(&self.url);

        if self.backend()? == Backend::Sqlite
            || (self.username.is_none() && self.password.is_none())
        {
            return Ok(raw.to_string());
        }

        let mut parsed = url::Url::parse(raw).map_err(|e| {
            Error::configuration(format!("Invalid database URL '{}': {}", mask_password(raw), e))
        })?;

        if let Some(username) = &self.username {
            parsed
                .set_username(username)
                .map_err(|_| Error::configuration("Database URL cannot carry a username"))?;
        }
        if let Some(password) = &self.password {
            parsed
                .set_password(Some(password))
                .map_err(|_| Error::configuration("Database URL cannot carry a password"))?;
        }

        Ok(parsed.to_string())
    }

    /// URL suitable for logs
    pub fn masked_url(&self) -> String {
        mask_password(strip_jdbc(&self.url))
    }
}

impl fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("driver", &self.driver)
            .field("url", &self.masked_url())
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("auto_commit", &self.auto_commit)
            .field("isolation_level", &self.isolation_level)
            .field("max_active_connections", &self.max_active_connections)
            .field("login_timeout", &self.login_timeout)
            .field("max_checkout_time", &self.max_checkout_time)
            .field("max_idle_connections", &self.max_idle_connections)
            .finish()
    }
}

/// Not-yet-configured pool handed to pool initialization hooks
///
/// Hooks assign at least the URL; everything else is optional.
#[derive(Debug, Clone, Default)]
pub struct PoolSettings {
    driver: Option<String>,
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    auto_commit: Option<bool>,
    isolation_level: Option<IsolationLevel>,
    max_active_connections: Option<u32>,
    login_timeout: Option<u64>,
    max_checkout_time: Option<u64>,
    max_idle_connections: Option<u32>,
}

impl PoolSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_driver(&mut self, driver: impl Into<String>) -> &mut Self {
        self.driver = Some(driver.into());
        self
    }

    pub fn set_url(&mut self, url: impl Into<String>) -> &mut Self {
        self.url = Some(url.into());
        self
    }

    pub fn set_username(&mut self, username: impl Into<String>) -> &mut Self {
        self.username = Some(username.into());
        self
    }

    pub fn set_password(&mut self, password: impl Into<String>) -> &mut Self {
        self.password = Some(password.into());
        self
    }

    pub fn set_auto_commit(&mut self, auto_commit: bool) -> &mut Self {
        self.auto_commit = Some(auto_commit);
        self
    }

    pub fn set_isolation_level(&mut self, level: IsolationLevel) -> &mut Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn set_max_active_connections(&mut self, max: u32) -> &mut Self {
        self.max_active_connections = Some(max);
        self
    }

    pub fn set_login_timeout(&mut self, seconds: u64) -> &mut Self {
        self.login_timeout = Some(seconds);
        self
    }

    pub fn set_max_checkout_time(&mut self, millis: u64) -> &mut Self {
        self.max_checkout_time = Some(millis);
        self
    }

    pub fn set_max_idle_connections(&mut self, max: u32) -> &mut Self {
        self.max_idle_connections = Some(max);
        self
    }

    /// Copy every field from configured parameters
    pub fn apply(&mut self, parameters: &ConnectionParameters) -> &mut Self {
        self.driver = parameters.driver.clone();
        self.url = Some(parameters.url.clone());
        self.username = parameters.username.clone();
        self.password = parameters.password.clone();
        self.auto_commit = parameters.auto_commit;
        self.isolation_level = parameters.isolation_level;
        self.max_active_connections = parameters.max_active_connections;
        self.login_timeout = parameters.login_timeout;
        self.max_checkout_time = parameters.max_checkout_time;
        self.max_idle_connections = parameters.max_idle_connections;
        self
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Whether a hook assigned a connection URL
    pub fn is_configured(&self) -> bool {
        self.url.as_deref().map(|u| !u.trim().is_empty()).unwrap_or(false)
    }

    /// Freeze into parameters; fails when no URL was assigned
    pub fn build(&self) -> Result<ConnectionParameters> {
        let url = self
            .url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .or_configuration("Pool settings have no connection URL")?;

        Ok(ConnectionParameters {
            driver: self.driver.clone(),
            url,
            username: self.username.clone(),
            password: self.password.clone(),
            auto_commit: self.auto_commit,
            isolation_level: self.isolation_level,
            max_active_connections: self.max_active_connections,
            login_timeout: self.login_timeout,
            max_checkout_time: self.max_checkout_time,
            max_idle_connections: self.max_idle_connections,
        })
    }
}

fn strip_jdbc(url: &str) -> &str {
    url.strip_prefix("jdbc:").unwrap_or(url)
}

/// Replace the password component of a URL for logging
pub(crate) fn mask_password(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "[invalid URL]".to_string(),
    }
}
