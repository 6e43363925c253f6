use crate::database::params::ConnectionParameters;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment type for configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Test,
    Production,
}

impl Environment {
    /// Get environment from string
    pub fn from_str(env: &str) -> Self {
        match env.to_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "test" | "testing" => Environment::Test,
            _ => Environment::Development,
        }
    }

    /// Suffix of the overlay file, as in `config.<suffix>.toml`
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "dev",
            Environment::Test => "test",
            Environment::Production => "prod",
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Registry settings, read from the `[mdbs]` section of `config.toml`
///
/// ```toml
/// [mdbs]
/// refresh_period = 1
/// idle_timeout = 3600
/// mapper_locations = ["mapper"]
///
/// [mdbs.databases.reports]
/// url = "postgres://localhost/reports"
/// username = "report"
/// password = "secret"
/// max_active_connections = 5
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Environment the configuration was loaded for
    #[serde(skip)]
    pub environment: Environment,

    /// Seconds between reaper sweeps; values below 1 are treated as 1
    #[serde(default = "default_refresh_period")]
    pub refresh_period: u64,

    /// Seconds an entry may stay untouched before it is evicted
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Connection parameters per database identifier
    #[serde(default, alias = "info")]
    pub databases: HashMap<String, ConnectionParameters>,

    /// Files or directories holding `.sql` statement mappings
    #[serde(default)]
    pub mapper_locations: Vec<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    mdbs: Option<RegistryConfig>,
}

fn default_refresh_period() -> u64 {
    1
}

fn default_idle_timeout() -> u64 {
    3600
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            refresh_period: default_refresh_period(),
            idle_timeout: default_idle_timeout(),
            databases: HashMap::new(),
            mapper_locations: Vec::new(),
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_refresh_period(mut self, seconds: u64) -> Self {
        self.refresh_period = seconds;
        self
    }

    pub fn with_idle_timeout(mut self, seconds: u64) -> Self {
        self.idle_timeout = seconds;
        self
    }

    pub fn with_database(mut self, database_id: impl Into<String>, parameters: ConnectionParameters) -> Self {
        self.databases.insert(database_id.into(), parameters);
        self
    }

    pub fn with_mapper_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.mapper_locations.push(location.into());
        self
    }

    /// Interval between reaper sweeps, at least one second
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_period.max(1))
    }

    /// Idle threshold copied onto each new entry
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    /// Configured parameters for a database identifier
    pub fn parameters(&self, database_id: &str) -> Option<&ConnectionParameters> {
        self.databases.get(database_id)
    }

    /// Load configuration with environment-specific overrides
    pub fn load() -> Result<Self> {
        Self::load_with_base_dir(".")
    }

    /// Load `config.toml` and the overlay for the detected environment
    pub fn load_with_base_dir<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        Self::load_for_environment(base_dir, Self::detect_environment())
    }

    /// Load `config.toml` merged with `config.<env>.toml` from `base_dir`
    ///
    /// Environment variable overrides are applied last.
    pub fn load_for_environment<P: AsRef<Path>>(base_dir: P, env: Environment) -> Result<Self> {
        let base_dir = base_dir.as_ref();

        let base_config_path = base_dir.join("config.toml");
        let mut merged_value = if base_config_path.exists() {
            Self::load_toml_value(&base_config_path)?
        } else {
            log::debug!(
                "No config.toml in {}, using registry defaults",
                base_dir.display()
            );
            toml::Value::Table(toml::map::Map::new())
        };

        let env_config_path = base_dir.join(format!("config.{}.toml", env.as_str()));
        if env_config_path.exists() {
            log::debug!(
                "Loading environment-specific config from: {}",
                env_config_path.display()
            );
            let env_value = Self::load_toml_value(&env_config_path)?;

            #[cfg(feature = "config")]
            {
                use serde_toml_merge::merge;
                merged_value = merge(merged_value, env_value).map_err(|e| {
                    Error::configuration(format!("Failed to merge configuration files: {}", e))
                })?;
            }

            #[cfg(not(feature = "config"))]
            {
                let _ = env_value;
                log::warn!(
                    "Config feature not enabled, skipping environment-specific config merge"
                );
            }
        }

        let json_value = serde_json::to_value(&merged_value).map_err(|e| {
            Error::configuration(format!("Failed to convert merged configuration: {}", e))
        })?;

        let file: ConfigFile = serde_json::from_value(json_value).map_err(|e| {
            Error::configuration(format!("Failed to deserialize merged configuration: {}", e))
        })?;

        let mut config = file.mdbs.unwrap_or_default();
        config.environment = env;
        config.apply_env_overrides()?;
        config.resolve_paths(base_dir);
        config.validate()?;

        log::info!(
            "Registry configuration loaded (environment: {}, {} database(s))",
            config.environment.as_str(),
            config.databases.len()
        );

        Ok(config)
    }

    /// Load the `[mdbs]` section of a single TOML file
    ///
    /// Relative mapper locations resolve against the file's directory. No
    /// environment overrides are applied.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        let content = fs::read_to_string(path_ref).map_err(|e| {
            Error::configuration(format!(
                "Failed to read config file '{}': {}. Make sure the file exists and is readable.",
                path_ref.display(),
                e
            ))
        })?;

        let mut config = Self::from_toml_str(&content).map_err(|e| {
            e.with_context(format!("Failed to load config file '{}'", path_ref.display()))
        })?;

        config.resolve_paths(path_ref.parent().unwrap_or_else(|| Path::new(".")));

        log::debug!(
            "Successfully loaded configuration from: {}",
            path_ref.display()
        );
        Ok(config)
    }

    /// Parse TOML text holding an `[mdbs]` section
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| {
            Error::configuration(format!("Failed to parse configuration: {}. Check TOML syntax.", e))
        })?;

        let config = file.mdbs.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    fn load_toml_value<P: AsRef<Path>>(path: P) -> Result<toml::Value> {
        let path_ref = path.as_ref();

        let content = fs::read_to_string(path_ref).map_err(|e| {
            Error::configuration(format!(
                "Failed to read config file '{}': {}. Make sure the file exists and is readable.",
                path_ref.display(),
                e
            ))
        })?;

        toml::from_str(&content).map_err(|e| {
            Error::configuration(format!(
                "Failed to parse config file '{}': {}. Check TOML syntax.",
                path_ref.display(),
                e
            ))
        })
    }

    /// Detect current environment from environment variables
    pub fn detect_environment() -> Environment {
        // MDBS_ENV wins over the framework-wide RUSTF_ENV
        if let Ok(env) = env::var("MDBS_ENV") {
            return Environment::from_str(&env);
        }
        if let Ok(env) = env::var("RUSTF_ENV") {
            return Environment::from_str(&env);
        }

        Environment::Development
    }

    /// Check every configured database
    pub fn validate(&self) -> Result<()> {
        for (database_id, parameters) in &self.databases {
            parameters.validate(database_id)?;
        }

        if self.refresh_period == 0 {
            log::warn!("mdbs.refresh_period is 0; the reaper will run every second");
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| env::var(key).ok())
    }

    fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(period) = lookup("MDBS_REFRESH_PERIOD") {
            self.refresh_period = period
                .trim()
                .parse()
                .map_err(|_| Error::configuration("Invalid MDBS_REFRESH_PERIOD value"))?;
        }
        if let Some(timeout) = lookup("MDBS_IDLE_TIMEOUT") {
            self.idle_timeout = timeout
                .trim()
                .parse()
                .map_err(|_| Error::configuration("Invalid MDBS_IDLE_TIMEOUT value"))?;
        }
        if let Some(locations) = lookup("MDBS_MAPPER_LOCATIONS") {
            self.mapper_locations = locations
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        for location in &mut self.mapper_locations {
            if location.is_relative() {
                *location = base_dir.join(&*location);
            }
        }
    }
}
