use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use shellexpand;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for FleetScope
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// GitHub access settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Snapshot database settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// API throttle settings
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Collector behavior settings
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// Organization to collect (can be overridden per invocation)
    pub organization: Option<String>,

    /// Environment variable holding the API token
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

/// Snapshot database configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
}

/// Token-bucket throttle and retry configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ThrottleConfig {
    /// Token refill rate in requests per second
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Maximum tokens available at once
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,

    /// Optional pause between per-repo workers, in milliseconds
    #[serde(default = "default_inter_repo_delay_ms")]
    pub inter_repo_delay_ms: u64,

    /// Retry attempts after the first on rate-limit errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in seconds
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,

    /// Backoff ceiling in seconds
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Geometric backoff growth factor
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

/// Collector behavior configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CollectorConfig {
    /// Repositories per batched metadata query
    #[serde(default = "default_metadata_chunk_size")]
    pub metadata_chunk_size: usize,

    /// Reduced batch size used when a query trips complexity limits
    #[serde(default = "default_fallback_chunk_size")]
    pub fallback_chunk_size: usize,

    /// Concurrent repositories in the security collector
    #[serde(default = "default_security_workers")]
    pub security_workers: usize,

    /// Concurrent repositories in the CI collector
    #[serde(default = "default_ci_workers")]
    pub ci_workers: usize,

    /// Display name of the CI workflow to harvest
    #[serde(default = "default_workflow_name")]
    pub workflow_name: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact"
}

// Default value functions
fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}
fn default_db_path() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/fleetscope/analytics.db", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/fleetscope/analytics.db", home)
    } else {
        "/tmp/fleetscope-analytics.db".to_string()
    }
}
fn default_requests_per_second() -> f64 {
    1.0
}
fn default_burst_size() -> u32 {
    3
}
fn default_inter_repo_delay_ms() -> u64 {
    500
}
fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff_secs() -> u64 {
    2
}
fn default_max_backoff_secs() -> u64 {
    60
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_metadata_chunk_size() -> usize {
    25
}
fn default_fallback_chunk_size() -> usize {
    10
}
fn default_security_workers() -> usize {
    3
}
fn default_ci_workers() -> usize {
    5
}
fn default_workflow_name() -> String {
    "GoFortress".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            organization: None,
            token_env: default_token_env(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst_size: default_burst_size(),
            inter_repo_delay_ms: default_inter_repo_delay_ms(),
            max_retries: default_max_retries(),
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            metadata_chunk_size: default_metadata_chunk_size(),
            fallback_chunk_size: default_fallback_chunk_size(),
            security_workers: default_security_workers(),
            ci_workers: default_ci_workers(),
            workflow_name: default_workflow_name(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ThrottleConfig {
    /// Inter-repo delay as a Duration; zero means no pause
    pub fn inter_repo_delay(&self) -> Duration {
        Duration::from_millis(self.inter_repo_delay_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            // Create default config
            let config = Self::default();

            // Create config directory if it doesn't exist
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            // Save default config
            config.save(&config_path)?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand environment variables in paths
        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("fleetscope").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.database.path = shellexpand::full(&self.database.path)
            .context("Failed to expand database path")?
            .into_owned();

        Ok(())
    }

    /// Read the API token from the configured environment variable
    pub fn github_token(&self) -> Result<String> {
        let token = std::env::var(&self.github.token_env).with_context(|| {
            format!(
                "{} environment variable not set or invalid",
                self.github.token_env
            )
        })?;

        if token.is_empty() {
            anyhow::bail!("{} is empty", self.github.token_env);
        }

        Ok(token)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            github: GitHubConfig::default(),
            database: DatabaseConfig::default(),
            throttle: ThrottleConfig::default(),
            collector: CollectorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
