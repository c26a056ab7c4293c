//! Configuration management for Bucketeer.

use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{BucketeerError, Result};
use crate::ratelimit::{BucketPolicy, Window};
use crate::store::DEFAULT_MAX_ATTEMPTS;

/// Prefix of environment variables overriding file configuration.
const ENV_PREFIX: &str = "BUCKETEER";

/// Main configuration for Bucketeer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketeerConfig {
    /// Bucket state store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limit configuration
    #[serde(default)]
    pub limit: LimitConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which store holds bucket state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; only shared by callers in this process
    #[default]
    Memory,
    /// Redis server shared by every process pointing at it
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Compare-and-swap attempts before a contended update fails
    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_redis_url(),
            max_cas_attempts: default_max_cas_attempts(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_max_cas_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// Rate limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Actions allowed per interval; also the bucket capacity
    #[serde(default = "default_max_in_interval")]
    pub max_in_interval: u64,

    /// Interval length in milliseconds; `null` means the allowance never refills
    #[serde(default = "default_interval_ms")]
    pub interval_ms: Option<u64>,

    /// Minimum milliseconds between two allowed actions
    #[serde(default)]
    pub min_difference_ms: u64,

    /// Key namespace; a random one is generated when absent
    #[serde(default)]
    pub namespace: Option<String>,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_in_interval: default_max_in_interval(),
            interval_ms: default_interval_ms(),
            min_difference_ms: 0,
            namespace: None,
        }
    }
}

fn default_max_in_interval() -> u64 {
    10
}

fn default_interval_ms() -> Option<u64> {
    Some(1000)
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl LimitConfig {
    /// Build the validated policy described by this configuration.
    pub fn policy(&self) -> Result<BucketPolicy> {
        BucketPolicy::new(
            self.max_in_interval,
            Window::from_millis(self.interval_ms),
            self.min_difference_ms,
        )
    }
}

impl BucketeerConfig {
    /// Load configuration from an optional YAML file, overridden by
    /// `BUCKETEER__SECTION__FIELD` environment variables.
    ///
    /// The rate limit policy is validated before returning.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, Self::environment())
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    fn load_with(path: Option<&Path>, environment: Environment) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }

        let config: BucketeerConfig = builder
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        config.limit.policy()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: BucketeerConfig = serde_yaml::from_str(yaml)
            .map_err(|e| BucketeerError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.limit.policy()?;
        Ok(config)
    }

    /// Build the validated rate limit policy.
    pub fn policy(&self) -> Result<BucketPolicy> {
        self.limit.policy()
    }
}
