//! Configuration management for Tollgate.
//!
//! Configuration is layered: serde defaults, then an optional YAML file, then
//! `TOLLGATE__`-prefixed environment variables (for example
//! `TOLLGATE__STORE__BACKEND=redis`). A plain `REDIS_URL` fills in the Redis
//! connection URL when nothing else set it.

use serde::{Deserialize, Serialize};

use crate::advisory::Environment;
use crate::error::{Result, TollgateError};
use crate::ratelimit::LimitRule;

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Named limits, matched against keys in order
    #[serde(default)]
    pub rules: Vec<LimitRule>,
}

/// Which counter store backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Per-process counters
    Memory,
    /// Counters shared through Redis
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Explicit backend choice. When unset, Redis is used if a URL is known.
    #[serde(default)]
    pub backend: Option<Backend>,

    /// Redis connection URL
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Reclamation interval for the in-process store, in seconds
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,

    /// Time allowed to establish the Redis connection, in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Time allowed for a single Redis round trip, in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: None,
            redis_url: None,
            gc_interval_secs: default_gc_interval(),
            connect_timeout_ms: default_connect_timeout(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

fn default_gc_interval() -> u64 {
    600
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_command_timeout() -> u64 {
    500
}

impl Backend {
    /// Whether counters outlive the process and are seen by other instances.
    pub fn is_shared(&self) -> bool {
        matches!(self, Backend::Redis)
    }
}

impl StoreConfig {
    /// The backend to construct, resolving an unset choice from the URL.
    pub fn backend(&self) -> Backend {
        match self.backend {
            Some(backend) => backend,
            None if self.redis_url.is_some() => Backend::Redis,
            None => Backend::Memory,
        }
    }
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file plus the process
    /// environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::new(path, ::config::FileFormat::Yaml).required(true),
            );
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("TOLLGATE")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: TollgateConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        config.apply_environment(&Environment::capture());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Fill the Redis URL from well-known variables when it is still unset.
    pub fn apply_environment(&mut self, env: &Environment) {
        if self.store.redis_url.is_none() {
            self.store.redis_url = env.get("REDIS_URL").map(str::to_string);
        }
    }

    /// Reject configurations that cannot produce a working store.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend() == Backend::Redis && self.store.redis_url.is_none() {
            return Err(TollgateError::Config(
                "store.backend is redis but no store.redis_url or REDIS_URL is set".to_string(),
            ));
        }
        if self.store.command_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "store.command_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
