//! Configuration consumed by the analysis client and result cache.
//!
//! Deserialized from the `[analysis]` and `[cache]` tables of the service
//! config file. Every field has a default so an empty file is valid.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use typelens_resilience::{BreakerConfig, BreakerConfigError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("analysis.command must be set when analysis is enabled")]
    MissingCommand,
    #[error("{field} must be greater than zero")]
    ZeroTimeout { field: &'static str },
    #[error("cache.max_entries must be greater than zero")]
    ZeroCacheCapacity,
    #[error("{section}: {source}")]
    Breaker {
        section: &'static str,
        source: BreakerConfigError,
    },
}

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.analysis.validate()?;
        self.cache.validate()
    }
}

/// The analysis server and how long to wait on it.
///
/// ```toml
/// [analysis]
/// enabled = true
/// command = "pyright-langserver"
/// args = ["--stdio"]
/// language_id = "python"
///
/// [analysis.breaker]
/// failure_threshold = 3
/// recovery_timeout_secs = 60
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Whether the analysis client runs at all. Default: false.
    #[serde(default)]
    pub enabled: bool,
    /// Executable, resolved through `PATH`.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// `languageId` sent with every opened document.
    #[serde(default = "default_language_id")]
    pub language_id: String,
    /// Workspace root handed to `initialize`. Default: current directory.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Forward the server's stderr to debug logs instead of discarding it.
    #[serde(default = "default_true")]
    pub capture_stderr: bool,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Fields left out of `[analysis.breaker]` take the analysis defaults
    /// (3 failures, 60s), not the generic breaker ones.
    #[serde(
        default = "default_analysis_breaker",
        deserialize_with = "deserialize_analysis_breaker"
    )]
    pub breaker: BreakerConfig,
}

fn default_language_id() -> String {
    "plaintext".to_string()
}

fn default_true() -> bool {
    true
}

fn default_query_timeout_secs() -> u64 {
    5
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_analysis_breaker() -> BreakerConfig {
    BreakerConfig::new(3, 60)
}

fn deserialize_analysis_breaker<'de, D>(deserializer: D) -> Result<BreakerConfig, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct PartialBreaker {
        failure_threshold: Option<u32>,
        recovery_timeout_secs: Option<u64>,
        half_open_max_calls: Option<u32>,
    }

    let partial = PartialBreaker::deserialize(deserializer)?;
    let defaults = default_analysis_breaker();
    Ok(BreakerConfig {
        failure_threshold: partial
            .failure_threshold
            .unwrap_or(defaults.failure_threshold),
        recovery_timeout_secs: partial
            .recovery_timeout_secs
            .unwrap_or(defaults.recovery_timeout_secs),
        half_open_max_calls: partial
            .half_open_max_calls
            .unwrap_or(defaults.half_open_max_calls),
    })
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: String::new(),
            args: Vec::new(),
            language_id: default_language_id(),
            root: None,
            capture_stderr: true,
            query_timeout_secs: default_query_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            breaker: default_analysis_breaker(),
        }
    }
}

impl AnalysisConfig {
    /// An enabled config for `command`, everything else defaulted.
    pub fn for_command(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            enabled: true,
            command: command.into(),
            args,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    #[must_use]
    pub fn root_dir(&self) -> PathBuf {
        self.root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// A disabled config is always valid; its other fields are never read.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.command.trim().is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        for (field, value) in [
            ("analysis.query_timeout_secs", self.query_timeout_secs),
            ("analysis.handshake_timeout_secs", self.handshake_timeout_secs),
            ("analysis.shutdown_timeout_secs", self.shutdown_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroTimeout { field });
            }
        }
        self.breaker
            .validate()
            .map_err(|source| ConfigError::Breaker {
                section: "analysis.breaker",
                source,
            })
    }
}

/// Result cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_max_entries() -> usize {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl_secs(),
            max_entries: default_cache_max_entries(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.max_entries == 0 {
            return Err(ConfigError::ZeroCacheCapacity);
        }
        if self.ttl_secs == 0 {
            return Err(ConfigError::ZeroTimeout {
                field: "cache.ttl_secs",
            });
        }
        self.breaker
            .validate()
            .map_err(|source| ConfigError::Breaker {
                section: "cache.breaker",
                source,
            })
    }
}
