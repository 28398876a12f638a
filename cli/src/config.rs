//! Loading `ServiceConfig` from TOML.
//!
//! Lookup order: `--config`, then `$TYPELENS_CONFIG`, then
//! `~/.typelens/config.toml`. A missing default file yields defaults;
//! a missing explicit file is an error.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use typelens_lsp::{ConfigError as InvalidConfig, ServiceConfig};

pub const CONFIG_ENV: &str = "TYPELENS_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config at {}: {source}", path.display())]
    Invalid {
        path: PathBuf,
        source: InvalidConfig,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. }
            | ConfigError::Parse { path, .. }
            | ConfigError::Invalid { path, .. } => path,
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".typelens").join("config.toml"))
}

/// Replace `${VAR}` with the variable's value; unset variables become "".
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var = &after[..end];
                if !var.is_empty() {
                    out.push_str(&env::var(var).unwrap_or_default());
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn expand_in_place(config: &mut ServiceConfig) {
    let analysis = &mut config.analysis;
    analysis.command = expand_env_vars(&analysis.command);
    for arg in &mut analysis.args {
        *arg = expand_env_vars(arg);
    }
    if let Some(root) = &analysis.root
        && let Some(raw) = root.to_str()
    {
        analysis.root = Some(PathBuf::from(expand_env_vars(raw)));
    }
}

/// Parse, expand and validate config text read from `path`.
pub fn parse(path: &Path, content: &str) -> Result<ServiceConfig, ConfigError> {
    let mut config: ServiceConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    expand_in_place(&mut config);
    config.validate().map_err(|source| ConfigError::Invalid {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(config)
}

/// Load config from `explicit`, the environment override, or the default
/// location.
pub fn load(explicit: Option<&Path>) -> Result<ServiceConfig, ConfigError> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => match env::var_os(CONFIG_ENV) {
            Some(path) => (PathBuf::from(path), true),
            None => match config_path() {
                Some(path) => (path, false),
                None => return Ok(ServiceConfig::default()),
            },
        },
    };

    if !required && !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(ServiceConfig::default());
    }

    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) => {
            tracing::warn!("Failed to read config at {:?}: {}", path, err);
            return Err(ConfigError::Read { path, source: err });
        }
    };

    match parse(&path, &content) {
        Ok(config) => Ok(config),
        Err(err) => {
            tracing::warn!("{err}");
            Err(err)
        }
    }
}
