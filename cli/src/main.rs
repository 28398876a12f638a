//! typelens CLI - one-shot queries against the configured analysis server.
//!
//! ```text
//! main() -> load config -> LifecycleManager::start()
//!                               |
//!                               v
//!                  hover | definition | health -> JSON on stdout
//!                               |
//!                               v
//!                      LifecycleManager::shutdown()
//! ```
//!
//! An unavailable server is not a failure: queries print a `null` result
//! with the error kind and exit 0. Only usage and config problems exit 1.

mod config;

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use typelens_lsp::{LifecycleManager, LspError};

#[derive(Parser)]
#[command(name = "typelens")]
#[command(about = "Query a language analysis server for types and definitions")]
struct Cli {
    /// Config file (default: $TYPELENS_CONFIG, then ~/.typelens/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hover text at a 0-indexed position
    Hover {
        file: PathBuf,
        line: u32,
        character: u32,
    },
    /// Definition locations of the symbol at a 0-indexed position
    Definition {
        file: PathBuf,
        line: u32,
        character: u32,
    },
    /// Print the health report
    Health,
}

#[derive(Serialize)]
struct QueryOutput<T> {
    result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorOutput>,
}

#[derive(Serialize)]
struct ErrorOutput {
    kind: typelens_lsp::ErrorKind,
    message: String,
    degraded: bool,
}

impl<T> From<Result<Option<T>, LspError>> for QueryOutput<T> {
    fn from(outcome: Result<Option<T>, LspError>) -> Self {
        match outcome {
            Ok(result) => Self {
                result,
                error: None,
            },
            Err(e) => Self {
                result: None,
                error: Some(ErrorOutput {
                    kind: e.kind(),
                    message: e.to_string(),
                    degraded: e.is_degraded(),
                }),
            },
        }
    }
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(path) = log_file {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();
        tracing::info!(path = %path.display(), "Logging initialized");
        return Ok(());
    }

    // stdout carries the JSON result; logs go to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    Ok(())
}

fn read_source(file: &Path) -> Result<(PathBuf, String)> {
    let path = std::path::absolute(file)
        .with_context(|| format!("resolving {}", file.display()))?;
    let text =
        fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    Ok((path, text))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Usage errors exit 1 like config errors; `--help` and `--version` exit 0.
fn parse_args() -> Cli {
    Cli::try_parse().unwrap_or_else(|err| {
        let code = i32::from(err.use_stderr());
        let _ = err.print();
        std::process::exit(code);
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_args();
    init_tracing(cli.log_file.as_deref())?;

    let config = config::load(cli.config.as_deref())?;

    // Read the file before spawning anything so usage errors exit cleanly.
    let source = match &cli.command {
        Commands::Hover { file, .. } | Commands::Definition { file, .. } => {
            Some(read_source(file)?)
        }
        Commands::Health => None,
    };

    let manager = LifecycleManager::new(config);
    if let Err(e) = manager.start().await {
        tracing::debug!(kind = %e.kind(), "continuing without analysis server");
    }

    let printed = match (cli.command, source) {
        (
            Commands::Hover {
                line, character, ..
            },
            Some((path, text)),
        ) => print_json(&QueryOutput::from(
            manager.hover(path, text, line, character).await,
        )),
        (
            Commands::Definition {
                line, character, ..
            },
            Some((path, text)),
        ) => print_json(&QueryOutput::from(
            manager.definition(path, text, line, character).await,
        )),
        _ => print_json(&manager.health().await),
    };

    manager.shutdown().await;
    printed
}
