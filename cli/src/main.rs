//! Tally CLI - binary entry point.
//!
//! ```text
//! main() -> Settings::from_env -> Agent::from_settings -> repl::run -> Agent::shutdown
//! ```
//!
//! Answers go to stdout. Logs go to `~/.tally/logs/tally.log`, falling back to
//! `./.tally/logs/tally.log`, then stderr.

mod repl;

use anyhow::{Context, Result};
use std::{
    fs::{self, OpenOptions},
    path::PathBuf,
    sync::Mutex,
};
use tokio::io::BufReader;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tally_engine::{Agent, Settings, TallyConfig, tally_home};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_tally_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_tally_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in tally_log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn tally_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(home) = tally_home() {
        candidates.push(home.join("logs").join("tally.log"));
    }

    // Fallback for read-only homes
    candidates.push(PathBuf::from(".tally").join("logs").join("tally.log"));

    candidates
}

async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = match TallyConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring unreadable config file");
            eprintln!("Warning: {e}");
            None
        }
    };
    let settings = Settings::from_env(config).context("failed to resolve settings")?;
    tracing::info!(model = %settings.model, memory = settings.memory_enabled, "Starting Tally");

    let mut agent = Agent::from_settings(&settings)?;

    let result = repl::run(
        &mut agent,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        interrupted(),
    )
    .await;

    if let Err(e) = agent.shutdown().await {
        eprintln!("Failed to save session: {e:#}");
    }

    result
}
