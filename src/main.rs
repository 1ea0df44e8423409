//! # mukit
//!
//! Telegram bot binary. Wires settings, telemetry, the summary engine, the
//! Telegram transport and the status server, then runs until Ctrl-C.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mukit_core::{ChatTransport, StatusSource};
use mukit_engine::Engine;
use mukit_settings::{load_settings_from_path, mukit_home, settings_path, MukitSettings};
use mukit_telegram::{TelegramClient, UpdateRunner};
use mukit_telemetry::{init_telemetry, parse_level, IncidentJournal, TelemetryConfig};

const INCIDENT_RETENTION_DAYS: i64 = 30;

/// Pinned daily summary bot.
#[derive(Parser, Debug)]
#[command(name = "mukit", about = "Pinned daily summary bot for Telegram")]
struct Cli {
    /// Settings file. Defaults to `~/.mukit/settings.json`.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level (overrides settings; `RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,

    /// Do not start the status HTTP server.
    #[arg(long)]
    no_server: bool,
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn telemetry_config(settings: &MukitSettings, level_override: Option<&str>) -> TelemetryConfig {
    let db_path = PathBuf::from(&settings.logging.log_db_path);
    TelemetryConfig {
        log_level: parse_level(level_override.unwrap_or(&settings.logging.level)),
        module_levels: Vec::new(),
        json: settings.logging.json,
        log_to_sqlite: settings.logging.log_to_sqlite,
        log_db_path: if db_path.is_absolute() {
            db_path
        } else {
            mukit_home().join(db_path)
        },
    }
}

/// Drop expired incidents and report what the last day looked like.
fn review_incidents(journal: &IncidentJournal, now: chrono::DateTime<chrono::Utc>) -> Result<()> {
    let pruned = journal.prune_before(now - chrono::Duration::days(INCIDENT_RETENTION_DAYS))?;
    for (kind, count) in journal.kinds_since(now - chrono::Duration::days(1))? {
        info!(kind = %kind, count, "transport failures in the last day");
    }
    info!(pruned, "incident journal ready");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli.settings.clone().unwrap_or_else(settings_path);
    let settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;

    let telemetry = telemetry_config(&settings, cli.log_level.as_deref());
    if telemetry.log_to_sqlite {
        ensure_parent_dir(&telemetry.log_db_path)?;
    }
    let telemetry_guard = init_telemetry(&telemetry);
    info!(settings = %path.display(), "starting mukit");
    if let Some(journal) = telemetry_guard.incidents() {
        if let Err(e) = review_incidents(&journal, chrono::Utc::now()) {
            warn!(error = %e, "incident journal unavailable");
        }
    }

    let client = Arc::new(TelegramClient::from_settings(&settings.telegram).context("Failed to create Telegram client")?);
    let transport: Arc<dyn ChatTransport> = client.clone();
    let engine = Arc::new(Engine::from_settings(transport, &settings).context("Invalid engine settings")?);

    let cancel = CancellationToken::new();
    let ticker = engine.spawn_ticker(cancel.clone());

    let server = if settings.server.enabled && !cli.no_server {
        let source: Arc<dyn StatusSource> = engine.clone();
        let host = settings.server.host.clone();
        let port = settings.server.port;
        let cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = mukit_server::serve(&host, port, source, cancel).await {
                error!(error = %e, "status server failed");
            }
        }))
    } else {
        None
    };

    let poll_timeout = Duration::from_secs(settings.telegram.poll_timeout_secs);
    let runner = match UpdateRunner::connect(client, Arc::clone(&engine), poll_timeout).await {
        Ok(runner) => runner,
        Err(e) => {
            cancel.cancel();
            return Err(e).context("Failed to reach Telegram");
        }
    };
    let poller = tokio::spawn(runner.run(cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;
    info!("shutting down");
    cancel.cancel();

    let _ = poller.await;
    let _ = ticker.await;
    if let Some(server) = server {
        let _ = server.await;
    }
    info!("mukit stopped");
    Ok(())
}
