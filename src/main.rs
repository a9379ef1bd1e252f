//! Sovereign CLI entry point.
//!
//! `start` runs the governance daemon. The other subcommands are read-only
//! one-shot inspections and never append to the audit chain.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use sovereign::audit::{read_entries, verify_chain};
use sovereign::bundle::store::BundleStore;
use sovereign::config::{config_dir, load_env_file, GovernanceConfig};
use sovereign::network::NetworkMonitor;
use sovereign::service::SovereignService;
use sovereign::types::BundleStatus;

/// Sovereign: mode governance for an AI runtime.
#[derive(Parser)]
#[command(name = "sovereign", version, about)]
struct Cli {
    /// Path to `sovereign.toml` (defaults to `$SOVEREIGN_CONFIG_PATH`, then
    /// `~/.sovereign/sovereign.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the governance daemon.
    Start,
    /// Run one connectivity check and print the result.
    NetworkCheck,
    /// Inspect registered bundles.
    Bundles {
        /// Bundle action.
        #[command(subcommand)]
        action: BundlesAction,
    },
    /// Inspect the audit chain.
    Audit {
        /// Audit action.
        #[command(subcommand)]
        action: AuditAction,
    },
    /// Inspect the configuration.
    Config {
        /// Config action.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// `bundles` actions.
#[derive(Subcommand)]
enum BundlesAction {
    /// List bundles, optionally filtered by status.
    List {
        /// Only bundles with this status.
        #[arg(long)]
        status: Option<BundleStatus>,
    },
}

/// `audit` actions.
#[derive(Subcommand)]
enum AuditAction {
    /// Verify the hash chain of an audit file.
    Verify {
        /// Audit file (defaults to the configured audit log).
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print the newest entries.
    Tail {
        /// Number of entries.
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Audit file (defaults to the configured audit log).
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

/// `config` actions.
#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML.
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Command::Start => handle_start(config_path).await,
        Command::NetworkCheck => handle_network_check(config_path).await,
        Command::Bundles {
            action: BundlesAction::List { status },
        } => handle_bundles_list(config_path, status).await,
        Command::Audit {
            action: AuditAction::Verify { file },
        } => handle_audit_verify(config_path, file.as_deref()),
        Command::Audit {
            action: AuditAction::Tail { limit, file },
        } => handle_audit_tail(config_path, file.as_deref(), limit),
        Command::Config {
            action: ConfigAction::Show,
        } => handle_config_show(config_path),
    }
}

/// Load config with env precedence: process env, then `~/.sovereign/.env`.
fn load_config(path: Option<&Path>) -> anyhow::Result<GovernanceConfig> {
    let env_file = match config_dir() {
        Ok(dir) => load_env_file(&dir.join(".env"))?,
        Err(_) => BTreeMap::new(),
    };
    GovernanceConfig::load_with(path, |key| {
        std::env::var(key)
            .ok()
            .or_else(|| env_file.get(key).cloned())
    })
    .context("failed to load configuration")
}

/// Run the governance daemon until ctrl-c.
async fn handle_start(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let paths = config.paths.resolve();
    let _logging_guard = sovereign::logging::init_production(&paths.logs_dir)?;

    let service = Arc::new(SovereignService::open(config).await?);

    match service.discover().await {
        Ok(report) => info!(discovered = report.count(), "initial bundle discovery complete"),
        Err(e) => warn!(error = %e, "initial bundle discovery failed"),
    }

    // The loop re-reads `network.enabled` every tick, so a later config
    // patch can switch monitoring on or off.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = service.spawn_network_monitor(shutdown_rx);

    info!(
        state_db = %paths.state_db.display(),
        audit_log = %paths.audit_log.display(),
        bundles_dir = %paths.bundles_dir.display(),
        "sovereign governance running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("received shutdown signal");

    let _ = shutdown_tx.send(true);
    if let Err(e) = monitor.await {
        warn!(error = %e, "network monitor task ended abnormally");
    }
    info!("sovereign governance stopped");
    Ok(())
}

/// Run a single connectivity check.
async fn handle_network_check(config_path: Option<&Path>) -> anyhow::Result<()> {
    sovereign::logging::init_cli();
    let config = load_config(config_path)?;
    let monitor = NetworkMonitor::from_config(&config.network)?;
    let result = monitor.check().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("failed to serialize network check")?
    );
    Ok(())
}

/// List bundles from the state database.
async fn handle_bundles_list(config_path: Option<&Path>, status: Option<BundleStatus>) -> anyhow::Result<()> {
    sovereign::logging::init_cli();
    let config = load_config(config_path)?;
    let paths = config.paths.resolve();
    let store = BundleStore::open(&paths.state_db).await?;
    let bundles = store.list(status).await?;

    if bundles.is_empty() {
        println!("no bundles");
        return Ok(());
    }
    for bundle in &bundles {
        println!(
            "{:<32} {:<12} {:<10} {:<12} loads={}",
            bundle.id,
            bundle.status.as_str(),
            bundle.version,
            bundle.model_type,
            bundle.load_count
        );
    }
    Ok(())
}

fn audit_file(config_path: Option<&Path>, file: Option<&Path>) -> anyhow::Result<PathBuf> {
    match file {
        Some(f) => Ok(f.to_path_buf()),
        None => Ok(load_config(config_path)?.paths.resolve().audit_log),
    }
}

/// Verify an audit file's chain.
fn handle_audit_verify(config_path: Option<&Path>, file: Option<&Path>) -> anyhow::Result<()> {
    sovereign::logging::init_cli();
    let path = audit_file(config_path, file)?;
    let entries = read_entries(&path)?;
    verify_chain(&entries).with_context(|| format!("audit chain in {} is broken", path.display()))?;
    println!("audit chain ok: {} entries", entries.len());
    Ok(())
}

/// Print the newest audit entries, newest first.
fn handle_audit_tail(config_path: Option<&Path>, file: Option<&Path>, limit: usize) -> anyhow::Result<()> {
    sovereign::logging::init_cli();
    let path = audit_file(config_path, file)?;
    let entries = read_entries(&path)?;
    for entry in entries.iter().rev().take(limit) {
        println!(
            "{}",
            serde_json::to_string(entry).context("failed to serialize audit entry")?
        );
    }
    Ok(())
}

/// Print the effective configuration.
fn handle_config_show(config_path: Option<&Path>) -> anyhow::Result<()> {
    sovereign::logging::init_cli();
    let config = load_config(config_path)?;
    print!(
        "{}",
        toml::to_string_pretty(&config).context("failed to serialize configuration")?
    );
    Ok(())
}
