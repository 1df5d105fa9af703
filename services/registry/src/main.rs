//! Registry daemon entry point
//!
//! Loads layered settings, restores the last snapshot, runs the background
//! loops and writes a final snapshot on shutdown. SIGHUP reloads settings.

use anyhow::{Context, Result};
use clap::Parser;
use discovery::snapshot;
use discovery::{
    DiscoveryEngine, HealthProbeRunner, RegistryConfig, RegistryRuntime, RuntimeHandle,
    SnapshotFormat, SnapshotSchedule, TcpConnectProbe,
};
use discovery_config::{load_settings, RegistrySettings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment overlay (config/environments/<name>.toml)
    #[arg(short, long)]
    environment: Option<String>,

    /// Snapshot file, overrides the configured path
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Actively probe registered nodes over TCP
    #[arg(long)]
    probe: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    /// Print the default configuration as TOML and exit
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_default_config {
        print!("{}", RegistrySettings::default().to_toml_string()?);
        return Ok(());
    }

    init_logging(&args);
    info!("Starting registry daemon v{}", env!("CARGO_PKG_VERSION"));

    let settings = load(&args)?;
    let config = RegistryConfig::from(&settings);
    let engine = Arc::new(DiscoveryEngine::new(config).context("Invalid registry configuration")?);

    let schedule = snapshot_schedule(&args, &settings)?;
    if let Some(schedule) = &schedule {
        restore(&engine, schedule)?;
    }

    let mut handle = start_runtime(&engine, &args, schedule.clone());
    wait_for_signals(&engine, &args, &mut handle).await?;

    handle.shutdown().await;
    info!("Registry daemon stopped");
    Ok(())
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},discovery={}", args.log_level, args.log_level)));

    if args.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn load(args: &Args) -> Result<RegistrySettings> {
    load_settings(args.config.as_deref(), args.environment.as_deref())
        .context("Failed to load registry settings")
}

fn snapshot_schedule(args: &Args, settings: &RegistrySettings) -> Result<Option<SnapshotSchedule>> {
    let Some(path) = args.snapshot.clone().or_else(|| settings.snapshot_path()) else {
        return Ok(None);
    };
    let format: SnapshotFormat = settings
        .snapshot
        .format
        .parse()
        .context("Invalid snapshot format")?;
    let interval = Duration::from_millis(settings.snapshot.interval_ms);
    Ok(Some(SnapshotSchedule::new(path, format, interval)))
}

fn restore(engine: &DiscoveryEngine, schedule: &SnapshotSchedule) -> Result<()> {
    let Some(bytes) = snapshot::load(&schedule.path)
        .with_context(|| format!("Failed to read snapshot {}", schedule.path.display()))?
    else {
        info!("No snapshot at {}, starting empty", schedule.path.display());
        return Ok(());
    };

    match engine.import(&bytes) {
        Ok(report) => info!(
            "Restored {} services / {} nodes from {} ({} skipped)",
            report.services,
            report.nodes,
            schedule.path.display(),
            report.skipped
        ),
        // A bad snapshot must not keep the registry down
        Err(e) => warn!("Ignoring unreadable snapshot {}: {}", schedule.path.display(), e),
    }
    Ok(())
}

fn start_runtime(
    engine: &Arc<DiscoveryEngine>,
    args: &Args,
    schedule: Option<SnapshotSchedule>,
) -> RuntimeHandle {
    let mut runtime = RegistryRuntime::new(engine.clone());
    if args.probe {
        let config = engine.config();
        runtime = runtime.with_probes(HealthProbeRunner::new(Arc::new(TcpConnectProbe), &config.health));
    }
    if let Some(schedule) = schedule {
        runtime = runtime.with_snapshots(schedule);
    }
    runtime.start()
}

#[cfg(unix)]
async fn wait_for_signals(
    engine: &Arc<DiscoveryEngine>,
    args: &Args,
    handle: &mut RuntimeHandle,
) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                return Ok(());
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading settings");
                reload(engine, args, handle).await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(
    _engine: &Arc<DiscoveryEngine>,
    _args: &Args,
    _handle: &mut RuntimeHandle,
) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C handler")?;
    info!("Shutdown signal received");
    Ok(())
}

/// Apply new settings and restart the loops so new intervals take effect
#[cfg_attr(not(unix), allow(dead_code))]
async fn reload(engine: &Arc<DiscoveryEngine>, args: &Args, handle: &mut RuntimeHandle) {
    let settings = match load(args) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Reload failed, keeping current settings: {:#}", e);
            return;
        }
    };
    if let Err(e) = engine.reload_config(RegistryConfig::from(&settings)) {
        error!("Reload rejected, keeping current settings: {}", e);
        return;
    }
    let schedule = match snapshot_schedule(args, &settings) {
        Ok(schedule) => schedule,
        Err(e) => {
            error!("Snapshot settings invalid, periodic snapshots disabled: {:#}", e);
            None
        }
    };

    let next = start_runtime(engine, args, schedule);
    let previous = std::mem::replace(handle, next);
    previous.shutdown().await;
    info!("Settings reloaded");
}
