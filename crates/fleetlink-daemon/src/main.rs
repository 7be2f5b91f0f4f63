//! `fleetlink` Daemon
//!
//! Authenticates the integrator, keeps one push channel per relay host open
//! for every granted device, and persists fleet state across restarts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fleetlink_core::config::load_config;
use fleetlink_core::consent::consent_url;
use fleetlink_core::tracing_init::{default_filter, init_tracing};
use fleetlink_core::{DeviceIndex, HealthMonitor};
use fleetlink_daemon::channel::{ChannelOptions, ReconnectPolicy};
use fleetlink_daemon::daemon::{StatePaths, supervise_channels};
use fleetlink_daemon::fleet::{FleetControl, FleetOrchestrator};
use fleetlink_daemon::intake;
use fleetlink_daemon::provision::ProvisioningEngine;
use fleetlink_daemon::session::{RegionalAuthenticator, TokenSource};

#[derive(Parser, Debug)]
#[command(name = "fleetlink")]
#[command(version, about = "fleetlink daemon - fleet connectivity and command dispatch")]
struct Args {
    /// Settings file (replaces the global settings.json)
    #[arg(long, env = "FLEETLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for index, fleet and provisioning snapshots
    #[arg(long, env = "FLEETLINK_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, env = "FLEETLINK_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "FLEETLINK_LOG_JSON")]
    log_json: bool,

    /// Integrator tag issued by the cloud
    #[arg(long, env = "FLEETLINK_INTEGRATOR_TAG")]
    integrator_tag: Option<String>,

    /// Integrator secret token
    #[arg(long, env = "FLEETLINK_INTEGRATOR_SECRET", hide_env_values = true)]
    integrator_secret: Option<String>,

    /// Address for the grant/revoke callback intake (e.g. 0.0.0.0:8089)
    #[arg(long, env = "FLEETLINK_CALLBACK_LISTEN")]
    callback_listen: Option<String>,

    /// Seconds between dead-channel checks
    #[arg(long, default_value_t = 15, env = "FLEETLINK_SUPERVISE_INTERVAL")]
    supervise_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(tag) = args.integrator_tag {
        config.integrator.tag = tag;
    }
    if let Some(secret) = args.integrator_secret {
        config.integrator.secret = secret;
    }
    if let Some(dir) = args.state_dir {
        config.state_dir = Some(dir);
    }
    if let Some(addr) = args.callback_listen {
        config.integrator.callback_listen = Some(addr);
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    init_tracing(&default_filter(&config.log_level), args.log_json);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        integrator = %config.integrator.tag,
        regions = config.regions.len(),
        "Starting fleetlink"
    );

    // Authenticate every region up front; auto refresh retries failures.
    let auth = Arc::new(RegionalAuthenticator::from_config(&config)?);
    let failures = auth.authenticate_all().await;
    for (region, e) in &failures {
        warn!(region = %region, error = %e, "Initial authentication failed");
    }
    if failures.len() == auth.regions().len() && failures.values().all(|e| !e.is_transient()) {
        anyhow::bail!("Authentication rejected in every region");
    }
    let refresh_ctx = CancellationToken::new();
    let refreshing = auth.start_auto_refresh_all(&refresh_ctx);
    info!(regions = refreshing, "Token auto refresh started");

    let index = Arc::new(DeviceIndex::new());
    let health = Arc::new(HealthMonitor::new());
    let fleet = Arc::new(FleetOrchestrator::new(
        Arc::clone(&index),
        health,
        Arc::clone(&auth) as Arc<dyn TokenSource>,
        ChannelOptions::from(&config.channel),
    ));
    let provisioning = ProvisioningEngine::new(
        Arc::clone(&index),
        Arc::clone(&fleet) as Arc<dyn FleetControl>,
    );

    let state_dir = config.resolved_state_dir();
    let paths = StatePaths::new(&state_dir);
    info!(state_dir = %state_dir.display(), "Loading state");
    paths.load_all(&fleet, &provisioning)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let intake_task = match &config.integrator.callback_listen {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
            Some(tokio::spawn(intake::serve(
                listener,
                Arc::clone(&fleet),
                shutdown_rx.clone(),
            )))
        }
        None => None,
    };

    match (&config.integrator.callback_url, &intake_task) {
        (Some(callback), Some(_)) => {
            let url = consent_url(
                &config.integrator.consent_host,
                &config.integrator.tag,
                callback,
            );
            info!(url = %url, "Share this consent URL with end users to grant device access");
        }
        (Some(_), None) => {
            warn!("callback_url is set but callback_listen is not; grants will not be received");
        }
        _ => {}
    }

    let connect_errors = fleet.connect_all().await;
    info!(
        connected = fleet.connected_hosts().len(),
        failed = connect_errors.len(),
        devices = index.device_count(),
        "Fleet online"
    );

    let supervisor = tokio::spawn(supervise_channels(
        Arc::clone(&fleet),
        ReconnectPolicy::default(),
        Duration::from_secs(args.supervise_interval.max(1)),
        Duration::from_secs(config.health.unhealthy_after_secs),
        shutdown_rx,
    ));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    refresh_ctx.cancel();
    auth.stop_auto_refresh_all();
    let _ = supervisor.await;
    if let Some(task) = intake_task {
        match task.await {
            Ok(Err(e)) => warn!(error = %e, "Callback intake failed"),
            Err(e) => warn!(error = %e, "Callback intake task panicked"),
            Ok(Ok(())) => {}
        }
    }

    if let Err(e) = fleet.disconnect_all().await {
        warn!(error = %e, "Some channels failed to close cleanly");
    }
    let failed = paths.save_all(&fleet, &provisioning);
    if failed > 0 {
        warn!(failed, "Some state snapshots were not saved");
    }

    info!("Daemon stopped");
    Ok(())
}
