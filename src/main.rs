//! LoRa FOTA rollout process
//!
//! Runs exactly one firmware rollout and exits:
//! - `0` when every device ends on the target version (or none needed it)
//! - `1` on any fatal failure

use anyhow::{Context, Result};
use clap::Parser;
use lora_fota::config::RolloutConfig;
use lora_fota::fleet::{FleetCoordinator, RolloutReport};
use lora_fota::network::ChirpStackClient;
use lora_fota::transport::{integration_router, serve_integration, IntegrationState, RestDownlinkTransport};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "lora-fota")]
#[command(about = "Multicast firmware rollout for LoRaWAN device fleets")]
#[command(version)]
struct CliArgs {
    /// Rollout config file (overrides LORA_FOTA_CONFIG and ./rollout.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Firmware store root holding one directory per version
    #[arg(long, value_name = "DIR")]
    firmware_dir: Option<PathBuf>,

    /// Override the uplink integration listen address
    #[arg(long, value_name = "HOST:PORT")]
    listen: Option<String>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    match run(args).await {
        Ok(Some(report)) => {
            print_report(&report);
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Rollout failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CliArgs) -> Result<Option<RolloutReport>> {
    let mut config =
        RolloutConfig::load(args.config.as_deref()).context("Failed to load rollout configuration")?;
    if let Some(dir) = args.firmware_dir {
        config.firmware.store_dir = dir;
    }
    if let Some(addr) = args.listen {
        config.integration.listen_addr = addr;
    }

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(None);
    }

    info!(
        server = %config.network_server.url,
        devices = config.devices.eui.len(),
        store = %config.firmware.store_dir.display(),
        "Configuration loaded"
    );

    let gateway = Arc::new(
        ChirpStackClient::from_config(&config.network_server)
            .context("Failed to build network server client")?,
    );
    let transport = Arc::new(
        RestDownlinkTransport::from_config(&config.network_server)
            .context("Failed to build downlink transport")?,
    );

    // Uplink integration endpoint
    let (uplink_tx, uplink_rx) = mpsc::channel(config.integration.channel_capacity);
    let listener = tokio::net::TcpListener::bind(&config.integration.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.integration.listen_addr))?;
    let server_shutdown = CancellationToken::new();
    let server = tokio::spawn(serve_integration(
        listener,
        integration_router(IntegrationState { uplinks: uplink_tx }),
        server_shutdown.clone(),
    ));

    // Ctrl+C fails the rollout through the normal cleanup path
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("Received Ctrl+C, aborting rollout");
        interrupt.cancel();
    });

    let coordinator = FleetCoordinator::new(config, gateway, transport);
    let outcome = coordinator.run(uplink_rx, cancel).await;

    server_shutdown.cancel();
    match server.await {
        Ok(Err(e)) => warn!(error = %e, "Integration server stopped with error"),
        Err(e) => warn!(error = %e, "Integration server task failed"),
        Ok(Ok(())) => {}
    }

    Ok(Some(outcome?))
}

fn print_report(report: &RolloutReport) {
    if report.nothing_to_do() {
        info!(target_version = %report.target_version, "Every device already runs the target version");
    } else {
        info!(
            from = %report.from_version.as_ref().map(ToString::to_string).unwrap_or_default(),
            to = %report.target_version,
            devices = report.updated.len(),
            "Fleet updated"
        );
    }
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(error = %e, "Could not render rollout report"),
    }
}
