//! dvrwatch — fleet liveness monitor for cloud-registered DVRs.
//!
//! Resolves each device through the vendor's P2P discovery service, sends
//! one signed info request to the relay it is parked on, and keeps the
//! latest online/offline picture in memory for the HTTP API.
//!
//! Commands:
//! - `serve`   scan on an interval and answer API requests
//! - `check`   probe one serial, print ONLINE/OFFLINE
//! - `offline` scan an inventory once and print the offline rows

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use dvrwatch::config::Config;
use dvrwatch::fleet::{FleetMonitor, FleetRow};
use dvrwatch::inventory::{self, Inventory, COL_NAME, COL_SERIAL, COL_SITE};
use dvrwatch::p2p::probe::DeviceProber;
use dvrwatch::p2p::resolver::DiscoveryResolver;
use dvrwatch::p2p::{self, Prober, Resolver};
use dvrwatch::scanner::{self, Scanner};
use dvrwatch::server;
use dvrwatch::status::{StatusCache, StatusFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: <config dir>/dvrwatch/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler and the HTTP API
    Serve {
        #[arg(long)]
        listen: Option<String>,
        #[arg(long)]
        inventory: Option<PathBuf>,
    },
    /// Check a single serial
    Check { serial: String },
    /// Scan an inventory once and list offline devices
    Offline {
        #[arg(long)]
        inventory: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let mut config = Config::load(args.config.as_deref())?;
    config.validate().context("Invalid configuration")?;

    match args.command {
        Command::Serve { listen, inventory } => {
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if inventory.is_some() {
                config.inventory = inventory;
            }
            serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Check { serial } => check(&config, &serial).await,
        Command::Offline { inventory } => {
            if inventory.is_some() {
                config.inventory = inventory;
            }
            offline(&config).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "dvrwatch=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn probe_stack(config: &Config) -> Result<(Arc<dyn Resolver>, Arc<dyn Prober>)> {
    let creds = config.credentials()?;
    let resolver = DiscoveryResolver::new(
        config.discovery.host.clone(),
        config.discovery.port,
        config.discovery_timeout(),
        Arc::clone(&creds),
    );
    let prober = DeviceProber::new(config.probe_timeout(), creds, config.probe.preflight);
    Ok((Arc::new(resolver), Arc::new(prober)))
}

fn load_inventory(config: &Config) -> Result<Arc<Inventory>> {
    let path = config
        .inventory
        .as_deref()
        .context("No inventory configured (use --inventory, DVRWATCH_INVENTORY or `inventory:` in the config file)")?;
    Ok(Arc::new(Inventory::load(path)?))
}

fn build_fleet(config: &Config, cancel: CancellationToken) -> Result<(Arc<Scanner>, Arc<FleetMonitor>)> {
    let inventory = load_inventory(config)?;
    let (resolver, prober) = probe_stack(config)?;
    let cache = Arc::new(StatusCache::new());
    let scanner = Arc::new(Scanner::new(
        inventory.clone(),
        Arc::clone(&cache),
        resolver,
        prober,
        config.scan.concurrency,
        cancel,
    ));
    let fleet = Arc::new(FleetMonitor::new(inventory, cache, Arc::clone(&scanner)));
    Ok((scanner, fleet))
}

async fn serve(config: Config) -> Result<()> {
    info!("📹 dvrwatch v{}", env!("CARGO_PKG_VERSION"));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let cancel = CancellationToken::new();
    let (scanner, fleet) = build_fleet(&config, cancel.clone())?;

    info!(
        discovery = %format!("{}:{}", config.discovery.host, config.discovery.port),
        devices = fleet.get_stats().total,
        workers = config.scan.concurrency,
        interval_secs = config.scan.interval_secs,
        "Fleet loaded"
    );

    // ── Scan Scheduler ──────────────────────────────────────────────
    let scheduler = tokio::spawn(scanner::poller::run_scheduler(
        scanner,
        config.scan_interval(),
        cancel.clone(),
    ));

    // ── Shutdown Signal ─────────────────────────────────────────────
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_cancel.cancel();
    });

    // ── HTTP API ────────────────────────────────────────────────────
    let result = server::serve(&config.listen, fleet, cancel.clone()).await;
    cancel.cancel();
    if let Err(e) = scheduler.await {
        error!("Scan scheduler ended abnormally: {}", e);
    }
    result
}

async fn check(config: &Config, serial: &str) -> Result<ExitCode> {
    let serial = inventory::normalize_serial(serial);
    let (resolver, prober) = probe_stack(config)?;
    let outcome = p2p::check_device(resolver.as_ref(), prober.as_ref(), &serial).await?;

    if outcome.is_online() {
        println!("ONLINE");
        Ok(ExitCode::SUCCESS)
    } else {
        if let Some(reason) = outcome.reason {
            info!(serial = %serial, reason = %reason, "Device offline");
        }
        println!("OFFLINE");
        Ok(ExitCode::from(1))
    }
}

async fn offline(config: &Config) -> Result<ExitCode> {
    let (scanner, fleet) = build_fleet(config, CancellationToken::new())?;
    let report = scanner.scan().await?;
    info!(probed = report.probed, online = report.online, offline = report.offline, "Scan complete");

    let rows = fleet.list_by_status(StatusFilter::Offline);
    print!("{}", render_table(&rows));
    if rows.is_empty() {
        println!("No offline entries found.");
    }
    Ok(ExitCode::SUCCESS)
}

/// Left-aligned columns separated by two spaces, with a dashed rule
/// under the header.
fn render_table(rows: &[FleetRow]) -> String {
    let cells: Vec<[&str; 3]> = rows
        .iter()
        .map(|r| [r.row.serial.as_str(), r.row.site.as_str(), r.row.display_name.as_str()])
        .collect();
    let header = [COL_SERIAL, COL_SITE, COL_NAME];

    let mut widths = header.map(|h| h.chars().count());
    for row in &cells {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let line = |cols: [&str; 3]| {
        cols.iter()
            .zip(widths)
            .map(|(c, w)| format!("{:<width$}", c, width = w))
            .collect::<Vec<_>>()
            .join("  ")
    };

    let mut out = String::new();
    out.push_str(&line(header));
    out.push('\n');
    out.push_str(&widths.map(|w| "-".repeat(w)).join("  "));
    out.push('\n');
    for row in cells {
        out.push_str(&line(row));
        out.push('\n');
    }
    out
}
