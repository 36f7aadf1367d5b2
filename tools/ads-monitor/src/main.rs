//! ads-monitor - watch PLC variables over ADS
//!
//! Loads a session configuration, connects to the controller and prints every
//! published poll snapshot until interrupted.

mod logging;
mod shutdown;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use voltage_ads::virt::VirtualPlc;
use voltage_ads::{load_config, AdsSession, PlcValue, SessionConfig};

#[derive(Parser, Debug)]
#[command(name = "ads-monitor", version, about = "Watch PLC variables over ADS")]
struct Cli {
    /// Session configuration file (yaml, toml or json)
    #[arg(short, long, env = "ADS_MONITOR_CONFIG")]
    config: PathBuf,

    /// Poll once, print and exit
    #[arg(long)]
    once: bool,

    /// Print diagnostics JSON before exiting
    #[arg(long)]
    diagnostics: bool,

    /// Use a simulated controller instead of the network
    #[arg(long)]
    virt: bool,

    /// Default log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level)?;

    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let session = open_session(config, cli.virt)
        .await
        .context("Failed to open ADS session")?;

    if cli.once {
        let values = session.poll_now().await.context("Poll failed")?;
        print_values(&session, &values);
    } else {
        watch(&session).await;
    }

    if cli.diagnostics {
        println!("{}", session.diagnostics().to_json()?);
    }
    session.close().await;
    Ok(())
}

async fn open_session(config: SessionConfig, virt: bool) -> voltage_ads::Result<AdsSession> {
    if !virt {
        return AdsSession::connect(config).await;
    }

    info!("Using simulated controller");
    let plc = VirtualPlc::new();
    for entry in &config.addresses {
        plc.set_raw(&entry.address, vec![0; entry.plc_type.byte_size() as usize]);
    }
    AdsSession::setup(
        config.endpoint,
        config.options,
        config.addresses,
        Arc::new(plc.factory()),
    )
    .await
}

async fn watch(session: &AdsSession) {
    let mut snapshots = session.watch();
    let shutdown = shutdown::wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if let Some(at) = snapshot.updated_at {
                    println!("{}", at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed());
                }
                print_values(session, &snapshot.values);
            }
        }
    }
}

fn print_values(session: &AdsSession, values: &BTreeMap<String, PlcValue>) {
    for (address, value) in values {
        if session.is_available(address) {
            println!("  {:<40} {}", address, value.to_string().green());
        } else {
            println!("  {:<40} {} {}", address, value.to_string().yellow(), "(unavailable)".red());
        }
    }
}
