//! Thin CLI wrapping the `remote_slot_lease` library for interactive and
//! manual use. Demonstration glue around the pool, not a re-implementation
//! of the build-plugin framework that normally consumes it.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use log::LevelFilter;

use remote_slot_lease::{logging, RemoteHostsConfig, RemoteHostsPool};

#[derive(Parser)]
#[command(name = "slot-leasectl", about = "Manage slot leases on a fleet of remote build hosts")]
struct Cli {
    /// Path to the TOML config describing `slots_dir` and `pools.<platform>.<host>`.
    #[arg(long, default_value = "remote-hosts.toml")]
    config: PathBuf,

    /// Platform pool to operate against (e.g. `x86_64`).
    #[arg(long)]
    platform: String,

    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Acquire a slot for a pipeline run.
    Lock { prid: String },
    /// Release a slot held by a pipeline run.
    Unlock {
        host: String,
        slot: u32,
        prid: String,
    },
    /// Print operational/available/occupied slots for every host in the pool.
    Status {
        /// Emit machine-readable JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },
}

#[derive(serde::Serialize)]
struct HostStatus {
    hostname: String,
    operational: bool,
    slots: u32,
    available: Vec<u32>,
    occupied: Vec<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    logging::init(cli.log_level.into());

    let config_text = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config file {}", cli.config.display()))?;
    let config = RemoteHostsConfig::from_toml(&config_text).context("parsing remote hosts config")?;
    let pool = RemoteHostsPool::from_config(&config, &cli.platform).context("building remote hosts pool")?;

    match cli.command {
        Command::Lock { prid } => match pool.lock_resource(&prid).await {
            Some(lease) => {
                println!("locked {}/slot_{} for {}", lease.hostname(), lease.slot, lease.prid);
            }
            None => {
                println!("no remote host slot available for pipelinerun {prid}");
                std::process::exit(1);
            }
        },
        Command::Unlock { host, slot, prid } => {
            let target = pool
                .hosts()
                .find(|h| h.hostname() == host)
                .ok_or_else(|| eyre!("host {host} not found in platform pool"))?;
            if target.unlock(slot, &prid).await {
                println!("unlocked {host}/slot_{slot} for {prid}");
            } else {
                println!("failed to unlock {host}/slot_{slot} for {prid}");
                std::process::exit(1);
            }
        }
        Command::Status { json } => {
            let mut statuses = Vec::new();
            for host in pool.hosts() {
                let operational = host.is_operational().await;
                let (available, occupied) = if operational {
                    (
                        host.available_slots().await.unwrap_or_default(),
                        host.occupied_slots().await.unwrap_or_default(),
                    )
                } else {
                    (Vec::new(), Vec::new())
                };
                statuses.push(HostStatus {
                    hostname: host.hostname().to_string(),
                    operational,
                    slots: host.slots(),
                    available,
                    occupied,
                });
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&statuses).context("serializing host status")?);
            } else {
                for status in &statuses {
                    if !status.operational {
                        println!("{}: not operational", status.hostname);
                        continue;
                    }
                    println!(
                        "{}: operational, {}/{} slots available {:?}, occupied {:?}",
                        status.hostname,
                        status.available.len(),
                        status.slots,
                        status.available,
                        status.occupied
                    );
                }
            }
        }
    }

    Ok(())
}
