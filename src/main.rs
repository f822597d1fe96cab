// edgenet: network instance agent for edge devices.
// One binary runs the agent and the offline operator commands.

mod apps;
mod config;
mod daemon;
mod instance;
mod ipam;
mod network;
mod services;
mod types;
mod uplink;
mod utils;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use config::AgentConfig;
use daemon::intake::{self, IntakeFile};
use daemon::Daemon;
use instance::StatusStore;
use types::{NetworkInstanceMetrics, NetworkInstanceStatus};
use uplink::UplinkSelector;
use utils::command::CommandExecutor;
use utils::logger::{self, Logger};

/// edgenet - network instances for edge workloads
#[derive(Parser, Debug)]
#[clap(author, version, about = "Bridges, NAT, DHCP/DNS and metadata for edge application networks")]
#[clap(propagate_version = true)]
struct EdgenetCli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent in the foreground
    Daemon {
        /// Intake file with device ports, network instances and apps
        #[clap(long)]
        config: Option<PathBuf>,

        /// Directory for service files and published status
        #[clap(long)]
        run_dir: Option<PathBuf>,
    },

    /// Validate the network instances of an intake file without touching the host
    Check {
        #[clap(long)]
        config: Option<PathBuf>,
    },

    /// Show the status published by a running agent
    Status {
        #[clap(long)]
        run_dir: Option<PathBuf>,

        /// Print raw JSON records
        #[clap(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = EdgenetCli::parse();
    logger::init_tracing(&config::log_filter());
    let agent = AgentConfig::from_env();

    match cli.command {
        Commands::Daemon { config, run_dir } => {
            let agent = agent.with_overrides(config, run_dir);
            let daemon = Daemon::build(agent).await?;
            daemon.run().await?;
            Ok(())
        }
        Commands::Check { config } => handle_check(&agent.with_overrides(config, None)),
        Commands::Status { run_dir, json } => {
            handle_status(&agent.with_overrides(None, run_dir), json)
        }
    }
}

fn handle_check(agent: &AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let file = IntakeFile::load(&agent.config_path)?;
    Logger::section(&format!("Checking {}", agent.config_path.display()));

    let results = intake::check(&file, &UplinkSelector::new());
    let mut failed = 0;
    for (config, result) in &results {
        match result {
            Ok(()) => Logger::success(&format!("{} ({})", config.name(), config.kind)),
            Err(e) => {
                failed += 1;
                Logger::error(&format!("{} ({}): {}", config.name(), config.kind, e));
            }
        }
    }

    Logger::section("Host tools");
    for tool in ["ip", "iptables", "conntrack", agent.dnsmasq_bin.as_str()] {
        if CommandExecutor::is_command_available(tool) {
            Logger::item(tool);
        } else {
            Logger::warning(&format!("{} not found in PATH", tool));
        }
    }

    if failed > 0 {
        return Err(format!("{} of {} network instance(s) rejected", failed, results.len()).into());
    }
    Logger::success(&format!("{} network instance(s) accepted", results.len()));
    Ok(())
}

fn handle_status(agent: &AgentConfig, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let statuses = StatusStore::load_persisted(&agent.status_dir())?;
    let metrics = StatusStore::load_persisted_metrics(&agent.status_dir())?;
    if json {
        let records: Vec<_> = statuses
            .iter()
            .map(|status| {
                serde_json::json!({
                    "status": status,
                    "metrics": metrics.get(&status.uuid()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if statuses.is_empty() {
        Logger::info("No network instances published");
        return Ok(());
    }
    for status in &statuses {
        print_status(status, metrics.get(&status.uuid()));
    }
    Ok(())
}

fn print_status(status: &NetworkInstanceStatus, metrics: Option<&NetworkInstanceMetrics>) {
    Logger::section(&status.config.name());
    Logger::detail("type", &status.kind().to_string());
    Logger::detail("activated", &status.activated.to_string());
    if !status.bridge_name.is_empty() {
        Logger::detail("bridge", &status.bridge_name);
    }
    if let Some(ip) = status.bridge_ip {
        Logger::detail("bridge ip", &ip.to_string());
    }
    if !status.current_uplink_intf.is_empty() {
        Logger::detail("uplink", &status.current_uplink_intf);
    }
    Logger::detail("leases", &status.ip_assignments.len().to_string());
    if let Some(vpn) = &status.vpn_status {
        Logger::detail("tunnel", &format!("{} (active: {})", vpn.tunnel_name, vpn.active));
    }
    if let Some(m) = metrics {
        Logger::detail(
            "traffic",
            &format!(
                "rx {} B / {} pkts, tx {} B / {} pkts ({})",
                m.rx_bytes,
                m.rx_packets,
                m.tx_bytes,
                m.tx_packets,
                m.collected_at.format("%H:%M:%S")
            ),
        );
    }
    if let Some(error) = &status.error {
        Logger::error(error);
    }
}
