use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dhcpward::api::{self, ApiState};
use dhcpward::{Config, DataTracker, DhcpServer, FileStore, Result, Store};

#[derive(Parser)]
#[command(name = "dhcpward")]
#[command(author, version, about = "A DHCPv4 server with an administrative REST API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Directory holding the persisted server state
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    /// Network interface to answer DHCP on
    #[arg(short = 'n', long, default_value = "eth0")]
    interface: String,

    /// Drop DISCOVER/REQUEST from MACs that have no binding
    #[arg(long)]
    ignore_anonymous: bool,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
    ListSubnets,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config).await?;
    let store: Arc<dyn Store> = Arc::new(FileStore::new(cli.data_dir.join("database.json"))?);
    let tracker = Arc::new(DataTracker::new(store));
    tracker.load_data().await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP server with config: {:?}", cli.config);
            let server = DhcpServer::new(
                Arc::clone(&tracker),
                config.server_ip,
                &cli.interface,
                cli.ignore_anonymous,
            )?;
            let state = ApiState {
                tracker: Arc::clone(&tracker),
                username: config.username.clone(),
                password: config.password.clone(),
            };

            tokio::select! {
                result = server.run() => result,
                result = api::serve(state, config.api_port) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server...");
                    if let Err(err) = tracker.save_data().await {
                        error!("Failed to save state on shutdown: {}", err);
                    }
                    Ok(())
                }
            }
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListSubnets => {
            let subnets = tracker.list_subnets().await;

            if subnets.is_empty() {
                println!("No subnets configured.");
            } else {
                println!(
                    "{:<16} {:<18} {:<15} {:<15} {:>7} {:>9}",
                    "Name", "Subnet", "Active Start", "Active End", "Leases", "Bindings"
                );
                println!("{}", "-".repeat(84));

                for subnet in subnets {
                    println!(
                        "{:<16} {:<18} {:<15} {:<15} {:>7} {:>9}",
                        subnet.name,
                        subnet.subnet.to_string(),
                        subnet.active_start.to_string(),
                        subnet.active_end.to_string(),
                        subnet.leases.len(),
                        subnet.bindings.len()
                    );
                }
            }

            Ok(())
        }
    }
}
