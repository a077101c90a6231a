use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhcpscope::{DhcpServer, MemoryZoneStore, Result, ServerConfig, ZoneStore};

#[derive(Parser)]
#[command(name = "dhcpscope")]
#[command(author, version, about = "A multi-scope DHCP server with DNS integration", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
    ListScopes,
    ListLeases {
        scope: String,
    },
    CleanupLeases,
}

fn zone_store(config: &ServerConfig) -> Option<Arc<dyn ZoneStore>> {
    config.dns_updates_enabled.then(|| {
        Arc::new(MemoryZoneStore::new(config.dns_server_name.clone())) as Arc<dyn ZoneStore>
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = ServerConfig::load_or_create(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP server with config: {:?}", cli.config);

            let store = zone_store(&config);
            let server = DhcpServer::new(config, store).await?;
            server.start().await?;

            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal, stopping server...");
            server.stop().await?;
            Ok(())
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListScopes => {
            let server = DhcpServer::new(config, None).await?;

            println!(
                "{:<20} {:<16} {:<32} {:<8}",
                "Name", "Interface", "Range", "Enabled"
            );
            println!("{}", "-".repeat(78));

            for scope in server.scopes().snapshot().await {
                let scope_config = scope.config();
                println!(
                    "{:<20} {:<16} {:<32} {:<8}",
                    scope.name().await,
                    scope_config.interface_address.to_string(),
                    format!("{} - {}", scope_config.start, scope_config.end),
                    scope.is_enabled().await
                );
            }
            Ok(())
        }
        Commands::ListLeases { scope } => {
            let server = DhcpServer::new(config, None).await?;
            let Some(scope) = server.get_scope(&scope).await else {
                eprintln!("Scope {} does not exist.", scope);
                return Ok(());
            };

            let leases = scope.lease_snapshot().await;
            if leases.is_empty() {
                println!("No leases.");
            } else {
                println!(
                    "{:<24} {:<16} {:<24} {:<10}",
                    "Client ID", "IP Address", "Expires At", "Remaining"
                );
                println!("{}", "-".repeat(76));

                for lease in leases {
                    let remaining = lease.remaining_seconds();
                    let remaining_str = if remaining > 0 {
                        format!("{}s", remaining)
                    } else {
                        "expired".to_string()
                    };

                    println!(
                        "{:<24} {:<16} {:<24} {:<10}",
                        lease.client_id.to_string(),
                        lease.address.to_string(),
                        lease.expires_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                        remaining_str
                    );
                }
            }
            Ok(())
        }
        Commands::CleanupLeases => {
            let store = zone_store(&config);
            let server = DhcpServer::new(config, store).await?;
            let count = server.cleanup_expired_leases().await;

            println!("Cleaned up {} expired lease(s).", count);
            Ok(())
        }
    }
}
