mod api;
mod bootstrap;
mod checkout;
mod config;
mod error;
mod gateway;
mod ledger;
mod middleware;
mod panels;
mod reconciliation;
mod server;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::{handler::reseller_filter, models::RetryErrorsQuery};

#[derive(Parser)]
#[command(name = "recarga", about = "PIX payment reconciliation for reseller credit panels")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API together with the poller and audit sweep (default)
    Serve,
    /// Check or retry a single payment
    Check { payment_id: i64 },
    /// Retry every errored payment of a tenant
    RetryErrors {
        #[arg(long)]
        tenant: i64,
        #[arg(long)]
        reseller_type: Option<String>,
        #[arg(long)]
        reseller_id: Option<i64>,
    },
    /// List payments whose status disagrees with their audit trail
    Audit,
}

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,recarga=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = config::Config::from_env()?;
    let runtime = bootstrap::initialize(&config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            info!("🚀 Starting recarga reconciliation service");

            let poller = runtime.poller.clone().start();
            let audit = runtime.audit.clone().start();

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for shutdown signal: {}", e);
                    return;
                }
                info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
            });

            let app = server::create_app(runtime.state, &config);
            let served = server::run_server(app, &config.bind_address, shutdown_rx).await;

            poller.shutdown().await;
            audit.shutdown().await;
            served?;
            info!("👋 Server stopped");
        }
        Command::Check { payment_id } => {
            let report = runtime.state.engine.check_payment(payment_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::RetryErrors {
            tenant,
            reseller_type,
            reseller_id,
        } => {
            let reseller = reseller_filter(&RetryErrorsQuery {
                reseller_type,
                reseller_id,
            })?;
            let report = runtime.state.engine.retry_errors(tenant, reseller).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Audit => {
            let discrepancies = runtime.audit.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&discrepancies)?);
        }
    }

    Ok(())
}
