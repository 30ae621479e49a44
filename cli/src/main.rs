//! ChainFeed daemon.
//!
//! ```bash
//! # Stream a local node's events on :8080
//! chainfeed run --rpc-url ws://127.0.0.1:8546
//!
//! # Start from a YAML file and print the effective configuration
//! chainfeed --config chainfeed.yaml config
//! ```

mod config;
mod logging;

use anyhow::{Context, Result};
use chainfeed_broadcast::BroadcastService;
use chainfeed_core::{EventListener, TransactionProcessor};
use chainfeed_rpc::WsRpcClient;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use config::{ChainfeedConfig, Overrides};

#[derive(Parser)]
#[command(
    name = "chainfeed",
    about = "Fan out a node's blocks, transactions and contract events to WebSocket subscribers",
    long_about = "
ChainFeed subscribes to an Ethereum node over WebSocket JSON-RPC and relays
new blocks, transactions, contract logs and high-value transfer alerts to
any number of WebSocket subscribers.

ENVIRONMENT VARIABLES:
  CHAINFEED_CONFIG       Path to a YAML config file
  CHAINFEED_RPC_URL      Upstream node WebSocket URL
  CHAINFEED_LISTEN       Gateway bind address
  CHAINFEED_LOG_LEVEL    Global log level
  CHAINFEED_LOG_JSON     Emit JSON logs
  CHAINFEED_HIGH_VALUE   Default high-value threshold in ether, or \"off\"
",
    version
)]
struct Cli {
    /// YAML config file
    #[arg(short, long, global = true, env = "CHAINFEED_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default)
    Run,
    /// Print the effective configuration as YAML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ChainfeedConfig::load(cli.config.as_deref())?.apply(&cli.overrides)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

async fn run(config: ChainfeedConfig) -> Result<()> {
    logging::init_tracing(&config.log);
    info!(version = env!("CARGO_PKG_VERSION"), rpc = %config.rpc_url, "starting chainfeed");

    let client = Arc::new(WsRpcClient::connect(config.rpc_url.clone(), config.rpc.clone()));
    let listener = EventListener::with_config(client, config.listener.clone());
    let processor = TransactionProcessor::new(listener.clone());
    let service = BroadcastService::new(listener, processor, config.broadcast.clone());

    service
        .start()
        .await
        .context("failed to start the event pipeline")?;

    let tcp = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;

    let stopping = service.clone();
    let served = chainfeed_server::serve(tcp, service.clone(), async move {
        shutdown_signal().await;
        info!("shutdown requested");
        stopping.stop().await;
    })
    .await;

    service.stop().await;
    served.context("gateway failed")?;
    info!("chainfeed stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
}
