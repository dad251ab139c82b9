use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use server::anti_cheat::CheatMonitor;
use server::auth::DevAuthenticator;
use server::config::ServerConfig;
use server::events::{spawn_event_worker, MemoryRanking, RankingService};
use server::game::GameService;
use server::network::Server;
use server::store::MemoryStore;
use tokio::sync::mpsc;

/// Authoritative sync server for the tap economy
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the listener to
    #[arg(short = 'b', long, default_value = "127.0.0.1:9000")]
    bind: String,

    /// Maximum concurrent client connections
    #[arg(short = 'm', long, default_value = "256")]
    max_connections: usize,

    /// Accepted taps allowed per user per rolling rate window
    #[arg(long, default_value = "20")]
    max_taps_per_window: usize,

    /// Allowed client/server counter gap before a correction is issued
    #[arg(long, default_value = "0")]
    reconcile_tolerance: u64,
}

/// Parses command-line arguments, wires the storage, anti-cheat, and event
/// pipeline together, then serves until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }
    env_logger::init();

    let mut config = ServerConfig {
        bind_addr: args.bind,
        max_connections: args.max_connections,
        ..ServerConfig::default()
    };
    config.anti_cheat.max_taps_per_window = args.max_taps_per_window;
    config.reconcile.coin_tolerance = args.reconcile_tolerance;
    config.reconcile.total_earned_tolerance = args.reconcile_tolerance;

    let store = Arc::new(MemoryStore::new());
    let ranking: Arc<dyn RankingService> = Arc::new(MemoryRanking::new());

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let _event_worker = spawn_event_worker(events_rx, ranking);

    let monitor = CheatMonitor::new(config.anti_cheat.clone());
    let game = Arc::new(GameService::new(
        store,
        monitor,
        events_tx,
        config.reconcile.clone(),
    ));

    info!("Using development token authentication (dev-<user id>)");
    let server = Server::new(config, game, Arc::new(DevAuthenticator));

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
