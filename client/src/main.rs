use std::time::{Duration, Instant};

use clap::Parser;
use client::network::{Command, NetworkClient};
use client::sync::{ClientEvent, SyncConfig};
use log::{info, warn};
use shared::economy::UpgradeKind;
use tokio::sync::mpsc;
use tokio::time::interval;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:9000")]
    server: String,

    /// Authentication token (dev-<user id> against the dev server)
    #[arg(short = 't', long, default_value = "dev-1")]
    token: String,

    /// How many taps to send per second
    #[arg(long, default_value = "3")]
    taps_per_sec: u64,

    /// Stop after this many seconds (0 runs until Ctrl+C)
    #[arg(long, default_value = "30")]
    duration_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {}", args.server);
    info!("Tapping {} times per second", args.taps_per_sec);
    if args.duration_secs > 0 {
        info!("Running for {} seconds", args.duration_secs);
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (mut client, commands) = NetworkClient::new(&args.server, SyncConfig::default(), events_tx);

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                ClientEvent::Connected { user_id } => {
                    info!("Session established as user {}", user_id)
                }
                ClientEvent::ConnectionLost => warn!("Connection lost"),
                ClientEvent::Corrected { discrepancies } => {
                    warn!("State corrected by server: {:?}", discrepancies)
                }
                ClientEvent::OperationsDropped { count } => {
                    warn!("{} operations dropped", count)
                }
            }
        }
    });

    let taps_per_sec = args.taps_per_sec;
    let duration_secs = args.duration_secs;
    tokio::spawn(async move {
        let period = Duration::from_millis((1_000 / taps_per_sec.max(1)).max(1));
        let mut ticker = interval(period);
        let started = Instant::now();
        let mut taps: u64 = 0;
        loop {
            ticker.tick().await;
            if duration_secs > 0 && started.elapsed().as_secs() >= duration_secs {
                let _ = commands.send(Command::Shutdown);
                break;
            }
            let _ = commands.send(Command::Tap);
            taps += 1;
            // Spend the winnings every tenth tap.
            if taps % 10 == 0 {
                let _ = commands.send(Command::Purchase(UpgradeKind::TapPower));
            }
        }
    });

    client.run(&args.token).await?;
    info!("Client stopped");

    Ok(())
}
