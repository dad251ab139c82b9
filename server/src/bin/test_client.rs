use bincode::{deserialize, serialize};
use shared::economy::{derived_rates, UpgradeKind};
use shared::protocol::{Operation, OperationKind, Packet, SyncEnvelope, SyncResult};
use shared::{unix_millis, PROTOCOL_VERSION};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;

async fn send_packet(
    stream: &mut TcpStream,
    packet: &Packet,
) -> Result<(), Box<dyn std::error::Error>> {
    let payload = serialize(packet)?;
    stream
        .write_all(&(payload.len() as u32).to_le_bytes())
        .await?;
    stream.write_all(&payload).await?;
    Ok(())
}

async fn read_packet(stream: &mut TcpStream) -> Result<Packet, Box<dyn std::error::Error>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(deserialize(&payload)?)
}

// Reads until the sync reply arrives, reporting pushes along the way.
async fn read_sync_reply(stream: &mut TcpStream) -> Result<SyncResult, Box<dyn std::error::Error>> {
    loop {
        match read_packet(stream).await? {
            Packet::SyncReply { result } => return Ok(result),
            Packet::StatePush { updates } => {
                println!(
                    "State push: {} auto coins credited",
                    updates.auto_coins_credited
                );
            }
            other => return Err(format!("unexpected packet: {:?}", other).into()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server_addr = "127.0.0.1:9000";
    println!("Connecting to {}", server_addr);
    let mut stream = TcpStream::connect(server_addr).await?;

    send_packet(
        &mut stream,
        &Packet::Connect {
            protocol_version: PROTOCOL_VERSION,
            auth_token: "dev-99".to_string(),
        },
    )
    .await?;

    // Local mirror of the authoritative state, refreshed from every reply.
    let mut mirror = match read_packet(&mut stream).await? {
        Packet::Connected {
            user_id, snapshot, ..
        } => {
            println!(
                "Authenticated as user {} ({} coins, {} per tap)",
                user_id, snapshot.coins, snapshot.coins_per_tap
            );
            snapshot
        }
        other => {
            println!("Expected handshake reply but got: {:?}", other);
            return Ok(());
        }
    };

    // Honest play: tap at the derived rate and buy TapPower when affordable.
    for round in 1..=15 {
        let now = unix_millis();
        let mut operations = Vec::new();
        let mut predicted = mirror.clone();

        let level = predicted.upgrade_level(UpgradeKind::TapPower);
        let upgrade_cost = UpgradeKind::TapPower.cost_at_level(level);
        if predicted.coins >= upgrade_cost {
            println!("Round {}: buying TapPower for {} coins", round, upgrade_cost);
            operations.push(Operation::new(
                OperationKind::UpgradePurchase {
                    upgrade: UpgradeKind::TapPower,
                },
                now,
            ));
            predicted.debit(upgrade_cost);
            predicted.apply_upgrade_effect(UpgradeKind::TapPower);
        }

        let per_tap = derived_rates(&predicted).coins_per_tap;
        for _ in 0..5 {
            operations.push(Operation::new(
                OperationKind::Tap {
                    claimed_earnings: per_tap,
                },
                now,
            ));
            predicted.credit(per_tap);
        }

        let envelope = SyncEnvelope::new(operations, predicted, now);
        send_packet(&mut stream, &Packet::SyncRequest { envelope }).await?;

        let result = read_sync_reply(&mut stream).await?;
        println!(
            "Round {}: {:?} across {} operations",
            round,
            result.outcome,
            result.operations.len()
        );
        if let Some(updates) = &result.updates {
            mirror.coins = updates.coins;
            mirror.total_coins_earned = updates.total_coins_earned;
            mirror.coins_per_tap = updates.coins_per_tap;
            mirror.auto_clicker_rate = updates.auto_clicker_rate;
            if let Some(upgrades) = &updates.upgrades {
                mirror.upgrades = upgrades.clone();
            }
            println!(
                "  Balance: {} coins ({} lifetime)",
                updates.coins, updates.total_coins_earned
            );
        }
        if let Some(correction) = &result.correction {
            println!("  Correction: {:?}", correction.discrepancies);
            mirror = correction.snapshot.clone();
        }

        // Stay under the server's sync interval and tap rate limits.
        sleep(Duration::from_millis(400)).await;
    }

    // A deliberately forged claim; the server should refuse and correct it.
    let now = unix_millis();
    let mut predicted = mirror.clone();
    predicted.credit(9_999);
    let forged = Operation::new(
        OperationKind::Tap {
            claimed_earnings: 9_999,
        },
        now,
    );
    let envelope = SyncEnvelope::new(vec![forged], predicted, now);
    println!("Claiming 9999 coins for one tap...");
    send_packet(&mut stream, &Packet::SyncRequest { envelope }).await?;

    let result = read_sync_reply(&mut stream).await?;
    println!("Forged tap: {:?}", result.outcome);
    for operation in &result.operations {
        println!("  {:?}", operation.status);
    }
    if let Some(correction) = &result.correction {
        println!(
            "  Server snapshot restored: {} coins",
            correction.snapshot.coins
        );
        mirror = correction.snapshot.clone();
    }

    println!("Sending disconnect request");
    send_packet(&mut stream, &Packet::Disconnect).await?;

    println!(
        "Final balance: {} coins ({} lifetime)",
        mirror.coins, mirror.total_coins_earned
    );
    println!("Test client finished");
    Ok(())
}
