use std::time::Duration;

use log::{debug, info, warn};
use shared::economy::UpgradeKind;
use shared::protocol::{check_frame_len, decode_payload, encode_frame, Packet, WireError};
use shared::{unix_millis, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};

use crate::sync::{ClientEvent, SyncConfig, SyncManager};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const RETRY_POLL_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Tap,
    Purchase(UpgradeKind),
    FullSync,
    Shutdown,
}

pub struct NetworkClient {
    server_addr: String,
    config: SyncConfig,
    manager: SyncManager,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl NetworkClient {
    pub fn new(
        server_addr: &str,
        config: SyncConfig,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> (Self, mpsc::UnboundedSender<Command>) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let manager = SyncManager::new(config.clone(), events);
        (
            Self {
                server_addr: server_addr.to_string(),
                config,
                manager,
                commands,
            },
            command_tx,
        )
    }

    /// Connects and reconnects until a shutdown command arrives. Commands
    /// sent while disconnected wait in the channel and are applied with
    /// fresh timestamps once a session is up again.
    pub async fn run(&mut self, auth_token: &str) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            match self.connect_once(auth_token).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    self.manager.on_disconnected(unix_millis());
                    info!("Reconnecting in {:?}...", RECONNECT_DELAY);
                    sleep(RECONNECT_DELAY).await;
                }
                Err(e) => {
                    warn!("Connection attempt failed: {}", e);
                    self.manager.on_disconnected(unix_millis());
                    sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    /// Runs one connection's lifetime. Returns true when the caller asked
    /// for shutdown, false when the connection should be reopened.
    async fn connect_once(&mut self, auth_token: &str) -> Result<bool, Box<dyn std::error::Error>> {
        info!("Connecting to {}...", self.server_addr);
        let stream = TcpStream::connect(&self.server_addr).await?;
        let (mut reader, mut writer) = stream.into_split();

        write_frame(
            &mut writer,
            &Packet::Connect {
                protocol_version: PROTOCOL_VERSION,
                auth_token: auth_token.to_string(),
            },
        )
        .await?;

        match read_packet(&mut reader).await? {
            Some(Packet::Connected {
                user_id, snapshot, ..
            }) => {
                self.manager.on_connected(user_id, snapshot, unix_millis());
            }
            Some(Packet::Disconnected { reason }) => {
                return Err(format!("server refused connection: {}", reason).into());
            }
            Some(_) => return Err("unexpected packet during handshake".into()),
            None => return Err("connection closed during handshake".into()),
        }

        // Frame reads live in their own task so the select loop below can
        // be cancelled at any await point without tearing a partial frame.
        let (packet_tx, mut packets) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_packet(&mut reader).await {
                    Ok(Some(packet)) => {
                        if packet_tx.send(packet).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Wire error: {}", e);
                        break;
                    }
                }
            }
        });

        let mut flush_timer = interval(Duration::from_millis(self.config.flush_interval_ms));
        let mut retry_timer = interval(Duration::from_millis(RETRY_POLL_MS));
        let mut sweep_timer = interval(Duration::from_secs(1));

        let shutdown = loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Tap) => {
                            self.manager.tap(unix_millis());
                        }
                        Some(Command::Purchase(upgrade)) => {
                            if !self.manager.purchase(upgrade, unix_millis()) {
                                debug!("Purchase of {:?} skipped; not affordable", upgrade);
                            }
                        }
                        Some(Command::FullSync) => {
                            self.manager.request_full_sync(unix_millis());
                        }
                        Some(Command::Shutdown) | None => break true,
                    }
                    if self.manager.urgent() {
                        flush(&mut self.manager, &mut writer).await?;
                    }
                }
                _ = flush_timer.tick() => {
                    flush(&mut self.manager, &mut writer).await?;
                }
                _ = retry_timer.tick() => {
                    if self.manager.release_due_retries(unix_millis()) > 0 {
                        flush(&mut self.manager, &mut writer).await?;
                    }
                }
                _ = sweep_timer.tick() => {
                    self.manager.expire_envelopes(unix_millis());
                }
                packet = packets.recv() => {
                    match packet {
                        Some(Packet::SyncReply { result }) => {
                            self.manager.handle_reply(result, unix_millis());
                        }
                        Some(Packet::StatePush { updates }) => {
                            self.manager.apply_push(&updates);
                        }
                        Some(Packet::Disconnected { reason }) => {
                            warn!("Server closed the connection: {}", reason);
                            break false;
                        }
                        Some(_) => warn!("Unexpected packet type"),
                        None => break false,
                    }
                }
            }
        };

        if shutdown {
            let _ = write_frame(&mut writer, &Packet::Disconnect).await;
        }
        reader_task.abort();
        Ok(shutdown)
    }

    pub fn manager(&self) -> &SyncManager {
        &self.manager
    }
}

/// Sends at most one envelope per call; the next timer tick picks up any
/// remainder of the queue.
async fn flush<W: AsyncWrite + Unpin>(
    manager: &mut SyncManager,
    writer: &mut W,
) -> Result<(), WireError> {
    if let Some(envelope) = manager.next_envelope(unix_millis()) {
        debug!(
            "Flushing envelope {} ({} operations)",
            envelope.id,
            envelope.operations.len()
        );
        write_frame(writer, &Packet::SyncRequest { envelope }).await?;
    }
    Ok(())
}

async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Packet>, WireError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = check_frame_len(u32::from_le_bytes(len_bytes))?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(decode_payload(&payload)?))
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &Packet,
) -> Result<(), WireError> {
    let frame = encode_frame(packet)?;
    writer.write_all(&frame).await?;
    Ok(())
}
