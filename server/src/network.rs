//! TCP front-end: connection lifecycle, framing, and background sweeps

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error, info, warn};
use shared::protocol::{
    check_frame_len, decode_payload, encode_frame, Packet, StateUpdates, SyncError, SyncErrorKind,
    SyncResult, WireError,
};
use shared::{unix_millis, UserId, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::game::GameService;
use crate::session::SyncSession;

/// Handle to one live connection's outbound queue.
struct ConnectionHandle {
    sender: mpsc::UnboundedSender<Packet>,
    connection_id: u64,
}

/// Live connections by user, for server pushes and reconnect supersession.
pub struct ConnectionRegistry {
    connections: DashMap<UserId, ConnectionHandle>,
    next_connection_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection, superseding any existing one for the user.
    pub fn register(&self, user_id: UserId, sender: mpsc::UnboundedSender<Packet>) -> u64 {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let handle = ConnectionHandle {
            sender,
            connection_id,
        };
        if let Some(old) = self.connections.insert(user_id, handle) {
            info!(
                "User {} reconnected; superseding connection {}",
                user_id, old.connection_id
            );
            let _ = old.sender.send(Packet::Disconnected {
                reason: "superseded by a new connection".to_string(),
            });
        }
        connection_id
    }

    /// Removes the registration only if it still belongs to this connection.
    /// A superseded connection's late deregister must not evict its
    /// replacement.
    pub fn deregister(&self, user_id: UserId, connection_id: u64) {
        self.connections
            .remove_if(&user_id, |_, handle| handle.connection_id == connection_id);
    }

    /// Queues a packet to a user's live connection, if any.
    pub fn push(&self, user_id: UserId, packet: Packet) -> bool {
        match self.connections.get(&user_id) {
            Some(handle) => handle.sender.send(packet).is_ok(),
            None => false,
        }
    }

    pub fn connected_users(&self) -> Vec<UserId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// TCP server coordinating connections, sessions, and background sweeps.
pub struct Server {
    config: ServerConfig,
    game: Arc<GameService>,
    authenticator: Arc<dyn Authenticator>,
    registry: Arc<ConnectionRegistry>,
    // Counts accepted sockets, authenticated or not.
    connection_count: Arc<AtomicUsize>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        game: Arc<GameService>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            config,
            game,
            authenticator,
            registry: Arc::new(ConnectionRegistry::new()),
            connection_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Binds the configured address and serves until the task is dropped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serves connections on an already-bound listener. Callers that need
    /// the ephemeral port can bind first and pass the listener in.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.spawn_prune_sweep();
        self.spawn_accrual_push_sweep();

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            if self.connection_count.load(Ordering::SeqCst) >= self.config.max_connections {
                warn!("Refusing connection from {}: server full", addr);
                tokio::spawn(async move {
                    let mut stream = stream;
                    let packet = Packet::Disconnected {
                        reason: "server full".to_string(),
                    };
                    let _ = write_frame(&mut stream, &packet).await;
                });
                continue;
            }

            self.connection_count.fetch_add(1, Ordering::SeqCst);
            debug!("Accepted connection from {}", addr);

            let game = Arc::clone(&self.game);
            let authenticator = Arc::clone(&self.authenticator);
            let registry = Arc::clone(&self.registry);
            let config = self.config.clone();
            let connection_count = Arc::clone(&self.connection_count);
            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, addr, game, authenticator, registry, config).await
                {
                    warn!("Connection from {} ended with error: {}", addr, e);
                }
                connection_count.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    /// Spawns the sweep that evicts idle anti-cheat bookkeeping.
    fn spawn_prune_sweep(&self) {
        let game = Arc::clone(&self.game);
        let mut sweep = interval(Duration::from_millis(self.config.prune_interval_ms));
        tokio::spawn(async move {
            loop {
                sweep.tick().await;
                game.monitor().prune(unix_millis());
            }
        });
    }

    /// Spawns the sweep that accrues auto-clicker coins for connected users
    /// and pushes the result to connections with no recent envelope traffic.
    fn spawn_accrual_push_sweep(&self) {
        let game = Arc::clone(&self.game);
        let registry = Arc::clone(&self.registry);
        let push_interval_ms = self.config.accrual_push_interval_ms;
        let mut sweep = interval(Duration::from_millis(push_interval_ms));
        tokio::spawn(async move {
            loop {
                sweep.tick().await;
                for user_id in registry.connected_users() {
                    let handle = match game.cached_account(user_id) {
                        Some(handle) => handle,
                        None => continue,
                    };
                    let now = unix_millis();
                    let mut account = handle.lock().await;
                    // Actively syncing sessions get their accrual inside
                    // envelope replies instead.
                    if now.saturating_sub(account.last_envelope_ms) <= push_interval_ms {
                        continue;
                    }
                    match game.accrue_auto_coins(&mut account, user_id, now) {
                        Ok(amount) if amount > 0 => {
                            let updates = StateUpdates::from_state(&account.state, amount, false);
                            drop(account);
                            if registry.push(user_id, Packet::StatePush { updates }) {
                                debug!("Pushed {} accrued coins to user {}", amount, user_id);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Accrual sweep for user {} failed: {}", user_id, e),
                    }
                }
            }
        });
    }
}

/// Drives one connection from handshake to teardown.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    game: Arc<GameService>,
    authenticator: Arc<dyn Authenticator>,
    registry: Arc<ConnectionRegistry>,
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut reader, mut writer) = stream.into_split();

    let handshake_timeout = Duration::from_millis(config.handshake_timeout_ms);
    let first = match timeout(handshake_timeout, read_packet(&mut reader)).await {
        Ok(Ok(Some(packet))) => packet,
        Ok(Ok(None)) => {
            debug!("Connection from {} closed before handshake", addr);
            return Ok(());
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            debug!("Handshake from {} timed out", addr);
            return Ok(());
        }
    };

    let (protocol_version, auth_token) = match first {
        Packet::Connect {
            protocol_version,
            auth_token,
        } => (protocol_version, auth_token),
        Packet::SyncRequest { envelope } => {
            // Sync traffic before authentication gets a typed refusal.
            let error = SyncError::new(SyncErrorKind::Unauthenticated, false, "connect first");
            let result = SyncResult::failed(envelope.id, error, unix_millis());
            write_frame(&mut writer, &Packet::SyncReply { result }).await?;
            write_frame(
                &mut writer,
                &Packet::Disconnected {
                    reason: "handshake expected".to_string(),
                },
            )
            .await?;
            return Ok(());
        }
        _ => {
            write_frame(
                &mut writer,
                &Packet::Disconnected {
                    reason: "handshake expected".to_string(),
                },
            )
            .await?;
            return Ok(());
        }
    };

    if protocol_version != PROTOCOL_VERSION {
        warn!(
            "Client at {} speaks protocol {}, server speaks {}",
            addr, protocol_version, PROTOCOL_VERSION
        );
        write_frame(
            &mut writer,
            &Packet::Disconnected {
                reason: "protocol version mismatch".to_string(),
            },
        )
        .await?;
        return Ok(());
    }

    let user_id = match authenticator.authenticate(&auth_token) {
        Some(user_id) => user_id,
        None => {
            warn!("Rejected credentials from {}", addr);
            write_frame(
                &mut writer,
                &Packet::Disconnected {
                    reason: "invalid credentials".to_string(),
                },
            )
            .await?;
            return Ok(());
        }
    };

    let handle = match game.account_handle(user_id) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Account load for user {} failed: {}", user_id, e);
            write_frame(
                &mut writer,
                &Packet::Disconnected {
                    reason: "storage unavailable".to_string(),
                },
            )
            .await?;
            return Ok(());
        }
    };
    let snapshot = handle.lock().await.state.clone();

    let (packet_tx, mut packet_rx) = mpsc::unbounded_channel::<Packet>();
    let connection_id = registry.register(user_id, packet_tx.clone());
    info!("User {} connected from {}", user_id, addr);

    // The writer task owns the write half, so sync replies and server
    // pushes never interleave mid-frame.
    let writer_task = tokio::spawn(async move {
        while let Some(packet) = packet_rx.recv().await {
            let closing = matches!(packet, Packet::Disconnected { .. });
            if let Err(e) = write_frame(&mut writer, &packet).await {
                debug!("Write to user {} failed: {}", user_id, e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    let send = |packet: Packet| packet_tx.send(packet).is_ok();
    send(Packet::Connected {
        user_id,
        snapshot,
        server_timestamp: unix_millis(),
    });

    let mut session = SyncSession::new(user_id, config.sync.clone());
    let idle_timeout = Duration::from_millis(config.idle_timeout_ms);

    loop {
        // A timeout abandons any partial read; the connection closes right
        // after, so a torn frame is never resumed.
        match timeout(idle_timeout, read_packet(&mut reader)).await {
            Ok(Ok(Some(Packet::SyncRequest { envelope }))) => {
                debug!(
                    "Envelope {} from user {} ({} operations)",
                    envelope.id,
                    user_id,
                    envelope.operations.len()
                );
                let result = session.handle_envelope(&game, envelope, unix_millis()).await;
                if !send(Packet::SyncReply { result }) {
                    break;
                }
            }
            Ok(Ok(Some(Packet::Disconnect))) => {
                info!("User {} disconnected", user_id);
                break;
            }
            Ok(Ok(Some(_))) => {
                warn!("Unexpected packet from user {}; closing connection", user_id);
                break;
            }
            Ok(Ok(None)) => {
                debug!("Connection from user {} closed", user_id);
                break;
            }
            Ok(Err(e)) => {
                warn!("Wire error from user {}: {}", user_id, e);
                break;
            }
            Err(_) => {
                info!("User {} idle; disconnecting", user_id);
                send(Packet::Disconnected {
                    reason: "idle timeout".to_string(),
                });
                break;
            }
        }
    }

    registry.deregister(user_id, connection_id);
    drop(packet_tx);
    let _ = writer_task.await;
    Ok(())
}

/// Reads one length-prefixed packet. Returns `None` on clean end of stream.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Packet>, WireError> {
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

/// Writes one length-prefixed packet.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &Packet,
) -> Result<(), WireError> {
    let frame = encode_frame(packet)?;
    writer.write_all(&frame).await?;
    Ok(())
}
