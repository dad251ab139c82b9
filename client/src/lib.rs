//! # Economy Client Library
//!
//! This library provides the client side of the tap-to-earn economy. It
//! applies every user action to a local copy of the state immediately,
//! batches the actions into sync envelopes for the authoritative server,
//! and reconciles whenever the server disagrees with the local prediction.
//!
//! ## Architecture Overview
//!
//! ### Optimistic Prediction
//! Taps and purchases update the displayed state the instant they happen.
//! Each action becomes an operation with its own idempotency id; the
//! prediction stays folded into the display until the server confirms,
//! rejects, or corrects it.
//!
//! ### Batched Sync
//! Operations accumulate in an ordered, capped queue and flush as one
//! envelope per round, on a timer or immediately for high-priority work.
//! Replies are matched by envelope id, so they may arrive out of order or
//! not at all without confusing the pending bookkeeping.
//!
//! ### Retry with Backoff
//! Lost envelopes and retryable rejections reschedule their operations
//! through a due-time priority queue with exponential backoff. A reconnect
//! collapses every pending delay in one step and leads with a forced full
//! sync so the session restarts from authoritative truth.
//!
//! ## Module Organization
//!
//! ### State Module (`state`)
//! Confirmed server state plus the pending prediction deltas, and the fold
//! that produces the displayed state from the two.
//!
//! ### Sync Module (`sync`)
//! The operation queue, retry scheduler, and [`sync::SyncManager`], which
//! decides what goes into each envelope and how every reply, correction,
//! and push is absorbed.
//!
//! ### Network Module (`network`)
//! TCP framing, the handshake, the reconnect loop, and the select loop that
//! multiplexes commands, timers, and server packets.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{Command, NetworkClient};
//! use client::sync::SyncConfig;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (events_tx, mut events_rx) = mpsc::unbounded_channel();
//!     let (mut client, commands) =
//!         NetworkClient::new("127.0.0.1:9000", SyncConfig::default(), events_tx);
//!
//!     // Watch what the sync layer reports.
//!     tokio::spawn(async move {
//!         while let Some(event) = events_rx.recv().await {
//!             println!("{:?}", event);
//!         }
//!     });
//!
//!     let _ = commands.send(Command::Tap);
//!     let _ = commands.send(Command::Shutdown);
//!
//!     client.run("dev-1").await
//! }
//! ```
//!
//! ## Design Philosophy
//!
//! ### Responsiveness First
//! The display never waits for the server. Predictions use the same shared
//! arithmetic the server enforces, so an honest client's claims always
//! match and corrections stay rare.
//!
//! ### Server Authority
//! Whatever the server replies wins. Confirmed counters are overwritten
//! with absolute values, corrections replace the whole local state, and a
//! rejected operation's prediction is rolled back rather than argued with.
//!
//! ### Graceful Degradation
//! Offline taps queue locally until the cap, in-flight work survives a
//! dropped connection through the retry scheduler, and the reconnect
//! handshake re-seeds the session without losing pending operations.

pub mod network;
pub mod state;
pub mod sync;
