//! # Economy Server Library
//!
//! This library provides the authoritative server implementation for the
//! tap-to-earn economy. It owns the canonical per-user state, validates every
//! client-reported action, and returns corrections whenever a client's
//! optimistic prediction drifts from reality.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Economy
//! The server recomputes every tap payout and upgrade purchase from its own
//! copy of the user's state. Clients predict outcomes locally for
//! responsiveness, but only server-computed balances persist; a client claim
//! that does not match the server's arithmetic is rejected, never trusted.
//!
//! ### Cheat Detection
//! Claimed earnings, tap rates, and timestamps are checked against what the
//! user's upgrades make possible. Repeat offenders escalate from rejection
//! to a flag for review and finally to a locked account:
//! - Per-user sliding tap window enforcement
//! - Earnings plausibility against derived rates
//! - Timestamp sanity (stale and future bounds)
//! - Violation counting with flag and lock thresholds
//!
//! ### Reconciliation
//! Every sync reply carries the server's view of the user's counters. When
//! the client-reported state disagrees beyond tolerance, the reply includes a
//! full snapshot and the list of discrepancies so the client can overwrite
//! its local state and continue from truth.
//!
//! ## Architecture Design
//!
//! ### Per-User Serialization
//! All mutation of one user's account happens under that user's async mutex.
//! Different users proceed in parallel; a single user's operations apply in
//! envelope order, which makes replay detection and balance arithmetic
//! straightforward.
//!
//! ### TCP Framed Protocol
//! Clients speak length-prefixed bincode frames over TCP. Sync envelopes
//! batch operations; replies carry per-operation results, corrections, and
//! fresh counters in one round trip.
//!
//! ### Unit-of-Work Storage
//! Balance changes and their audit entries commit together through the
//! [`store::UserStore`] trait. A storage outage rejects the operation as
//! retryable instead of applying half an update.
//!
//! ## Module Organization
//!
//! ### Anti-Cheat Module (`anti_cheat`)
//! Sliding tap windows, earnings plausibility, and suspicion escalation:
//! - Per-user accepted-tap window with timestamp pruning
//! - Violation records per user and rejection reason
//! - Flag and lock thresholds with rolling-window reset
//!
//! ### Auth Module (`auth`)
//! Token authentication behind a trait, with a static token table and a
//! parse-the-token development fallback.
//!
//! ### Config Module (`config`)
//! Serde-friendly configuration for the listener, sync validation limits,
//! anti-cheat thresholds, and reconciliation tolerances.
//!
//! ### Events Module (`events`)
//! Domain events emitted by the game layer, milestone detection, and the
//! background worker that feeds the ranking service.
//!
//! ### Game Module (`game`)
//! The authoritative economy itself:
//! - Account cache with per-user locks and idempotency receipts
//! - Tap and purchase application with server-side arithmetic
//! - Auto-clicker accrual from wall-clock elapsed time
//! - State comparison producing corrections
//!
//! ### Network Module (`network`)
//! TCP listener, connection lifecycle, packet framing, and the background
//! sweeps for accrual pushes and anti-cheat pruning.
//!
//! ### Session Module (`session`)
//! Per-connection envelope pipeline: duplicate replay, validation,
//! operation application, reconciliation, and accrual, in that order.
//!
//! ### Store Module (`store`)
//! The [`store::UserStore`] trait and the in-memory implementation used by
//! the binary and the tests, including audit tails and account flags.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use server::anti_cheat::CheatMonitor;
//! use server::auth::DevAuthenticator;
//! use server::config::ServerConfig;
//! use server::events::{spawn_event_worker, MemoryRanking, RankingService};
//! use server::game::GameService;
//! use server::network::Server;
//! use server::store::MemoryStore;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let config = ServerConfig::default();
//!     let store = Arc::new(MemoryStore::new());
//!     let ranking: Arc<dyn RankingService> = Arc::new(MemoryRanking::new());
//!
//!     // Domain events flow to a background worker that updates rankings.
//!     let (events_tx, events_rx) = mpsc::unbounded_channel();
//!     let _event_worker = spawn_event_worker(events_rx, ranking);
//!
//!     let monitor = CheatMonitor::new(config.anti_cheat.clone());
//!     let game = Arc::new(GameService::new(
//!         store,
//!         monitor,
//!         events_tx,
//!         config.reconcile.clone(),
//!     ));
//!
//!     // Accepts connections until the process is stopped.
//!     let server = Server::new(config, game, Arc::new(DevAuthenticator));
//!     server.run().await
//! }
//! ```
//!
//! ## Security Considerations
//!
//! ### Earnings Authority
//! The server never credits what a client claims. Tap earnings are recomputed
//! from the server's upgrade levels; an implausible claim is rejected and
//! counted against the sender.
//!
//! ### Rate Limiting
//! Tap acceptance is bounded per sliding window, envelopes are bounded in
//! size and frequency, and the listener refuses connections past its cap.
//!
//! ### Idempotency
//! Operation and envelope identifiers deduplicate retries, so a client that
//! resends after a lost reply cannot double-earn or double-spend.

pub mod anti_cheat;
pub mod auth;
pub mod config;
pub mod events;
pub mod game;
pub mod network;
pub mod session;
pub mod store;
