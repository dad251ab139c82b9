//! Runtime configuration for the sync server.

use serde::{Deserialize, Serialize};
use shared::{
    MAX_OPERATIONS_PER_ENVELOPE, MAX_TAPS_PER_WINDOW, MIN_SYNC_INTERVAL_MS, TAP_RATE_WINDOW_MS,
};

/// Validation limits applied to every incoming sync envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLimits {
    /// Maximum number of operations a single envelope may carry.
    pub max_operations_per_envelope: usize,
    /// Minimum time between two envelopes from the same session.
    pub min_sync_interval_ms: u64,
    /// Envelopes stamped further in the past than this are refused.
    pub envelope_max_age_ms: u64,
    /// Envelopes stamped further in the future than this are refused.
    pub envelope_max_future_ms: u64,
}

impl Default for SyncLimits {
    fn default() -> Self {
        Self {
            max_operations_per_envelope: MAX_OPERATIONS_PER_ENVELOPE,
            min_sync_interval_ms: MIN_SYNC_INTERVAL_MS,
            envelope_max_age_ms: 60_000,
            envelope_max_future_ms: 2_000,
        }
    }
}

/// Thresholds for the tap-rate, timestamp and escalation checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntiCheatConfig {
    pub tap_window_ms: u64,
    pub max_taps_per_window: usize,
    /// Taps stamped older than this relative to the server clock are stale.
    pub tap_max_age_ms: u64,
    /// Allowed forward clock skew on tap timestamps.
    pub tap_max_future_ms: u64,
    /// Violations of one kind within the rolling window before the account is flagged.
    pub flag_threshold: u32,
    /// Violations of one kind before the account is review-locked.
    pub lock_threshold: u32,
    /// Incident samples kept per suspicion record.
    pub max_incident_samples: usize,
    /// Rolling window for violation counting; doubles as the record's idle expiry.
    pub suspicion_ttl_ms: u64,
    /// Tap windows with no activity for this long are pruned.
    pub idle_window_ttl_ms: u64,
}

impl Default for AntiCheatConfig {
    fn default() -> Self {
        Self {
            tap_window_ms: TAP_RATE_WINDOW_MS,
            max_taps_per_window: MAX_TAPS_PER_WINDOW,
            tap_max_age_ms: 60_000,
            tap_max_future_ms: 1_500,
            flag_threshold: 5,
            lock_threshold: 20,
            max_incident_samples: 10,
            suspicion_ttl_ms: 86_400_000,
            idle_window_ttl_ms: 300_000,
        }
    }
}

/// Tolerances for client/server state comparison.
///
/// Both default to zero: absolute-value updates leave no legitimate room for
/// drift, so any gap counts as a discrepancy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileConfig {
    pub coin_tolerance: u64,
    pub total_earned_tolerance: u64,
}

/// Top-level server configuration; `Default` matches the development setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_connections: usize,
    pub handshake_timeout_ms: u64,
    /// Connections with no inbound traffic for this long are dropped.
    pub idle_timeout_ms: u64,
    /// How often accrued auto-clicker coins are pushed to quiet connections.
    pub accrual_push_interval_ms: u64,
    /// How often anti-cheat bookkeeping is pruned.
    pub prune_interval_ms: u64,
    pub sync: SyncLimits,
    pub anti_cheat: AntiCheatConfig,
    pub reconcile: ReconcileConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            max_connections: 256,
            handshake_timeout_ms: 5_000,
            idle_timeout_ms: 60_000,
            accrual_push_interval_ms: 5_000,
            prune_interval_ms: 30_000,
            sync: SyncLimits::default(),
            anti_cheat: AntiCheatConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}
