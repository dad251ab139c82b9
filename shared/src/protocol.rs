use crate::economy::{UpgradeKind, UserEconomyState};
use crate::{UserId, MAX_FRAME_BYTES};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum OperationKind {
    Tap { claimed_earnings: u64 },
    UpgradePurchase { upgrade: UpgradeKind },
    FullSync,
}

impl OperationKind {
    pub fn default_priority(&self) -> Priority {
        match self {
            OperationKind::FullSync => Priority::High,
            _ => Priority::Normal,
        }
    }
}

/// A single client-initiated action, idempotent by id.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Operation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub client_timestamp: u64,
    pub retry_count: u32,
    pub priority: Priority,
}

impl Operation {
    pub fn new(kind: OperationKind, client_timestamp: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority: kind.default_priority(),
            kind,
            client_timestamp,
            retry_count: 0,
        }
    }
}

/// A batch of operations plus the client's own view of its state.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SyncEnvelope {
    pub id: Uuid,
    pub operations: Vec<Operation>,
    pub client_state: UserEconomyState,
    pub client_checksum: u64,
    pub timestamp: u64,
}

impl SyncEnvelope {
    pub fn new(operations: Vec<Operation>, client_state: UserEconomyState, timestamp: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_checksum: client_state.checksum(),
            operations,
            client_state,
            timestamp,
        }
    }
}

/// Why the server refused a single operation.
#[derive(Debug, Error, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    #[error("tap rate limit exceeded")]
    TapRateExceeded,
    #[error("tap timestamp is too old")]
    StaleTimestamp,
    #[error("tap timestamp is in the future")]
    FutureTimestamp,
    #[error("claimed earnings do not match server rules")]
    ForgedEarnings,
    #[error("insufficient coins")]
    InsufficientCoins,
    #[error("account is locked pending review")]
    AccountLocked,
    #[error("storage backend unavailable")]
    StorageUnavailable,
}

impl RejectReason {
    /// Whether the client should retry the same operation later. Domain
    /// rejections are final; only infrastructure faults are worth a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RejectReason::StorageUnavailable)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum OperationStatus {
    TapApplied {
        earnings: u64,
        golden: bool,
        new_coins: u64,
        new_total_earned: u64,
    },
    PurchaseApplied {
        upgrade: UpgradeKind,
        new_level: u32,
        cost: u64,
        new_coins: u64,
    },
    FullSyncApplied,
    Rejected {
        reason: RejectReason,
        retryable: bool,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OperationResult {
    pub operation_id: Uuid,
    pub status: OperationStatus,
}

impl OperationResult {
    pub fn rejected(operation_id: Uuid, reason: RejectReason) -> Self {
        Self {
            operation_id,
            status: OperationStatus::Rejected {
                reason,
                retryable: reason.is_retryable(),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Success,
    Corrected,
    Failed,
}

/// Where the client's view diverged from the authoritative state.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Discrepancy {
    CoinBalance { client: u64, server: u64 },
    TotalEarned { client: u64, server: u64 },
    EarnedBelowCoins,
    DerivedStats,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Correction {
    pub snapshot: UserEconomyState,
    pub discrepancies: Vec<Discrepancy>,
}

/// Absolute authoritative values after an envelope or accrual sweep. The
/// client overwrites its confirmed state with these, never re-derives them.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StateUpdates {
    pub coins: u64,
    pub total_coins_earned: u64,
    pub coins_per_tap: u64,
    pub auto_clicker_rate: u64,
    pub upgrades: Option<HashMap<UpgradeKind, u32>>,
    pub auto_coins_credited: u64,
}

impl StateUpdates {
    pub fn from_state(
        state: &UserEconomyState,
        auto_coins_credited: u64,
        include_upgrades: bool,
    ) -> Self {
        Self {
            coins: state.coins,
            total_coins_earned: state.total_coins_earned,
            coins_per_tap: state.coins_per_tap,
            auto_clicker_rate: state.auto_clicker_rate,
            upgrades: include_upgrades.then(|| state.upgrades.clone()),
            auto_coins_credited,
        }
    }
}

/// Why a whole envelope failed before its operations were considered.
#[derive(Debug, Error, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    #[error("not authenticated")]
    Unauthenticated,
    #[error("malformed envelope")]
    Malformed,
    #[error("too many operations in one envelope")]
    OversizedBatch,
    #[error("envelope timestamp out of range")]
    TimestampOutOfRange,
    #[error("sync requests arriving too fast")]
    SyncIntervalViolation,
    #[error("storage backend unavailable")]
    StorageUnavailable,
}

#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[error("{kind}: {detail}")]
pub struct SyncError {
    pub kind: SyncErrorKind,
    pub retryable: bool,
    pub detail: String,
}

impl SyncError {
    pub fn new(kind: SyncErrorKind, retryable: bool, detail: impl Into<String>) -> Self {
        Self {
            kind,
            retryable,
            detail: detail.into(),
        }
    }
}

/// The server's verdict on one envelope. Matched to the request by id.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SyncResult {
    pub envelope_id: Uuid,
    pub outcome: SyncOutcome,
    pub operations: Vec<OperationResult>,
    pub updates: Option<StateUpdates>,
    pub correction: Option<Correction>,
    pub error: Option<SyncError>,
    pub timestamp: u64,
}

impl SyncResult {
    pub fn failed(envelope_id: Uuid, error: SyncError, timestamp: u64) -> Self {
        Self {
            envelope_id,
            outcome: SyncOutcome::Failed,
            operations: Vec::new(),
            updates: None,
            correction: None,
            error: Some(error),
            timestamp,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Connect {
        protocol_version: u32,
        auth_token: String,
    },
    SyncRequest {
        envelope: SyncEnvelope,
    },
    Disconnect,

    Connected {
        user_id: UserId,
        snapshot: UserEconomyState,
        server_timestamp: u64,
    },
    SyncReply {
        result: SyncResult,
    },
    StatePush {
        updates: StateUpdates,
    },
    Disconnected {
        reason: String,
    },
}

/// Transport faults below the packet layer. Never crosses the wire.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: u32 },
    #[error("packet codec failure: {0}")]
    Codec(#[from] bincode::Error),
    #[error("socket failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Encodes a packet as a stream frame: u32 little-endian payload length,
/// then the bincode payload.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, WireError> {
    let payload = bincode::serialize(packet)?;
    if payload.len() > MAX_FRAME_BYTES as usize {
        return Err(WireError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Validates a received length prefix before the payload is read off the
/// socket.
pub fn check_frame_len(len: u32) -> Result<usize, WireError> {
    if len > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge {
            len: len as usize,
            max: MAX_FRAME_BYTES,
        });
    }
    Ok(len as usize)
}

pub fn decode_payload(payload: &[u8]) -> Result<Packet, WireError> {
    Ok(bincode::deserialize(payload)?)
}
