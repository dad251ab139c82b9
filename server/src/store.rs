//! Persistence seam between the game service and whatever durable storage
//! backs it.
//!
//! `commit` is the unit of work: a snapshot and its audit entry land together
//! or not at all, so a crash mid-write can never leave a balance without its
//! ledger line. `MemoryStore` is the in-process implementation used by the
//! binary and the tests; its `unavailable` switch simulates storage outages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use shared::economy::{UpgradeKind, UserEconomyState};
use shared::protocol::RejectReason;
use shared::UserId;
use thiserror::Error;

/// Entries kept per user before the oldest are discarded.
const MAX_AUDIT_ENTRIES: usize = 512;

/// Failure surfaced by a [`UserStore`] implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("user {0} not found")]
    UserNotFound(UserId),
}

impl StorageError {
    /// Whether the caller may retry the same write later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// What a ledger entry records.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditKind {
    TapEarnings { golden: bool },
    UpgradePurchase { upgrade: UpgradeKind, level: u32 },
    AutoAccrual,
}

/// One line of the per-user coin ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub kind: AuditKind,
    /// Signed coin movement; negative for purchases.
    pub coin_delta: i64,
    pub timestamp: u64,
}

/// A captured incident attached to an account flag.
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationSample {
    pub timestamp: u64,
    pub detail: String,
}

/// Persisted record of repeated violations. `review_lock` freezes the
/// account's economy until a human clears it; a plain flag does not.
#[derive(Debug, Clone)]
pub struct AccountFlag {
    pub user_id: UserId,
    pub reason: RejectReason,
    pub violation_count: u32,
    pub samples: Vec<ViolationSample>,
    pub flagged_at: u64,
    pub review_lock: bool,
}

/// Durable storage for account snapshots, audit entries and flags.
///
/// Methods are synchronous and are called while a per-user lock is held, so
/// implementations must not block for long.
pub trait UserStore: Send + Sync {
    /// Loads the latest snapshot, or `None` for a user never seen before.
    fn load_user(&self, user_id: UserId) -> Result<Option<UserEconomyState>, StorageError>;

    /// Creates the initial snapshot for a new user. Returns the existing
    /// snapshot if the user already exists.
    fn create_user(&self, user_id: UserId) -> Result<UserEconomyState, StorageError>;

    /// Writes a snapshot and its audit entry as one unit of work.
    fn commit(
        &self,
        user_id: UserId,
        state: &UserEconomyState,
        entry: AuditEntry,
    ) -> Result<(), StorageError>;

    /// Persists an escalated account flag.
    fn flag_account(&self, flag: AccountFlag) -> Result<(), StorageError>;

    /// All flags recorded against a user, oldest first.
    fn flags(&self, user_id: UserId) -> Result<Vec<AccountFlag>, StorageError>;

    /// The most recent audit entries for a user, oldest first, at most `limit`.
    fn audit_tail(&self, user_id: UserId, limit: usize) -> Result<Vec<AuditEntry>, StorageError>;
}

#[derive(Default)]
struct MemoryStoreInner {
    users: HashMap<UserId, UserEconomyState>,
    audits: HashMap<UserId, Vec<AuditEntry>>,
    flags: HashMap<UserId, Vec<AccountFlag>>,
}

/// In-memory [`UserStore`] used by the binary and the test suite.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a storage outage; every call fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn guard(&self) -> Result<MutexGuard<'_, MemoryStoreInner>, StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("storage offline".to_string()));
        }
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

impl UserStore for MemoryStore {
    fn load_user(&self, user_id: UserId) -> Result<Option<UserEconomyState>, StorageError> {
        Ok(self.guard()?.users.get(&user_id).cloned())
    }

    fn create_user(&self, user_id: UserId) -> Result<UserEconomyState, StorageError> {
        let mut inner = self.guard()?;
        Ok(inner
            .users
            .entry(user_id)
            .or_insert_with(UserEconomyState::new)
            .clone())
    }

    fn commit(
        &self,
        user_id: UserId,
        state: &UserEconomyState,
        entry: AuditEntry,
    ) -> Result<(), StorageError> {
        let mut inner = self.guard()?;
        if !inner.users.contains_key(&user_id) {
            return Err(StorageError::UserNotFound(user_id));
        }
        inner.users.insert(user_id, state.clone());
        let tail = inner.audits.entry(user_id).or_default();
        tail.push(entry);
        if tail.len() > MAX_AUDIT_ENTRIES {
            let excess = tail.len() - MAX_AUDIT_ENTRIES;
            tail.drain(..excess);
        }
        Ok(())
    }

    fn flag_account(&self, flag: AccountFlag) -> Result<(), StorageError> {
        self.guard()?
            .flags
            .entry(flag.user_id)
            .or_default()
            .push(flag);
        Ok(())
    }

    fn flags(&self, user_id: UserId) -> Result<Vec<AccountFlag>, StorageError> {
        Ok(self.guard()?.flags.get(&user_id).cloned().unwrap_or_default())
    }

    fn audit_tail(&self, user_id: UserId, limit: usize) -> Result<Vec<AuditEntry>, StorageError> {
        let inner = self.guard()?;
        let tail = inner
            .audits
            .get(&user_id)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let start = tail.len().saturating_sub(limit);
        Ok(tail[start..].to_vec())
    }
}
