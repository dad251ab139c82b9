//! Authoritative economy engine.
//!
//! All balance mutations for one user are serialized behind that user's
//! account mutex; different users proceed fully in parallel. Every mutation
//! is all-or-nothing: validation first, then the store commit, and only then
//! the in-memory swap, so a storage failure leaves memory untouched.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, error, warn};
use shared::economy::{derived_rates, UpgradeKind, UserEconomyState};
use shared::protocol::{
    Correction, Discrepancy, Operation, OperationKind, OperationResult, OperationStatus,
    RejectReason,
};
use shared::{unix_millis, UserId};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::anti_cheat::{CheatMonitor, Escalation};
use crate::config::ReconcileConfig;
use crate::events::{milestones_crossed, GameEvent};
use crate::store::{AccountFlag, AuditEntry, AuditKind, StorageError, UserStore};

/// Operation receipts kept per account for idempotent replay.
const MAX_RECEIPTS: usize = 128;

/// One user's loaded state plus the bookkeeping the service needs around it.
pub struct Account {
    pub state: UserEconomyState,
    /// Review lock, restored from persisted flags or set by escalation.
    pub locked: bool,
    /// Position of the auto-clicker accrual clock, in unix millis.
    pub last_accrual_ms: u64,
    /// Last time an envelope touched this account; the push sweep skips
    /// accounts with recent envelope traffic.
    pub last_envelope_ms: u64,
    receipts: HashMap<Uuid, OperationStatus>,
    receipt_order: VecDeque<Uuid>,
}

impl Account {
    fn new(state: UserEconomyState, locked: bool, now: u64) -> Self {
        Self {
            state,
            locked,
            last_accrual_ms: now,
            last_envelope_ms: 0,
            receipts: HashMap::new(),
            receipt_order: VecDeque::new(),
        }
    }

    fn replay(&self, operation_id: &Uuid) -> Option<OperationStatus> {
        self.receipts.get(operation_id).cloned()
    }

    /// Caches a terminal outcome. Retryable rejections are not terminal;
    /// the same id may come back and deserves a fresh attempt.
    fn remember(&mut self, operation_id: Uuid, status: &OperationStatus) {
        if let OperationStatus::Rejected {
            retryable: true, ..
        } = status
        {
            return;
        }
        if self.receipts.insert(operation_id, status.clone()).is_none() {
            self.receipt_order.push_back(operation_id);
            if self.receipt_order.len() > MAX_RECEIPTS {
                if let Some(evicted) = self.receipt_order.pop_front() {
                    self.receipts.remove(&evicted);
                }
            }
        }
    }
}

fn rejected(reason: RejectReason) -> OperationStatus {
    OperationStatus::Rejected {
        reason,
        retryable: reason.is_retryable(),
    }
}

/// Shared game logic behind every connection.
pub struct GameService {
    accounts: DashMap<UserId, Arc<Mutex<Account>>>,
    store: Arc<dyn UserStore>,
    monitor: CheatMonitor,
    events: UnboundedSender<GameEvent>,
    reconcile_config: ReconcileConfig,
}

impl GameService {
    pub fn new(
        store: Arc<dyn UserStore>,
        monitor: CheatMonitor,
        events: UnboundedSender<GameEvent>,
        reconcile_config: ReconcileConfig,
    ) -> Self {
        Self {
            accounts: DashMap::new(),
            store,
            monitor,
            events,
            reconcile_config,
        }
    }

    /// Returns the serialization handle for a user, loading the account on
    /// first sight. New users start with a fresh state; the accrual clock
    /// starts at load time, so offline periods never back-accrue.
    pub fn account_handle(&self, user_id: UserId) -> Result<Arc<Mutex<Account>>, StorageError> {
        if let Some(handle) = self.accounts.get(&user_id) {
            return Ok(Arc::clone(handle.value()));
        }
        // Store round-trip runs before taking the map entry; shard locks
        // are never held across it.
        let state = match self.store.load_user(user_id)? {
            Some(state) => state,
            None => self.store.create_user(user_id)?,
        };
        let locked = self.store.flags(user_id)?.iter().any(|f| f.review_lock);
        let account = Arc::new(Mutex::new(Account::new(state, locked, unix_millis())));
        // First insert wins if two connections raced the load.
        let handle = self.accounts.entry(user_id).or_insert(account);
        Ok(Arc::clone(handle.value()))
    }

    /// The handle for an already-loaded account, without touching the store.
    pub fn cached_account(&self, user_id: UserId) -> Option<Arc<Mutex<Account>>> {
        self.accounts.get(&user_id).map(|h| Arc::clone(h.value()))
    }

    /// Applies one operation against a locked account, idempotently: a
    /// previously applied operation id replays its receipt unchanged.
    pub fn apply_operation(
        &self,
        account: &mut Account,
        user_id: UserId,
        operation: &Operation,
        now: u64,
    ) -> OperationResult {
        if let Some(status) = account.replay(&operation.id) {
            debug!("Replaying receipt for operation {}", operation.id);
            return OperationResult {
                operation_id: operation.id,
                status,
            };
        }
        let status = match &operation.kind {
            OperationKind::Tap { claimed_earnings } => self.apply_tap(
                account,
                user_id,
                *claimed_earnings,
                operation.client_timestamp,
                now,
            ),
            OperationKind::UpgradePurchase { upgrade } => {
                self.apply_purchase(account, user_id, *upgrade, now)
            }
            OperationKind::FullSync => OperationStatus::FullSyncApplied,
        };
        account.remember(operation.id, &status);
        OperationResult {
            operation_id: operation.id,
            status,
        }
    }

    fn apply_tap(
        &self,
        account: &mut Account,
        user_id: UserId,
        claimed_earnings: u64,
        client_timestamp: u64,
        now: u64,
    ) -> OperationStatus {
        if account.locked {
            return rejected(RejectReason::AccountLocked);
        }
        let rates = derived_rates(&account.state);
        if let Err(reason) =
            self.monitor
                .check_tap(user_id, claimed_earnings, client_timestamp, &rates, now)
        {
            warn!("Rejected tap from user {}: {}", user_id, reason);
            self.escalate(
                account,
                user_id,
                reason,
                format!("tap claimed {} coins", claimed_earnings),
                now,
            );
            return rejected(reason);
        }
        let golden =
            rates.golden_tap_chance > 0.0 && claimed_earnings == rates.golden_tap_earnings;

        let before_total = account.state.total_coins_earned;
        let mut next = account.state.clone();
        next.credit(claimed_earnings);
        let entry = AuditEntry {
            kind: AuditKind::TapEarnings { golden },
            coin_delta: claimed_earnings as i64,
            timestamp: now,
        };
        if let Err(e) = self.store.commit(user_id, &next, entry) {
            error!("Tap commit for user {} failed: {}", user_id, e);
            return OperationStatus::Rejected {
                reason: RejectReason::StorageUnavailable,
                retryable: e.is_retryable(),
            };
        }
        account.state = next;
        // Only committed taps count against the rate window.
        self.monitor.record_accepted_tap(user_id, now);
        self.emit(GameEvent::TapApplied {
            user_id,
            earnings: claimed_earnings,
            golden,
            total_coins_earned: account.state.total_coins_earned,
        });
        self.emit_milestones(user_id, before_total, account.state.total_coins_earned);
        OperationStatus::TapApplied {
            earnings: claimed_earnings,
            golden,
            new_coins: account.state.coins,
            new_total_earned: account.state.total_coins_earned,
        }
    }

    fn apply_purchase(
        &self,
        account: &mut Account,
        user_id: UserId,
        upgrade: UpgradeKind,
        now: u64,
    ) -> OperationStatus {
        if account.locked {
            return rejected(RejectReason::AccountLocked);
        }
        let level = account.state.upgrade_level(upgrade);
        let cost = upgrade.cost_at_level(level);
        let mut next = account.state.clone();
        if !next.debit(cost) {
            debug!(
                "User {} cannot afford {:?} level {} ({} coins)",
                user_id,
                upgrade,
                level + 1,
                cost
            );
            return rejected(RejectReason::InsufficientCoins);
        }
        next.apply_upgrade_effect(upgrade);
        let new_level = next.upgrade_level(upgrade);
        let entry = AuditEntry {
            kind: AuditKind::UpgradePurchase {
                upgrade,
                level: new_level,
            },
            coin_delta: -(cost as i64),
            timestamp: now,
        };
        if let Err(e) = self.store.commit(user_id, &next, entry) {
            error!("Purchase commit for user {} failed: {}", user_id, e);
            return OperationStatus::Rejected {
                reason: RejectReason::StorageUnavailable,
                retryable: e.is_retryable(),
            };
        }
        account.state = next;
        self.emit(GameEvent::UpgradePurchased {
            user_id,
            upgrade,
            new_level,
            cost,
        });
        OperationStatus::PurchaseApplied {
            upgrade,
            new_level,
            cost,
            new_coins: account.state.coins,
        }
    }

    /// Credits auto-clicker earnings for the whole seconds elapsed since the
    /// last accrual. The sub-second remainder stays on the clock. The clock
    /// advances only when the commit succeeds, so an outage loses nothing.
    pub fn accrue_auto_coins(
        &self,
        account: &mut Account,
        user_id: UserId,
        now: u64,
    ) -> Result<u64, StorageError> {
        let elapsed = now.saturating_sub(account.last_accrual_ms);
        let whole_secs = elapsed / 1000;
        if whole_secs == 0 {
            return Ok(0);
        }
        let advanced = account.last_accrual_ms + whole_secs * 1000;
        if account.locked {
            account.last_accrual_ms = advanced;
            return Ok(0);
        }
        let rates = derived_rates(&account.state);
        let earned = rates.auto_coins_per_sec.saturating_mul(whole_secs);
        if earned == 0 {
            account.last_accrual_ms = advanced;
            return Ok(0);
        }

        let before_total = account.state.total_coins_earned;
        let mut next = account.state.clone();
        next.credit(earned);
        let entry = AuditEntry {
            kind: AuditKind::AutoAccrual,
            coin_delta: earned as i64,
            timestamp: now,
        };
        self.store.commit(user_id, &next, entry)?;
        account.last_accrual_ms = advanced;
        account.state = next;
        self.emit(GameEvent::AutoCoinsAccrued {
            user_id,
            amount: earned,
            total_coins_earned: account.state.total_coins_earned,
        });
        self.emit_milestones(user_id, before_total, account.state.total_coins_earned);
        Ok(earned)
    }

    /// Compares the client's carried snapshot against the authoritative one.
    ///
    /// Equal checksums short-circuit as clean. Gaps inside the configured
    /// tolerances (room for in-flight operations) are also clean. Anything
    /// else yields a correction carrying the authoritative snapshot.
    pub fn reconcile(
        &self,
        account: &Account,
        client_state: &UserEconomyState,
        client_checksum: u64,
    ) -> Option<Correction> {
        if client_checksum == account.state.checksum() {
            return None;
        }
        let server = &account.state;
        let mut discrepancies = Vec::new();
        if server.coins.abs_diff(client_state.coins) > self.reconcile_config.coin_tolerance {
            discrepancies.push(Discrepancy::CoinBalance {
                client: client_state.coins,
                server: server.coins,
            });
        }
        if server
            .total_coins_earned
            .abs_diff(client_state.total_coins_earned)
            > self.reconcile_config.total_earned_tolerance
        {
            discrepancies.push(Discrepancy::TotalEarned {
                client: client_state.total_coins_earned,
                server: server.total_coins_earned,
            });
        }
        if client_state.total_coins_earned < client_state.coins {
            discrepancies.push(Discrepancy::EarnedBelowCoins);
        }
        if client_state.coins_per_tap != server.coins_per_tap
            || client_state.auto_clicker_rate != server.auto_clicker_rate
        {
            discrepancies.push(Discrepancy::DerivedStats);
        }
        if discrepancies.is_empty() {
            return None;
        }
        Some(Correction {
            snapshot: server.clone(),
            discrepancies,
        })
    }

    /// A correction that carries the snapshot without claiming divergence,
    /// for explicit full-sync requests.
    pub fn full_snapshot(&self, account: &Account) -> Correction {
        Correction {
            snapshot: account.state.clone(),
            discrepancies: Vec::new(),
        }
    }

    pub fn monitor(&self) -> &CheatMonitor {
        &self.monitor
    }

    fn escalate(
        &self,
        account: &mut Account,
        user_id: UserId,
        reason: RejectReason,
        detail: String,
        now: u64,
    ) {
        let escalation = match self.monitor.report_violation(user_id, reason, detail, now) {
            Some(escalation) => escalation,
            None => return,
        };
        let flag = match escalation {
            Escalation::Flagged(flag) => flag,
            Escalation::Locked(flag) => {
                account.locked = true;
                flag
            }
        };
        let review_lock = flag.review_lock;
        // Flag persistence failure never aborts the rejection itself.
        if let Err(e) = self.store.flag_account(flag) {
            error!("Failed to persist flag for user {}: {}", user_id, e);
        }
        self.emit(GameEvent::AccountFlagged {
            user_id,
            reason,
            review_lock,
        });
    }

    fn emit(&self, event: GameEvent) {
        if self.events.send(event).is_err() {
            warn!("Game event channel closed; dropping event");
        }
    }

    fn emit_milestones(&self, user_id: UserId, before: u64, after: u64) {
        for milestone in milestones_crossed(before, after) {
            self.emit(GameEvent::MilestoneReached { user_id, milestone });
        }
    }
}
