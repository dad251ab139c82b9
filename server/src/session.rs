//! Per-connection envelope handling.
//!
//! A session validates each envelope, drives the game service, and shapes
//! the reply. Validation failures short-circuit before any operation runs.
//! Results of applied envelopes are cached so a duplicate envelope id (a
//! client retry that raced the reply) replays the exact same result instead
//! of applying twice.

use std::collections::VecDeque;

use log::{debug, warn};
use shared::protocol::{
    OperationKind, OperationStatus, RejectReason, StateUpdates, SyncEnvelope, SyncError,
    SyncErrorKind, SyncOutcome, SyncResult,
};
use shared::UserId;

use crate::config::SyncLimits;
use crate::game::GameService;

/// Applied-envelope results kept for duplicate detection.
const RECENT_RESULTS: usize = 16;

/// State for one authenticated connection.
pub struct SyncSession {
    user_id: UserId,
    limits: SyncLimits,
    last_sync_ms: Option<u64>,
    recent: VecDeque<SyncResult>,
}

impl SyncSession {
    pub fn new(user_id: UserId, limits: SyncLimits) -> Self {
        Self {
            user_id,
            limits,
            last_sync_ms: None,
            recent: VecDeque::new(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Processes one envelope end to end and returns the reply to send.
    ///
    /// Order matters: operations apply first, then reconciliation against
    /// the client's carried snapshot, then the auto-clicker accrual. Running
    /// the accrual last keeps server-side credits the client has not seen
    /// out of the comparison.
    pub async fn handle_envelope(
        &mut self,
        game: &GameService,
        envelope: SyncEnvelope,
        now: u64,
    ) -> SyncResult {
        if let Some(result) = self.recent.iter().find(|r| r.envelope_id == envelope.id) {
            debug!(
                "Duplicate envelope {} from user {}; replaying cached result",
                envelope.id, self.user_id
            );
            return result.clone();
        }
        if let Some(error) = self.validate(&envelope, now) {
            debug!(
                "Refused envelope {} from user {}: {}",
                envelope.id, self.user_id, error
            );
            return SyncResult::failed(envelope.id, error, now);
        }

        let handle = match game.account_handle(self.user_id) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Account load for user {} failed: {}", self.user_id, e);
                let error =
                    SyncError::new(SyncErrorKind::StorageUnavailable, e.is_retryable(), e.to_string());
                return SyncResult::failed(envelope.id, error, now);
            }
        };
        let mut account = handle.lock().await;
        account.last_envelope_ms = now;

        let mut operations = Vec::with_capacity(envelope.operations.len());
        let mut storage_failed = false;
        for operation in &envelope.operations {
            let result = game.apply_operation(&mut account, self.user_id, operation, now);
            let aborted = matches!(
                result.status,
                OperationStatus::Rejected {
                    reason: RejectReason::StorageUnavailable,
                    retryable: true,
                }
            );
            operations.push(result);
            if aborted {
                warn!(
                    "Storage failure mid-envelope for user {}; aborting the remainder",
                    self.user_id
                );
                storage_failed = true;
                break;
            }
        }
        if storage_failed {
            // Not cached and the sync clock does not advance: the client
            // retries the same envelope id and gets a fresh attempt.
            let error = SyncError::new(
                SyncErrorKind::StorageUnavailable,
                true,
                "storage failed while applying operations",
            );
            let mut result = SyncResult::failed(envelope.id, error, now);
            result.operations = operations;
            return result;
        }

        let force_full = envelope
            .operations
            .iter()
            .any(|op| matches!(op.kind, OperationKind::FullSync));
        let mut correction =
            game.reconcile(&account, &envelope.client_state, envelope.client_checksum);
        if force_full && correction.is_none() {
            correction = Some(game.full_snapshot(&account));
        }

        let auto_coins = match game.accrue_auto_coins(&mut account, self.user_id, now) {
            Ok(amount) => amount,
            Err(e) => {
                // Accrual rides along; its failure never fails the envelope.
                warn!("Auto accrual for user {} failed: {}", self.user_id, e);
                0
            }
        };

        let purchased = operations
            .iter()
            .any(|r| matches!(r.status, OperationStatus::PurchaseApplied { .. }));
        let updates =
            StateUpdates::from_state(&account.state, auto_coins, purchased || force_full);
        drop(account);

        let outcome = match &correction {
            Some(correction) => {
                if !correction.discrepancies.is_empty() {
                    warn!(
                        "Corrected user {} ({} discrepancies)",
                        self.user_id,
                        correction.discrepancies.len()
                    );
                }
                SyncOutcome::Corrected
            }
            None => SyncOutcome::Success,
        };
        self.last_sync_ms = Some(now);

        let result = SyncResult {
            envelope_id: envelope.id,
            outcome,
            operations,
            updates: Some(updates),
            correction,
            error: None,
            timestamp: now,
        };
        self.remember(result.clone());
        result
    }

    fn validate(&self, envelope: &SyncEnvelope, now: u64) -> Option<SyncError> {
        if envelope.operations.len() > self.limits.max_operations_per_envelope {
            return Some(SyncError::new(
                SyncErrorKind::OversizedBatch,
                false,
                format!(
                    "{} operations exceed the limit of {}",
                    envelope.operations.len(),
                    self.limits.max_operations_per_envelope
                ),
            ));
        }
        if envelope.client_checksum != envelope.client_state.checksum() {
            return Some(SyncError::new(
                SyncErrorKind::Malformed,
                false,
                "checksum does not match the carried state",
            ));
        }
        if envelope
            .timestamp
            .saturating_add(self.limits.envelope_max_age_ms)
            < now
        {
            return Some(SyncError::new(
                SyncErrorKind::TimestampOutOfRange,
                false,
                "envelope timestamp is too old",
            ));
        }
        if envelope.timestamp > now.saturating_add(self.limits.envelope_max_future_ms) {
            return Some(SyncError::new(
                SyncErrorKind::TimestampOutOfRange,
                false,
                "envelope timestamp is in the future",
            ));
        }
        if let Some(last) = self.last_sync_ms {
            let since = now.saturating_sub(last);
            if since < self.limits.min_sync_interval_ms {
                return Some(SyncError::new(
                    SyncErrorKind::SyncIntervalViolation,
                    true,
                    format!(
                        "{} ms since the previous envelope; minimum is {} ms",
                        since, self.limits.min_sync_interval_ms
                    ),
                ));
            }
        }
        None
    }

    fn remember(&mut self, result: SyncResult) {
        self.recent.push_back(result);
        if self.recent.len() > RECENT_RESULTS {
            self.recent.pop_front();
        }
    }
}
