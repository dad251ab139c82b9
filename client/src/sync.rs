//! Operation queueing, envelope flushing, and retry backoff for the sync loop

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use log::{debug, info, warn};
use shared::economy::{UpgradeKind, UserEconomyState};
use shared::protocol::{
    Discrepancy, Operation, OperationKind, OperationStatus, Priority, StateUpdates, SyncEnvelope,
    SyncOutcome, SyncResult,
};
use shared::{UserId, MAX_OPERATIONS_PER_ENVELOPE, MIN_SYNC_INTERVAL_MS};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::state::ClientEconomyState;

/// Ordered, capped queue of operations awaiting an envelope. High priority
/// enters at the front and is never dropped on overflow.
pub struct OperationQueue {
    entries: VecDeque<Operation>,
    cap: usize,
}

impl OperationQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap,
        }
    }

    /// Returns the operation that had to give way, if the queue was full.
    pub fn push(&mut self, operation: Operation) -> Option<Operation> {
        if operation.priority == Priority::High {
            self.entries.push_front(operation);
            return None;
        }
        if self.entries.len() >= self.cap {
            return match self
                .entries
                .iter()
                .position(|op| op.priority == Priority::Normal)
            {
                Some(index) => {
                    let evicted = self.entries.remove(index);
                    self.entries.push_back(operation);
                    evicted
                }
                // Only high-priority work queued; the newcomer is refused.
                None => Some(operation),
            };
        }
        self.entries.push_back(operation);
        None
    }

    /// Returns a retry to the head of the queue, behind any high-priority
    /// work already waiting there.
    pub fn release_front(&mut self, operation: Operation) {
        if operation.priority == Priority::High {
            self.entries.push_front(operation);
            return;
        }
        let at = self
            .entries
            .iter()
            .position(|op| op.priority != Priority::High)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, operation);
    }

    pub fn drain_batch(&mut self, max: usize) -> Vec<Operation> {
        let take = max.min(self.entries.len());
        self.entries.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct ScheduledRetry {
    due_ms: u64,
    seq: u64,
    operation: Operation,
}

impl PartialEq for ScheduledRetry {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}

impl Eq for ScheduledRetry {}

impl PartialOrd for ScheduledRetry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledRetry {
    // Reversed so the earliest due time sits on top of the max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due_ms
            .cmp(&self.due_ms)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Due-time priority queue for failed operations. Collapsing every delay on
/// reconnect is one [`RetryScheduler::make_all_due`] call rather than a pile
/// of timer cancellations.
pub struct RetryScheduler {
    heap: BinaryHeap<ScheduledRetry>,
    seq: u64,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
    max_retries: u32,
}

impl RetryScheduler {
    pub fn new(backoff_base_ms: u64, backoff_max_ms: u64, max_retries: u32) -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
            backoff_base_ms,
            backoff_max_ms,
            max_retries,
        }
    }

    /// Schedules one more attempt with exponential backoff. Hands the
    /// operation back once its retries are spent.
    pub fn schedule(&mut self, mut operation: Operation, now: u64) -> Result<u64, Operation> {
        if operation.retry_count >= self.max_retries {
            return Err(operation);
        }
        operation.retry_count += 1;
        let due_ms = now.saturating_add(self.backoff_delay(operation.retry_count));
        self.seq += 1;
        self.heap.push(ScheduledRetry {
            due_ms,
            seq: self.seq,
            operation,
        });
        Ok(due_ms)
    }

    fn backoff_delay(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(16);
        self.backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.backoff_max_ms)
    }

    /// Pops every operation whose due time has passed, earliest first.
    pub fn due(&mut self, now: u64) -> Vec<Operation> {
        let mut ready = Vec::new();
        while let Some(next) = self.heap.peek() {
            if next.due_ms > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                ready.push(entry.operation);
            }
        }
        ready
    }

    /// Collapses all pending delays, keeping retry counts intact.
    pub fn make_all_due(&mut self, now: u64) {
        let entries: Vec<ScheduledRetry> = self.heap.drain().collect();
        for entry in entries {
            self.seq += 1;
            self.heap.push(ScheduledRetry {
                due_ms: now,
                seq: self.seq,
                operation: entry.operation,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub max_batch: usize,
    pub queue_cap: usize,
    pub flush_interval_ms: u64,
    pub envelope_timeout_ms: u64,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub max_retries: u32,
    pub min_send_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_batch: MAX_OPERATIONS_PER_ENVELOPE,
            queue_cap: 200,
            flush_interval_ms: 500,
            envelope_timeout_ms: 5_000,
            retry_base_ms: 1_000,
            retry_max_ms: 30_000,
            max_retries: 5,
            min_send_interval_ms: MIN_SYNC_INTERVAL_MS,
        }
    }
}

/// What the sync layer reports upward to whoever is driving it.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { user_id: UserId },
    ConnectionLost,
    Corrected { discrepancies: Vec<Discrepancy> },
    OperationsDropped { count: usize },
}

struct PendingEnvelope {
    operations: Vec<Operation>,
    sent_at_ms: u64,
}

/// Drives optimistic prediction, envelope assembly, and reply handling.
/// The network layer owns the timers; this type owns the decisions.
pub struct SyncManager {
    state: ClientEconomyState,
    queue: OperationQueue,
    scheduler: RetryScheduler,
    in_flight: HashMap<Uuid, PendingEnvelope>,
    config: SyncConfig,
    events: mpsc::UnboundedSender<ClientEvent>,
    connected: bool,
    urgent_flush: bool,
    ever_connected: bool,
    last_sent_ms: u64,
}

impl SyncManager {
    pub fn new(config: SyncConfig, events: mpsc::UnboundedSender<ClientEvent>) -> Self {
        Self {
            state: ClientEconomyState::new(),
            queue: OperationQueue::new(config.queue_cap),
            scheduler: RetryScheduler::new(
                config.retry_base_ms,
                config.retry_max_ms,
                config.max_retries,
            ),
            in_flight: HashMap::new(),
            config,
            events,
            connected: false,
            urgent_flush: false,
            ever_connected: false,
            last_sent_ms: 0,
        }
    }

    /// Predicts a tap locally and queues it. Returns the predicted earnings.
    pub fn tap(&mut self, now: u64) -> u64 {
        let rates = self.state.display_rates();
        let golden =
            rates.golden_tap_chance > 0.0 && rand::random::<f64>() < rates.golden_tap_chance;
        let earnings = if golden {
            rates.golden_tap_earnings
        } else {
            rates.coins_per_tap
        };

        let operation = Operation::new(
            OperationKind::Tap {
                claimed_earnings: earnings,
            },
            now,
        );
        self.state.predict_tap(operation.id, earnings);
        if golden {
            debug!("Golden tap! Predicted {} coins", earnings);
        }
        self.enqueue(operation);
        earnings
    }

    /// Predicts a purchase if the displayed balance covers the next level's
    /// cost. Returns false without queueing anything when it does not.
    pub fn purchase(&mut self, upgrade: UpgradeKind, now: u64) -> bool {
        let display = self.state.display();
        let cost = upgrade.cost_at_level(display.upgrade_level(upgrade));
        if display.coins < cost {
            debug!("Cannot afford {:?} at {} coins", upgrade, cost);
            return false;
        }

        let operation = Operation::new(OperationKind::UpgradePurchase { upgrade }, now);
        self.state.predict_purchase(operation.id, upgrade, cost);
        self.enqueue(operation);
        true
    }

    pub fn request_full_sync(&mut self, now: u64) {
        self.enqueue(Operation::new(OperationKind::FullSync, now));
    }

    fn enqueue(&mut self, operation: Operation) {
        if operation.priority == Priority::High {
            self.urgent_flush = true;
        }
        if let Some(dropped) = self.queue.push(operation) {
            warn!("Operation queue full; dropping {:?}", dropped.kind);
            self.state.resolve(dropped.id);
            self.emit(ClientEvent::OperationsDropped { count: 1 });
        }
    }

    /// Assembles the next envelope if one is allowed right now. Urgent work
    /// ignores the minimum send interval.
    pub fn next_envelope(&mut self, now: u64) -> Option<SyncEnvelope> {
        if !self.connected || self.queue.is_empty() {
            return None;
        }
        if !self.urgent_flush
            && now.saturating_sub(self.last_sent_ms) < self.config.min_send_interval_ms
        {
            return None;
        }

        let operations = self.queue.drain_batch(self.config.max_batch);
        if operations.is_empty() {
            return None;
        }
        let envelope = SyncEnvelope::new(operations.clone(), self.state.display(), now);
        self.in_flight.insert(
            envelope.id,
            PendingEnvelope {
                operations,
                sent_at_ms: now,
            },
        );
        self.urgent_flush = false;
        self.last_sent_ms = now;
        Some(envelope)
    }

    pub fn handle_reply(&mut self, result: SyncResult, now: u64) {
        let pending = match self.in_flight.remove(&result.envelope_id) {
            Some(pending) => pending,
            None => {
                debug!("Reply for unknown envelope {}; ignoring", result.envelope_id);
                return;
            }
        };

        if result.outcome == SyncOutcome::Failed {
            let retryable = result.error.as_ref().map_or(true, |error| error.retryable);
            match &result.error {
                Some(error) => warn!("Envelope {} failed: {}", result.envelope_id, error),
                None => warn!("Envelope {} failed", result.envelope_id),
            }
            if retryable {
                // Operations that did apply before the failure are covered
                // by server-side receipts, so resending is harmless.
                self.schedule_retries(pending.operations, now);
            } else {
                let count = pending.operations.len();
                for operation in &pending.operations {
                    self.state.resolve(operation.id);
                }
                if count > 0 {
                    self.emit(ClientEvent::OperationsDropped { count });
                }
            }
            return;
        }

        for op_result in &result.operations {
            match &op_result.status {
                OperationStatus::Rejected {
                    reason,
                    retryable: true,
                } => {
                    if let Some(operation) = pending
                        .operations
                        .iter()
                        .find(|op| op.id == op_result.operation_id)
                    {
                        warn!("Operation {} deferred: {}", op_result.operation_id, reason);
                        self.schedule_retries(vec![operation.clone()], now);
                    }
                }
                OperationStatus::Rejected {
                    reason,
                    retryable: false,
                } => {
                    warn!(
                        "Server rejected operation {}: {}",
                        op_result.operation_id, reason
                    );
                    self.state.resolve(op_result.operation_id);
                    self.emit(ClientEvent::OperationsDropped { count: 1 });
                }
                _ => self.state.resolve(op_result.operation_id),
            }
        }

        if let Some(updates) = &result.updates {
            self.state.apply_updates(updates);
        }

        if let Some(correction) = result.correction {
            if !correction.discrepancies.is_empty() {
                warn!(
                    "Server corrected local state ({} discrepancies)",
                    correction.discrepancies.len()
                );
                self.emit(ClientEvent::Corrected {
                    discrepancies: correction.discrepancies.clone(),
                });
            }
            self.state.force_overwrite(correction.snapshot);
        }
    }

    fn schedule_retries(&mut self, operations: Vec<Operation>, now: u64) {
        let mut dropped = 0;
        for operation in operations {
            match self.scheduler.schedule(operation, now) {
                Ok(due_ms) => debug!("Retry due at {}", due_ms),
                Err(operation) => {
                    warn!(
                        "Giving up on {:?} after {} retries",
                        operation.kind, operation.retry_count
                    );
                    self.state.resolve(operation.id);
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            self.emit(ClientEvent::OperationsDropped { count: dropped });
        }
    }

    /// Times out envelopes whose replies never came and schedules their
    /// operations for retry.
    pub fn expire_envelopes(&mut self, now: u64) {
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, pending)| {
                now.saturating_sub(pending.sent_at_ms) >= self.config.envelope_timeout_ms
            })
            .map(|(id, _)| *id)
            .collect();

        for envelope_id in expired {
            if let Some(pending) = self.in_flight.remove(&envelope_id) {
                warn!(
                    "Envelope {} timed out with {} operations; scheduling retries",
                    envelope_id,
                    pending.operations.len()
                );
                self.schedule_retries(pending.operations, now);
            }
        }
    }

    /// Moves due retries back into the queue, earliest first. Returns how
    /// many were released.
    pub fn release_due_retries(&mut self, now: u64) -> usize {
        let due = self.scheduler.due(now);
        let count = due.len();
        for operation in due.into_iter().rev() {
            self.queue.release_front(operation);
        }
        count
    }

    pub fn on_connected(&mut self, user_id: UserId, snapshot: UserEconomyState, now: u64) {
        self.connected = true;
        if self.ever_connected {
            info!("Reconnected as user {}", user_id);
            // Backoff collapses and a forced full sync leads the next
            // envelope; its correction brings the authoritative snapshot.
            self.scheduler.make_all_due(now);
            self.request_full_sync(now);
        } else {
            info!("Connected as user {}", user_id);
            self.state.seed(snapshot);
        }
        self.ever_connected = true;
        self.emit(ClientEvent::Connected { user_id });
    }

    pub fn on_disconnected(&mut self, now: u64) {
        if !self.connected {
            return;
        }
        self.connected = false;

        let stranded: Vec<PendingEnvelope> =
            self.in_flight.drain().map(|(_, pending)| pending).collect();
        let operations: usize = stranded.iter().map(|p| p.operations.len()).sum();
        if operations > 0 {
            warn!("Connection lost with {} operations in flight", operations);
        }
        for pending in stranded {
            self.schedule_retries(pending.operations, now);
        }
        self.emit(ClientEvent::ConnectionLost);
    }

    pub fn apply_push(&mut self, updates: &StateUpdates) {
        if updates.auto_coins_credited > 0 {
            debug!(
                "Server pushed {} auto-accrued coins",
                updates.auto_coins_credited
            );
        }
        self.state.apply_updates(updates);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn urgent(&self) -> bool {
        self.urgent_flush
    }

    pub fn state(&self) -> &ClientEconomyState {
        &self.state
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}
