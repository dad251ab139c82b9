use shared::economy::{derived_rates, DerivedRates, UpgradeKind, UserEconomyState};
use shared::protocol::StateUpdates;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PendingDelta {
    pub operation_id: Uuid,
    pub coin_delta: i64,
    pub earned_delta: u64,
    pub upgrade: Option<UpgradeKind>,
}

pub struct ClientEconomyState {
    confirmed: UserEconomyState,
    pending: Vec<PendingDelta>,
}

impl ClientEconomyState {
    pub fn new() -> Self {
        Self {
            confirmed: UserEconomyState::new(),
            pending: Vec::new(),
        }
    }

    pub fn seed(&mut self, snapshot: UserEconomyState) {
        self.confirmed = snapshot;
        self.pending.clear();
    }

    pub fn confirmed(&self) -> &UserEconomyState {
        &self.confirmed
    }

    /// Confirmed state with every unacknowledged local action folded on top.
    pub fn display(&self) -> UserEconomyState {
        let mut state = self.confirmed.clone();
        for delta in &self.pending {
            state.coins = state.coins.saturating_add_signed(delta.coin_delta);
            state.total_coins_earned = state.total_coins_earned.saturating_add(delta.earned_delta);
            if let Some(upgrade) = delta.upgrade {
                state.apply_upgrade_effect(upgrade);
            }
        }
        state
    }

    pub fn display_rates(&self) -> DerivedRates {
        derived_rates(&self.display())
    }

    pub fn predict_tap(&mut self, operation_id: Uuid, earnings: u64) {
        self.pending.push(PendingDelta {
            operation_id,
            coin_delta: earnings as i64,
            earned_delta: earnings,
            upgrade: None,
        });
    }

    pub fn predict_purchase(&mut self, operation_id: Uuid, upgrade: UpgradeKind, cost: u64) {
        self.pending.push(PendingDelta {
            operation_id,
            coin_delta: -(cost as i64),
            earned_delta: 0,
            upgrade: Some(upgrade),
        });
    }

    pub fn resolve(&mut self, operation_id: Uuid) {
        self.pending
            .retain(|delta| delta.operation_id != operation_id);
    }

    /// Server counters are absolute values, not deltas.
    pub fn apply_updates(&mut self, updates: &StateUpdates) {
        self.confirmed.coins = updates.coins;
        self.confirmed.total_coins_earned = updates.total_coins_earned;
        self.confirmed.coins_per_tap = updates.coins_per_tap;
        self.confirmed.auto_clicker_rate = updates.auto_clicker_rate;
        if let Some(upgrades) = &updates.upgrades {
            self.confirmed.upgrades = upgrades.clone();
        }
    }

    pub fn force_overwrite(&mut self, snapshot: UserEconomyState) {
        self.confirmed = snapshot;
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for ClientEconomyState {
    fn default() -> Self {
        Self::new()
    }
}
