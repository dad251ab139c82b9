use crate::{
    BASE_GOLDEN_TAP_CHANCE, GOLDEN_TAP_CHANCE_CEILING, GOLDEN_TAP_CHANCE_PER_LUCK_LEVEL,
    GOLDEN_TAP_MULTIPLIER, PRESTIGE_BONUS_PER_LEVEL,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Purchasable upgrade lines offered by the game economy
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpgradeKind {
    TapPower,
    AutoClicker,
    GoldenLuck,
}

impl UpgradeKind {
    pub const ALL: [UpgradeKind; 3] = [
        UpgradeKind::TapPower,
        UpgradeKind::AutoClicker,
        UpgradeKind::GoldenLuck,
    ];

    fn base_cost(&self) -> u64 {
        match self {
            UpgradeKind::TapPower => 50,
            UpgradeKind::AutoClicker => 200,
            UpgradeKind::GoldenLuck => 500,
        }
    }

    fn cost_growth(&self) -> f64 {
        match self {
            UpgradeKind::TapPower => 1.15,
            UpgradeKind::AutoClicker => 1.2,
            UpgradeKind::GoldenLuck => 1.3,
        }
    }

    /// Cost of buying the next level when `owned_levels` are already held.
    /// Deterministic on both sides: base * growth^level, floored to whole coins.
    pub fn cost_at_level(&self, owned_levels: u32) -> u64 {
        floor_coins(self.base_cost() as f64 * self.cost_growth().powi(owned_levels as i32))
    }
}

/// Authoritative economy state for a single user account
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UserEconomyState {
    pub coins: u64,
    pub total_coins_earned: u64,
    pub coins_per_tap: u64,
    pub auto_clicker_rate: u64,
    pub upgrades: HashMap<UpgradeKind, u32>,
    pub prestige_level: u32,
    pub event_multiplier: f64,
    pub achievement_multiplier: f64,
}

impl UserEconomyState {
    pub fn new() -> Self {
        Self {
            coins: 0,
            total_coins_earned: 0,
            coins_per_tap: 1,
            auto_clicker_rate: 0,
            upgrades: HashMap::new(),
            prestige_level: 0,
            event_multiplier: 1.0,
            achievement_multiplier: 1.0,
        }
    }

    pub fn upgrade_level(&self, kind: UpgradeKind) -> u32 {
        self.upgrades.get(&kind).copied().unwrap_or(0)
    }

    /// Credits earnings to the spendable balance and the lifetime total
    /// together, preserving `total_coins_earned >= coins`.
    pub fn credit(&mut self, earned: u64) {
        self.coins = self.coins.saturating_add(earned);
        self.total_coins_earned = self.total_coins_earned.saturating_add(earned);
    }

    /// Debits the spendable balance. Returns false and leaves the state
    /// untouched when the balance cannot cover the cost.
    pub fn debit(&mut self, cost: u64) -> bool {
        if self.coins < cost {
            return false;
        }
        self.coins -= cost;
        true
    }

    /// Raises `kind` by one level and applies its denormalized stat effect.
    /// GoldenLuck has no direct stat; its level feeds the golden-tap chance.
    pub fn apply_upgrade_effect(&mut self, kind: UpgradeKind) {
        *self.upgrades.entry(kind).or_insert(0) += 1;
        match kind {
            UpgradeKind::TapPower => self.coins_per_tap = self.coins_per_tap.saturating_add(1),
            UpgradeKind::AutoClicker => {
                self.auto_clicker_rate = self.auto_clicker_rate.saturating_add(1)
            }
            UpgradeKind::GoldenLuck => {}
        }
    }

    pub fn invariants_hold(&self) -> bool {
        self.total_coins_earned >= self.coins && self.coins_per_tap >= 1
    }

    /// FNV-1a 64 over the sync-critical counters, little-endian byte order.
    /// Advisory drift signal for reconciliation only.
    pub fn checksum(&self) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for value in [
            self.coins,
            self.total_coins_earned,
            self.coins_per_tap,
            self.auto_clicker_rate,
        ] {
            for byte in value.to_le_bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        hash
    }
}

impl Default for UserEconomyState {
    fn default() -> Self {
        Self::new()
    }
}

/// Effective per-action rates derived from a state snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedRates {
    pub coins_per_tap: u64,
    pub auto_coins_per_sec: u64,
    pub golden_tap_chance: f64,
    pub golden_tap_earnings: u64,
}

/// Computes the effective rates identically on client and server.
///
/// Multipliers compose multiplicatively: prestige bonus, then event, then
/// achievement. Monetary outputs floor to whole coins and the effective
/// coins-per-tap never drops below 1. Golden taps pay a fixed multiple of
/// the effective tap value.
pub fn derived_rates(state: &UserEconomyState) -> DerivedRates {
    let multiplier = (1.0 + f64::from(state.prestige_level) * PRESTIGE_BONUS_PER_LEVEL)
        * state.event_multiplier
        * state.achievement_multiplier;

    let coins_per_tap = floor_coins(state.coins_per_tap as f64 * multiplier).max(1);
    let auto_coins_per_sec = floor_coins(state.auto_clicker_rate as f64 * multiplier);

    let luck = f64::from(state.upgrade_level(UpgradeKind::GoldenLuck));
    let golden_tap_chance = (BASE_GOLDEN_TAP_CHANCE + luck * GOLDEN_TAP_CHANCE_PER_LUCK_LEVEL)
        .min(GOLDEN_TAP_CHANCE_CEILING);

    DerivedRates {
        coins_per_tap,
        auto_coins_per_sec,
        golden_tap_chance,
        golden_tap_earnings: coins_per_tap.saturating_mul(GOLDEN_TAP_MULTIPLIER),
    }
}

// Floor for coin amounts. Binary rounding can leave a product like
// 10 * (1 + 2 * 0.1) a fraction below the whole number; the slack keeps
// whole coins whole without promoting genuinely fractional values.
fn floor_coins(value: f64) -> u64 {
    (value + 1e-9).floor().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_new_state_defaults() {
        let state = UserEconomyState::new();
        assert_eq!(state.coins, 0);
        assert_eq!(state.total_coins_earned, 0);
        assert_eq!(state.coins_per_tap, 1);
        assert_eq!(state.auto_clicker_rate, 0);
        assert!(state.upgrades.is_empty());
        assert_eq!(state.prestige_level, 0);
        assert_approx_eq!(state.event_multiplier, 1.0);
        assert_approx_eq!(state.achievement_multiplier, 1.0);
        assert!(state.invariants_hold());
    }

    #[test]
    fn test_credit_raises_balance_and_lifetime_together() {
        let mut state = UserEconomyState::new();
        state.credit(25);
        state.credit(5);
        assert_eq!(state.coins, 30);
        assert_eq!(state.total_coins_earned, 30);
        assert!(state.invariants_hold());
    }

    #[test]
    fn test_debit_leaves_lifetime_total_untouched() {
        let mut state = UserEconomyState::new();
        state.credit(100);
        assert!(state.debit(40));
        assert_eq!(state.coins, 60);
        assert_eq!(state.total_coins_earned, 100);
        assert!(state.invariants_hold());
    }

    #[test]
    fn test_debit_rejects_insufficient_balance() {
        let mut state = UserEconomyState::new();
        state.credit(10);
        assert!(!state.debit(11));
        assert_eq!(state.coins, 10);
    }

    #[test]
    fn test_upgrade_cost_curve() {
        assert_eq!(UpgradeKind::TapPower.cost_at_level(0), 50);
        assert_eq!(UpgradeKind::TapPower.cost_at_level(1), 57);
        assert_eq!(UpgradeKind::AutoClicker.cost_at_level(0), 200);
        assert_eq!(UpgradeKind::GoldenLuck.cost_at_level(0), 500);

        for kind in UpgradeKind::ALL {
            for level in 0..10 {
                assert!(kind.cost_at_level(level + 1) > kind.cost_at_level(level));
            }
        }
    }

    #[test]
    fn test_apply_upgrade_effect_tap_power() {
        let mut state = UserEconomyState::new();
        state.apply_upgrade_effect(UpgradeKind::TapPower);
        state.apply_upgrade_effect(UpgradeKind::TapPower);
        assert_eq!(state.upgrade_level(UpgradeKind::TapPower), 2);
        assert_eq!(state.coins_per_tap, 3);
    }

    #[test]
    fn test_apply_upgrade_effect_auto_clicker() {
        let mut state = UserEconomyState::new();
        state.apply_upgrade_effect(UpgradeKind::AutoClicker);
        assert_eq!(state.upgrade_level(UpgradeKind::AutoClicker), 1);
        assert_eq!(state.auto_clicker_rate, 1);
    }

    #[test]
    fn test_apply_upgrade_effect_golden_luck_changes_no_stats() {
        let mut state = UserEconomyState::new();
        state.apply_upgrade_effect(UpgradeKind::GoldenLuck);
        assert_eq!(state.upgrade_level(UpgradeKind::GoldenLuck), 1);
        assert_eq!(state.coins_per_tap, 1);
        assert_eq!(state.auto_clicker_rate, 0);
    }

    #[test]
    fn test_derived_rates_for_fresh_account() {
        let rates = derived_rates(&UserEconomyState::new());
        assert_eq!(rates.coins_per_tap, 1);
        assert_eq!(rates.auto_coins_per_sec, 0);
        assert_approx_eq!(rates.golden_tap_chance, 0.0);
        assert_eq!(rates.golden_tap_earnings, GOLDEN_TAP_MULTIPLIER);
    }

    #[test]
    fn test_derived_rates_compose_multipliers() {
        let mut state = UserEconomyState::new();
        state.coins_per_tap = 5;
        state.auto_clicker_rate = 10;
        state.event_multiplier = 2.0;
        state.achievement_multiplier = 1.5;

        let rates = derived_rates(&state);
        assert_eq!(rates.coins_per_tap, 15);
        assert_eq!(rates.auto_coins_per_sec, 30);
        assert_eq!(rates.golden_tap_earnings, 150);
    }

    #[test]
    fn test_derived_rates_prestige_bonus_keeps_whole_coins() {
        let mut state = UserEconomyState::new();
        state.coins_per_tap = 10;
        state.prestige_level = 2;

        let rates = derived_rates(&state);
        assert_eq!(rates.coins_per_tap, 12);
        assert_eq!(rates.golden_tap_earnings, 120);
    }

    #[test]
    fn test_derived_rates_floor_never_drops_below_one() {
        let mut state = UserEconomyState::new();
        state.event_multiplier = 0.25;

        let rates = derived_rates(&state);
        assert_eq!(rates.coins_per_tap, 1);
    }

    #[test]
    fn test_golden_chance_scales_with_luck_level() {
        let mut state = UserEconomyState::new();
        assert_approx_eq!(derived_rates(&state).golden_tap_chance, 0.0);

        state.upgrades.insert(UpgradeKind::GoldenLuck, 3);
        assert_approx_eq!(derived_rates(&state).golden_tap_chance, 0.03);
    }

    #[test]
    fn test_golden_chance_clamped_at_ceiling() {
        let mut state = UserEconomyState::new();
        state.upgrades.insert(UpgradeKind::GoldenLuck, 500);
        assert_approx_eq!(
            derived_rates(&state).golden_tap_chance,
            GOLDEN_TAP_CHANCE_CEILING
        );
    }

    #[test]
    fn test_checksum_deterministic_for_equal_counters() {
        let mut a = UserEconomyState::new();
        let mut b = UserEconomyState::new();
        a.credit(1234);
        b.credit(1234);
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_checksum_changes_when_balance_changes() {
        let mut state = UserEconomyState::new();
        let before = state.checksum();
        state.credit(1);
        assert_ne!(before, state.checksum());
    }

    #[test]
    fn test_checksum_ignores_fields_outside_sync_counters() {
        let mut a = UserEconomyState::new();
        let mut b = UserEconomyState::new();
        b.prestige_level = 7;
        b.event_multiplier = 3.0;
        b.upgrades.insert(UpgradeKind::GoldenLuck, 2);
        assert_eq!(a.checksum(), b.checksum());
        a.coins_per_tap = 2;
        assert_ne!(a.checksum(), b.checksum());
    }
}
