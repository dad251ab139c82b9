//! Anti-cheat validation for tap operations.
//!
//! The monitor keeps two concurrent maps:
//! - Per-user sliding windows of accepted tap timestamps (rate limiting)
//! - Per-(user, violation) suspicion records (escalation bookkeeping)
//!
//! Checks run in a fixed order: rate, timestamp age, timestamp skew, then
//! earnings plausibility. A rejected operation never touches the economy.
//! Repeat violations of one kind inside a rolling window escalate to a
//! persisted account flag, and at a higher threshold to a review lock.
//! Idle windows and expired suspicion records are pruned by a timer sweep.

use std::collections::VecDeque;

use dashmap::DashMap;
use shared::economy::DerivedRates;
use shared::protocol::RejectReason;
use shared::UserId;

use crate::config::AntiCheatConfig;
use crate::store::{AccountFlag, ViolationSample};

/// Sliding window of accepted tap timestamps for one user.
#[derive(Debug, Default)]
struct TapWindow {
    accepted: VecDeque<u64>,
    last_activity_ms: u64,
}

impl TapWindow {
    fn prune(&mut self, window_ms: u64, now: u64) {
        while let Some(&front) = self.accepted.front() {
            if front.saturating_add(window_ms) <= now {
                self.accepted.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Violation bookkeeping for one (user, reason) pair.
#[derive(Debug)]
struct SuspicionRecord {
    count: u32,
    window_started_ms: u64,
    last_violation_ms: u64,
    samples: Vec<ViolationSample>,
}

impl SuspicionRecord {
    fn new(now: u64) -> Self {
        Self {
            count: 0,
            window_started_ms: now,
            last_violation_ms: now,
            samples: Vec::new(),
        }
    }
}

/// Result of a violation report that crossed a threshold.
#[derive(Debug, Clone)]
pub enum Escalation {
    /// Count reached the flag threshold; persist the flag, keep serving.
    Flagged(AccountFlag),
    /// Count reached the lock threshold; persist and freeze the account.
    Locked(AccountFlag),
}

/// Stateful validator shared by every connection.
pub struct CheatMonitor {
    config: AntiCheatConfig,
    /// Accepted-tap windows, keyed by user.
    tap_windows: DashMap<UserId, TapWindow>,
    /// Escalation counters, keyed by user and violation kind.
    suspicions: DashMap<(UserId, RejectReason), SuspicionRecord>,
}

impl CheatMonitor {
    pub fn new(config: AntiCheatConfig) -> Self {
        Self {
            config,
            tap_windows: DashMap::new(),
            suspicions: DashMap::new(),
        }
    }

    /// Validates a tap before it touches the economy.
    ///
    /// `claimed_earnings` must exactly match the derived base earnings, or
    /// the derived golden earnings when the user's golden chance is nonzero.
    /// Anything else is treated as forged.
    pub fn check_tap(
        &self,
        user_id: UserId,
        claimed_earnings: u64,
        client_timestamp: u64,
        rates: &DerivedRates,
        now: u64,
    ) -> Result<(), RejectReason> {
        if !self.tap_rate_ok(user_id, now) {
            return Err(RejectReason::TapRateExceeded);
        }
        if client_timestamp.saturating_add(self.config.tap_max_age_ms) < now {
            return Err(RejectReason::StaleTimestamp);
        }
        if client_timestamp > now.saturating_add(self.config.tap_max_future_ms) {
            return Err(RejectReason::FutureTimestamp);
        }
        let golden_possible = rates.golden_tap_chance > 0.0;
        let plausible = claimed_earnings == rates.coins_per_tap
            || (golden_possible && claimed_earnings == rates.golden_tap_earnings);
        if !plausible {
            return Err(RejectReason::ForgedEarnings);
        }
        Ok(())
    }

    /// Records a tap that passed validation and committed. Only committed
    /// taps count against the rate window.
    pub fn record_accepted_tap(&self, user_id: UserId, now: u64) {
        let mut window = self.tap_windows.entry(user_id).or_default();
        window.last_activity_ms = now;
        window.prune(self.config.tap_window_ms, now);
        window.accepted.push_back(now);
    }

    /// Counts a violation and reports whether it crossed an escalation
    /// threshold. The count restarts once the rolling window elapses.
    pub fn report_violation(
        &self,
        user_id: UserId,
        reason: RejectReason,
        detail: String,
        now: u64,
    ) -> Option<Escalation> {
        let mut record = self
            .suspicions
            .entry((user_id, reason))
            .or_insert_with(|| SuspicionRecord::new(now));
        if now.saturating_sub(record.window_started_ms) >= self.config.suspicion_ttl_ms {
            record.count = 0;
            record.samples.clear();
            record.window_started_ms = now;
        }
        record.count += 1;
        record.last_violation_ms = now;
        if record.samples.len() < self.config.max_incident_samples {
            record.samples.push(ViolationSample {
                timestamp: now,
                detail,
            });
        }

        let build_flag = |record: &SuspicionRecord, review_lock: bool| AccountFlag {
            user_id,
            reason,
            violation_count: record.count,
            samples: record.samples.clone(),
            flagged_at: now,
            review_lock,
        };
        if record.count == self.config.lock_threshold {
            Some(Escalation::Locked(build_flag(&record, true)))
        } else if record.count == self.config.flag_threshold {
            Some(Escalation::Flagged(build_flag(&record, false)))
        } else {
            None
        }
    }

    /// Evicts idle tap windows and expired suspicion records.
    pub fn prune(&self, now: u64) {
        let idle_ttl = self.config.idle_window_ttl_ms;
        self.tap_windows
            .retain(|_, window| now.saturating_sub(window.last_activity_ms) < idle_ttl);
        let suspicion_ttl = self.config.suspicion_ttl_ms;
        self.suspicions
            .retain(|_, record| now.saturating_sub(record.last_violation_ms) < suspicion_ttl);
    }

    /// Number of users with a live tap window.
    pub fn tracked_windows(&self) -> usize {
        self.tap_windows.len()
    }

    /// Number of live suspicion records.
    pub fn tracked_suspicions(&self) -> usize {
        self.suspicions.len()
    }

    fn tap_rate_ok(&self, user_id: UserId, now: u64) -> bool {
        let mut window = self.tap_windows.entry(user_id).or_default();
        window.last_activity_ms = now;
        window.prune(self.config.tap_window_ms, now);
        window.accepted.len() < self.config.max_taps_per_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> CheatMonitor {
        CheatMonitor::new(AntiCheatConfig::default())
    }

    fn base_rates() -> DerivedRates {
        DerivedRates {
            coins_per_tap: 1,
            auto_coins_per_sec: 0,
            golden_tap_chance: 0.0,
            golden_tap_earnings: 10,
        }
    }

    fn lucky_rates() -> DerivedRates {
        DerivedRates {
            coins_per_tap: 1,
            auto_coins_per_sec: 0,
            golden_tap_chance: 0.01,
            golden_tap_earnings: 10,
        }
    }

    #[test]
    fn test_accepts_taps_up_to_window_capacity() {
        let monitor = monitor();
        let now = 1_000_000;
        for _ in 0..20 {
            assert!(monitor.check_tap(1, 1, now, &base_rates(), now).is_ok());
            monitor.record_accepted_tap(1, now);
        }
        assert_eq!(
            monitor.check_tap(1, 1, now, &base_rates(), now),
            Err(RejectReason::TapRateExceeded)
        );
    }

    #[test]
    fn test_rate_window_slides() {
        let monitor = monitor();
        for _ in 0..20 {
            monitor.record_accepted_tap(1, 1_000);
        }
        assert_eq!(
            monitor.check_tap(1, 1, 1_500, &base_rates(), 1_500),
            Err(RejectReason::TapRateExceeded)
        );
        // All 20 drop out once the window has fully passed.
        assert!(monitor.check_tap(1, 1, 2_000, &base_rates(), 2_000).is_ok());
    }

    #[test]
    fn test_rate_windows_are_per_user() {
        let monitor = monitor();
        for _ in 0..20 {
            monitor.record_accepted_tap(1, 1_000);
        }
        assert!(monitor.check_tap(2, 1, 1_000, &base_rates(), 1_000).is_ok());
    }

    #[test]
    fn test_rejects_stale_timestamp() {
        let monitor = monitor();
        assert_eq!(
            monitor.check_tap(1, 1, 0, &base_rates(), 61_000),
            Err(RejectReason::StaleTimestamp)
        );
        // Exactly at the age bound is still acceptable.
        assert!(monitor.check_tap(1, 1, 1_000, &base_rates(), 61_000).is_ok());
    }

    #[test]
    fn test_rejects_future_timestamp() {
        let monitor = monitor();
        let now = 100_000;
        assert_eq!(
            monitor.check_tap(1, 1, now + 1_501, &base_rates(), now),
            Err(RejectReason::FutureTimestamp)
        );
        assert!(monitor
            .check_tap(1, 1, now + 1_000, &base_rates(), now)
            .is_ok());
    }

    #[test]
    fn test_rejects_forged_earnings() {
        let monitor = monitor();
        let now = 100_000;
        assert_eq!(
            monitor.check_tap(1, 3, now, &base_rates(), now),
            Err(RejectReason::ForgedEarnings)
        );
        // Golden value without any golden luck is forged too.
        assert_eq!(
            monitor.check_tap(1, 10, now, &base_rates(), now),
            Err(RejectReason::ForgedEarnings)
        );
    }

    #[test]
    fn test_golden_earnings_accepted_with_luck() {
        let monitor = monitor();
        let now = 100_000;
        assert!(monitor.check_tap(1, 10, now, &lucky_rates(), now).is_ok());
        assert!(monitor.check_tap(1, 1, now, &lucky_rates(), now).is_ok());
        assert_eq!(
            monitor.check_tap(1, 7, now, &lucky_rates(), now),
            Err(RejectReason::ForgedEarnings)
        );
    }

    #[test]
    fn test_escalates_to_flag_at_threshold() {
        let monitor = monitor();
        for _ in 0..4 {
            let escalation =
                monitor.report_violation(1, RejectReason::ForgedEarnings, "claimed 99".into(), 0);
            assert!(escalation.is_none());
        }
        match monitor.report_violation(1, RejectReason::ForgedEarnings, "claimed 99".into(), 0) {
            Some(Escalation::Flagged(flag)) => {
                assert_eq!(flag.user_id, 1);
                assert_eq!(flag.violation_count, 5);
                assert_eq!(flag.samples.len(), 5);
                assert!(!flag.review_lock);
            }
            other => panic!("Expected flag escalation, got {:?}", other),
        }
        // The sixth violation is past the threshold, not on it.
        assert!(monitor
            .report_violation(1, RejectReason::ForgedEarnings, "claimed 99".into(), 0)
            .is_none());
    }

    #[test]
    fn test_escalates_to_lock_with_bounded_samples() {
        let monitor = monitor();
        let mut escalations = Vec::new();
        for i in 0..20 {
            if let Some(e) =
                monitor.report_violation(1, RejectReason::TapRateExceeded, format!("burst {}", i), 0)
            {
                escalations.push(e);
            }
        }
        assert_eq!(escalations.len(), 2);
        match &escalations[1] {
            Escalation::Locked(flag) => {
                assert!(flag.review_lock);
                assert_eq!(flag.violation_count, 20);
                assert_eq!(flag.samples.len(), 10);
            }
            other => panic!("Expected lock escalation, got {:?}", other),
        }
    }

    #[test]
    fn test_violation_kinds_count_separately() {
        let monitor = monitor();
        for _ in 0..4 {
            monitor.report_violation(1, RejectReason::ForgedEarnings, String::new(), 0);
        }
        // A different violation kind starts from zero.
        assert!(monitor
            .report_violation(1, RejectReason::TapRateExceeded, String::new(), 0)
            .is_none());
    }

    #[test]
    fn test_suspicion_window_resets_after_ttl() {
        let monitor = monitor();
        for _ in 0..4 {
            monitor.report_violation(1, RejectReason::ForgedEarnings, String::new(), 0);
        }
        // One rolling day later the old count no longer applies.
        let escalation =
            monitor.report_violation(1, RejectReason::ForgedEarnings, String::new(), 86_400_000);
        assert!(escalation.is_none());
    }

    #[test]
    fn test_prune_evicts_idle_state() {
        let monitor = monitor();
        monitor.record_accepted_tap(1, 0);
        monitor.report_violation(1, RejectReason::ForgedEarnings, String::new(), 0);
        assert_eq!(monitor.tracked_windows(), 1);
        assert_eq!(monitor.tracked_suspicions(), 1);

        monitor.prune(300_000);
        assert_eq!(monitor.tracked_windows(), 0);
        assert_eq!(monitor.tracked_suspicions(), 1);

        monitor.prune(86_400_000);
        assert_eq!(monitor.tracked_suspicions(), 0);
    }
}
