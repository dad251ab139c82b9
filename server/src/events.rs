//! Typed game events and the worker task that fans them out to collaborators.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use shared::economy::UpgradeKind;
use shared::protocol::RejectReason;
use shared::UserId;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Lifetime-earnings thresholds announced as milestones.
pub const MILESTONES: [u64; 6] = [
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
];

/// Everything noteworthy the game service produces.
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    /// A validated tap credited coins
    TapApplied {
        user_id: UserId,
        earnings: u64,
        golden: bool,
        total_coins_earned: u64,
    },
    /// An upgrade purchase went through
    UpgradePurchased {
        user_id: UserId,
        upgrade: UpgradeKind,
        new_level: u32,
        cost: u64,
    },
    /// Lifetime earnings passed a fixed threshold
    MilestoneReached { user_id: UserId, milestone: u64 },
    /// The periodic accrual credited auto-clicker coins
    AutoCoinsAccrued {
        user_id: UserId,
        amount: u64,
        total_coins_earned: u64,
    },
    /// Anti-cheat escalated an account
    AccountFlagged {
        user_id: UserId,
        reason: RejectReason,
        review_lock: bool,
    },
}

/// Milestones passed when lifetime earnings move from `before` to `after`.
pub fn milestones_crossed(before: u64, after: u64) -> Vec<u64> {
    MILESTONES
        .iter()
        .copied()
        .filter(|&m| before < m && after >= m)
        .collect()
}

#[derive(Debug, Error)]
pub enum RankingError {
    #[error("ranking unavailable: {0}")]
    Unavailable(String),
}

/// Leaderboard collaborator. Updates are best-effort; a failure here never
/// fails the operation that produced the score.
pub trait RankingService: Send + Sync {
    fn update_score(&self, user_id: UserId, total_earned: u64) -> Result<(), RankingError>;
    fn top(&self, n: usize) -> Vec<(UserId, u64)>;
}

/// In-memory [`RankingService`] for demos and tests.
#[derive(Default)]
pub struct MemoryRanking {
    scores: Mutex<HashMap<UserId, u64>>,
}

impl MemoryRanking {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RankingService for MemoryRanking {
    fn update_score(&self, user_id: UserId, total_earned: u64) -> Result<(), RankingError> {
        let mut scores = self.scores.lock().unwrap_or_else(|p| p.into_inner());
        let entry = scores.entry(user_id).or_insert(0);
        // Lifetime earnings only grow; ignore out-of-order updates.
        if total_earned > *entry {
            *entry = total_earned;
        }
        Ok(())
    }

    fn top(&self, n: usize) -> Vec<(UserId, u64)> {
        let scores = self.scores.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<(UserId, u64)> = scores.iter().map(|(&u, &s)| (u, s)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries.truncate(n);
        entries
    }
}

/// Spawns the worker that drains the event channel and forwards earnings
/// totals to the ranking service. Exits when every sender is dropped.
pub fn spawn_event_worker(
    mut events: mpsc::UnboundedReceiver<GameEvent>,
    ranking: Arc<dyn RankingService>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                GameEvent::TapApplied {
                    user_id,
                    total_coins_earned,
                    ..
                }
                | GameEvent::AutoCoinsAccrued {
                    user_id,
                    total_coins_earned,
                    ..
                } => {
                    if let Err(e) = ranking.update_score(user_id, total_coins_earned) {
                        warn!("Ranking update for user {} failed: {}", user_id, e);
                    }
                }
                GameEvent::MilestoneReached { user_id, milestone } => {
                    info!("User {} reached {} total coins earned", user_id, milestone);
                }
                GameEvent::UpgradePurchased {
                    user_id,
                    upgrade,
                    new_level,
                    cost,
                } => {
                    debug!(
                        "User {} bought {:?} level {} for {} coins",
                        user_id, upgrade, new_level, cost
                    );
                }
                GameEvent::AccountFlagged {
                    user_id,
                    reason,
                    review_lock,
                } => {
                    if review_lock {
                        warn!("User {} review-locked ({})", user_id, reason);
                    } else {
                        warn!("User {} flagged ({})", user_id, reason);
                    }
                }
            }
        }
        debug!("Game event channel closed; event worker exiting");
    })
}
