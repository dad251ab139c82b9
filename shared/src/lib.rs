use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod economy;
pub mod protocol;

pub const PROTOCOL_VERSION: u32 = 1;

pub const PRESTIGE_BONUS_PER_LEVEL: f64 = 0.1;
pub const GOLDEN_TAP_MULTIPLIER: u64 = 10;
pub const BASE_GOLDEN_TAP_CHANCE: f64 = 0.0;
pub const GOLDEN_TAP_CHANCE_PER_LUCK_LEVEL: f64 = 0.01;
pub const GOLDEN_TAP_CHANCE_CEILING: f64 = 0.25;

pub const TAP_RATE_WINDOW_MS: u64 = 1000;
pub const MAX_TAPS_PER_WINDOW: usize = 20;
pub const MAX_OPERATIONS_PER_ENVELOPE: usize = 50;
pub const MIN_SYNC_INTERVAL_MS: u64 = 250;

pub const MAX_FRAME_BYTES: u32 = 64 * 1024;

pub type UserId = u64;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
