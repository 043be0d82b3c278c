//! Response bodies for the query API. No DB or business logic here.
use serde::Serialize;

pub use common::types::{PlatformStats, XpBucketCount};

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
}

/// Row of the total-XP leaderboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalRankRow {
    pub wallet_address: String,
    pub total_xp: i64,
    pub xp_rank: i64,
}

/// Row of the daily XP-change leaderboard. `position` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyRankRow {
    pub position: i64,
    pub wallet_address: String,
    pub xp_change: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewWalletRow {
    pub wallet_address: String,
    pub total_xp: i64,
    pub xp_rank: i64,
}

#[derive(Debug, Serialize)]
pub struct NewWalletsPage {
    /// Matches before pagination.
    pub total: i64,
    pub items: Vec<NewWalletRow>,
}
