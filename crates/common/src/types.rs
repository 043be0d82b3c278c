use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// JSON key used to deduplicate feed records.
pub const WALLET_KEY: &str = "walletAddress";

/// Wallet address of a raw feed record, if present and a string.
pub fn wallet_key(record: &Value) -> Option<&str> {
    record.get(WALLET_KEY).and_then(Value::as_str)
}

/// One row of the upstream leaderboard, as written to the daily JSONL log.
///
/// Numeric fields arrive as numbers or numeric strings depending on the
/// upstream serializer; anything unparseable becomes 0. Only `xp_rank` keeps
/// its null.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub wallet_address: Option<String>,
    pub referred_by: Option<String>,
    #[serde(default, deserialize_with = "de_lenient_i64")]
    pub referral_count: i64,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub bridged_total: f64,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub swap_volume: f64,
    #[serde(default, deserialize_with = "de_lenient_i64")]
    pub swap_count: i64,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub tvl_total_usd: f64,
    #[serde(default, deserialize_with = "de_lenient_f64")]
    pub real_tvl_usd: f64,
    #[serde(default, deserialize_with = "de_lenient_i64")]
    pub protocols_used: i64,
    #[serde(default, deserialize_with = "de_lenient_i64")]
    pub longest_swap_streak_weeks: i64,
    #[serde(default, deserialize_with = "de_lenient_i64")]
    pub adjustment_points: i64,
    #[serde(
        rename = "protectorsOfPlumePoints",
        default,
        deserialize_with = "de_lenient_i64"
    )]
    pub protectors_points: i64,
    #[serde(default, deserialize_with = "de_lenient_i64")]
    pub badge_points: i64,
    #[serde(default, deserialize_with = "de_lenient_i64")]
    pub user_self_xp: i64,
    #[serde(default, deserialize_with = "de_lenient_i64")]
    pub referral_bonus_xp: i64,
    #[serde(default, deserialize_with = "de_lenient_i64")]
    pub total_xp: i64,
    #[serde(default, deserialize_with = "de_opt_lenient_i64")]
    pub xp_rank: Option<i64>,
    #[serde(default, deserialize_with = "de_lenient_i64")]
    pub longest_tvl_streak: i64,
    #[serde(
        rename = "plumeStakingPointsEarned",
        default,
        deserialize_with = "de_lenient_i64"
    )]
    pub staking_points: i64,
    #[serde(
        rename = "plumeStakingBonusPointsEarned",
        default,
        deserialize_with = "de_lenient_i64"
    )]
    pub staking_bonus: i64,
    #[serde(
        rename = "currentPlumeStakingTotalTokens",
        default,
        deserialize_with = "de_lenient_i64"
    )]
    pub staking_total_tokens: i64,
    /// Upstream snapshot label, `YYYY-MM-DD_<suffix>`.
    pub date_str: Option<String>,
}

impl LeaderboardEntry {
    /// Snapshot date carried by `dateStr`, if it parses.
    pub fn snapshot_date(&self) -> Option<NaiveDate> {
        let raw = self.date_str.as_deref()?;
        let day = raw.split('_').next()?;
        NaiveDate::parse_from_str(day.trim(), "%Y-%m-%d").ok()
    }
}

/// Platform-wide aggregate for one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformStats {
    pub snapshot_date: String,
    pub total_wallets: i64,
    pub total_xp: i64,
    pub new_wallets: i64,
    pub new_xp: i64,
}

/// XP histogram buckets as `(label, min, max)`, bounds inclusive.
pub const XP_BUCKETS: [(&str, i64, i64); 6] = [
    ("1 - 9999", 1, 9_999),
    ("10000 - 49999", 10_000, 49_999),
    ("50000 - 99999", 50_000, 99_999),
    ("100000 - 199999", 100_000, 199_999),
    ("200000 - 299999", 200_000, 299_999),
    ("300000+", 300_000, i64::MAX),
];

/// Index into [`XP_BUCKETS`]; `None` for zero or negative XP.
pub fn xp_bucket(xp: i64) -> Option<usize> {
    XP_BUCKETS
        .iter()
        .position(|&(_, min, max)| (min..=max).contains(&xp))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct XpBucketCount {
    pub range: String,
    pub wallets: i64,
}

/// Per-bucket counts in bucket order, empty buckets included.
pub fn xp_distribution(xps: impl IntoIterator<Item = i64>) -> Vec<XpBucketCount> {
    let mut counts = [0i64; XP_BUCKETS.len()];
    for xp in xps {
        if let Some(i) = xp_bucket(xp) {
            counts[i] += 1;
        }
    }
    XP_BUCKETS
        .iter()
        .zip(counts)
        .map(|(&(label, _, _), wallets)| XpBucketCount {
            range: label.to_string(),
            wallets,
        })
        .collect()
}

fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

fn value_as_f64(v: &Value) -> Option<f64> {
    let f = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    f.is_finite().then_some(f)
}

fn de_lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(de_opt_lenient_i64(deserializer)?.unwrap_or(0))
}

fn de_opt_lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(deserializer)?;
    Ok(v.as_ref().and_then(value_as_i64))
}

fn de_lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(deserializer)?;
    Ok(v.as_ref().and_then(value_as_f64).unwrap_or(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_entry() {
        let json = r#"{
            "walletAddress": "0xabc",
            "referredBy": "0xref",
            "referralCount": 4,
            "bridgedTotal": "1500.25",
            "swapVolume": 320.5,
            "swapCount": 12,
            "tvlTotalUsd": "200.0",
            "realTvlUsd": 180.0,
            "protocolsUsed": 3,
            "longestSwapStreakWeeks": 2,
            "adjustmentPoints": 0,
            "protectorsOfPlumePoints": 50,
            "badgePoints": 25,
            "userSelfXp": 900,
            "referralBonusXp": 100,
            "totalXp": 1075,
            "xpRank": 42,
            "longestTvlStreak": 5,
            "plumeStakingPointsEarned": 7,
            "plumeStakingBonusPointsEarned": 1,
            "currentPlumeStakingTotalTokens": "1000",
            "dateStr": "2025-09-28_00"
        }"#;
        let e: LeaderboardEntry = serde_json::from_str(json).unwrap();
        assert_eq!(e.wallet_address.as_deref(), Some("0xabc"));
        assert_eq!(e.referral_count, 4);
        assert!((e.bridged_total - 1500.25).abs() < 1e-9);
        assert!((e.tvl_total_usd - 200.0).abs() < 1e-9);
        assert_eq!(e.protectors_points, 50);
        assert_eq!(e.total_xp, 1075);
        assert_eq!(e.xp_rank, Some(42));
        assert_eq!(e.staking_total_tokens, 1000);
        assert_eq!(
            e.snapshot_date(),
            NaiveDate::from_ymd_opt(2025, 9, 28)
        );
    }

    #[test]
    fn test_missing_and_garbage_numbers_default_to_zero() {
        let json = r#"{"walletAddress":"0xabc","totalXp":"n/a","tvlTotalUsd":null,"swapCount":true}"#;
        let e: LeaderboardEntry = serde_json::from_str(json).unwrap();
        assert_eq!(e.total_xp, 0);
        assert_eq!(e.tvl_total_usd, 0.0);
        assert_eq!(e.swap_count, 0);
        assert_eq!(e.bridged_total, 0.0);
        assert_eq!(e.xp_rank, None);
        assert_eq!(e.snapshot_date(), None);
    }

    #[test]
    fn test_fractional_points_truncate() {
        let json = r#"{"walletAddress":"0xabc","totalXp":150.9,"badgePoints":"12.5"}"#;
        let e: LeaderboardEntry = serde_json::from_str(json).unwrap();
        assert_eq!(e.total_xp, 150);
        assert_eq!(e.badge_points, 12);
    }

    #[test]
    fn test_xp_buckets_edges() {
        assert_eq!(xp_bucket(0), None);
        assert_eq!(xp_bucket(-5), None);
        assert_eq!(xp_bucket(1), Some(0));
        assert_eq!(xp_bucket(9_999), Some(0));
        assert_eq!(xp_bucket(10_000), Some(1));
        assert_eq!(xp_bucket(299_999), Some(4));
        assert_eq!(xp_bucket(5_000_000), Some(5));
    }

    #[test]
    fn test_xp_distribution_keeps_empty_buckets() {
        let dist = xp_distribution([5, 9_000, 120_000, 0]);
        assert_eq!(dist.len(), 6);
        assert_eq!(dist[0].wallets, 2);
        assert_eq!(dist[1].wallets, 0);
        assert_eq!(dist[3].range, "100000 - 199999");
        assert_eq!(dist[3].wallets, 1);
    }

    #[test]
    fn test_wallet_key_requires_string() {
        let with: Value = serde_json::json!({"walletAddress": "0xabc"});
        let numeric: Value = serde_json::json!({"walletAddress": 12});
        let without: Value = serde_json::json!({"totalXp": 1});
        assert_eq!(wallet_key(&with), Some("0xabc"));
        assert_eq!(wallet_key(&numeric), None);
        assert_eq!(wallet_key(&without), None);
    }
}
