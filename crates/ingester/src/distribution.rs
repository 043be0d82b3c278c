use anyhow::{Context, Result};
use common::types::{xp_distribution, LeaderboardEntry, XpBucketCount};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};

/// XP histogram of ranked, non-zero-XP records in a raw log, without touching
/// the store.
pub async fn distribution_from_log(path: &Path) -> Result<Vec<XpBucketCount>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut xps = Vec::new();
    let mut unparseable = 0usize;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LeaderboardEntry>(&line) {
            Ok(e) if e.total_xp != 0 && e.xp_rank.is_some() => xps.push(e.total_xp),
            Ok(_) => {}
            Err(_) => unparseable += 1,
        }
    }
    if unparseable > 0 {
        tracing::warn!(unparseable, path = %path.display(), "skipped unparseable lines");
    }
    Ok(xp_distribution(xps))
}
