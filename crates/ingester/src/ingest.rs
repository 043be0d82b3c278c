//! Batch diff/upsert of a daily leaderboard log into the store.
//!
//! Each batch is one SQLite transaction: wallet identities, snapshot rows, and
//! day-over-day change rows against the prior calendar day.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use common::db::{is_transient, AsyncDb};
use common::types::LeaderboardEntry;
use rusqlite::{params, ToSql, Transaction};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::fetch::date_from_log_name;

const SAMPLE_CHARS: usize = 500;
const PRIOR_LOOKUP_CHUNK: usize = 900;

#[derive(Debug, Error)]
#[error("batch {batch} failed after {attempts} attempt(s): {source:#}; sample: {sample}")]
pub struct BatchError {
    pub batch: usize,
    pub attempts: u32,
    /// First line of the batch, truncated.
    pub sample: String,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Clone, Copy)]
pub struct IngestConfig {
    pub base_batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub tvl_ceiling: f64,
}

impl IngestConfig {
    pub fn from_ingest(ingest: &common::config::Ingest) -> Self {
        Self {
            base_batch_size: ingest.base_batch_size,
            max_retries: ingest.max_retries,
            retry_backoff: Duration::from_millis(ingest.retry_backoff_ms),
            tvl_ceiling: ingest.tvl_ceiling,
        }
    }
}

/// Larger logs get larger batches.
pub fn batch_size_for(total_lines: usize, base: usize) -> usize {
    if total_lines > 200_000 {
        4000
    } else if total_lines > 100_000 {
        3000
    } else {
        base
    }
}

/// NaN becomes 0; everything else is pinned to `[0, ceiling]`.
pub fn clamp_tvl(value: f64, ceiling: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, ceiling)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Delta {
    pub xp: i64,
    pub tvl: f64,
}

impl Delta {
    pub fn is_zero(&self) -> bool {
        self.xp == 0 && self.tvl == 0.0
    }
}

/// Change against the prior day's `(total_xp, tvl_total_usd)`; a wallet with no
/// prior snapshot is compared against zeros.
pub fn compute_delta(current: &LeaderboardEntry, prior: Option<(i64, f64)>, ceiling: f64) -> Delta {
    let (prior_xp, prior_tvl) = prior.unwrap_or((0, 0.0));
    Delta {
        xp: current.total_xp.saturating_sub(prior_xp),
        tvl: clamp_tvl(current.tvl_total_usd, ceiling) - clamp_tvl(prior_tvl, ceiling),
    }
}

/// Explicit date wins, then the record's `dateStr`, then the log file name.
pub fn resolve_snapshot_date(
    explicit: Option<NaiveDate>,
    first: Option<&LeaderboardEntry>,
    from_file: Option<NaiveDate>,
) -> Option<NaiveDate> {
    explicit
        .or_else(|| first.and_then(LeaderboardEntry::snapshot_date))
        .or(from_file)
}

#[derive(Debug, Default)]
struct ParsedBatch {
    records: Vec<LeaderboardEntry>,
    skipped: usize,
}

/// Parse non-blank lines. Later duplicates of a wallet replace earlier ones.
fn parse_lines(batch: usize, lines: &[String]) -> ParsedBatch {
    let mut out = ParsedBatch::default();
    let mut index: HashMap<String, usize> = HashMap::new();
    for (n, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry: LeaderboardEntry = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(batch, line = n, error = %e, "skipping unparseable line");
                out.skipped += 1;
                continue;
            }
        };
        let Some(wallet) = entry.wallet_address.clone().filter(|w| !w.is_empty()) else {
            tracing::warn!(batch, line = n, "skipping record without walletAddress");
            out.skipped += 1;
            continue;
        };
        match index.get(&wallet) {
            Some(&i) => out.records[i] = entry,
            None => {
                index.insert(wallet, out.records.len());
                out.records.push(entry);
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub records: usize,
    pub skipped_lines: usize,
    pub snapshots: usize,
    pub changes: usize,
    /// Store attempts the commit took; 0 when nothing was written.
    pub attempts: u32,
}

fn upsert_users(tx: &Transaction<'_>, records: &[LeaderboardEntry]) -> Result<Vec<i64>> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO users (wallet_address, referred_by, referral_count)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(wallet_address) DO UPDATE SET
            referred_by = excluded.referred_by,
            referral_count = excluded.referral_count,
            updated_at = datetime('now')
         RETURNING id",
    )?;
    records
        .iter()
        .map(|r| {
            Ok(stmt.query_row(
                params![r.wallet_address, r.referred_by, r.referral_count],
                |row| row.get(0),
            )?)
        })
        .collect()
}

fn prior_snapshots(
    tx: &Transaction<'_>,
    user_ids: &[i64],
    prior_date: &str,
) -> Result<HashMap<i64, (i64, f64)>> {
    let mut out = HashMap::with_capacity(user_ids.len());
    for chunk in user_ids.chunks(PRIOR_LOOKUP_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let sql = format!(
            "SELECT user_id, total_xp, tvl_total_usd FROM user_snapshots
             WHERE snapshot_date = ?1 AND user_id IN ({placeholders})"
        );
        let mut stmt = tx.prepare(&sql)?;
        let mut args: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() + 1);
        args.push(&prior_date);
        args.extend(chunk.iter().map(|id| id as &dyn ToSql));
        let rows = stmt.query_map(args.as_slice(), |row| {
            Ok((row.get::<_, i64>(0)?, (row.get(1)?, row.get(2)?)))
        })?;
        for row in rows {
            let (id, prior) = row?;
            out.insert(id, prior);
        }
    }
    Ok(out)
}

const UPSERT_SNAPSHOT: &str = "
INSERT INTO user_snapshots (
    user_id, snapshot_date, bridged_total, swap_volume, swap_count,
    tvl_total_usd, real_tvl_usd, protocols_used, longest_swap_streak_weeks,
    adjustment_points, protectors_points, badge_points, user_self_xp,
    referral_bonus_xp, total_xp, xp_rank, longest_tvl_streak,
    staking_points, staking_bonus, staking_total_tokens
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
ON CONFLICT(user_id, snapshot_date) DO UPDATE SET
    bridged_total = excluded.bridged_total,
    swap_volume = excluded.swap_volume,
    swap_count = excluded.swap_count,
    tvl_total_usd = excluded.tvl_total_usd,
    real_tvl_usd = excluded.real_tvl_usd,
    protocols_used = excluded.protocols_used,
    longest_swap_streak_weeks = excluded.longest_swap_streak_weeks,
    adjustment_points = excluded.adjustment_points,
    protectors_points = excluded.protectors_points,
    badge_points = excluded.badge_points,
    user_self_xp = excluded.user_self_xp,
    referral_bonus_xp = excluded.referral_bonus_xp,
    total_xp = excluded.total_xp,
    xp_rank = excluded.xp_rank,
    longest_tvl_streak = excluded.longest_tvl_streak,
    staking_points = excluded.staking_points,
    staking_bonus = excluded.staking_bonus,
    staking_total_tokens = excluded.staking_total_tokens,
    updated_at = datetime('now')
";

const UPSERT_CHANGE: &str = "
INSERT INTO user_daily_changes (user_id, snapshot_date, xp_change, tvl_change)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(user_id, snapshot_date) DO UPDATE SET
    xp_change = excluded.xp_change,
    tvl_change = excluded.tvl_change,
    updated_at = datetime('now')
";

/// Apply one parsed batch in a single transaction. Dropping the transaction on
/// any error path rolls it back.
fn apply_batch(
    conn: &mut rusqlite::Connection,
    date: NaiveDate,
    records: &[LeaderboardEntry],
    tvl_ceiling: f64,
) -> Result<(usize, usize)> {
    let day = date.format("%Y-%m-%d").to_string();
    let prior_day = date
        .pred_opt()
        .context("snapshot date has no prior day")?
        .format("%Y-%m-%d")
        .to_string();

    let tx = conn.transaction()?;
    let user_ids = upsert_users(&tx, records)?;
    let prior = prior_snapshots(&tx, &user_ids, &prior_day)?;

    let mut changes = 0usize;
    {
        let mut snap = tx.prepare_cached(UPSERT_SNAPSHOT)?;
        let mut change = tx.prepare_cached(UPSERT_CHANGE)?;
        for (r, &user_id) in records.iter().zip(&user_ids) {
            snap.execute(params![
                user_id,
                day,
                r.bridged_total,
                r.swap_volume,
                r.swap_count,
                clamp_tvl(r.tvl_total_usd, tvl_ceiling),
                clamp_tvl(r.real_tvl_usd, tvl_ceiling),
                r.protocols_used,
                r.longest_swap_streak_weeks,
                r.adjustment_points,
                r.protectors_points,
                r.badge_points,
                r.user_self_xp,
                r.referral_bonus_xp,
                r.total_xp,
                r.xp_rank,
                r.longest_tvl_streak,
                r.staking_points,
                r.staking_bonus,
                r.staking_total_tokens,
            ])?;

            let delta = compute_delta(r, prior.get(&user_id).copied(), tvl_ceiling);
            if !delta.is_zero() {
                change.execute(params![user_id, day, delta.xp, delta.tvl])?;
                changes += 1;
            }
        }
    }
    tx.commit()?;
    Ok((records.len(), changes))
}

fn sample_of(lines: &[String]) -> String {
    lines
        .iter()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .map(|l| l.chars().take(SAMPLE_CHARS).collect())
        .unwrap_or_else(|| "<empty>".to_string())
}

/// Parse and upsert one batch, retrying transient store errors with linear
/// backoff. `date` of `None` means "take it from the first record".
pub async fn process_batch(
    db: &AsyncDb,
    batch: usize,
    lines: &[String],
    date: Option<NaiveDate>,
    cfg: &IngestConfig,
) -> Result<(NaiveDate, BatchStats), BatchError> {
    let parsed = parse_lines(batch, lines);
    let fail = |attempts: u32, source: anyhow::Error| BatchError {
        batch,
        attempts,
        sample: sample_of(lines),
        source,
    };

    let Some(date) = resolve_snapshot_date(date, parsed.records.first(), None) else {
        return Err(fail(0, anyhow::anyhow!("no snapshot date for batch")));
    };

    let mut stats = BatchStats {
        records: parsed.records.len(),
        skipped_lines: parsed.skipped,
        ..BatchStats::default()
    };
    if parsed.records.is_empty() {
        return Ok((date, stats));
    }

    let records = Arc::new(parsed.records);
    let ceiling = cfg.tvl_ceiling;
    let mut attempt = 1u32;
    loop {
        let records = Arc::clone(&records);
        let res = db
            .call_named("ingest.batch", move |conn| {
                apply_batch(conn, date, &records, ceiling)
            })
            .await;
        match res {
            Ok((snapshots, changes)) => {
                stats.snapshots = snapshots;
                stats.changes = changes;
                stats.attempts = attempt;
                return Ok((date, stats));
            }
            Err(e) if attempt < cfg.max_retries && is_transient(&e) => {
                tracing::warn!(batch, attempt, error = %e, "transient store error; retrying batch");
                tokio::time::sleep(cfg.retry_backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(fail(attempt, e)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub lines: usize,
    pub batch_size: usize,
    pub batches_ok: usize,
    pub batches_failed: usize,
    pub records: usize,
    pub skipped_lines: usize,
    pub snapshots_upserted: usize,
    pub changes_upserted: usize,
    pub snapshot_dates: BTreeSet<NaiveDate>,
}

async fn count_lines(path: &Path) -> Result<usize> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut n = 0usize;
    while lines.next_line().await?.is_some() {
        n += 1;
    }
    Ok(n)
}

/// Ingest a JSONL log batch by batch. A failed batch is logged and skipped.
///
/// The snapshot date is `date` when given; otherwise each batch's first record
/// (`dateStr`), falling back to the `YYYYMMDD_` prefix of the file name.
pub async fn ingest_file(
    db: &AsyncDb,
    path: &Path,
    date: Option<NaiveDate>,
    cfg: &IngestConfig,
) -> Result<IngestReport> {
    let total = count_lines(path).await?;
    let batch_size = batch_size_for(total, cfg.base_batch_size);
    let file_date = date_from_log_name(path);
    let mut report = IngestReport {
        lines: total,
        batch_size,
        ..IngestReport::default()
    };
    tracing::info!(path = %path.display(), lines = total, batch_size, "ingest starting");

    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut batch_no = 0usize;
    loop {
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            match lines.next_line().await? {
                Some(line) => batch.push(line),
                None => break,
            }
        }
        if batch.is_empty() {
            break;
        }
        batch_no += 1;

        let first = batch
            .iter()
            .find(|l| !l.trim().is_empty())
            .and_then(|l| serde_json::from_str::<LeaderboardEntry>(l).ok());
        let batch_date = resolve_snapshot_date(date, first.as_ref(), file_date);

        match process_batch(db, batch_no, &batch, batch_date, cfg).await {
            Ok((day, stats)) => {
                report.batches_ok += 1;
                report.records += stats.records;
                report.skipped_lines += stats.skipped_lines;
                report.snapshots_upserted += stats.snapshots;
                report.changes_upserted += stats.changes;
                if stats.records > 0 {
                    report.snapshot_dates.insert(day);
                }
                metrics::counter!("leaderboard_ingest_batches_total", "status" => "ok").increment(1);
                metrics::counter!("leaderboard_snapshots_upserted_total")
                    .increment(stats.snapshots as u64);
                metrics::counter!("leaderboard_changes_upserted_total")
                    .increment(stats.changes as u64);
                tracing::debug!(
                    batch = batch_no,
                    records = stats.records,
                    changes = stats.changes,
                    attempts = stats.attempts,
                    "batch committed"
                );
            }
            Err(e) => {
                report.batches_failed += 1;
                metrics::counter!("leaderboard_ingest_batches_total", "status" => "failed").increment(1);
                tracing::error!(batch = e.batch, attempts = e.attempts, sample = %e.sample, error = %e.source, "batch skipped");
            }
        }
    }

    tracing::info!(
        batches_ok = report.batches_ok,
        batches_failed = report.batches_failed,
        snapshots = report.snapshots_upserted,
        changes = report.changes_upserted,
        skipped_lines = report.skipped_lines,
        "ingest finished"
    );
    Ok(report)
}
