use anyhow::{Context, Result};
use chrono::NaiveDate;
use common::db::AsyncDb;
use common::types::PlatformStats;
use rusqlite::{params, OptionalExtension};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateOutcome {
    Updated(PlatformStats),
    /// No ranked, non-zero-XP snapshots for the date. Nothing was written.
    Skipped,
}

fn update_platform_stats_sync(
    conn: &mut rusqlite::Connection,
    date: NaiveDate,
) -> Result<AggregateOutcome> {
    let day = date.format("%Y-%m-%d").to_string();
    let prior_day = date
        .pred_opt()
        .context("snapshot date has no prior day")?
        .format("%Y-%m-%d")
        .to_string();

    let tx = conn.transaction()?;
    let (total_wallets, total_xp): (i64, i64) = tx.query_row(
        "SELECT COUNT(*), COALESCE(SUM(total_xp), 0)
         FROM user_snapshots
         WHERE snapshot_date = ?1 AND xp_rank IS NOT NULL AND total_xp <> 0",
        params![day],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    if total_wallets == 0 {
        return Ok(AggregateOutcome::Skipped);
    }

    let (prior_wallets, prior_xp): (i64, i64) = tx
        .query_row(
            "SELECT total_wallets, total_xp FROM platform_stats WHERE snapshot_date = ?1",
            params![prior_day],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .unwrap_or((0, 0));

    let stats = PlatformStats {
        snapshot_date: day,
        total_wallets,
        total_xp,
        new_wallets: total_wallets - prior_wallets,
        new_xp: total_xp - prior_xp,
    };
    tx.execute(
        "INSERT INTO platform_stats (snapshot_date, total_wallets, total_xp, new_wallets, new_xp)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(snapshot_date) DO UPDATE SET
            total_wallets = excluded.total_wallets,
            total_xp = excluded.total_xp,
            new_wallets = excluded.new_wallets,
            new_xp = excluded.new_xp,
            updated_at = datetime('now')",
        params![
            stats.snapshot_date,
            stats.total_wallets,
            stats.total_xp,
            stats.new_wallets,
            stats.new_xp
        ],
    )?;
    tx.commit()?;
    Ok(AggregateOutcome::Updated(stats))
}

/// Recompute the platform totals for `date` and their change since the prior
/// day's stored row.
pub async fn update_platform_stats(db: &AsyncDb, date: NaiveDate) -> Result<AggregateOutcome> {
    let outcome = db
        .call_named("platform_stats.update", move |conn| {
            update_platform_stats_sync(conn, date)
        })
        .await?;

    match &outcome {
        AggregateOutcome::Updated(s) => {
            metrics::counter!("leaderboard_platform_stats_updates_total", "outcome" => "updated")
                .increment(1);
            tracing::info!(
                date = %s.snapshot_date,
                total_wallets = s.total_wallets,
                new_wallets = s.new_wallets,
                "platform stats updated"
            );
        }
        AggregateOutcome::Skipped => {
            metrics::counter!("leaderboard_platform_stats_updates_total", "outcome" => "skipped")
                .increment(1);
            tracing::warn!(%date, "no qualifying snapshots; platform stats skipped");
        }
    }
    Ok(outcome)
}
