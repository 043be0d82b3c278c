//! SQL queries for the API. All read-only.
use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::{
    DailyRankRow, GlobalRankRow, NewWalletRow, NewWalletsPage, PlatformStats, XpBucketCount,
};

const STATS_COLUMNS: &str = "snapshot_date, total_wallets, total_xp, new_wallets, new_xp";

fn stats_from_row(r: &Row<'_>) -> rusqlite::Result<PlatformStats> {
    Ok(PlatformStats {
        snapshot_date: r.get(0)?,
        total_wallets: r.get(1)?,
        total_xp: r.get(2)?,
        new_wallets: r.get(3)?,
        new_xp: r.get(4)?,
    })
}

/// Stats for `date`, or the newest row when `date` is `None`.
pub fn platform_stats(conn: &Connection, date: Option<NaiveDate>) -> Result<Option<PlatformStats>> {
    let row = match date {
        Some(d) => conn
            .query_row(
                &format!("SELECT {STATS_COLUMNS} FROM platform_stats WHERE snapshot_date = ?1"),
                [d.to_string()],
                stats_from_row,
            )
            .optional()?,
        None => conn
            .query_row(
                &format!(
                    "SELECT {STATS_COLUMNS} FROM platform_stats ORDER BY snapshot_date DESC LIMIT 1"
                ),
                [],
                stats_from_row,
            )
            .optional()?,
    };
    Ok(row)
}

pub fn all_platform_stats(conn: &Connection) -> Result<Vec<PlatformStats>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STATS_COLUMNS} FROM platform_stats ORDER BY snapshot_date DESC"
    ))?;
    let rows = stmt
        .query_map([], stats_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn global_rank(conn: &Connection, date: NaiveDate, limit: i64) -> Result<Vec<GlobalRankRow>> {
    let mut stmt = conn.prepare(
        "SELECT u.wallet_address, s.total_xp, s.xp_rank
         FROM user_snapshots s
         JOIN users u ON u.id = s.user_id
         WHERE s.snapshot_date = ?1 AND s.xp_rank IS NOT NULL
         ORDER BY s.total_xp DESC, s.xp_rank ASC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![date.to_string(), limit], |r| {
            Ok(GlobalRankRow {
                wallet_address: r.get(0)?,
                total_xp: r.get(1)?,
                xp_rank: r.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Daily XP gainers among wallets ranked on `date`.
pub fn daily_rank(conn: &Connection, date: NaiveDate, limit: i64) -> Result<Vec<DailyRankRow>> {
    let mut stmt = conn.prepare(
        "SELECT u.wallet_address, c.xp_change
         FROM user_daily_changes c
         JOIN users u ON u.id = c.user_id
         JOIN user_snapshots s
           ON s.user_id = c.user_id AND s.snapshot_date = c.snapshot_date
         WHERE c.snapshot_date = ?1 AND s.xp_rank IS NOT NULL
         ORDER BY c.xp_change DESC, u.wallet_address ASC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![date.to_string(), limit], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows
        .into_iter()
        .zip(1..)
        .map(|((wallet_address, xp_change), position)| DailyRankRow {
            position,
            wallet_address,
            xp_change,
        })
        .collect())
}

// Ranked, positive XP on `date`, no snapshot the day before.
const NEW_WALLETS_WHERE: &str = "
    FROM user_snapshots s
    JOIN users u ON u.id = s.user_id
    WHERE s.snapshot_date = ?1
      AND s.xp_rank IS NOT NULL
      AND s.total_xp > 0
      AND NOT EXISTS (
          SELECT 1 FROM user_snapshots p
          WHERE p.user_id = s.user_id AND p.snapshot_date = ?2
      )";

pub fn new_wallets(
    conn: &Connection,
    date: NaiveDate,
    offset: i64,
    limit: i64,
) -> Result<NewWalletsPage> {
    let day = date.to_string();
    let prev = date.pred_opt().unwrap_or(date).to_string();

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) {NEW_WALLETS_WHERE}"),
        params![day, prev],
        |r| r.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT u.wallet_address, s.total_xp, s.xp_rank {NEW_WALLETS_WHERE}
         ORDER BY s.total_xp DESC, u.wallet_address ASC
         LIMIT ?3 OFFSET ?4"
    ))?;
    let items = stmt
        .query_map(params![day, prev, limit, offset], |r| {
            Ok(NewWalletRow {
                wallet_address: r.get(0)?,
                total_xp: r.get(1)?,
                xp_rank: r.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(NewWalletsPage { total, items })
}

pub fn xp_distribution(conn: &Connection, date: NaiveDate) -> Result<Vec<XpBucketCount>> {
    let mut stmt = conn.prepare(
        "SELECT total_xp FROM user_snapshots
         WHERE snapshot_date = ?1 AND xp_rank IS NOT NULL AND total_xp != 0",
    )?;
    let xps = stmt
        .query_map([date.to_string()], |r| r.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(common::types::xp_distribution(xps))
}
