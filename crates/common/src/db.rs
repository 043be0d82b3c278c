use anyhow::Result;
use rusqlite::Connection;

/// Store failures callers need to tell apart from ordinary SQL errors.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database connection closed")]
    ConnectionClosed,
}

pub struct Database {
    pub conn: Connection,
}

/// Async database wrapper around `tokio_rusqlite::Connection`.
///
/// Runs all SQLite operations on a dedicated background thread via
/// `tokio_rusqlite`, keeping the Tokio runtime cooperative. Clone is
/// cheap (shared mpsc sender to the background thread).
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open a database at `path`, set PRAGMAs (WAL, foreign keys, busy_timeout),
    /// and create the schema, all on the background thread.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;

        // Schema creation needs the write lock. The web process or an admin
        // sqlite3 session may hold it briefly, so back off instead of failing.
        let mut backoff = std::time::Duration::from_secs(1);
        let max_backoff = std::time::Duration::from_secs(30);
        let max_total_wait = std::time::Duration::from_secs(10 * 60);
        let start = std::time::Instant::now();

        loop {
            let res = conn
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(std::time::Duration::from_secs(1))?;
                    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                    conn.execute_batch(SCHEMA)?;
                    conn.busy_timeout(std::time::Duration::from_secs(30))?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err)) => {
                    if !is_busy_or_locked(&err) {
                        return Err(
                            anyhow::Error::from(err).context("AsyncDb::open: schema setup failed")
                        );
                    }

                    if start.elapsed() >= max_total_wait {
                        return Err(anyhow::Error::from(err).context(
                            "AsyncDb::open: schema setup failed (database stayed locked too long)",
                        ));
                    }

                    tracing::warn!(
                        wait_for = ?backoff,
                        "AsyncDb::open: database is locked; retrying schema setup"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
            }
        }

        Ok(Self { conn })
    }

    /// Run a closure on the background SQLite thread and return the result.
    ///
    /// The closure receives `&mut rusqlite::Connection` and can perform
    /// arbitrary sync SQLite operations, including opening a transaction.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => DbError::ConnectionClosed.into(),
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records Prometheus metrics for DB latency and errors.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        let status = if res.is_ok() { "ok" } else { "err" };
        metrics::histogram!(
            "leaderboard_db_query_latency_ms",
            "op" => op,
            "status" => status
        )
        .record(ms);
        if res.is_err() {
            metrics::counter!("leaderboard_db_query_errors_total", "op" => op).increment(1);
        }

        res
    }
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    pub fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

fn is_busy_or_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

/// True when retrying the same unit of work may succeed: the database was
/// busy/locked by another writer, or the background connection went away.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if matches!(cause.downcast_ref::<DbError>(), Some(DbError::ConnectionClosed)) {
            return true;
        }
        cause
            .downcast_ref::<rusqlite::Error>()
            .is_some_and(is_busy_or_locked)
    })
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_address TEXT NOT NULL UNIQUE,
    referred_by TEXT,
    referral_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS user_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    snapshot_date TEXT NOT NULL,           -- YYYY-MM-DD

    bridged_total REAL NOT NULL DEFAULT 0,
    swap_volume REAL NOT NULL DEFAULT 0,
    swap_count INTEGER NOT NULL DEFAULT 0,
    tvl_total_usd REAL NOT NULL DEFAULT 0, -- clamped to [0, tvl_ceiling]
    real_tvl_usd REAL NOT NULL DEFAULT 0,
    protocols_used INTEGER NOT NULL DEFAULT 0,
    longest_swap_streak_weeks INTEGER NOT NULL DEFAULT 0,
    adjustment_points INTEGER NOT NULL DEFAULT 0,
    protectors_points INTEGER NOT NULL DEFAULT 0,
    badge_points INTEGER NOT NULL DEFAULT 0,
    user_self_xp INTEGER NOT NULL DEFAULT 0,
    referral_bonus_xp INTEGER NOT NULL DEFAULT 0,
    total_xp INTEGER NOT NULL DEFAULT 0,
    xp_rank INTEGER,                       -- NULL until ranked upstream
    longest_tvl_streak INTEGER NOT NULL DEFAULT 0,
    staking_points INTEGER NOT NULL DEFAULT 0,
    staking_bonus INTEGER NOT NULL DEFAULT 0,
    staking_total_tokens INTEGER NOT NULL DEFAULT 0,

    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(user_id, snapshot_date)
);

CREATE INDEX IF NOT EXISTS idx_user_snapshots_date_xp
    ON user_snapshots(snapshot_date, total_xp DESC);
CREATE INDEX IF NOT EXISTS idx_user_snapshots_date_rank
    ON user_snapshots(snapshot_date, xp_rank);

CREATE TABLE IF NOT EXISTS user_daily_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    snapshot_date TEXT NOT NULL,
    xp_change INTEGER NOT NULL DEFAULT 0,
    tvl_change REAL NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(user_id, snapshot_date)
);

CREATE INDEX IF NOT EXISTS idx_user_daily_changes_date_xp
    ON user_daily_changes(snapshot_date, xp_change DESC);

CREATE TABLE IF NOT EXISTS platform_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    snapshot_date TEXT NOT NULL UNIQUE,
    total_wallets INTEGER NOT NULL DEFAULT 0,
    total_xp INTEGER NOT NULL DEFAULT 0,
    new_wallets INTEGER NOT NULL DEFAULT 0,
    new_xp INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS job_status (
    job_name TEXT PRIMARY KEY,
    status TEXT NOT NULL,                  -- running, idle, failed
    last_run_at TEXT,
    duration_ms INTEGER,
    last_error TEXT,
    metadata TEXT,                         -- JSON
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(std::result::Result::ok)
            .collect()
    }

    fn insert_user(conn: &Connection, wallet: &str) -> i64 {
        conn.execute(
            "INSERT INTO users (wallet_address) VALUES (?1)",
            rusqlite::params![wallet],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    #[test]
    fn test_migrations_create_all_tables() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();

        let tables = table_names(&db.conn);
        for t in [
            "users",
            "user_snapshots",
            "user_daily_changes",
            "platform_stats",
            "job_status",
        ] {
            assert!(tables.contains(&t.to_string()), "missing table {t}");
        }
    }

    #[test]
    fn test_migrations_idempotent() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        db.run_migrations().unwrap();
    }

    #[test]
    fn test_migrations_create_expected_indexes() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();

        let indexes: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='index' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(std::result::Result::ok)
            .collect();

        for idx in [
            "idx_user_snapshots_date_xp",
            "idx_user_snapshots_date_rank",
            "idx_user_daily_changes_date_xp",
        ] {
            assert!(
                indexes.contains(&idx.to_string()),
                "missing index {idx}; got {indexes:?}"
            );
        }
    }

    #[test]
    fn test_snapshot_unique_per_wallet_and_date() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        let uid = insert_user(&db.conn, "0xabc");

        db.conn
            .execute(
                "INSERT INTO user_snapshots (user_id, snapshot_date, total_xp) VALUES (?1, '2025-09-28', 10)",
                rusqlite::params![uid],
            )
            .unwrap();
        let dup = db.conn.execute(
            "INSERT INTO user_snapshots (user_id, snapshot_date, total_xp) VALUES (?1, '2025-09-28', 20)",
            rusqlite::params![uid],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn test_deleting_user_cascades_to_snapshots_and_changes() {
        let db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        let uid = insert_user(&db.conn, "0xabc");

        db.conn
            .execute(
                "INSERT INTO user_snapshots (user_id, snapshot_date, total_xp) VALUES (?1, '2025-09-28', 10)",
                rusqlite::params![uid],
            )
            .unwrap();
        db.conn
            .execute(
                "INSERT INTO user_daily_changes (user_id, snapshot_date, xp_change) VALUES (?1, '2025-09-28', 10)",
                rusqlite::params![uid],
            )
            .unwrap();
        db.conn
            .execute("DELETE FROM users WHERE id = ?1", rusqlite::params![uid])
            .unwrap();

        let remaining: i64 = db
            .conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM user_snapshots) + (SELECT COUNT(*) FROM user_daily_changes)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_is_transient_recognizes_busy_and_closed() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(is_transient(&anyhow::Error::from(busy)));

        let locked = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            Some("database table is locked".to_string()),
        );
        assert!(is_transient(
            &anyhow::Error::from(locked).context("batch upsert")
        ));

        assert!(is_transient(&anyhow::Error::from(DbError::ConnectionClosed)));
    }

    #[test]
    fn test_is_transient_rejects_constraint_and_plain_errors() {
        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!is_transient(&anyhow::Error::from(constraint)));
        assert!(!is_transient(&anyhow::anyhow!("something else")));
    }

    #[tokio::test]
    async fn test_async_db_open_runs_migrations() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let tables: Vec<String> = db.call(|conn| Ok(table_names(conn))).await.unwrap();

        assert!(tables.contains(&"users".to_string()));
        assert!(tables.contains(&"platform_stats".to_string()));
    }

    #[tokio::test]
    async fn test_async_db_is_clone_and_send() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let db2 = db.clone();

        db.call(|conn| {
            conn.execute(
                "INSERT INTO users (wallet_address, referral_count) VALUES ('0xabc', 3)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        // Same underlying connection from the clone.
        let count: i64 = db2
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT referral_count FROM users WHERE wallet_address = '0xabc'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();

        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_async_db_call_returns_error_on_bad_sql() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let result: Result<()> = db
            .call(|conn| {
                conn.execute("INVALID SQL", [])?;
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert!(!is_transient(&err));
    }
}
