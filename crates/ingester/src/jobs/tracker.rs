use anyhow::Result;
use common::db::AsyncDb;
use rusqlite::params;
use std::time::Instant;

/// Status row in `job_status` for one run of a pipeline stage.
pub struct JobTracker {
    db: AsyncDb,
    job_name: &'static str,
    started: Instant,
}

impl JobTracker {
    pub async fn start(db: &AsyncDb, job_name: &'static str) -> Result<Self> {
        db.call_named("job_tracker.start", move |conn| {
            conn.execute(
                "INSERT INTO job_status (job_name, status, last_run_at, updated_at)
                 VALUES (?1, 'running', datetime('now'), datetime('now'))
                 ON CONFLICT(job_name) DO UPDATE SET
                    status = 'running',
                    last_run_at = datetime('now'),
                    updated_at = datetime('now'),
                    last_error = NULL,
                    duration_ms = NULL",
                params![job_name],
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            db: db.clone(),
            job_name,
            started: Instant::now(),
        })
    }

    fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    pub async fn success(self, metadata: serde_json::Value) -> Result<()> {
        let duration_ms = self.elapsed_ms();
        let name = self.job_name;
        let meta = metadata.to_string();
        self.db
            .call_named("job_tracker.success", move |conn| {
                conn.execute(
                    "UPDATE job_status SET
                        status = 'idle',
                        duration_ms = ?2,
                        metadata = ?3,
                        updated_at = datetime('now')
                     WHERE job_name = ?1",
                    params![name, duration_ms, meta],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn fail(self, error: &anyhow::Error) -> Result<()> {
        let duration_ms = self.elapsed_ms();
        let name = self.job_name;
        let message = format!("{error:#}");
        self.db
            .call_named("job_tracker.fail", move |conn| {
                conn.execute(
                    "UPDATE job_status SET
                        status = 'failed',
                        duration_ms = ?2,
                        last_error = ?3,
                        updated_at = datetime('now')
                     WHERE job_name = ?1",
                    params![name, duration_ms, message],
                )?;
                Ok(())
            })
            .await
    }

    /// Run `job` and record its outcome. The job's error is returned as-is.
    pub async fn track<T, F, M>(db: &AsyncDb, job_name: &'static str, job: F, meta: M) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
        M: FnOnce(&T) -> serde_json::Value,
    {
        let tracker = Self::start(db, job_name).await?;
        match job.await {
            Ok(value) => {
                tracker.success(meta(&value)).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(record_err) = tracker.fail(&e).await {
                    tracing::warn!(job = job_name, error = %record_err, "failed to record job failure");
                }
                Err(e)
            }
        }
    }
}
