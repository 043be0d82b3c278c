mod tracker;

pub use tracker::JobTracker;

use anyhow::Result;
use chrono::NaiveDate;
use common::config::Config;
use common::db::AsyncDb;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

use crate::aggregate::{update_platform_stats, AggregateOutcome};
use crate::fetch::{
    FetchCoordinator, FetchOutcome, FetchReport, LeaderboardPager, PageFetcher, RetryPolicy,
    RunFiles, WindowConfig,
};
use crate::ingest::{ingest_file, IngestConfig, IngestReport};

pub const JOB_FETCH: &str = "fetch";
pub const JOB_INGEST: &str = "ingest";
pub const JOB_PLATFORM_STATS: &str = "platform_stats";

/// The fetch hit a page that stayed empty. Everything before `offset` is in
/// the log and the checkpoint points at `offset`.
#[derive(Debug, thiserror::Error)]
#[error("fetch stopped at offset {offset} after {pages_written} page(s); rerun to resume")]
pub struct FetchStopped {
    pub offset: u64,
    pub pages_written: u64,
}

/// Fetch the feed into the log for `run_date`. A fatal page is an error; the
/// checkpoint lets the next run resume from it.
pub async fn run_fetch_once<P>(
    db: &AsyncDb,
    pager: Arc<P>,
    cfg: &Config,
    run_date: NaiveDate,
) -> Result<FetchReport>
where
    P: LeaderboardPager + Send + Sync + 'static,
{
    let fetcher = PageFetcher::new(pager, cfg.feed.page_size, RetryPolicy::from_feed(&cfg.feed));
    let files = RunFiles::for_date(&cfg.fetch.data_dir, run_date);
    let coordinator = FetchCoordinator::new(fetcher, WindowConfig::from_fetch(&cfg.fetch), files);
    tracing::info!(%run_date, log = %coordinator.files().log.display(), "fetch job starting");

    let job = async {
        let report = coordinator.run().await?;
        if let FetchOutcome::Fatal { offset } = report.outcome {
            return Err(FetchStopped {
                offset,
                pages_written: report.pages_written,
            }
            .into());
        }
        Ok::<_, anyhow::Error>(report)
    };
    JobTracker::track(db, JOB_FETCH, job, |r| {
        json!({
            "outcome": format!("{:?}", r.outcome),
            "start_offset": r.start_offset,
            "next_offset": r.next_offset,
            "pages": r.pages_written,
            "records": r.records_written,
            "duplicates": r.duplicates_skipped,
        })
    })
    .await
}

pub async fn run_ingest_once(
    db: &AsyncDb,
    path: &Path,
    date: Option<NaiveDate>,
    cfg: &Config,
) -> Result<IngestReport> {
    let ingest_cfg = IngestConfig::from_ingest(&cfg.ingest);
    JobTracker::track(
        db,
        JOB_INGEST,
        ingest_file(db, path, date, &ingest_cfg),
        |r| {
            json!({
                "file": path.display().to_string(),
                "lines": r.lines,
                "batch_size": r.batch_size,
                "batches_ok": r.batches_ok,
                "batches_failed": r.batches_failed,
                "snapshots": r.snapshots_upserted,
                "changes": r.changes_upserted,
                "skipped_lines": r.skipped_lines,
                "dates": r.snapshot_dates.iter().map(ToString::to_string).collect::<Vec<_>>(),
            })
        },
    )
    .await
}

pub async fn run_platform_stats_once(db: &AsyncDb, date: NaiveDate) -> Result<AggregateOutcome> {
    JobTracker::track(db, JOB_PLATFORM_STATS, update_platform_stats(db, date), |o| match o {
        AggregateOutcome::Updated(s) => json!({"date": s.snapshot_date, "outcome": "updated"}),
        AggregateOutcome::Skipped => json!({"date": date.to_string(), "outcome": "skipped"}),
    })
    .await
}

#[derive(Debug)]
pub struct PipelineSummary {
    pub fetch: FetchReport,
    pub ingest: IngestReport,
    pub stats: Vec<(NaiveDate, AggregateOutcome)>,
}

/// Fetch, ingest and aggregate one day. Stats are recomputed for every
/// snapshot date the ingest touched, or for `snapshot_date` when given.
///
/// A stopped fetch still ingests and aggregates whatever the log holds, then
/// returns the [`FetchStopped`] error. A feed whose size is an exact multiple
/// of the page size ends this way, and its log is complete.
pub async fn run_pipeline_once<P>(
    db: &AsyncDb,
    pager: Arc<P>,
    cfg: &Config,
    run_date: NaiveDate,
    snapshot_date: Option<NaiveDate>,
) -> Result<PipelineSummary>
where
    P: LeaderboardPager + Send + Sync + 'static,
{
    let fetch = match run_fetch_once(db, pager, cfg, run_date).await {
        Ok(report) => Ok(report),
        Err(e) => Err(e.downcast::<FetchStopped>()?),
    };
    let log = RunFiles::for_date(&cfg.fetch.data_dir, run_date).log;
    let fetch = match fetch {
        Err(stopped) if !log.exists() => return Err(stopped.into()),
        other => other,
    };

    let ingest = run_ingest_once(db, &log, snapshot_date, cfg).await?;

    let dates: Vec<NaiveDate> = match snapshot_date {
        Some(d) => vec![d],
        None => ingest.snapshot_dates.iter().copied().collect(),
    };
    let mut stats = Vec::with_capacity(dates.len());
    for date in dates {
        stats.push((date, run_platform_stats_once(db, date).await?));
    }

    match fetch {
        Ok(fetch) => Ok(PipelineSummary {
            fetch,
            ingest,
            stats,
        }),
        Err(stopped) => {
            tracing::warn!(
                offset = stopped.offset,
                snapshots = ingest.snapshots_upserted,
                "fetch stopped early; ingested the log written so far"
            );
            Err(stopped.into())
        }
    }
}
