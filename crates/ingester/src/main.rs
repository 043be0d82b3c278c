use anyhow::Result;
use chrono::{Local, NaiveDate};
use std::sync::Arc;
use tracing::Instrument;

mod aggregate;
mod cli;
mod distribution;
mod fetch;
mod ingest;
mod jobs;
mod metrics;
mod scheduler;

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn yesterday() -> NaiveDate {
    let today = today();
    today.pred_opt().unwrap_or(today)
}

fn print_stats(date: NaiveDate, outcome: &aggregate::AggregateOutcome) {
    match outcome {
        aggregate::AggregateOutcome::Updated(s) => println!(
            "{date}  wallets={}  xp={}  new_wallets={}  new_xp={}",
            s.total_wallets, s.total_xp, s.new_wallets, s.new_xp
        ),
        aggregate::AggregateOutcome::Skipped => {
            println!("{date}  no qualifying snapshots; skipped");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;
    let config = common::config::Config::load()?;

    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("ingester", &config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    // Offline; no store needed.
    if let cli::Command::Distribution { path } = &cmd {
        for bucket in distribution::distribution_from_log(path).await? {
            println!("{:>16}: {}", bucket.range, bucket.wallets);
        }
        return Ok(());
    }

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = common::db::AsyncDb::open(&config.database.path).await?;
    let client = Arc::new(common::leaderboard::LeaderboardClient::new(&config.feed)?);

    match cmd {
        cli::Command::Distribution { .. } => Ok(()),
        cli::Command::Fetch => {
            let r = jobs::run_fetch_once(&db, client, &config, today()).await?;
            println!(
                "{:?}: pages={} records={} duplicates={} next_offset={}",
                r.outcome, r.pages_written, r.records_written, r.duplicates_skipped, r.next_offset
            );
            Ok(())
        }
        cli::Command::Ingest { path, date } => {
            let r = jobs::run_ingest_once(&db, &path, date, &config).await?;
            println!(
                "batches ok={} failed={}  snapshots={} changes={} skipped_lines={}",
                r.batches_ok, r.batches_failed, r.snapshots_upserted, r.changes_upserted, r.skipped_lines
            );
            Ok(())
        }
        cli::Command::Stats { date } => {
            let date = date.unwrap_or_else(yesterday);
            let outcome = jobs::run_platform_stats_once(&db, date).await?;
            print_stats(date, &outcome);
            Ok(())
        }
        cli::Command::Pipeline { date } => {
            let summary = jobs::run_pipeline_once(&db, client, &config, today(), date).await?;
            println!(
                "fetched {} record(s); ingested {} snapshot(s), {} change(s)",
                summary.fetch.records_written,
                summary.ingest.snapshots_upserted,
                summary.ingest.changes_upserted
            );
            for (date, outcome) in &summary.stats {
                print_stats(*date, outcome);
            }
            Ok(())
        }
        cli::Command::Run => run_daemon(db, client, config).await,
    }
}

async fn run_daemon(
    db: common::db::AsyncDb,
    client: Arc<common::leaderboard::LeaderboardClient>,
    config: common::config::Config,
) -> Result<()> {
    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();
    tracing::info!(
        port = config.observability.prometheus_port,
        interval_secs = config.schedule.interval_secs,
        "ingester daemon starting"
    );

    let cfg = Arc::new(config);
    let (pipeline_tx, mut pipeline_rx) = tokio::sync::mpsc::channel::<()>(1);

    // Worker first so the immediate tick has a receiver.
    tokio::spawn({
        let cfg = cfg.clone();
        async move {
            while pipeline_rx.recv().await.is_some() {
                let run_date = today();
                let span = tracing::info_span!("job_run", job = "pipeline", %run_date);
                let res = jobs::run_pipeline_once(&db, client.clone(), cfg.as_ref(), run_date, None)
                    .instrument(span)
                    .await;
                match res {
                    Ok(s) => tracing::info!(
                        records = s.fetch.records_written,
                        snapshots = s.ingest.snapshots_upserted,
                        changes = s.ingest.changes_upserted,
                        "pipeline done"
                    ),
                    Err(e) => tracing::error!(error = %e, "pipeline failed"),
                }
            }
        }
    });

    let _scheduler_handles = scheduler::start(vec![scheduler::JobSpec {
        name: "pipeline".to_string(),
        interval: std::time::Duration::from_secs(cfg.schedule.interval_secs),
        tick: pipeline_tx,
        run_immediately: true,
    }]);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
