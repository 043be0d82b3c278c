use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub interval: Duration,
    pub tick: mpsc::Sender<()>,
    /// Fire once at startup instead of waiting a full interval.
    pub run_immediately: bool,
}

/// Spawn one ticker per job. A ticker stops when its receiver is dropped.
pub fn start(jobs: Vec<JobSpec>) -> Vec<JoinHandle<()>> {
    jobs.into_iter()
        .map(|job| {
            tokio::spawn(async move {
                let first = if job.run_immediately {
                    Instant::now()
                } else {
                    Instant::now() + job.interval
                };
                let mut interval = tokio::time::interval_at(first, job.interval);
                // a pipeline run can outlast the interval; don't queue catch-up runs
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    interval.tick().await;
                    tracing::debug!(job = %job.name, "scheduler tick");
                    if job.tick.send(()).await.is_err() {
                        break;
                    }
                }
            })
        })
        .collect()
}
