use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use common::types::wallet_key;

use super::{LeaderboardPager, PageFetcher, ProgressTracker, RunFiles};

#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    pub window_pages: u64,
    pub max_workers: usize,
}

impl WindowConfig {
    pub fn from_fetch(fetch: &common::config::Fetch) -> Self {
        Self {
            window_pages: fetch.window_pages,
            max_workers: fetch.max_workers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// A short page was written; the feed is exhausted.
    Done,
    /// The done marker already existed; nothing was fetched.
    AlreadyComplete,
    /// `offset` stayed empty after remediation. The checkpoint points at it.
    Fatal { offset: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub outcome: FetchOutcome,
    pub start_offset: u64,
    pub next_offset: u64,
    pub pages_written: u64,
    pub records_written: u64,
    pub duplicates_skipped: u64,
}

/// Drives windowed, ordered, deduplicated fetching into a dated JSONL log.
pub struct FetchCoordinator<P> {
    fetcher: PageFetcher<P>,
    window: WindowConfig,
    files: RunFiles,
}

impl<P> FetchCoordinator<P>
where
    P: LeaderboardPager + Send + Sync + 'static,
{
    pub fn new(fetcher: PageFetcher<P>, window: WindowConfig, files: RunFiles) -> Self {
        Self {
            fetcher,
            window,
            files,
        }
    }

    pub fn files(&self) -> &RunFiles {
        &self.files
    }

    pub async fn run(&self) -> Result<FetchReport> {
        let page_size = self.fetcher.page_size();
        let progress = ProgressTracker::new(&self.files.progress, page_size);
        let start_offset = progress.load();
        let mut report = FetchReport {
            outcome: FetchOutcome::AlreadyComplete,
            start_offset,
            next_offset: start_offset,
            pages_written: 0,
            records_written: 0,
            duplicates_skipped: 0,
        };

        if self.files.done.exists() {
            tracing::info!(log = %self.files.log.display(), "fetch already complete");
            return Ok(report);
        }

        if let Some(parent) = self.files.log.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut seen = load_seen_wallets(&self.files.log).await?;
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.files.log)
            .await
            .with_context(|| format!("failed to open {}", self.files.log.display()))?;

        tracing::info!(
            start_offset,
            known_wallets = seen.len(),
            log = %self.files.log.display(),
            checkpoint = %progress.path().display(),
            "fetch run starting"
        );

        loop {
            let window_start = report.next_offset;
            let pages = self.fetch_window(window_start).await?;

            for (offset, mut page) in pages {
                if page.is_empty() {
                    tracing::warn!(offset, "empty page after retries; remediating");
                    page = self.fetcher.fetch(offset).await;
                }
                if page.is_empty() {
                    tracing::error!(offset, "page still empty; stopping to avoid a gap");
                    report.outcome = FetchOutcome::Fatal { offset };
                    return Ok(report);
                }

                let page_len = page.len() as u64;
                let (buf, written, duplicates) = encode_page(page, &mut seen)?;
                log.write_all(&buf).await?;
                log.flush().await?;

                report.next_offset = offset + page_size;
                progress.save(report.next_offset).await?;

                report.pages_written += 1;
                report.records_written += written;
                report.duplicates_skipped += duplicates;
                metrics::counter!("leaderboard_pages_written_total").increment(1);
                metrics::counter!("leaderboard_records_written_total").increment(written);
                metrics::counter!("leaderboard_duplicates_skipped_total").increment(duplicates);
                tracing::info!(offset, written, page_len, "page written");

                if page_len < page_size {
                    tracing::info!(offset, page_len, "short page; end of feed");
                    tokio::fs::write(&self.files.done, report.next_offset.to_string()).await?;
                    report.outcome = FetchOutcome::Done;
                    return Ok(report);
                }
            }
        }
    }

    async fn fetch_window(&self, start: u64) -> Result<BTreeMap<u64, Vec<Value>>> {
        let page_size = self.fetcher.page_size();
        let permits = Arc::new(Semaphore::new(self.window.max_workers));
        let mut tasks = JoinSet::new();

        for i in 0..self.window.window_pages {
            let offset = start + i * page_size;
            let fetcher = self.fetcher.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await?;
                Ok::<_, anyhow::Error>((offset, fetcher.fetch(offset).await))
            });
        }

        let mut pages = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (offset, page) = joined.context("page fetch task failed")??;
            pages.insert(offset, page);
        }
        Ok(pages)
    }
}

/// Serialize one page as JSON lines, dropping records whose wallet was already
/// written this run. Records without a wallet key are always kept.
fn encode_page(page: Vec<Value>, seen: &mut HashSet<String>) -> Result<(Vec<u8>, u64, u64)> {
    let mut buf = Vec::new();
    let mut written = 0u64;
    let mut duplicates = 0u64;
    for record in page {
        if let Some(wallet) = wallet_key(&record) {
            if !seen.insert(wallet.to_string()) {
                duplicates += 1;
                continue;
            }
        }
        serde_json::to_writer(&mut buf, &record)?;
        buf.push(b'\n');
        written += 1;
    }
    Ok((buf, written, duplicates))
}

/// Wallets already present in a partially written log, so a resumed run does
/// not append them twice.
async fn load_seen_wallets(path: &Path) -> Result<HashSet<String>> {
    let mut seen = HashSet::new();
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(seen),
        Err(e) => return Err(e).with_context(|| format!("failed to open {}", path.display())),
    };
    let mut lines = BufReader::new(file).lines();
    while let Some(line) = lines.next_line().await? {
        if let Ok(record) = serde_json::from_str::<Value>(&line) {
            if let Some(wallet) = wallet_key(&record) {
                seen.insert(wallet.to_string());
            }
        }
    }
    Ok(seen)
}
