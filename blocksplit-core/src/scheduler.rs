//! Repeated bucket scans

use crate::bucket::BlockRef;
use crate::splitter::{BlockSplitter, SplitReport};
use crate::timeutil::TimeOrDuration;
use crate::Result;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Which blocks to process and how often
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Search nested folders for blocks
    pub recursive: bool,
    /// Only process blocks created before this time, resolved every cycle
    pub max_time: Option<TimeOrDuration>,
    /// Only process blocks whose metadata source matches
    pub source: Option<String>,
    /// Pause between cycles; zero runs a single cycle
    pub interval: Duration,
}

/// Summary of one cycle
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Blocks listed in the bucket
    pub listed: usize,
    pub reports: Vec<SplitReport>,
    /// Stopped early because of cancellation
    pub cancelled: bool,
}

/// Runs the block splitter over a bucket
pub struct Scheduler {
    splitter: BlockSplitter,
    options: ScheduleOptions,
}

impl Scheduler {
    pub fn new(splitter: BlockSplitter, options: ScheduleOptions) -> Self {
        Self { splitter, options }
    }

    /// Process every eligible block once, in listing order.
    ///
    /// Cancellation is checked between blocks. The first failing block ends
    /// the cycle with its error.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let start = Instant::now();
        let bucket = self.splitter.source();
        let max_time = self.options.max_time.map(|t| t.resolve_now());
        let blocks = bucket.list_blocks(self.options.recursive, max_time).await?;

        let mut cycle = CycleReport {
            listed: blocks.len(),
            ..Default::default()
        };

        for block in &blocks {
            if cancel.is_cancelled() {
                info!("cancelled, stopping bucket iteration");
                cycle.cancelled = true;
                break;
            }
            if !self.source_matches(block).await? {
                continue;
            }
            cycle.reports.push(self.splitter.split_block(block).await?);
        }

        info!(
            blocks = cycle.listed,
            processed = cycle.reports.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            sleeping = ?self.options.interval,
            "bucket iteration done"
        );
        Ok(cycle)
    }

    async fn source_matches(&self, block: &BlockRef) -> Result<bool> {
        let Some(source) = self.options.source.as_deref() else {
            return Ok(true);
        };
        match self.splitter.source().get_meta(block).await? {
            Some(meta) => Ok(meta.thanos.source == source),
            None => {
                // meta.json vanished between listing and now
                debug!(block = %block, "block disappeared, skipping");
                Ok(false)
            }
        }
    }

    /// Run cycles until cancelled. With a zero interval a single cycle runs
    /// and its error is returned; otherwise cycle errors are logged and the
    /// loop goes on.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.options.interval.is_zero() {
            return self.run_once(&cancel).await.map(|_| ());
        }

        loop {
            match self.run_once(&cancel).await {
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    warn!("bucket iteration failed, retrying next cycle: {}", e)
                }
                Err(e) => error!("bucket iteration failed: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.options.interval) => {}
            }
        }
    }
}
