//! Per-block split job: download, split, upload, delete

use crate::block::{BlockId, BlockMeta, BlockReader, BlockWriterOptions};
use crate::bucket::{BlockRef, Bucket};
use crate::pipeline::{SplitOutcome, SplitPipeline, SplitStats};
use crate::relabel::RelabelRules;
use crate::routing::RoutingTable;
use crate::{Labels, Result, SplitError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Split job options
#[derive(Debug, Clone)]
pub struct SplitOptions {
    /// Local scratch directory; wiped before every block
    pub data_dir: PathBuf,
    /// Split locally but neither upload nor delete
    pub dry_run: bool,
    /// Pending samples per tenant that trigger an intermediate commit
    pub commit_threshold: usize,
    pub writer: BlockWriterOptions,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(crate::config::DEFAULT_DATA_DIR),
            dry_run: false,
            commit_threshold: crate::config::COMMIT_THRESHOLD,
            writer: BlockWriterOptions::default(),
        }
    }
}

/// What happened to one input block
#[derive(Debug, Clone, Default)]
pub struct SplitReport {
    pub block: Option<BlockRef>,
    /// Output blocks, in routing key order
    pub outputs: Vec<BlockId>,
    /// Extracted labels and appended samples per output block
    pub tenants: Vec<(Labels, u64)>,
    pub stats: SplitStats,
    /// Block labels were dropped by meta relabeling; nothing was done
    pub skipped: bool,
    pub dry_run: bool,
}

/// Splits blocks from a source bucket into a destination bucket
pub struct BlockSplitter {
    src: Bucket,
    dst: Bucket,
    relabel: Arc<RelabelRules>,
    meta_relabel: Arc<RelabelRules>,
    options: SplitOptions,
}

impl BlockSplitter {
    pub fn new(
        src: Bucket,
        dst: Bucket,
        relabel: RelabelRules,
        meta_relabel: RelabelRules,
        options: SplitOptions,
    ) -> Self {
        Self {
            src,
            dst,
            relabel: Arc::new(relabel),
            meta_relabel: Arc::new(meta_relabel),
            options,
        }
    }

    /// Source bucket
    pub fn source(&self) -> &Bucket {
        &self.src
    }

    /// Split one block. Errors carry the block's location.
    pub async fn split_block(&self, block: &BlockRef) -> Result<SplitReport> {
        self.split_block_inner(block)
            .await
            .map_err(|e| e.for_block(block.to_string()))
    }

    async fn split_block_inner(&self, block: &BlockRef) -> Result<SplitReport> {
        let mut report = SplitReport {
            block: Some(block.clone()),
            dry_run: self.options.dry_run,
            ..Default::default()
        };

        let in_dir = self.options.data_dir.join("in");
        let out_dir = self.options.data_dir.join("out");
        reset_dir(&self.options.data_dir).await?;
        tokio::fs::create_dir_all(&in_dir).await?;
        tokio::fs::create_dir_all(&out_dir).await?;

        let start = Instant::now();
        let block_dir = self.src.download(block, &in_dir).await?;
        debug!(block = %block, elapsed_ms = start.elapsed().as_millis() as u64, "downloaded");

        let mut meta = BlockMeta::read_from_dir(&block_dir)?;
        match self.meta_relabel.process_map(&meta.thanos.labels) {
            Some(labels) => {
                if labels != meta.thanos.labels {
                    meta.thanos.labels = labels;
                    meta.write_to_dir(&block_dir)?;
                }
            }
            None => {
                info!(block = %block, "block dropped by meta relabeling, skipping");
                report.skipped = true;
                return Ok(report);
            }
        }

        let outcome = self.run_split(block_dir, out_dir, meta.duration_ms()).await?;
        report.stats = outcome.stats;
        report.outputs = outcome.outputs.iter().map(|o| o.id).collect();
        report.tenants = outcome
            .outputs
            .iter()
            .map(|o| (o.extracted.clone(), o.samples))
            .collect();

        if self.options.dry_run {
            info!(
                block = %block,
                outputs = ?report.outputs,
                "dry-run: skipping upload of created blocks and delete of original block"
            );
            return Ok(report);
        }

        let mut uploaded = Vec::with_capacity(outcome.outputs.len());
        for output in &outcome.outputs {
            let start = Instant::now();
            // A failed upload may have left some of its files behind.
            uploaded.push(BlockRef::new(output.id));
            if let Err(e) = self.dst.upload(&output.dir).await {
                error!(block = %output.id, "upload failed, keeping original block: {}", e);
                self.remove_uploaded(&uploaded).await;
                return Err(e);
            }
            info!(
                block = %output.id,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "uploaded block"
            );
        }

        info!(block = %block, "deleting original block");
        self.src.delete(block).await?;
        Ok(report)
    }

    /// Delete the outputs of a failed split from the destination
    async fn remove_uploaded(&self, uploaded: &[BlockRef]) {
        for output in uploaded {
            match self.dst.delete(output).await {
                Ok(()) => debug!(block = %output, "removed output of failed split"),
                Err(e) => error!(
                    block = %output,
                    "failed to remove output of failed split, remove it manually: {}", e
                ),
            }
        }
    }

    /// Run the blocking split off the async runtime
    async fn run_split(
        &self,
        block_dir: PathBuf,
        out_dir: PathBuf,
        input_duration: i64,
    ) -> Result<SplitOutcome> {
        let relabel = self.relabel.clone();
        let mut writer = self.options.writer.clone();
        // Outputs span at most what the input spans.
        writer.block_duration = writer.block_duration.max(input_duration);
        let threshold = self.options.commit_threshold;

        tokio::task::spawn_blocking(move || {
            let reader = BlockReader::open(&block_dir)?;
            let table = RoutingTable::new(out_dir, writer, threshold);
            SplitPipeline::new(relabel.as_ref(), &table).split(&reader)
        })
        .await
        .map_err(|e| SplitError::Internal(format!("split task failed: {}", e)))?
    }
}

async fn reset_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SplitError::Io(e)),
    }
}
