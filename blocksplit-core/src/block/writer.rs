//! Block writer: append, commit and flush samples into a new block

use super::chunk::{self, ChunkRef};
use super::index::{Index, SeriesEntry};
use super::meta::{BlockMeta, BlockStats, CompactionMeta, ThanosMeta, META_VERSION};
use super::{BlockId, CHUNKS_DIR, CHUNK_SEGMENT, INDEX_FILENAME};
use crate::{FloatHistogram, Histogram, Labels, Result, Sample, SplitError, Timestamp, ValueKind};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Block writer options
#[derive(Debug, Clone)]
pub struct BlockWriterOptions {
    /// Expected maximum time span of a block in milliseconds
    pub block_duration: i64,
    /// Maximum number of samples in one chunk
    pub max_samples_per_chunk: usize,
    /// Source tag recorded in the block metadata
    pub source: String,
}

impl Default for BlockWriterOptions {
    fn default() -> Self {
        Self {
            block_duration: crate::config::DEFAULT_BLOCK_DURATION_MS,
            max_samples_per_chunk: crate::config::MAX_SAMPLES_PER_CHUNK,
            source: crate::config::SOURCE_TAG.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Flushed,
    Closed,
}

/// Committed data of a writer that has not been turned into a block yet
struct Head {
    chunks: Option<BufWriter<File>>,
    offset: u64,
    series: BTreeMap<Labels, HeadSeries>,
    stats: BlockStats,
    min_time: Timestamp,
    max_time: Timestamp,
    sealed: bool,
}

struct HeadSeries {
    last_ts: Timestamp,
    chunks: Vec<ChunkRef>,
}

impl Head {
    fn last_timestamp(&self, labels: &Labels) -> Option<Timestamp> {
        self.series.get(labels).map(|s| s.last_ts)
    }

    fn write_chunks(&mut self, samples: &[Sample], max_samples: usize) -> Result<Vec<ChunkRef>> {
        let file = self
            .chunks
            .as_mut()
            .ok_or_else(|| SplitError::Internal("chunk file already closed".into()))?;

        let mut refs = Vec::new();
        for run in chunk::cut(samples, max_samples) {
            let kind = run[0].kind();
            let frame = chunk::encode(kind, run)?;
            file.write_all(&frame)?;

            let min_time = run[0].timestamp();
            let max_time = run[run.len() - 1].timestamp();
            refs.push(ChunkRef {
                offset: self.offset,
                len: frame.len() as u32,
                kind,
                min_time,
                max_time,
                num_samples: run.len() as u32,
            });
            self.offset += frame.len() as u64;

            self.stats.num_chunks += 1;
            self.stats.num_samples += run.len() as u64;
            match kind {
                ValueKind::Float => self.stats.num_float_samples += run.len() as u64,
                ValueKind::Histogram | ValueKind::FloatHistogram => {
                    self.stats.num_histogram_samples += run.len() as u64
                }
            }
            self.min_time = self.min_time.min(min_time);
            self.max_time = self.max_time.max(max_time);
        }
        Ok(refs)
    }

    fn sync(&mut self) -> Result<()> {
        if let Some(file) = self.chunks.as_mut() {
            file.flush()?;
            file.get_ref().sync_all()?;
        }
        Ok(())
    }
}

/// Writes exactly one block from appended samples.
///
/// Samples become durable on [`Appender::commit`], which writes them as chunk
/// frames into a private working directory. [`BlockWriter::flush`] writes the
/// index and metadata and moves the finished block into the output directory.
/// The working directory is removed on [`BlockWriter::close`] or drop.
pub struct BlockWriter {
    output_dir: PathBuf,
    work_dir: PathBuf,
    options: BlockWriterOptions,
    head: Arc<Mutex<Head>>,
    state: WriterState,
}

impl BlockWriter {
    /// Create a writer producing a block under `output_dir`
    pub fn new(output_dir: impl AsRef<Path>, options: BlockWriterOptions) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        let work_dir = output_dir.join(format!(".tmp-{}", ulid::Ulid::new()));
        fs::create_dir_all(work_dir.join(CHUNKS_DIR))?;

        let file = File::create(work_dir.join(CHUNKS_DIR).join(CHUNK_SEGMENT))?;
        let head = Head {
            chunks: Some(BufWriter::new(file)),
            offset: 0,
            series: BTreeMap::new(),
            stats: BlockStats::default(),
            min_time: i64::MAX,
            max_time: i64::MIN,
            sealed: false,
        };

        debug!(dir = ?work_dir, "opened block writer");

        Ok(Self {
            output_dir,
            work_dir,
            options,
            head: Arc::new(Mutex::new(head)),
            state: WriterState::Open,
        })
    }

    /// Open a new append handle
    pub fn appender(&self) -> Appender {
        Appender {
            head: self.head.clone(),
            max_samples_per_chunk: self.options.max_samples_per_chunk,
            pending: BTreeMap::new(),
            pending_samples: 0,
        }
    }

    /// Number of samples committed so far
    pub fn committed_samples(&self) -> u64 {
        self.head.lock().stats.num_samples
    }

    /// Private working directory of this writer
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Turn all committed samples into an immutable block and return its id.
    ///
    /// Uncommitted samples of open appenders are not included.
    pub fn flush(&mut self) -> Result<BlockId> {
        if self.state != WriterState::Open {
            return Err(SplitError::Internal("block writer already flushed".into()));
        }

        let mut head = self.head.lock();
        head.sealed = true;
        if head.stats.num_samples == 0 {
            return Err(SplitError::EmptyBlock);
        }

        head.sync()?;
        head.chunks = None;

        let series = std::mem::take(&mut head.series);
        let index = Index {
            series: series
                .into_iter()
                .map(|(labels, s)| SeriesEntry {
                    labels,
                    chunks: s.chunks,
                })
                .collect(),
        };
        index.write(&self.work_dir.join(INDEX_FILENAME))?;

        let id = BlockId::new();
        let mut stats = head.stats;
        stats.num_series = index.series.len() as u64;
        let meta = BlockMeta {
            ulid: id,
            min_time: head.min_time,
            max_time: head.max_time + 1,
            stats,
            compaction: CompactionMeta {
                level: 1,
                sources: vec![id],
            },
            version: META_VERSION,
            thanos: ThanosMeta {
                source: self.options.source.clone(),
                version: 1,
                ..Default::default()
            },
        };
        drop(head);

        if meta.duration_ms() > self.options.block_duration {
            warn!(
                block = %id,
                duration_ms = meta.duration_ms(),
                block_duration_ms = self.options.block_duration,
                "block spans more than the configured block duration"
            );
        }
        meta.write_to_dir(&self.work_dir)?;

        let dest = self.output_dir.join(id.to_string());
        fs::rename(&self.work_dir, &dest)?;
        self.state = WriterState::Flushed;

        info!(
            block = %id,
            series = stats.num_series,
            samples = stats.num_samples,
            chunks = stats.num_chunks,
            "flushed block"
        );
        Ok(id)
    }

    /// Release the writer, removing its working directory if no block was produced
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, WriterState::Closed);
        self.head.lock().chunks = None;
        if state == WriterState::Open && self.work_dir.exists() {
            fs::remove_dir_all(&self.work_dir)?;
        }
        Ok(())
    }
}

impl Drop for BlockWriter {
    fn drop(&mut self) {
        if self.state != WriterState::Closed {
            if let Err(e) = self.release() {
                warn!("Failed to remove block writer directory {:?}: {}", self.work_dir, e);
            }
        }
    }
}

struct PendingSeries {
    committed_last: Option<Timestamp>,
    samples: Vec<Sample>,
}

impl PendingSeries {
    fn last_timestamp(&self) -> Option<Timestamp> {
        self.samples
            .last()
            .map(Sample::timestamp)
            .or(self.committed_last)
    }
}

/// Append handle of a [`BlockWriter`].
///
/// Samples are buffered until [`Appender::commit`]; dropping the appender
/// discards them.
pub struct Appender {
    head: Arc<Mutex<Head>>,
    max_samples_per_chunk: usize,
    pending: BTreeMap<Labels, PendingSeries>,
    pending_samples: usize,
}

impl Appender {
    /// Append a float sample
    pub fn append_float(&mut self, labels: &Labels, t: Timestamp, v: f64) -> Result<()> {
        self.append(labels, Sample::Float { t, v })
    }

    /// Append a native histogram sample; exactly one encoding must be given
    pub fn append_histogram(
        &mut self,
        labels: &Labels,
        t: Timestamp,
        h: Option<Histogram>,
        fh: Option<FloatHistogram>,
    ) -> Result<()> {
        let sample = match (h, fh) {
            (Some(h), None) => Sample::Histogram { t, h: Box::new(h) },
            (None, Some(fh)) => Sample::FloatHistogram { t, fh: Box::new(fh) },
            (Some(_), Some(_)) => {
                return Err(SplitError::Append(format!(
                    "series {} at {}: both histogram encodings given",
                    labels, t
                )))
            }
            (None, None) => {
                return Err(SplitError::Append(format!(
                    "series {} at {}: histogram sample without a histogram",
                    labels, t
                )))
            }
        };
        self.append(labels, sample)
    }

    /// Append any sample; timestamps must increase per series
    pub fn append(&mut self, labels: &Labels, sample: Sample) -> Result<()> {
        if labels.is_empty() {
            return Err(SplitError::Append("empty label set".into()));
        }
        if !self.pending.contains_key(labels) {
            let committed_last = self.head.lock().last_timestamp(labels);
            self.pending.insert(
                labels.clone(),
                PendingSeries {
                    committed_last,
                    samples: Vec::new(),
                },
            );
        }
        let series = self
            .pending
            .get_mut(labels)
            .ok_or_else(|| SplitError::Internal("pending series vanished".into()))?;

        let t = sample.timestamp();
        if let Some(last) = series.last_timestamp() {
            if t <= last {
                return Err(SplitError::OutOfOrderSample {
                    labels: labels.clone(),
                    timestamp: t,
                    last,
                });
            }
        }
        series.samples.push(sample);
        self.pending_samples += 1;
        Ok(())
    }

    /// Number of buffered samples
    pub fn pending(&self) -> usize {
        self.pending_samples
    }

    /// Persist buffered samples to the writer; returns how many were written
    pub fn commit(self) -> Result<usize> {
        if self.pending_samples == 0 {
            return Ok(0);
        }

        let mut head = self.head.lock();
        if head.sealed {
            return Err(SplitError::Internal("commit after block writer flush".into()));
        }

        // Another appender of the same writer may have committed in between.
        for (labels, series) in &self.pending {
            if let (Some(last), Some(first)) = (head.last_timestamp(labels), series.samples.first()) {
                if first.timestamp() <= last {
                    return Err(SplitError::OutOfOrderSample {
                        labels: labels.clone(),
                        timestamp: first.timestamp(),
                        last,
                    });
                }
            }
        }

        for (labels, series) in self.pending {
            if series.samples.is_empty() {
                continue;
            }
            let refs = head.write_chunks(&series.samples, self.max_samples_per_chunk)?;
            let last_ts = series.samples[series.samples.len() - 1].timestamp();
            let entry = head.series.entry(labels).or_insert_with(|| HeadSeries {
                last_ts,
                chunks: Vec::new(),
            });
            entry.last_ts = last_ts;
            entry.chunks.extend(refs);
        }
        head.sync()?;

        Ok(self.pending_samples)
    }

    /// Discard buffered samples; returns how many were dropped
    pub fn rollback(self) -> usize {
        self.pending_samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockReader;
    use crate::TimeRange;
    use tempfile::TempDir;

    fn series(name: &str) -> Labels {
        Labels::from_pairs([("__name__", name)])
    }

    #[test]
    fn test_commit_and_flush() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = BlockWriter::new(temp_dir.path(), BlockWriterOptions::default()).unwrap();

        let mut app = writer.appender();
        for t in 0..10 {
            app.append_float(&series("a"), t * 1000, t as f64).unwrap();
        }
        assert_eq!(app.pending(), 10);
        assert_eq!(app.commit().unwrap(), 10);

        let mut app = writer.appender();
        app.append_histogram(&series("b"), 500, Some(Histogram::default()), None)
            .unwrap();
        app.commit().unwrap();
        assert_eq!(writer.committed_samples(), 11);

        let id = writer.flush().unwrap();
        writer.close().unwrap();

        let block_dir = temp_dir.path().join(id.to_string());
        let reader = BlockReader::open(&block_dir).unwrap();
        let meta = reader.meta();
        assert_eq!(meta.min_time, 0);
        assert_eq!(meta.max_time, 9001);
        assert_eq!(meta.stats.num_samples, 11);
        assert_eq!(meta.stats.num_series, 2);
        assert_eq!(meta.stats.num_histogram_samples, 1);

        let names: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![id.to_string()]);

        let total: usize = reader
            .querier(TimeRange::all())
            .select(&[])
            .map(|s| s.unwrap().iter().count())
            .sum();
        assert_eq!(total, 11);
    }

    #[test]
    fn test_out_of_order_within_appender() {
        let temp_dir = TempDir::new().unwrap();
        let writer = BlockWriter::new(temp_dir.path(), BlockWriterOptions::default()).unwrap();

        let mut app = writer.appender();
        app.append_float(&series("a"), 10, 1.0).unwrap();
        let err = app.append_float(&series("a"), 10, 2.0).unwrap_err();
        assert!(matches!(err, SplitError::OutOfOrderSample { timestamp: 10, last: 10, .. }));

        // Other series are independent.
        app.append_float(&series("b"), 5, 1.0).unwrap();
    }

    #[test]
    fn test_out_of_order_across_commits() {
        let temp_dir = TempDir::new().unwrap();
        let writer = BlockWriter::new(temp_dir.path(), BlockWriterOptions::default()).unwrap();

        let mut app = writer.appender();
        app.append_float(&series("a"), 100, 1.0).unwrap();
        app.commit().unwrap();

        let mut app = writer.appender();
        let err = app.append_float(&series("a"), 50, 1.0).unwrap_err();
        assert!(matches!(err, SplitError::OutOfOrderSample { last: 100, .. }));
    }

    #[test]
    fn test_histogram_requires_one_encoding() {
        let temp_dir = TempDir::new().unwrap();
        let writer = BlockWriter::new(temp_dir.path(), BlockWriterOptions::default()).unwrap();
        let mut app = writer.appender();

        assert!(matches!(
            app.append_histogram(&series("h"), 1, None, None),
            Err(SplitError::Append(_))
        ));
        assert!(matches!(
            app.append_histogram(
                &series("h"),
                1,
                Some(Histogram::default()),
                Some(FloatHistogram::default())
            ),
            Err(SplitError::Append(_))
        ));
    }

    #[test]
    fn test_flush_empty_writer() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = BlockWriter::new(temp_dir.path(), BlockWriterOptions::default()).unwrap();

        let mut app = writer.appender();
        app.append_float(&series("a"), 1, 1.0).unwrap();
        assert_eq!(app.rollback(), 1);

        assert!(matches!(writer.flush(), Err(SplitError::EmptyBlock)));
    }

    #[test]
    fn test_drop_removes_work_dir() {
        let temp_dir = TempDir::new().unwrap();
        let work_dir = {
            let writer = BlockWriter::new(temp_dir.path(), BlockWriterOptions::default()).unwrap();
            let mut app = writer.appender();
            app.append_float(&series("a"), 1, 1.0).unwrap();
            app.commit().unwrap();
            writer.work_dir().to_path_buf()
        };
        assert!(!work_dir.exists());
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }
}
