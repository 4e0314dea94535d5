//! Block reader for querying series

use super::chunk::{self, ChunkRef};
use super::index::Index;
use super::matcher::Matcher;
use super::meta::BlockMeta;
use super::{CHUNKS_DIR, CHUNK_SEGMENT, INDEX_FILENAME};
use crate::{Labels, Result, Sample, SplitError, TimeRange};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Chunk segment shared by all series of a block
struct ChunkFile {
    file: Mutex<File>,
    len: u64,
}

impl ChunkFile {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }

    fn read(&self, r: &ChunkRef) -> Result<Vec<Sample>> {
        if r.end() > self.len {
            return Err(SplitError::Corruption(format!(
                "chunk at {}+{} beyond segment size {}",
                r.offset, r.len, self.len
            )));
        }
        let mut data = vec![0u8; r.len as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(r.offset))?;
            file.read_exact(&mut data)?;
        }
        chunk::decode(&data, r.kind)
    }
}

/// Read access to one block on local disk
pub struct BlockReader {
    meta: BlockMeta,
    index: Arc<Index>,
    chunks: Arc<ChunkFile>,
}

impl BlockReader {
    /// Open a block directory, loading its metadata and index
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let meta = BlockMeta::read_from_dir(dir)?;
        let index = Index::read(&dir.join(INDEX_FILENAME))?;
        let chunks = ChunkFile::open(&dir.join(CHUNKS_DIR).join(CHUNK_SEGMENT))?;

        debug!(
            block = %meta.ulid,
            series = index.series.len(),
            chunk_bytes = chunks.len,
            "opened block"
        );

        Ok(Self {
            meta,
            index: Arc::new(index),
            chunks: Arc::new(chunks),
        })
    }

    /// Block metadata
    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    /// Number of series in the index
    pub fn num_series(&self) -> usize {
        self.index.series.len()
    }

    /// Querier over `range` (inclusive on both ends)
    pub fn querier(&self, range: TimeRange) -> Querier {
        Querier {
            index: self.index.clone(),
            chunks: self.chunks.clone(),
            range,
        }
    }
}

/// Time-bounded view of a block
pub struct Querier {
    index: Arc<Index>,
    chunks: Arc<ChunkFile>,
    range: TimeRange,
}

impl Querier {
    /// Select series matching every matcher, in label order. No matchers
    /// selects everything.
    pub fn select(&self, matchers: &[Matcher]) -> SeriesSet {
        SeriesSet {
            index: self.index.clone(),
            chunks: self.chunks.clone(),
            range: self.range,
            matchers: matchers.to_vec(),
            pos: 0,
            warnings: Vec::new(),
        }
    }
}

/// Forward-only cursor over selected series.
///
/// Series that cannot be served completely are skipped and reported through
/// [`SeriesSet::warnings`] once iteration ends.
pub struct SeriesSet {
    index: Arc<Index>,
    chunks: Arc<ChunkFile>,
    range: TimeRange,
    matchers: Vec<Matcher>,
    pos: usize,
    warnings: Vec<String>,
}

impl SeriesSet {
    /// Non-fatal problems encountered so far
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

impl Iterator for SeriesSet {
    type Item = Result<Series>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(entry) = self.index.series.get(self.pos) {
            self.pos += 1;

            if !self.matchers.iter().all(|m| m.matches(&entry.labels)) {
                continue;
            }

            let mut chunks = Vec::new();
            let mut prev_max = None;
            let mut truncated = false;
            for r in &entry.chunks {
                if prev_max.map_or(false, |max| r.min_time <= max) {
                    return Some(Err(SplitError::Corruption(format!(
                        "series {} has overlapping chunks at {}",
                        entry.labels, r.min_time
                    ))));
                }
                prev_max = Some(r.max_time);

                if r.end() > self.chunks.len {
                    truncated = true;
                    break;
                }
                if r.overlaps(self.range.start, self.range.end) {
                    chunks.push(*r);
                }
            }

            if truncated {
                self.warnings.push(format!(
                    "series {}: chunk data missing from segment, skipped",
                    entry.labels
                ));
                continue;
            }
            if chunks.is_empty() {
                continue;
            }

            return Some(Ok(Series {
                labels: entry.labels.clone(),
                chunks,
                file: self.chunks.clone(),
                range: self.range,
            }));
        }
        None
    }
}

/// One selected series
pub struct Series {
    labels: Labels,
    chunks: Vec<ChunkRef>,
    file: Arc<ChunkFile>,
    range: TimeRange,
}

impl Series {
    /// Series labels
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Chunks overlapping the query range
    pub fn chunks(&self) -> &[ChunkRef] {
        &self.chunks
    }

    /// Iterate samples in timestamp order
    pub fn iter(&self) -> SampleIterator {
        SampleIterator {
            file: self.file.clone(),
            chunks: self.chunks.clone().into_iter(),
            current: Vec::new().into_iter(),
            range: self.range,
            failed: false,
        }
    }
}

/// Iterator over the samples of one series, decoding chunks lazily
pub struct SampleIterator {
    file: Arc<ChunkFile>,
    chunks: std::vec::IntoIter<ChunkRef>,
    current: std::vec::IntoIter<Sample>,
    range: TimeRange,
    failed: bool,
}

impl Iterator for SampleIterator {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            for sample in self.current.by_ref() {
                if self.range.contains(sample.timestamp()) {
                    return Some(Ok(sample));
                }
            }

            let r = self.chunks.next()?;
            match self.file.read(&r) {
                Ok(samples) => self.current = samples.into_iter(),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockWriter, BlockWriterOptions, MatchType};
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_block(dir: &Path) -> PathBuf {
        let options = BlockWriterOptions {
            max_samples_per_chunk: 4,
            ..Default::default()
        };
        let mut writer = BlockWriter::new(dir, options).unwrap();
        let mut app = writer.appender();
        for name in ["a", "b", "c"] {
            let labels = Labels::from_pairs([("__name__", name)]);
            for t in 0..10 {
                app.append_float(&labels, t, t as f64).unwrap();
            }
        }
        app.commit().unwrap();
        let id = writer.flush().unwrap();
        writer.close().unwrap();
        dir.join(id.to_string())
    }

    #[test]
    fn test_select_with_matchers_and_range() {
        let temp_dir = TempDir::new().unwrap();
        let reader = BlockReader::open(write_block(temp_dir.path())).unwrap();
        assert_eq!(reader.num_series(), 3);

        let matchers = vec![Matcher::new(MatchType::Regex, "__name__", "a|c").unwrap()];
        let mut set = reader.querier(TimeRange::new(2, 5)).select(&matchers);

        let mut seen = Vec::new();
        for series in set.by_ref() {
            let series = series.unwrap();
            let ts: Vec<_> = series.iter().map(|s| s.unwrap().timestamp()).collect();
            assert_eq!(ts, vec![2, 3, 4, 5]);
            seen.push(series.labels().get("__name__").unwrap().to_string());
        }
        assert_eq!(seen, vec!["a", "c"]);
        assert!(set.warnings().is_empty());
    }

    #[test]
    fn test_truncated_segment_yields_warning() {
        let temp_dir = TempDir::new().unwrap();
        let dir = write_block(temp_dir.path());

        let segment = dir.join(CHUNKS_DIR).join(CHUNK_SEGMENT);
        let len = std::fs::metadata(&segment).unwrap().len();
        let file = OpenOptions::new().write(true).open(&segment).unwrap();
        file.set_len(len - 1).unwrap();

        let reader = BlockReader::open(&dir).unwrap();
        let mut set = reader.querier(TimeRange::all()).select(&[Matcher::match_all()]);
        let served = set.by_ref().filter(|s| s.is_ok()).count();

        assert_eq!(served, 2);
        assert_eq!(set.warnings().len(), 1);
        assert!(set.warnings()[0].contains("\"c\""));
    }

    #[test]
    fn test_corrupt_chunk_fails_iteration() {
        let temp_dir = TempDir::new().unwrap();
        let dir = write_block(temp_dir.path());

        let segment = dir.join(CHUNKS_DIR).join(CHUNK_SEGMENT);
        let mut data = std::fs::read(&segment).unwrap();
        data[12] ^= 0xFF;
        std::fs::write(&segment, data).unwrap();

        let reader = BlockReader::open(&dir).unwrap();
        let first = reader
            .querier(TimeRange::all())
            .select(&[])
            .next()
            .unwrap()
            .unwrap();
        let results: Vec<_> = first.iter().collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].as_ref().unwrap_err().is_corruption());
    }
}
