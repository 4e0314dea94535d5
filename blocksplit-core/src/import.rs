//! Import of text samples into blocks
//!
//! Input lines follow the text exposition format with mandatory timestamps:
//!
//! ```text
//! # HELP http_requests_total Requests served
//! http_requests_total{code="200",job="api"} 1027 1700000000000
//! {__name__="up", job="api"} 1 1700000015000
//! ```
//!
//! Samples are cut into blocks aligned to a block duration. Every window
//! re-reads the input, so memory holds at most one commit worth of samples.

use crate::block::{parse_selector, BlockMeta, BlockWriter, BlockWriterOptions, MatchType};
use crate::inspect::{format_thousands, humanize_duration, Table};
use crate::{Labels, Result, SplitError, Timestamp};
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Block ranges grow by this factor from the default duration
const RANGE_STEP: i64 = 3;

/// Number of block ranges considered
const RANGE_COUNT: u32 = 10;

/// Import options
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Largest wanted block span in milliseconds; rounded down to a
    /// compatible duration
    pub max_block_duration: i64,
    /// Labels stored in the metadata of every created block
    pub labels: BTreeMap<String, String>,
    /// Samples buffered before an intermediate commit
    pub commit_threshold: usize,
    pub writer: BlockWriterOptions,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            max_block_duration: crate::config::DEFAULT_BLOCK_DURATION_MS,
            labels: BTreeMap::new(),
            commit_threshold: crate::config::COMMIT_THRESHOLD,
            writer: BlockWriterOptions::default(),
        }
    }
}

/// One parsed input line
#[derive(Debug, Clone, PartialEq)]
pub struct TextSample {
    pub labels: Labels,
    pub value: f64,
    pub timestamp: Timestamp,
}

/// Parse one input line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Result<Option<TextSample>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let end = series_end(line)?;
    let (series, rest) = line.split_at(end);
    let mut fields = rest.split_whitespace();
    let value = fields
        .next()
        .ok_or_else(|| SplitError::InvalidFormat(format!("expected value for series {}", series)))?;
    let timestamp = fields.next().ok_or_else(|| {
        SplitError::InvalidFormat(format!("expected timestamp for series {}, got none", series))
    })?;
    if let Some(extra) = fields.next() {
        return Err(SplitError::InvalidFormat(format!(
            "unexpected {:?} after timestamp",
            extra
        )));
    }

    let mut pairs = Vec::new();
    for m in parse_selector(series)
        .map_err(|e| SplitError::InvalidFormat(format!("series {}: {}", series, e)))?
    {
        if m.kind != MatchType::Equal {
            return Err(SplitError::InvalidFormat(format!(
                "series {}: label {} must use =",
                series, m
            )));
        }
        pairs.push((m.name, m.value));
    }
    let labels = Labels::from_pairs(pairs);
    if labels.get(crate::METRIC_NAME).unwrap_or("").is_empty() {
        return Err(SplitError::InvalidFormat(format!(
            "series {} has no metric name",
            series
        )));
    }

    let value = value
        .parse::<f64>()
        .map_err(|e| SplitError::InvalidFormat(format!("value {:?}: {}", value, e)))?;
    let timestamp = timestamp
        .parse::<Timestamp>()
        .map_err(|e| SplitError::InvalidFormat(format!("timestamp {:?}: {}", timestamp, e)))?;

    Ok(Some(TextSample {
        labels,
        value,
        timestamp,
    }))
}

/// Byte offset one past the series part of a line. Label values may contain
/// spaces and braces inside quotes.
fn series_end(line: &str) -> Result<usize> {
    let mut in_braces = false;
    let mut quote = None;
    let mut escaped = false;

    for (i, c) in line.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' if in_braces => quote = Some(c),
            '{' => in_braces = true,
            '}' if in_braces => return Ok(i + 1),
            c if c.is_whitespace() && !in_braces => return Ok(i),
            _ => {}
        }
    }

    if in_braces {
        return Err(SplitError::InvalidFormat(format!("unterminated label set in {:?}", line)));
    }
    Ok(line.len())
}

/// Samples of `input` in line order; errors carry the line number
fn samples(input: &str) -> impl Iterator<Item = Result<TextSample>> + '_ {
    input.lines().enumerate().filter_map(|(i, line)| {
        parse_line(line)
            .map_err(|e| match e {
                SplitError::InvalidFormat(msg) => {
                    SplitError::InvalidFormat(format!("line {}: {}", i + 1, msg))
                }
                other => other,
            })
            .transpose()
    })
}

/// Smallest and largest timestamp of the input, `None` without samples
pub fn time_bounds(input: &str) -> Result<Option<(Timestamp, Timestamp)>> {
    let mut bounds: Option<(Timestamp, Timestamp)> = None;
    for sample in samples(input) {
        let t = sample?.timestamp;
        bounds = Some(match bounds {
            Some((min, max)) => (min.min(t), max.max(t)),
            None => (t, t),
        });
    }
    Ok(bounds)
}

/// Largest block range not above `max_duration`.
///
/// Ranges are the default duration times powers of three; anything below
/// the default yields the default, anything above the largest range yields
/// the largest.
pub fn compatible_block_duration(max_duration: i64) -> i64 {
    let base = crate::config::DEFAULT_BLOCK_DURATION_MS;
    let mut duration = base;
    for i in 1..RANGE_COUNT {
        let range = base * RANGE_STEP.pow(i);
        if range > max_duration {
            break;
        }
        duration = range;
    }
    duration
}

/// Write the samples of `input` into blocks under `output_dir`.
///
/// Returns the metadata of every created block in time order. Windows
/// without samples produce no block.
pub fn import_text(input: &str, output_dir: &Path, options: &ImportOptions) -> Result<Vec<BlockMeta>> {
    if options.commit_threshold == 0 {
        return Err(SplitError::Config("commit threshold must be positive".into()));
    }
    let Some((min_time, max_time)) = time_bounds(input)? else {
        info!("no samples to import");
        return Ok(Vec::new());
    };

    let duration = compatible_block_duration(options.max_block_duration);
    let writer_options = BlockWriterOptions {
        block_duration: duration,
        ..options.writer.clone()
    };
    std::fs::create_dir_all(output_dir)?;

    let mut metas = Vec::new();
    let mut start = min_time.div_euclid(duration) * duration;
    let mut next_sample = Timestamp::MAX;

    while start <= max_time {
        let Some(end) = start.checked_add(duration) else {
            break;
        };
        // Nothing before the next known sample; skip the scan
        if next_sample != Timestamp::MAX && next_sample >= end {
            start = end;
            continue;
        }
        next_sample = Timestamp::MAX;

        let mut writer = BlockWriter::new(output_dir, writer_options.clone())?;
        let mut app = writer.appender();
        for sample in samples(input) {
            let sample = sample?;
            if sample.timestamp < start {
                continue;
            }
            if sample.timestamp >= end {
                next_sample = next_sample.min(sample.timestamp);
                continue;
            }
            app.append_float(&sample.labels, sample.timestamp, sample.value)?;
            if app.pending() >= options.commit_threshold {
                app.commit()?;
                app = writer.appender();
            }
        }
        app.commit()?;

        match writer.flush() {
            Ok(id) => {
                let dir = output_dir.join(id.to_string());
                let mut meta = BlockMeta::read_from_dir(&dir)?;
                meta.thanos.labels = options.labels.clone();
                meta.write_to_dir(&dir)?;
                info!(
                    block = %id,
                    samples = meta.stats.num_samples,
                    series = meta.stats.num_series,
                    "imported block"
                );
                metas.push(meta);
            }
            Err(SplitError::EmptyBlock) => {
                debug!(start, end, "no samples in window");
            }
            Err(e) => return Err(e),
        }
        writer.close()?;
        start = end;
    }

    Ok(metas)
}

/// Table of imported blocks
pub fn blocks_table(metas: &[BlockMeta]) -> Table {
    let header = [
        "BLOCK ULID",
        "MIN TIME",
        "MAX TIME",
        "DURATION",
        "NUM SAMPLES",
        "NUM CHUNKS",
        "NUM SERIES",
    ];
    let rows = metas
        .iter()
        .map(|m| {
            vec![
                m.ulid.to_string(),
                format_time(m.min_time),
                format_time(m.max_time),
                humanize_duration(m.duration_ms()),
                format_thousands(m.stats.num_samples),
                format_thousands(m.stats.num_chunks),
                format_thousands(m.stats.num_series),
            ]
        })
        .collect();
    Table {
        header: header.iter().map(|h| h.to_string()).collect(),
        rows,
    }
}

fn format_time(ms: Timestamp) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => ms.to_string(),
    }
}
