//! Bucket listing and block tables

use crate::block::BlockMeta;
use crate::bucket::{BlockRef, Bucket};
use crate::relabel::is_valid_label_name;
use crate::timeutil::parse_duration;
use crate::{Labels, Result, SplitError, Timestamp};
use chrono::{NaiveDateTime, TimeZone, Utc};
use futures::{StreamExt, TryStreamExt};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Columns of the inspect table; `DIR` is only shown for recursive listings
pub const INSPECT_COLUMNS: [&str; 10] = [
    "DIR", "ID", "FROM", "RANGE", "LVL", "RES", "#SAMPLES", "#CHUNKS", "LABELS", "SRC",
];

/// Default sort order of the inspect table
pub const DEFAULT_SORT: [&str; 2] = ["FROM", "LABELS"];

/// Concurrent metadata fetches
const META_CONCURRENCY: usize = 32;

const FROM_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A block together with its metadata
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub block: BlockRef,
    pub meta: BlockMeta,
}

/// Fetch metadata of every listed block. Blocks whose `meta.json` vanished
/// meanwhile are left out.
pub async fn collect_metas(
    bucket: &Bucket,
    recursive: bool,
    max_time: Option<Timestamp>,
) -> Result<Vec<BlockInfo>> {
    let blocks = bucket.list_blocks(recursive, max_time).await?;
    let infos: Vec<Option<BlockInfo>> = futures::stream::iter(blocks)
        .map(|block| async move {
            let meta = bucket.get_meta(&block).await?;
            Ok::<_, SplitError>(meta.map(|meta| BlockInfo { block, meta }))
        })
        .buffered(META_CONCURRENCY)
        .try_collect()
        .await?;
    Ok(infos.into_iter().flatten().collect())
}

/// Parse `name="value"` (or `name=value`) flags into a label set
pub fn parse_flag_labels<S: AsRef<str>>(flags: &[S]) -> Result<Labels> {
    let mut pairs = Vec::with_capacity(flags.len());
    for flag in flags {
        let flag = flag.as_ref();
        let (name, value) = flag
            .split_once('=')
            .ok_or_else(|| SplitError::Config(format!("unrecognized label {:?}", flag)))?;
        if !is_valid_label_name(name) {
            return Err(SplitError::Config(format!("unsupported format for label {}", flag)));
        }
        let value = if value.contains('"') {
            unquote(value)
                .ok_or_else(|| SplitError::Config(format!("unquote label value {}", value)))?
        } else {
            value.to_string()
        };
        pairs.push((name.to_string(), value));
    }
    Ok(Labels::from_pairs(pairs))
}

/// Strip surrounding double quotes and resolve escapes
fn unquote(s: &str) -> Option<String> {
    let inner = s.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => return None,
            '\\' => out.push(match chars.next()? {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                c @ ('\\' | '"' | '\'') => c,
                _ => return None,
            }),
            c => out.push(c),
        }
    }
    Some(out)
}

/// Check that every selector label is present with the same value. A value
/// of `*` only requires presence.
pub fn matches_selector(labels: &BTreeMap<String, String>, selector: &Labels) -> bool {
    selector.iter().all(|l| match labels.get(&l.name) {
        Some(v) => l.value == "*" || *v == l.value,
        None => false,
    })
}

/// Compact duration: `2h`, `1h30m`, `45s`, `14d`
pub fn humanize_duration(ms: i64) -> String {
    let sign = if ms < 0 { "-" } else { "" };
    let mut secs = (ms / 1000).abs();
    if secs > 58 {
        secs = (secs + 30) / 60 * 60;
    }
    if secs % 86_400 == 0 {
        return format!("{}{}d", sign, secs / 86_400);
    }

    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    let text = match (h, m, s) {
        (0, 0, s) => format!("{}s", s),
        (0, m, 0) => format!("{}m", m),
        (0, m, s) => format!("{}m{}s", m, s),
        (h, 0, 0) => format!("{}h", h),
        (h, m, 0) => format!("{}h{}m", h, m),
        (h, m, s) => format!("{}h{}m{}s", h, m, s),
    };
    format!("{}{}", sign, text)
}

/// Integer with thousands separators
pub fn format_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// `k=v` pairs in key order, comma separated
pub fn labels_to_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `<prefix><id> <created>` line of `ls`
pub fn ls_line(block: &BlockRef) -> String {
    match block.id.created_at() {
        Some(created) => format!("{} {}", block, created.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
        None => block.to_string(),
    }
}

/// Rendered text table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Build the inspect table for blocks matching `selector`, sorted by the
    /// named columns
    pub fn inspect<S: AsRef<str>>(
        infos: &[BlockInfo],
        selector: &Labels,
        sort_by: &[S],
        recursive: bool,
    ) -> Result<Self> {
        let skip = if recursive { 0 } else { 1 };
        let header: Vec<String> = INSPECT_COLUMNS[skip..].iter().map(|c| c.to_string()).collect();

        let sort_indices = sort_by
            .iter()
            .map(|col| {
                let col = col.as_ref();
                header
                    .iter()
                    .position(|h| h == col)
                    .ok_or_else(|| SplitError::Config(format!("column {} not found", col)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut rows: Vec<Vec<String>> = infos
            .iter()
            .filter(|info| matches_selector(&info.meta.thanos.labels, selector))
            .map(|info| {
                let meta = &info.meta;
                let mut row = Vec::with_capacity(header.len());
                if recursive {
                    row.push(info.block.prefix.clone());
                }
                row.push(meta.ulid.to_string());
                row.push(format_from(meta.min_time));
                row.push(humanize_duration(meta.duration_ms()));
                row.push(format_thousands(meta.compaction.level as u64));
                row.push(humanize_duration(meta.thanos.downsample.resolution));
                row.push(format_thousands(meta.stats.num_samples));
                row.push(format_thousands(meta.stats.num_chunks));
                row.push(labels_to_string(&meta.thanos.labels));
                row.push(meta.thanos.source.clone());
                row
            })
            .collect();

        rows.sort_by(|a, b| {
            sort_indices
                .iter()
                .map(|&i| compare_cells(&a[i], &b[i]))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or_else(|| compare_cells(&a[0], &b[0]))
        });

        Ok(Self { header, rows })
    }

    /// Render with `|` separated, left aligned columns
    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self.header.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (w, cell) in widths.iter_mut().zip(row) {
                *w = (*w).max(cell.chars().count());
            }
        }

        let line = |cells: &[String]| {
            cells
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!(" {:<width$} ", c, width = *w))
                .collect::<Vec<_>>()
                .join("|")
                .trim_end()
                .to_string()
        };

        let mut out = String::new();
        out.push_str(&line(&self.header));
        out.push('\n');
        out.push_str(
            &widths
                .iter()
                .map(|w| "-".repeat(w + 2))
                .collect::<Vec<_>>()
                .join("+"),
        );
        out.push('\n');
        for row in &self.rows {
            out.push_str(&line(row));
            out.push('\n');
        }
        out
    }
}

fn format_from(ms: Timestamp) -> String {
    Utc.timestamp_opt(ms.div_euclid(1000), 0)
        .single()
        .map(|t| t.format(FROM_FORMAT).to_string())
        .unwrap_or_default()
}

/// Compare cells as times, durations, integers or plain strings, whichever
/// parses for both
fn compare_cells(a: &str, b: &str) -> Ordering {
    if let (Ok(x), Ok(y)) = (
        NaiveDateTime::parse_from_str(a, FROM_FORMAT),
        NaiveDateTime::parse_from_str(b, FROM_FORMAT),
    ) {
        return x.cmp(&y);
    }
    if let (Ok(x), Ok(y)) = (parse_duration(a), parse_duration(b)) {
        return x.cmp(&y);
    }
    if let (Ok(x), Ok(y)) = (a.replace(',', "").parse::<u64>(), b.replace(',', "").parse::<u64>()) {
        return x.cmp(&y);
    }
    a.cmp(b)
}
