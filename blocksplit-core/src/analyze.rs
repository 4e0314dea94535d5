//! Churn and cardinality analysis of one block

use crate::block::{BlockId, BlockReader, Matcher};
use crate::inspect::{humanize_duration, labels_to_string};
use crate::{Result, SplitError, TimeRange, METRIC_NAME};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

/// Default number of entries per ranking
pub const DEFAULT_LIMIT: usize = 20;

/// Entries of a ranking, highest first
pub type Ranking = Vec<(String, u64)>;

/// Result of [`analyze`]
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub block: BlockId,
    pub block_labels: BTreeMap<String, String>,
    pub duration_ms: i64,
    pub total_series: u64,
    /// Selector text, when one was given
    pub selector: Option<String>,
    pub matched_series: u64,
    /// Distinct label names over the matched series
    pub label_names: usize,
    /// Distinct `name=value` pairs
    pub postings: usize,
    /// Label pairs summed over all matched series
    pub postings_entries: u64,
    /// Names other than `__name__` carried by every matched series
    pub names_in_all_series: Vec<String>,
    /// Label pairs by block durations not covered by their series
    pub churn_pairs: Ranking,
    /// Label names by block durations not covered by their series
    pub churn_names: Ranking,
    pub common_pairs: Ranking,
    /// Label names by summed length of their distinct values
    pub value_length: Ranking,
    /// Label names by number of distinct values
    pub cardinality: Ranking,
    /// Metric names by number of series
    pub metric_names: Ranking,
}

/// Analyze the series of `reader` matching `matchers`.
///
/// A series covers the span from its first chunk's minimum to its last
/// chunk's maximum; the rest of the block range counts as churn against
/// each of its labels. Rankings hold at most `limit` entries.
pub fn analyze(
    reader: &BlockReader,
    matchers: &[Matcher],
    selector: Option<&str>,
    limit: usize,
) -> Result<Analysis> {
    let meta = reader.meta();
    let duration = meta.duration_ms();

    let mut pair_uncovered: BTreeMap<String, u64> = BTreeMap::new();
    let mut name_uncovered: BTreeMap<String, u64> = BTreeMap::new();
    let mut pair_count: BTreeMap<String, u64> = BTreeMap::new();
    let mut values: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut metric_series: BTreeMap<String, u64> = BTreeMap::new();
    let mut in_all: Option<BTreeSet<String>> = None;
    let mut entries = 0;
    let mut matched = 0;

    let mut series_set = reader.querier(TimeRange::all()).select(matchers);
    for series in series_set.by_ref() {
        let series = series?;
        let labels = series.labels();
        let covered = match (series.chunks().first(), series.chunks().last()) {
            (Some(first), Some(last)) => last.max_time - first.min_time,
            _ => 0,
        };
        let uncovered = (duration - covered).max(0) as u64;

        for label in labels.iter() {
            let pair = format!("{}={}", label.name, label.value);
            *name_uncovered.entry(label.name.clone()).or_default() += uncovered;
            *pair_uncovered.entry(pair.clone()).or_default() += uncovered;
            *pair_count.entry(pair).or_default() += 1;
            values
                .entry(label.name.clone())
                .or_default()
                .insert(label.value.clone());
            entries += 1;
        }
        if let Some(name) = labels.get(METRIC_NAME) {
            *metric_series.entry(name.to_string()).or_default() += 1;
        }

        let names = labels
            .iter()
            .filter(|l| l.name != METRIC_NAME)
            .map(|l| l.name.clone());
        in_all = Some(match in_all {
            None => names.collect(),
            Some(mut all) => {
                let present: BTreeSet<String> = names.collect();
                all.retain(|n| present.contains(n));
                all
            }
        });
        matched += 1;
    }

    let warnings = series_set.warnings();
    if !warnings.is_empty() {
        return Err(SplitError::Warnings(warnings.to_vec()));
    }

    let per_duration = |total: &u64| {
        if duration > 0 {
            (*total as f64 / duration as f64) as u64
        } else {
            0
        }
    };

    Ok(Analysis {
        block: meta.ulid,
        block_labels: meta.thanos.labels.clone(),
        duration_ms: duration,
        total_series: meta.stats.num_series,
        selector: selector.map(str::to_string),
        matched_series: matched,
        label_names: values.len(),
        postings: pair_count.len(),
        postings_entries: entries,
        names_in_all_series: in_all.unwrap_or_default().into_iter().collect(),
        churn_pairs: rank(pair_uncovered.iter().map(|(k, v)| (k, per_duration(v))), limit),
        churn_names: rank(name_uncovered.iter().map(|(k, v)| (k, per_duration(v))), limit),
        common_pairs: rank(pair_count.iter().map(|(k, v)| (k, *v)), limit),
        value_length: rank(
            values
                .iter()
                .map(|(k, v)| (k, v.iter().map(|s| s.len() as u64).sum::<u64>())),
            limit,
        ),
        cardinality: rank(values.iter().map(|(k, v)| (k, v.len() as u64)), limit),
        metric_names: rank(metric_series.iter().map(|(k, v)| (k, *v)), limit),
    })
}

/// Highest values first, ties in key order
fn rank<'a>(items: impl Iterator<Item = (&'a String, u64)>, limit: usize) -> Ranking {
    let mut ranking: Ranking = items.map(|(k, v)| (k.clone(), v)).collect();
    ranking.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranking.truncate(limit);
    ranking
}

impl Analysis {
    /// Plain text report
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Block ID: {}", self.block);
        let _ = writeln!(out, "Thanos Labels: {}", labels_to_string(&self.block_labels));
        let _ = writeln!(out, "Duration: {}", humanize_duration(self.duration_ms));
        let _ = writeln!(out, "Total Series: {}", self.total_series);
        if let Some(selector) = &self.selector {
            let _ = writeln!(out, "Matcher: {}", selector);
        }
        let _ = writeln!(out, "Label names: {}", self.label_names);
        if self.selector.is_some() {
            let _ = writeln!(out, "Matched series: {}", self.matched_series);
        }
        let _ = writeln!(out, "Postings (unique label pairs): {}", self.postings);
        let _ = writeln!(out, "Postings entries (total label pairs): {}", self.postings_entries);
        let _ = writeln!(
            out,
            "Label names appearing in all Series: [{}]",
            self.names_in_all_series.join(", ")
        );

        for (title, ranking) in [
            ("Label pairs most involved in churning", &self.churn_pairs),
            ("Label names most involved in churning", &self.churn_names),
            ("Most common label pairs", &self.common_pairs),
            ("Label names with highest cumulative label value length", &self.value_length),
            ("Highest cardinality labels", &self.cardinality),
            ("Highest cardinality metric names", &self.metric_names),
        ] {
            let _ = writeln!(out, "\n{}:", title);
            for (key, value) in ranking {
                let _ = writeln!(out, "{} {}", value, key);
            }
        }
        out
    }
}
