//! Core types for blocksplit

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Name of the metric name label
pub const METRIC_NAME: &str = "__name__";

/// Prefix reserved for internal labels; stripped from output series
pub const RESERVED_PREFIX: &str = "__";

/// A single label pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    /// Create a new label
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Internal labels start with `__`, except the metric name
    pub fn is_internal(&self) -> bool {
        self.name.starts_with(RESERVED_PREFIX) && self.name != METRIC_NAME
    }
}

/// Label set sorted by name, unique by name
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Create an empty label set
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build from pairs; later duplicates win
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        let map: BTreeMap<String, String> = pairs
            .into_iter()
            .map(|(n, v)| (n.into(), v.into()))
            .collect();
        Self::from_map(&map)
    }

    /// Build from a map; map order already matches label order
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        Self(
            map.iter()
                .map(|(n, v)| Label::new(n.clone(), v.clone()))
                .collect(),
        )
    }

    /// Wrap labels that are already sorted and unique.
    ///
    /// Only for producers that guarantee the ordering, such as the partitioner.
    pub(crate) fn from_sorted(labels: Vec<Label>) -> Self {
        debug_assert!(labels.windows(2).all(|w| w[0].name < w[1].name));
        Self(labels)
    }

    /// Convert into a name -> value map
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|l| (l.name.clone(), l.value.clone()))
            .collect()
    }

    /// Value of the named label
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    /// Set a label, keeping the set sorted. An empty value removes the label.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.binary_search_by(|l| l.name.cmp(&name)) {
            Ok(i) if value.is_empty() => {
                self.0.remove(i);
            }
            Ok(i) => self.0[i].value = value,
            Err(_) if value.is_empty() => {}
            Err(i) => self.0.insert(i, Label { name, value }),
        }
    }

    /// Remove a label by name
    pub fn remove(&mut self, name: &str) {
        if let Ok(i) = self.0.binary_search_by(|l| l.name.as_str().cmp(name)) {
            self.0.remove(i);
        }
    }

    /// Number of labels
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in name order
    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    /// Borrow as a slice
    pub fn as_slice(&self) -> &[Label] {
        &self.0
    }

    /// Stable 64-bit hash of the label set.
    ///
    /// Names and values are separated by a byte that cannot occur in valid
    /// UTF-8, so `{a="bc"}` and `{ab="c"}` hash differently.
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for label in &self.0 {
            hasher.write(label.name.as_bytes());
            hasher.write_u8(0xff);
            hasher.write(label.value.as_bytes());
            hasher.write_u8(0xff);
        }
        hasher.finish()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, l) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", l.name, l.value)?;
        }
        f.write_str("}")
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A span of populated histogram buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSpan {
    /// Gap to the previous span (or start index for the first span)
    pub offset: i32,
    /// Number of consecutive buckets
    pub length: u32,
}

/// Counter reset hint carried by native histograms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CounterResetHint {
    #[default]
    Unknown,
    CounterReset,
    NotCounterReset,
    Gauge,
}

/// Integer native histogram; bucket counts are delta encoded
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Histogram {
    pub counter_reset_hint: CounterResetHint,
    pub schema: i32,
    pub zero_threshold: f64,
    pub zero_count: u64,
    pub count: u64,
    pub sum: f64,
    pub positive_spans: Vec<BucketSpan>,
    pub negative_spans: Vec<BucketSpan>,
    pub positive_buckets: Vec<i64>,
    pub negative_buckets: Vec<i64>,
}

/// Float native histogram; bucket counts are absolute
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FloatHistogram {
    pub counter_reset_hint: CounterResetHint,
    pub schema: i32,
    pub zero_threshold: f64,
    pub zero_count: f64,
    pub count: f64,
    pub sum: f64,
    pub positive_spans: Vec<BucketSpan>,
    pub negative_spans: Vec<BucketSpan>,
    pub positive_buckets: Vec<f64>,
    pub negative_buckets: Vec<f64>,
}

/// Kind of value stored in a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueKind {
    Float = 1,
    Histogram = 2,
    FloatHistogram = 3,
}

impl TryFrom<u8> for ValueKind {
    type Error = crate::SplitError;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            1 => Ok(ValueKind::Float),
            2 => Ok(ValueKind::Histogram),
            3 => Ok(ValueKind::FloatHistogram),
            _ => Err(crate::SplitError::InvalidFormat(format!(
                "Invalid value kind: {}",
                value
            ))),
        }
    }
}

/// One sample of a series; exactly one value kind per timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Sample {
    Float { t: Timestamp, v: f64 },
    Histogram { t: Timestamp, h: Box<Histogram> },
    FloatHistogram { t: Timestamp, fh: Box<FloatHistogram> },
}

impl Sample {
    /// Sample timestamp
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Sample::Float { t, .. } | Sample::Histogram { t, .. } | Sample::FloatHistogram { t, .. } => *t,
        }
    }

    /// Value kind of this sample
    pub fn kind(&self) -> ValueKind {
        match self {
            Sample::Float { .. } => ValueKind::Float,
            Sample::Histogram { .. } => ValueKind::Histogram,
            Sample::FloatHistogram { .. } => ValueKind::FloatHistogram,
        }
    }
}

/// Time range for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// The whole timeline
    pub fn all() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_sorted_and_unique() {
        let labels = Labels::from_pairs([("b", "1"), ("a", "2"), ("b", "3")]);
        let names: Vec<_> = labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(labels.get("b"), Some("3"));
        assert_eq!(labels.get("c"), None);
    }

    #[test]
    fn test_labels_set_and_remove() {
        let mut labels = Labels::from_pairs([("job", "api")]);
        labels.set("env", "prod");
        labels.set("job", "");
        assert_eq!(labels, Labels::from_pairs([("env", "prod")]));
        labels.remove("env");
        assert!(labels.is_empty());
    }

    #[test]
    fn test_labels_display() {
        let labels = Labels::from_pairs([(METRIC_NAME, "cpu"), ("region", "eu")]);
        assert_eq!(labels.to_string(), r#"{__name__="cpu", region="eu"}"#);
    }

    #[test]
    fn test_stable_hash_separates_name_and_value() {
        let a = Labels::from_pairs([("a", "bc")]);
        let b = Labels::from_pairs([("ab", "c")]);
        assert_ne!(a.stable_hash(), b.stable_hash());
        assert_eq!(a.stable_hash(), a.clone().stable_hash());
    }

    #[test]
    fn test_internal_labels() {
        assert!(Label::new("__meta_ext_labels", "x").is_internal());
        assert!(!Label::new(METRIC_NAME, "cpu").is_internal());
        assert!(!Label::new("_single", "x").is_internal());
    }

    #[test]
    fn test_time_range_bounds_inclusive() {
        let range = TimeRange::new(1_000, 2_000);
        assert!(range.contains(1_000));
        assert!(range.contains(2_000));
        assert!(!range.contains(999));
        assert!(TimeRange::all().contains(i64::MIN));
    }
}
