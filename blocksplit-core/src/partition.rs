//! Label partitioning
//!
//! Splits a series' label set into the labels that stay on the series and the
//! labels that select its output block.

use crate::{Label, Labels};

/// Result of partitioning one label set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    /// Labels written with the series
    pub kept: Labels,
    /// Labels identifying the output block
    pub extracted: Labels,
}

/// Split `labels` by `names` in a single merge pass.
///
/// Internal labels (`__` prefix, except `__name__`) appear in neither output.
/// Names not present in `labels` are ignored. `names` may be unsorted and
/// contain duplicates or empty strings.
pub fn partition<S: AsRef<str>>(labels: &Labels, names: &[S]) -> Partition {
    let mut names: Vec<&str> = names
        .iter()
        .map(AsRef::as_ref)
        .filter(|n| !n.is_empty())
        .collect();
    names.sort_unstable();
    names.dedup();

    let mut kept: Vec<Label> = Vec::with_capacity(labels.len());
    let mut extracted: Vec<Label> = Vec::with_capacity(names.len());

    let ls = labels.as_slice();
    let (mut i, mut j) = (0, 0);
    while i < ls.len() && j < names.len() {
        let label = &ls[i];
        if label.is_internal() {
            i += 1;
        } else if names[j] < label.name.as_str() {
            j += 1;
        } else if label.name.as_str() < names[j] {
            kept.push(label.clone());
            i += 1;
        } else {
            extracted.push(label.clone());
            i += 1;
            j += 1;
        }
    }
    kept.extend(ls[i..].iter().filter(|l| !l.is_internal()).cloned());

    Partition {
        kept: Labels::from_sorted(kept),
        extracted: Labels::from_sorted(extracted),
    }
}

/// Extraction names carried by a label value (`;` separated)
pub fn extraction_names(value: Option<&str>) -> Vec<&str> {
    match value {
        Some(v) => v.split(';').map(str::trim).filter(|n| !n.is_empty()).collect(),
        None => Vec::new(),
    }
}
