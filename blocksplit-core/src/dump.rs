//! Text dump of block samples

use crate::block::{BlockReader, Matcher};
use crate::{Result, Sample, SplitError, TimeRange};
use std::io::Write;

/// Write one line per sample of every series matching `matchers` within
/// `range`. Returns the number of lines written.
///
/// Float samples print as `<labels> <value> <timestamp>`; histogram samples
/// print their count and sum instead of a value.
pub fn dump_samples<W: Write>(
    reader: &BlockReader,
    range: TimeRange,
    matchers: &[Matcher],
    out: &mut W,
) -> Result<usize> {
    let mut lines = 0;
    let querier = reader.querier(range);
    let mut series_set = querier.select(matchers);

    for series in series_set.by_ref() {
        let series = series?;
        let labels = series.labels();
        for sample in series.iter() {
            match sample? {
                Sample::Float { t, v } => writeln!(out, "{} {} {}", labels, v, t)?,
                Sample::Histogram { t, h } => writeln!(
                    out,
                    "{} histogram{{count={}, sum={}}} {}",
                    labels, h.count, h.sum, t
                )?,
                Sample::FloatHistogram { t, fh } => writeln!(
                    out,
                    "{} float_histogram{{count={}, sum={}}} {}",
                    labels, fh.count, fh.sum, t
                )?,
            }
            lines += 1;
        }
    }

    let warnings = series_set.warnings();
    if !warnings.is_empty() {
        return Err(SplitError::Warnings(warnings.to_vec()));
    }
    Ok(lines)
}
