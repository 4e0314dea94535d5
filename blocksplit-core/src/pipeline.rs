//! Single pass over an input block, routing every series to its tenant

use crate::block::{BlockReader, Matcher};
use crate::config::EXT_LABELS;
use crate::partition::{extraction_names, partition, Partition};
use crate::reconcile::{reconcile, OutputBlock};
use crate::relabel::Relabeler;
use crate::routing::RoutingTable;
use crate::{Result, Sample, SplitError, TimeRange};
use std::time::Instant;
use tracing::{debug, info};

/// Counters of one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitStats {
    /// Series read from the input block
    pub series: u64,
    /// Series dropped by relabeling
    pub dropped_series: u64,
    /// Samples appended to tenants
    pub samples: u64,
}

/// Result of splitting one block
#[derive(Debug)]
pub struct SplitOutcome {
    pub stats: SplitStats,
    pub outputs: Vec<OutputBlock>,
}

/// Drives relabeling, partitioning and routing for one input block
pub struct SplitPipeline<'a> {
    relabeler: &'a dyn Relabeler,
    table: &'a RoutingTable,
}

impl<'a> SplitPipeline<'a> {
    pub fn new(relabeler: &'a dyn Relabeler, table: &'a RoutingTable) -> Self {
        Self { relabeler, table }
    }

    /// Replay every series of `reader` into the routing table.
    ///
    /// The first read or append error aborts the pass. Cursor warnings are
    /// checked once the cursor is exhausted and fail the pass as well.
    pub fn run(&self, reader: &BlockReader) -> Result<SplitStats> {
        let mut stats = SplitStats::default();
        let querier = reader.querier(TimeRange::all());
        let mut series_set = querier.select(&[Matcher::match_all()]);

        for series in series_set.by_ref() {
            let series = series?;
            stats.series += 1;

            let (labels, keep) = self.relabeler.process(series.labels());
            if !keep {
                debug!(series = %series.labels(), "series dropped by relabeling");
                stats.dropped_series += 1;
                continue;
            }

            let names = extraction_names(labels.get(EXT_LABELS));
            let Partition { kept, extracted } = partition(&labels, &names);

            let mut tenant = self.table.get_or_create(&extracted)?;
            for sample in series.iter() {
                match sample? {
                    Sample::Float { t, v } => tenant.append_float(&kept, t, v)?,
                    Sample::Histogram { t, h } => tenant.append_histogram(&kept, t, Some(*h), None)?,
                    Sample::FloatHistogram { t, fh } => {
                        tenant.append_histogram(&kept, t, None, Some(*fh))?
                    }
                }
                stats.samples += 1;
            }
        }

        let warnings = series_set.warnings();
        if !warnings.is_empty() {
            return Err(SplitError::Warnings(warnings.to_vec()));
        }
        Ok(stats)
    }

    /// Run the pass and flush every tenant into an output block.
    ///
    /// On failure all tenants are discarded together with their working
    /// directories.
    pub fn split(&self, reader: &BlockReader) -> Result<SplitOutcome> {
        let start = Instant::now();

        let stats = match self.run(reader) {
            Ok(stats) => stats,
            Err(e) => {
                drop(self.table.drain());
                return Err(e);
            }
        };
        let outputs = reconcile(self.table, reader.meta())?;

        info!(
            block = %reader.meta().ulid,
            series = stats.series,
            dropped = stats.dropped_series,
            samples = stats.samples,
            outputs = outputs.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "split block"
        );
        Ok(SplitOutcome { stats, outputs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockWriter, BlockWriterOptions};
    use crate::relabel::RelabelRules;
    use crate::{BucketSpan, FloatHistogram, Histogram, Labels};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn input_block(dir: &Path, series: &[(Labels, i64)]) -> PathBuf {
        let mut writer = BlockWriter::new(dir, BlockWriterOptions::default()).unwrap();
        let mut app = writer.appender();
        for (labels, n) in series {
            for t in 0..*n {
                app.append_float(labels, t, t as f64).unwrap();
            }
        }
        app.commit().unwrap();
        let id = writer.flush().unwrap();
        dir.join(id.to_string())
    }

    #[test]
    fn test_series_routed_by_extracted_labels() {
        let temp_dir = TempDir::new().unwrap();
        let in_dir = temp_dir.path().join("in");
        let out_dir = temp_dir.path().join("out");
        std::fs::create_dir_all(&in_dir).unwrap();
        std::fs::create_dir_all(&out_dir).unwrap();

        let block = input_block(
            &in_dir,
            &[
                (
                    Labels::from_pairs([
                        ("__name__", "cpu"),
                        (EXT_LABELS, "tenant"),
                        ("region", "eu"),
                        ("tenant", "a"),
                    ]),
                    10,
                ),
                (
                    Labels::from_pairs([
                        ("__name__", "cpu"),
                        (EXT_LABELS, "tenant"),
                        ("region", "eu"),
                        ("tenant", "b"),
                    ]),
                    7,
                ),
            ],
        );

        let reader = BlockReader::open(&block).unwrap();
        let rules = RelabelRules::default();
        let table = RoutingTable::new(&out_dir, BlockWriterOptions::default(), 5000);
        let outcome = SplitPipeline::new(&rules, &table).split(&reader).unwrap();

        assert_eq!(outcome.stats.samples, 17);
        assert_eq!(outcome.outputs.len(), 2);
        assert!(table.is_empty());

        for output in &outcome.outputs {
            let out = BlockReader::open(&output.dir).unwrap();
            let series: Vec<_> = out
                .querier(TimeRange::all())
                .select(&[])
                .map(|s| s.unwrap().labels().clone())
                .collect();
            assert_eq!(
                series,
                vec![Labels::from_pairs([("__name__", "cpu"), ("region", "eu")])]
            );
        }
    }

    #[test]
    fn test_dropped_series_create_no_tenant() {
        let temp_dir = TempDir::new().unwrap();
        let block = input_block(
            temp_dir.path(),
            &[(Labels::from_pairs([("__name__", "debug_metric")]), 5)],
        );
        let out_dir = TempDir::new().unwrap();

        let reader = BlockReader::open(&block).unwrap();
        let rules =
            RelabelRules::from_yaml("- source_labels: [__name__]\n  regex: debug_.*\n  action: drop\n")
                .unwrap();
        let table = RoutingTable::new(out_dir.path(), BlockWriterOptions::default(), 5000);

        let stats = SplitPipeline::new(&rules, &table).run(&reader).unwrap();
        assert_eq!(stats.dropped_series, 1);
        assert_eq!(stats.samples, 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_histograms_replayed() {
        let temp_dir = TempDir::new().unwrap();
        let labels = Labels::from_pairs([("__name__", "latency")]);
        let mut writer = BlockWriter::new(temp_dir.path(), BlockWriterOptions::default()).unwrap();
        let mut app = writer.appender();
        app.append_float(&labels, 1, 1.0).unwrap();
        let h = Histogram {
            count: 3,
            sum: 1.5,
            ..Default::default()
        };
        app.append_histogram(&labels, 2, Some(h.clone()), None).unwrap();
        let fh = FloatHistogram {
            schema: 1,
            count: 4.5,
            sum: 9.0,
            positive_spans: vec![BucketSpan { offset: 0, length: 2 }],
            positive_buckets: vec![1.5, 3.0],
            ..Default::default()
        };
        app.append_histogram(&labels, 3, None, Some(fh.clone())).unwrap();
        app.commit().unwrap();
        let block = temp_dir.path().join(writer.flush().unwrap().to_string());

        let out_dir = TempDir::new().unwrap();
        let reader = BlockReader::open(&block).unwrap();
        let rules = RelabelRules::default();
        let table = RoutingTable::new(out_dir.path(), BlockWriterOptions::default(), 5000);
        let outcome = SplitPipeline::new(&rules, &table).split(&reader).unwrap();

        let out = BlockReader::open(&outcome.outputs[0].dir).unwrap();
        let series = out.querier(TimeRange::all()).select(&[]).next().unwrap().unwrap();
        let samples: Vec<_> = series.iter().map(|s| s.unwrap()).collect();
        assert_eq!(
            samples,
            vec![
                Sample::Float { t: 1, v: 1.0 },
                Sample::Histogram { t: 2, h: Box::new(h) },
                Sample::FloatHistogram { t: 3, fh: Box::new(fh) },
            ]
        );
        assert_eq!(out.meta().stats.num_histogram_samples, 2);
        assert_eq!(outcome.stats.samples, 3);
    }

    #[test]
    fn test_append_error_aborts_and_cleans_up() {
        let temp_dir = TempDir::new().unwrap();
        // Both series end up as {__name__="cpu"} once `replica` is dropped
        let block = input_block(
            temp_dir.path(),
            &[
                (Labels::from_pairs([("__name__", "cpu"), ("replica", "1")]), 3),
                (Labels::from_pairs([("__name__", "cpu"), ("replica", "2")]), 3),
            ],
        );
        let out_dir = TempDir::new().unwrap();

        let reader = BlockReader::open(&block).unwrap();
        let rules = RelabelRules::from_yaml("- action: labeldrop\n  regex: replica\n").unwrap();
        let table = RoutingTable::new(out_dir.path(), BlockWriterOptions::default(), 5000);

        let err = SplitPipeline::new(&rules, &table).split(&reader).unwrap_err();
        assert!(matches!(err, SplitError::OutOfOrderSample { timestamp: 0, last: 2, .. }));
        assert!(table.is_empty());
        assert_eq!(std::fs::read_dir(out_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_cursor_warnings_abort_run() {
        let temp_dir = TempDir::new().unwrap();
        let block = input_block(
            temp_dir.path(),
            &[
                (Labels::from_pairs([("__name__", "a")]), 3),
                (Labels::from_pairs([("__name__", "b")]), 3),
            ],
        );
        let segment = block.join("chunks").join("000001");
        let len = std::fs::metadata(&segment).unwrap().len();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&segment)
            .unwrap()
            .set_len(len - 1)
            .unwrap();
        let out_dir = TempDir::new().unwrap();

        let reader = BlockReader::open(&block).unwrap();
        let rules = RelabelRules::default();
        let table = RoutingTable::new(out_dir.path(), BlockWriterOptions::default(), 5000);

        match SplitPipeline::new(&rules, &table).split(&reader) {
            Err(SplitError::Warnings(warnings)) => {
                assert_eq!(warnings.len(), 1);
                assert!(warnings[0].contains("\"b\""));
            }
            other => panic!("expected cursor warnings, got {:?}", other.map(|o| o.stats)),
        }
        assert!(table.is_empty());
        assert_eq!(std::fs::read_dir(out_dir.path()).unwrap().count(), 0);
    }
}
