//! Output block finalization and metadata merge

use crate::block::{BlockId, BlockMeta};
use crate::routing::RoutingTable;
use crate::{Labels, Result};
use std::path::PathBuf;
use tracing::{info, warn};

/// A finished output block
#[derive(Debug, Clone)]
pub struct OutputBlock {
    pub id: BlockId,
    /// Local block directory
    pub dir: PathBuf,
    /// Labels that routed series into this block
    pub extracted: Labels,
    /// Samples appended for this block
    pub samples: u64,
    pub meta: BlockMeta,
}

/// Flush every tenant of `table` and write the merged block metadata.
///
/// Tenants are processed in ascending routing key order. Each output block
/// inherits the labels and downsample resolution of `input`, with the
/// tenant's extracted labels taking precedence. The table is empty
/// afterwards, also on error.
pub fn reconcile(table: &RoutingTable, input: &BlockMeta) -> Result<Vec<OutputBlock>> {
    let tenants = table.drain();
    let mut outputs = Vec::with_capacity(tenants.len());

    for tenant in tenants {
        let key = tenant.key();
        let extracted = tenant.extracted().clone();
        let samples = tenant.samples();

        let id = match tenant.flush()? {
            Some(id) => id,
            None => {
                warn!(key, tenant = %extracted, "tenant received no samples, no block written");
                continue;
            }
        };

        let dir = table.output_dir().join(id.to_string());
        let mut meta = BlockMeta::read_from_dir(&dir)?;
        meta.thanos.labels = merge_labels(input, &extracted);
        meta.thanos.downsample = input.thanos.downsample;
        meta.write_to_dir(&dir)?;

        info!(
            block = %id,
            tenant = %extracted,
            samples,
            series = meta.stats.num_series,
            "wrote output block"
        );

        outputs.push(OutputBlock {
            id,
            dir,
            extracted,
            samples,
            meta,
        });
    }

    Ok(outputs)
}

fn merge_labels(input: &BlockMeta, extracted: &Labels) -> std::collections::BTreeMap<String, String> {
    let mut labels = input.thanos.labels.clone();
    for l in extracted {
        labels.insert(l.name.clone(), l.value.clone());
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{
        BlockStats, BlockWriterOptions, CompactionMeta, Downsample, ThanosMeta, META_VERSION,
    };
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn input_meta() -> BlockMeta {
        let id = BlockId::new();
        BlockMeta {
            ulid: id,
            min_time: 0,
            max_time: 100,
            stats: BlockStats::default(),
            compaction: CompactionMeta {
                level: 2,
                sources: vec![id],
            },
            version: META_VERSION,
            thanos: ThanosMeta {
                labels: BTreeMap::from([
                    ("cluster".to_string(), "c1".to_string()),
                    ("tenant".to_string(), "shared".to_string()),
                ]),
                downsample: Downsample { resolution: 300_000 },
                source: "receive".into(),
                version: 1,
            },
        }
    }

    #[test]
    fn test_reconcile_merges_labels() {
        let temp_dir = TempDir::new().unwrap();
        let table = RoutingTable::new(temp_dir.path(), BlockWriterOptions::default(), 5000);
        let series = Labels::from_pairs([("__name__", "m")]);

        for (tenant, n) in [("a", 3), ("b", 5)] {
            let mut t = table
                .get_or_create(&Labels::from_pairs([("tenant", tenant)]))
                .unwrap();
            for ts in 0..n {
                t.append_float(&series, ts, 1.0).unwrap();
            }
        }
        // Routed but never written to
        table
            .get_or_create(&Labels::from_pairs([("tenant", "c")]))
            .unwrap();

        let input = input_meta();
        let outputs = reconcile(&table, &input).unwrap();
        assert!(table.is_empty());
        assert_eq!(outputs.len(), 2);

        let mut by_tenant: Vec<_> = outputs
            .iter()
            .map(|o| (o.extracted.get("tenant").unwrap().to_string(), o.samples))
            .collect();
        by_tenant.sort();
        assert_eq!(by_tenant, vec![("a".to_string(), 3), ("b".to_string(), 5)]);

        for output in &outputs {
            let meta = BlockMeta::read_from_dir(&output.dir).unwrap();
            assert_eq!(meta.thanos.labels["cluster"], "c1");
            assert_eq!(
                meta.thanos.labels["tenant"],
                output.extracted.get("tenant").unwrap()
            );
            assert_eq!(meta.thanos.downsample.resolution, 300_000);
            assert_eq!(meta.compaction.level, 1);
            assert_eq!(meta.stats.num_samples, output.samples);
        }
    }

    #[test]
    fn test_reconcile_empty_table() {
        let temp_dir = TempDir::new().unwrap();
        let table = RoutingTable::new(temp_dir.path(), BlockWriterOptions::default(), 5000);
        assert!(reconcile(&table, &input_meta()).unwrap().is_empty());
    }
}
