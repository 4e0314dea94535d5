//! Routing of series to per-tenant block writers

use crate::block::{Appender, BlockId, BlockWriter, BlockWriterOptions};
use crate::{FloatHistogram, Histogram, Labels, Result, Sample, SplitError, Timestamp};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One output block under construction, identified by its extracted labels
pub struct Tenant {
    key: u64,
    extracted: Labels,
    writer: BlockWriter,
    appender: Appender,
    pending: usize,
    samples: u64,
}

impl Tenant {
    fn open(key: u64, extracted: Labels, dir: &Path, options: BlockWriterOptions) -> Result<Self> {
        let writer = BlockWriter::new(dir, options)?;
        let appender = writer.appender();
        Ok(Self {
            key,
            extracted,
            writer,
            appender,
            pending: 0,
            samples: 0,
        })
    }

    /// Routing key
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Labels that identify this tenant
    pub fn extracted(&self) -> &Labels {
        &self.extracted
    }

    /// Samples appended since the last commit
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Samples appended over the tenant's lifetime
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Append one sample of any kind
    pub fn append(&mut self, labels: &Labels, sample: Sample) -> Result<()> {
        self.appender.append(labels, sample)?;
        self.pending += 1;
        self.samples += 1;
        Ok(())
    }

    /// Append a float sample
    pub fn append_float(&mut self, labels: &Labels, t: Timestamp, v: f64) -> Result<()> {
        self.append(labels, Sample::Float { t, v })
    }

    /// Append a histogram sample carrying exactly one encoding
    pub fn append_histogram(
        &mut self,
        labels: &Labels,
        t: Timestamp,
        h: Option<Histogram>,
        fh: Option<FloatHistogram>,
    ) -> Result<()> {
        self.appender.append_histogram(labels, t, h, fh)?;
        self.pending += 1;
        self.samples += 1;
        Ok(())
    }

    /// Persist pending samples and continue with a fresh appender
    pub fn commit(&mut self) -> Result<usize> {
        let appender = std::mem::replace(&mut self.appender, self.writer.appender());
        let committed = appender.commit()?;
        self.pending = 0;
        Ok(committed)
    }

    /// Commit, write the block and release the writer.
    ///
    /// Returns `None` when the tenant never received a sample.
    pub(crate) fn flush(mut self) -> Result<Option<BlockId>> {
        self.commit()?;
        let Tenant { mut writer, .. } = self;
        let id = match writer.flush() {
            Ok(id) => Some(id),
            Err(SplitError::EmptyBlock) => None,
            Err(e) => return Err(e),
        };
        writer.close()?;
        Ok(id)
    }
}

/// Maps extracted label sets to tenants.
///
/// Tenants are created on first use and live until [`RoutingTable::drain`].
pub struct RoutingTable {
    output_dir: PathBuf,
    options: BlockWriterOptions,
    commit_threshold: usize,
    tenants: Mutex<BTreeMap<u64, Tenant>>,
}

impl RoutingTable {
    /// Create a table whose tenants write blocks into `output_dir`
    pub fn new(
        output_dir: impl Into<PathBuf>,
        options: BlockWriterOptions,
        commit_threshold: usize,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            options,
            commit_threshold,
            tenants: Mutex::new(BTreeMap::new()),
        }
    }

    /// Directory output blocks are written to
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Tenant for `extracted`, created if missing.
    ///
    /// A tenant holding more than the commit threshold of pending samples is
    /// committed before it is returned.
    pub fn get_or_create(&self, extracted: &Labels) -> Result<MappedMutexGuard<'_, Tenant>> {
        let key = extracted.stable_hash();
        let mut tenants = self.tenants.lock();

        let tenant = match tenants.entry(key) {
            Entry::Occupied(entry) => {
                let tenant = entry.into_mut();
                if tenant.extracted != *extracted {
                    return Err(SplitError::RoutingCollision {
                        key,
                        existing: tenant.extracted.clone(),
                        incoming: extracted.clone(),
                    });
                }
                tenant
            }
            Entry::Vacant(entry) => {
                let tenant =
                    Tenant::open(key, extracted.clone(), &self.output_dir, self.options.clone())?;
                debug!(key, tenant = %extracted, "created tenant");
                entry.insert(tenant)
            }
        };

        if tenant.pending > self.commit_threshold {
            let committed = tenant.commit()?;
            debug!(key, committed, "committed pending samples");
        }

        MutexGuard::try_map(tenants, |t| t.get_mut(&key))
            .map_err(|_| SplitError::Internal(format!("tenant {:016x} vanished", key)))
    }

    /// Number of tenants
    pub fn len(&self) -> usize {
        self.tenants.lock().len()
    }

    /// Check if no tenant exists
    pub fn is_empty(&self) -> bool {
        self.tenants.lock().is_empty()
    }

    /// Remove every tenant, in ascending routing key order
    pub fn drain(&self) -> Vec<Tenant> {
        let tenants = std::mem::take(&mut *self.tenants.lock());
        if !tenants.is_empty() {
            info!(tenants = tenants.len(), "draining routing table");
        }
        tenants.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table(dir: &Path, threshold: usize) -> RoutingTable {
        RoutingTable::new(dir, BlockWriterOptions::default(), threshold)
    }

    #[test]
    fn test_same_labels_same_tenant() {
        let temp_dir = TempDir::new().unwrap();
        let table = table(temp_dir.path(), 5000);

        let a = Labels::from_pairs([("tenant", "a")]);
        let b = Labels::from_pairs([("tenant", "b")]);

        let key_a = table.get_or_create(&a).unwrap().key();
        assert_eq!(table.get_or_create(&a.clone()).unwrap().key(), key_a);
        assert_ne!(table.get_or_create(&b).unwrap().key(), key_a);
        assert_eq!(table.len(), 2);

        // Empty extraction is a tenant of its own.
        table.get_or_create(&Labels::new()).unwrap();
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_collision_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let table = table(temp_dir.path(), 5000);

        let a = Labels::from_pairs([("tenant", "a")]);
        let b = Labels::from_pairs([("tenant", "b")]);
        table.get_or_create(&a).unwrap();

        // Force b onto a's key.
        {
            let mut tenants = table.tenants.lock();
            let tenant = tenants.remove(&a.stable_hash()).unwrap();
            tenants.insert(b.stable_hash(), tenant);
        }

        let err = table.get_or_create(&b).err().unwrap();
        assert!(matches!(err, SplitError::RoutingCollision { ref existing, .. } if *existing == a));
    }

    #[test]
    fn test_commit_when_threshold_exceeded() {
        let temp_dir = TempDir::new().unwrap();
        let table = table(temp_dir.path(), 3);
        let extracted = Labels::from_pairs([("tenant", "a")]);
        let series = Labels::from_pairs([("__name__", "m")]);

        {
            let mut tenant = table.get_or_create(&extracted).unwrap();
            for t in 0..4 {
                tenant.append_float(&series, t, 1.0).unwrap();
            }
            assert_eq!(tenant.pending(), 4);
        }

        let tenant = table.get_or_create(&extracted).unwrap();
        assert_eq!(tenant.pending(), 0);
        assert_eq!(tenant.samples(), 4);
        assert_eq!(tenant.writer.committed_samples(), 4);
    }

    #[test]
    fn test_drain_in_key_order() {
        let temp_dir = TempDir::new().unwrap();
        let table = table(temp_dir.path(), 5000);
        for v in ["a", "b", "c", "d"] {
            table.get_or_create(&Labels::from_pairs([("tenant", v)])).unwrap();
        }

        let keys: Vec<_> = table.drain().iter().map(Tenant::key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(table.is_empty());
    }

    #[test]
    fn test_flush_empty_tenant_yields_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let table = table(temp_dir.path(), 5000);
        table.get_or_create(&Labels::new()).unwrap();

        let tenant = table.drain().pop().unwrap();
        assert!(tenant.flush().unwrap().is_none());
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }
}
