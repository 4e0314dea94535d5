//! Object storage access for blocks
//!
//! Blocks live in a bucket as `<prefix><block-id>/...`, where the prefix is
//! empty for top-level blocks or a folder path ending in `/` for nested ones.

use crate::block::{BlockId, BlockMeta, META_FILENAME};
use crate::{Result, SplitError, Timestamp};
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Location of a block in a bucket
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRef {
    /// Folder holding the block, empty or ending in `/`
    pub prefix: String,
    pub id: BlockId,
}

impl BlockRef {
    pub fn new(id: BlockId) -> Self {
        Self {
            prefix: String::new(),
            id,
        }
    }

    fn path(&self) -> ObjectPath {
        ObjectPath::from(format!("{}{}", self.prefix, self.id))
    }

    fn meta_path(&self) -> ObjectPath {
        ObjectPath::from(format!("{}{}/{}", self.prefix, self.id, META_FILENAME))
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix, self.id)
    }
}

/// Parses `<id>` or `<folder>/.../<id>`
impl FromStr for BlockRef {
    type Err = SplitError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim_end_matches('/');
        let (prefix, id) = match s.rfind('/') {
            Some(pos) => (&s[..=pos], &s[pos + 1..]),
            None => ("", s),
        };
        Ok(Self {
            prefix: prefix.to_string(),
            id: id.parse()?,
        })
    }
}

/// Object store configuration:
///
/// ```yaml
/// type: S3
/// config:
///   bucket: metrics
///   endpoint: minio:9000
///   insecure: true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "UPPERCASE")]
pub enum BucketConfig {
    Filesystem(FilesystemConfig),
    S3(S3Config),
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesystemConfig {
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct S3Config {
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub insecure: bool,
}

impl BucketConfig {
    /// Parse YAML configuration
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| SplitError::Config(format!("parse object store configuration: {}", e)))
    }
}

/// Block-level operations on an object store
#[derive(Clone)]
pub struct Bucket {
    store: Arc<dyn ObjectStore>,
    name: String,
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket").field("name", &self.name).finish()
    }
}

impl Bucket {
    /// Wrap an existing store
    pub fn new(store: Arc<dyn ObjectStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    /// Empty in-memory bucket
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), "memory")
    }

    /// Create a bucket from configuration
    pub fn from_config(config: &BucketConfig) -> Result<Self> {
        match config {
            BucketConfig::Filesystem(fs) => {
                std::fs::create_dir_all(&fs.directory)?;
                let store = LocalFileSystem::new_with_prefix(&fs.directory)?;
                info!("Using filesystem bucket: {:?}", fs.directory);
                Ok(Self::new(Arc::new(store), fs.directory.display().to_string()))
            }
            BucketConfig::S3(s3) => {
                if s3.bucket.is_empty() {
                    return Err(SplitError::Config("S3 bucket name is required".into()));
                }
                let mut builder = AmazonS3Builder::new().with_bucket_name(&s3.bucket);
                if !s3.region.is_empty() {
                    builder = builder.with_region(&s3.region);
                }
                if !s3.endpoint.is_empty() {
                    let endpoint = if s3.endpoint.contains("://") {
                        s3.endpoint.clone()
                    } else if s3.insecure {
                        format!("http://{}", s3.endpoint)
                    } else {
                        format!("https://{}", s3.endpoint)
                    };
                    builder = builder.with_endpoint(endpoint).with_allow_http(s3.insecure);
                }
                if !s3.access_key.is_empty() {
                    builder = builder
                        .with_access_key_id(&s3.access_key)
                        .with_secret_access_key(&s3.secret_key);
                }
                info!("Using S3 bucket: {}", s3.bucket);
                Ok(Self::new(Arc::new(builder.build()?), s3.bucket.clone()))
            }
            BucketConfig::Memory => Ok(Self::in_memory()),
        }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// List blocks, sorted by prefix and id.
    ///
    /// Non-recursive listing returns top-level block directories. Recursive
    /// listing finds every `<prefix>/<id>/meta.json`. With `max_time`
    /// (milliseconds), only blocks created before it are returned.
    pub async fn list_blocks(&self, recursive: bool, max_time: Option<Timestamp>) -> Result<Vec<BlockRef>> {
        let mut found = Vec::new();

        if recursive {
            let objects: Vec<_> = self.store.list(None).try_collect().await?;
            for object in objects {
                let location = object.location.as_ref();
                let parts: Vec<&str> = location.split('/').collect();
                if parts.len() < 2 || parts[parts.len() - 1] != META_FILENAME {
                    continue;
                }
                let Some(id) = BlockId::from_dir_name(parts[parts.len() - 2]) else {
                    continue;
                };
                let prefix = if parts.len() > 2 {
                    format!("{}/", parts[..parts.len() - 2].join("/"))
                } else {
                    String::new()
                };
                found.push(BlockRef { prefix, id });
            }
        } else {
            let listing = self.store.list_with_delimiter(None).await?;
            for dir in listing.common_prefixes {
                if let Some(id) = dir.filename().and_then(BlockId::from_dir_name) {
                    found.push(BlockRef::new(id));
                }
            }
        }

        if let Some(max_time) = max_time {
            found.retain(|b| {
                b.id.created_at()
                    .map_or(true, |created| created.timestamp_millis() < max_time)
            });
        }
        found.sort();
        debug!(bucket = %self.name, blocks = found.len(), recursive, "listed blocks");
        Ok(found)
    }

    /// Fetch block metadata; `None` if `meta.json` does not exist
    pub async fn get_meta(&self, block: &BlockRef) -> Result<Option<BlockMeta>> {
        let data = match self.store.get(&block.meta_path()).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        BlockMeta::from_slice(&data)
            .map(Some)
            .map_err(|e| SplitError::InvalidFormat(format!("{}/{}: {}", block, META_FILENAME, e)))
    }

    /// Download a block into `dir/<id>` and return that directory
    pub async fn download(&self, block: &BlockRef, dir: &Path) -> Result<PathBuf> {
        let root = block.path();
        let dest = dir.join(block.id.to_string());
        let objects: Vec<_> = self.store.list(Some(&root)).try_collect().await?;

        let mut has_meta = false;
        for object in objects {
            let location = object.location.as_ref();
            let relative = location
                .strip_prefix(root.as_ref())
                .map(|r| r.trim_start_matches('/'))
                .unwrap_or_default();
            if relative.is_empty() {
                continue;
            }
            has_meta |= relative == META_FILENAME;

            let data = self.store.get(&object.location).await?.bytes().await?;
            let path = dest.join(relative);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &data).await?;
        }

        if !has_meta {
            return Err(SplitError::NotFound(format!("block {} has no {}", block, META_FILENAME)));
        }
        info!(block = %block, dir = ?dest, "downloaded block");
        Ok(dest)
    }

    /// Upload a local block directory to the bucket root.
    ///
    /// `meta.json` goes last so a partially uploaded block is never listed
    /// as complete.
    pub async fn upload(&self, block_dir: &Path) -> Result<BlockId> {
        let meta = BlockMeta::read_from_dir(block_dir)?;
        let target = BlockRef::new(meta.ulid);

        let mut files = local_files(block_dir).await?;
        files.retain(|f| f != Path::new(META_FILENAME));
        files.sort();
        files.push(PathBuf::from(META_FILENAME));

        for file in &files {
            let data = tokio::fs::read(block_dir.join(file)).await?;
            let name = file
                .iter()
                .map(|c| c.to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let location = ObjectPath::from(format!("{}/{}", target.path(), name));
            self.store
                .put(&location, PutPayload::from(Bytes::from(data)))
                .await?;
        }

        debug!(block = %target, files = files.len(), bucket = %self.name, "uploaded block");
        Ok(meta.ulid)
    }

    /// Delete a block. `meta.json` is removed first so the block stops being
    /// visible before its data disappears.
    pub async fn delete(&self, block: &BlockRef) -> Result<()> {
        match self.store.delete(&block.meta_path()).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let objects: Vec<_> = self.store.list(Some(&block.path())).try_collect().await?;
        for object in objects {
            match self.store.delete(&object.location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(block = %block, bucket = %self.name, "deleted block");
        Ok(())
    }
}

/// Relative paths of all files under `dir`
async fn local_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(rel) = pending.pop() {
        let mut entries = tokio::fs::read_dir(dir.join(&rel)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = rel.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}
