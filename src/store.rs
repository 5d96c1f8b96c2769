//! Object-store collaborator
//!
//! The pipeline only needs list/get/put by bucket and key plus a
//! last-modified timestamp for latest-file selection. `DirStore` maps
//! buckets onto first-level subdirectories of a local root; network-backed
//! stores implement the same trait.

use chrono::{DateTime, Local};
use std::fs;
use std::path::{Path, PathBuf};

/// One listed object
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: i64,
    pub last_modified: DateTime<Local>,
}

/// Error type for object-store operations
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    NotFound(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::NotFound(key) => write!(f, "Object not found: {}", key),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Minimal object-store contract consumed by the pipeline
pub trait ObjectStore {
    /// List objects in a bucket whose key starts with `prefix`
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>>;

    fn get_bytes(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    fn put_bytes(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<()>;
}

/// Pick the most-recently-modified object from a listing
pub fn latest_object(objects: &[ObjectInfo]) -> Option<&ObjectInfo> {
    objects.iter().max_by_key(|o| o.last_modified)
}

/// Local-directory object store: `<root>/<bucket>/<key>`
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store root from STRATUM_STORE_PATH, falling back to `.stratum/store`
    pub fn from_env() -> Self {
        let root = std::env::var("STRATUM_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".stratum/store"));
        Self::new(root)
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.bucket_dir(bucket).join(key)
    }
}

impl ObjectStore for DirStore {
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let dir = self.bucket_dir(bucket);
        if !dir.is_dir() {
            // A bucket nobody wrote to yet is just empty
            return Ok(Vec::new());
        }

        let mut objects = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let key = entry.file_name().to_string_lossy().to_string();
            if !key.starts_with(prefix) {
                continue;
            }
            let modified = meta.modified()?;
            objects.push(ObjectInfo {
                key,
                size: meta.len() as i64,
                last_modified: DateTime::from(modified),
            });
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    fn get_bytes(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, key);
        if !path.is_file() {
            return Err(StoreError::NotFound(format!("{}/{}", bucket, key)));
        }
        Ok(fs::read(path)?)
    }

    fn put_bytes(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }
}

/// Seed a bucket directory so listings work before the first upload
pub fn ensure_bucket(root: &Path, bucket: &str) -> Result<()> {
    fs::create_dir_all(root.join(bucket))?;
    Ok(())
}
