use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};

/// Roughly what a browser grants one origin's local storage.
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Key/value blob storage addressed by a small fixed set of string keys.
///
/// Writes may fail when the backing capacity is exceeded; callers decide how
/// to degrade.
pub trait BlobStore: Send {
    fn read(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn write(&mut self, key: &str, blob: &str) -> anyhow::Result<()>;
    fn remove(&mut self, key: &str) -> anyhow::Result<()>;
}

/// One `<key>.json` file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
    quota_bytes: Option<usize>,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quota_bytes: None,
        }
    }

    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{safe}.json"))
    }
}

impl BlobStore for FileBlobStore {
    fn read(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        Ok(Some(raw))
    }

    fn write(&mut self, key: &str, blob: &str) -> anyhow::Result<()> {
        check_quota(self.quota_bytes, key, blob.len())?;
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // A failed write leaves the previous blob intact.
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, blob)
            .with_context(|| format!("failed writing {}", staging.display()))?;
        std::fs::rename(&staging, &path)
            .with_context(|| format!("failed replacing {}", path.display()))?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed removing {}", path.display()))?;
        }
        Ok(())
    }
}

/// In-process blob store. Clones share the same entries, so a caller can
/// keep a handle for inspection after boxing one into a `ResultStore`.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
    quota_bytes: Option<usize>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    pub fn snapshot(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).cloned())
    }

    pub fn insert_raw(&self, key: &str, blob: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), blob.to_string());
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn read(&self, key: &str) -> anyhow::Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory blob store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn write(&mut self, key: &str, blob: &str) -> anyhow::Result<()> {
        check_quota(self.quota_bytes, key, blob.len())?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory blob store lock poisoned"))?;
        entries.insert(key.to_string(), blob.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> anyhow::Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("memory blob store lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}

fn check_quota(quota_bytes: Option<usize>, key: &str, len: usize) -> anyhow::Result<()> {
    if let Some(quota) = quota_bytes {
        if len > quota {
            bail!("storage quota exceeded writing '{key}' ({len} bytes > {quota} bytes)");
        }
    }
    Ok(())
}
