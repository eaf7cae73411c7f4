//! Committed consumer offsets.
//!
//! An offset committed for `(group, partition)` is the next offset to read: every
//! message before it is durable in storage. Commits are monotonic; committing a
//! lower offset than the current one is ignored.
//!
//! ```text
//! <dir>/<group>.offsets.json   {"0": 1200, "1": 980}
//! ```

use crate::error::{IngestError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use txhouse_storage::partition::write_atomic;

#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn committed(&self, group: &str, partition: u32) -> Result<Option<u64>>;

    async fn commit(&self, group: &str, partition: u32, offset: u64) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    offsets: RwLock<HashMap<(String, u32), u64>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn committed(&self, group: &str, partition: u32) -> Result<Option<u64>> {
        Ok(self
            .offsets
            .read()
            .await
            .get(&(group.to_string(), partition))
            .copied())
    }

    async fn commit(&self, group: &str, partition: u32, offset: u64) -> Result<()> {
        let mut offsets = self.offsets.write().await;
        let current = offsets.entry((group.to_string(), partition)).or_insert(0);
        if offset < *current {
            tracing::warn!(group, partition, offset, current = *current, "ignoring offset regression");
            return Ok(());
        }
        *current = offset;
        Ok(())
    }
}

/// Offsets persisted as one JSON file per group.
pub struct FileOffsetStore {
    dir: PathBuf,
    fsync: bool,
    groups: Mutex<HashMap<String, BTreeMap<u32, u64>>>,
}

impl FileOffsetStore {
    pub async fn open(dir: impl Into<PathBuf>, fsync: bool) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            fsync,
            groups: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn group_path(&self, group: &str) -> PathBuf {
        self.dir.join(format!("{}.offsets.json", group))
    }

    async fn load(&self, group: &str) -> Result<BTreeMap<u32, u64>> {
        match tokio::fs::read(self.group_path(group)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                IngestError::Offset(format!("corrupt offsets for group {}: {}", group, e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn committed(&self, group: &str, partition: u32) -> Result<Option<u64>> {
        let mut groups = self.groups.lock().await;
        if !groups.contains_key(group) {
            let loaded = self.load(group).await?;
            groups.insert(group.to_string(), loaded);
        }
        Ok(groups.get(group).and_then(|g| g.get(&partition)).copied())
    }

    async fn commit(&self, group: &str, partition: u32, offset: u64) -> Result<()> {
        let mut groups = self.groups.lock().await;
        if !groups.contains_key(group) {
            let loaded = self.load(group).await?;
            groups.insert(group.to_string(), loaded);
        }
        let Some(offsets) = groups.get_mut(group) else {
            return Ok(());
        };

        let current = offsets.get(&partition).copied().unwrap_or(0);
        if offset < current {
            tracing::warn!(group, partition, offset, current, "ignoring offset regression");
            return Ok(());
        }
        if offset == current && offsets.contains_key(&partition) {
            return Ok(());
        }
        offsets.insert(partition, offset);

        let bytes = serde_json::to_vec_pretty(offsets)?;
        write_atomic(&self.group_path(group), &bytes, self.fsync).await?;
        tracing::trace!(group, partition, offset, "offset committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_commits_are_monotonic() {
        let store = MemoryOffsetStore::new();
        assert_eq!(store.committed("g", 0).await.unwrap(), None);
        store.commit("g", 0, 10).await.unwrap();
        store.commit("g", 0, 4).await.unwrap();
        assert_eq!(store.committed("g", 0).await.unwrap(), Some(10));
        assert_eq!(store.committed("other", 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_offsets_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileOffsetStore::open(dir.path(), false).await.unwrap();
            store.commit("g", 0, 7).await.unwrap();
            store.commit("g", 3, 2).await.unwrap();
            store.commit("g", 0, 5).await.unwrap();
        }

        let store = FileOffsetStore::open(dir.path(), false).await.unwrap();
        assert_eq!(store.committed("g", 0).await.unwrap(), Some(7));
        assert_eq!(store.committed("g", 3).await.unwrap(), Some(2));
        assert_eq!(store.committed("g", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_offsets_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("g.offsets.json"), b"{not json").unwrap();
        let store = FileOffsetStore::open(dir.path(), false).await.unwrap();
        assert!(matches!(
            store.committed("g", 0).await,
            Err(IngestError::Offset(_))
        ));
    }
}
