//! Per-partition state.
//!
//! ## Layout
//!
//! ```text
//! <data_dir>/<table>/p201901/
//!   MANIFEST.json            next_seq + the list of live runs
//!   run-000000000007.run     column data
//!   run-000000000007.idx     skip-index sidecar
//! ```
//!
//! ## Snapshots
//!
//! The live runs are an immutable [`RunSet`] behind an `Arc`. Readers clone the Arc
//! and keep a consistent view for as long as they hold it. Writers and the compactor
//! build a new `RunSet` and swap it in while holding the partition's write lock, after
//! the new manifest is durable.
//!
//! A run replaced by compaction (or evicted by a drop) is only marked retired. Its
//! files are deleted when the last snapshot referencing it goes away, so a scan that
//! started before the swap can still read it.

use crate::error::{Error, Result};
use crate::run::format::RunReader;
use crate::run::RunMeta;
use crate::skip_index::SkipIndex;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub const MANIFEST_FILE: &str = "MANIFEST.json";

/// Durable description of a partition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub partition_key: u32,
    pub next_seq: u64,
    pub runs: Vec<RunMeta>,
}

impl Manifest {
    pub async fn load(dir: &Path) -> Result<Option<Self>> {
        match tokio::fs::read(dir.join(MANIFEST_FILE)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, dir: &Path, fsync: bool) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(&dir.join(MANIFEST_FILE), &bytes, fsync).await
    }
}

/// Write `bytes` to a temp file, optionally fsync it, then rename over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8], fsync: bool) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    if fsync {
        file.sync_all().await?;
    }
    drop(file);
    tokio::fs::rename(&tmp, path).await
}

/// A durable run plus its skip index.
#[derive(Debug)]
pub struct RunHandle {
    pub meta: RunMeta,
    pub index: SkipIndex,
    path: PathBuf,
    index_path: PathBuf,
    retired: AtomicBool,
}

impl RunHandle {
    pub fn new(dir: &Path, meta: RunMeta, index: SkipIndex) -> Self {
        Self {
            path: dir.join(meta.file_name()),
            index_path: dir.join(meta.index_file_name()),
            meta,
            index,
            retired: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and validate the run file. Rows are decoded a row group at a time as the
    /// reader is consumed.
    pub async fn reader(&self) -> Result<RunReader> {
        let bytes = tokio::fs::read(&self.path).await?;
        Ok(RunReader::open(Bytes::from(bytes))?)
    }

    /// Schedule the run's files for deletion once no snapshot holds it.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if !self.retired.load(Ordering::Acquire) {
            return;
        }
        for path in [&self.path, &self.index_path] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to delete retired run file");
                }
            }
        }
        // Succeeds only once a dropped partition's directory is empty.
        if let Some(dir) = self.path.parent() {
            let _ = std::fs::remove_dir(dir);
        }
    }
}

/// Immutable view of a partition's live runs, oldest first.
#[derive(Debug, Default)]
pub struct RunSet {
    pub version: u64,
    pub runs: Vec<Arc<RunHandle>>,
}

impl RunSet {
    pub fn rows(&self) -> u64 {
        self.runs.iter().map(|r| r.meta.rows).sum()
    }

    pub fn bytes(&self) -> u64 {
        self.runs.iter().map(|r| r.meta.bytes).sum()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.runs.iter().any(|r| r.meta.id == id)
    }

    pub fn metas(&self) -> Vec<RunMeta> {
        self.runs.iter().map(|r| r.meta.clone()).collect()
    }
}

/// Serialized writer state; held across manifest updates.
#[derive(Debug)]
pub struct WriterState {
    pub next_seq: u64,
}

#[derive(Debug)]
pub struct Partition {
    key: u32,
    dir: PathBuf,
    runs: RwLock<Arc<RunSet>>,
    writer: Mutex<WriterState>,
    dropped: AtomicBool,
}

impl Partition {
    pub fn new(key: u32, dir: PathBuf, next_seq: u64, runs: Vec<Arc<RunHandle>>) -> Self {
        Self {
            key,
            dir,
            runs: RwLock::new(Arc::new(RunSet { version: 0, runs })),
            writer: Mutex::new(WriterState { next_seq }),
            dropped: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot(&self) -> Arc<RunSet> {
        self.runs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn writer(&self) -> &Mutex<WriterState> {
        &self.writer
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    pub fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::Release);
    }

    /// Persist a manifest for `runs` and publish them as the new snapshot.
    /// Caller must hold the writer lock.
    pub async fn install(
        &self,
        state: &WriterState,
        runs: Vec<Arc<RunHandle>>,
        fsync: bool,
    ) -> Result<Arc<RunSet>> {
        let manifest = Manifest {
            partition_key: self.key,
            next_seq: state.next_seq,
            runs: runs.iter().map(|r| r.meta.clone()).collect(),
        };
        manifest
            .save(&self.dir, fsync)
            .await
            .map_err(|e| Error::write_failure(self.key, e))?;

        let mut guard = self
            .runs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = Arc::new(RunSet {
            version: guard.version + 1,
            runs,
        });
        *guard = next.clone();
        Ok(next)
    }

    /// Swap in an empty run set without touching disk. Used by drop.
    pub fn clear(&self) -> Arc<RunSet> {
        let mut guard = self
            .runs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = guard.clone();
        *guard = Arc::new(RunSet {
            version: previous.version + 1,
            runs: Vec::new(),
        });
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(id: u64) -> RunMeta {
        RunMeta {
            id,
            partition_key: 201901,
            rows: 3,
            bytes: 10,
            min_seq: 0,
            max_seq: 2,
            key_min: None,
            key_max: None,
            created_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_manifest_save_and_load() {
        let dir = TempDir::new().unwrap();
        assert!(Manifest::load(dir.path()).await.unwrap().is_none());

        let manifest = Manifest {
            partition_key: 201901,
            next_seq: 42,
            runs: vec![meta(1), meta(2)],
        };
        manifest.save(dir.path(), true).await.unwrap();

        let loaded = Manifest::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.next_seq, 42);
        assert_eq!(loaded.runs, manifest.runs);
        assert!(!dir.path().join("MANIFEST.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_retired_run_files_deleted_after_last_reference() {
        let dir = TempDir::new().unwrap();
        let handle = Arc::new(RunHandle::new(dir.path(), meta(9), SkipIndex::default()));
        std::fs::write(dir.path().join(meta(9).file_name()), b"x").unwrap();
        std::fs::write(dir.path().join(meta(9).index_file_name()), b"x").unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), b"{}").unwrap();

        let reader = handle.clone();
        handle.retire();
        drop(handle);
        assert!(reader.path().exists(), "still referenced by a snapshot");

        drop(reader);
        assert!(!dir.path().join(meta(9).file_name()).exists());
        assert!(!dir.path().join(meta(9).index_file_name()).exists());
    }

    #[tokio::test]
    async fn test_install_bumps_version() {
        let dir = TempDir::new().unwrap();
        let partition = Partition::new(201901, dir.path().to_path_buf(), 0, Vec::new());
        let before = partition.snapshot();

        let handle = Arc::new(RunHandle::new(dir.path(), meta(1), SkipIndex::default()));
        let state = partition.writer().lock().await;
        let after = partition.install(&state, vec![handle], false).await.unwrap();
        drop(state);

        assert_eq!(before.version + 1, after.version);
        assert!(before.runs.is_empty());
        assert_eq!(partition.snapshot().rows(), 3);
        assert!(partition.snapshot().contains(1));
    }
}
