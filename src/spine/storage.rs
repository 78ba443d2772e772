//! Persistent backends for spines and small side tables.
//!
//! The spined store never touches files directly. It talks to a
//! [`SpineStorage`], which is chosen by configuration through
//! [`open_storage`]. Backends only move opaque blobs; encoding is the store's
//! business.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use memmap2::Mmap;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::ConfigurationError;

const SPINE_DIR: &str = "spines";
const SPINE_EXT: &str = "spine";
const TABLE_EXT: &str = "tbl";

/// The storage contract every backend satisfies.
pub trait SpineStorage: Send + Sync + std::fmt::Debug {
    /// Reads the blob for spine `index`, `None` if it was never written.
    fn read_spine(&self, index: u32) -> std::io::Result<Option<Bytes>>;

    /// Replaces the blob for spine `index`.
    fn write_spine(&self, index: u32, data: &[u8]) -> std::io::Result<()>;

    /// Indices of every persisted spine, ascending.
    fn spine_indices(&self) -> std::io::Result<Vec<u32>>;

    fn read_table(&self, name: &str) -> std::io::Result<Option<Bytes>>;

    fn write_table(&self, name: &str, data: &[u8]) -> std::io::Result<()>;
}

/// Which backend [`open_storage`] builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Directory,
    Memory,
}

/// Builds the configured backend rooted at `root`.
///
/// The memory backend ignores `root`.
pub fn open_storage(
    backend: Backend,
    root: &Path,
) -> Result<Arc<dyn SpineStorage>, ConfigurationError> {
    match backend {
        Backend::Directory => Ok(Arc::new(DirectoryStorage::open(root)?)),
        Backend::Memory => Ok(Arc::new(MemoryStorage::default())),
    }
}

/// One file per spine under `<root>/spines`, one file per table under `<root>`.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never sees a half-written spine.
#[derive(Debug)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn open(root: &Path) -> Result<Self, ConfigurationError> {
        let unusable = |reason: String| ConfigurationError::UnusableRoot {
            path: root.to_path_buf(),
            reason,
        };
        if root.exists() && !root.is_dir() {
            return Err(unusable("exists and is not a directory".to_string()));
        }
        std::fs::create_dir_all(root.join(SPINE_DIR)).map_err(|e| unusable(e.to_string()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn spine_path(&self, index: u32) -> PathBuf {
        self.root
            .join(SPINE_DIR)
            .join(format!("{index:08}.{SPINE_EXT}"))
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{TABLE_EXT}"))
    }

    fn read(path: &Path) -> std::io::Result<Option<Bytes>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if file.metadata()?.len() == 0 {
            return Ok(Some(Bytes::new()));
        }
        // The file is replaced by rename, never modified in place, so the
        // mapping stays valid for as long as we copy out of it.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    fn write(path: &Path, data: &[u8]) -> std::io::Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)
    }
}

impl SpineStorage for DirectoryStorage {
    fn read_spine(&self, index: u32) -> std::io::Result<Option<Bytes>> {
        Self::read(&self.spine_path(index))
    }

    fn write_spine(&self, index: u32, data: &[u8]) -> std::io::Result<()> {
        Self::write(&self.spine_path(index), data)
    }

    fn spine_indices(&self) -> std::io::Result<Vec<u32>> {
        let mut indices = Vec::new();
        for entry in std::fs::read_dir(self.root.join(SPINE_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(SPINE_EXT) {
                continue;
            }
            if let Some(index) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u32>().ok())
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    fn read_table(&self, name: &str) -> std::io::Result<Option<Bytes>> {
        Self::read(&self.table_path(name))
    }

    fn write_table(&self, name: &str, data: &[u8]) -> std::io::Result<()> {
        Self::write(&self.table_path(name), data)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    spines: BTreeMap<u32, Bytes>,
    tables: HashMap<String, Bytes>,
}

/// Shared in-memory backend.
///
/// Clones share state, so a store can be closed and reopened over the same
/// `MemoryStorage` to exercise the persistence path without touching disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpineStorage for MemoryStorage {
    fn read_spine(&self, index: u32) -> std::io::Result<Option<Bytes>> {
        Ok(self.state.lock().spines.get(&index).cloned())
    }

    fn write_spine(&self, index: u32, data: &[u8]) -> std::io::Result<()> {
        self.state
            .lock()
            .spines
            .insert(index, Bytes::copy_from_slice(data));
        Ok(())
    }

    fn spine_indices(&self) -> std::io::Result<Vec<u32>> {
        Ok(self.state.lock().spines.keys().copied().collect())
    }

    fn read_table(&self, name: &str) -> std::io::Result<Option<Bytes>> {
        Ok(self.state.lock().tables.get(name).cloned())
    }

    fn write_table(&self, name: &str, data: &[u8]) -> std::io::Result<()> {
        self.state
            .lock()
            .tables
            .insert(name.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }
}

/// A [`MemoryStorage`] whose reads and writes can be made to fail.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct FailingStorage {
    inner: MemoryStorage,
    failing_reads: Arc<std::sync::atomic::AtomicUsize>,
    failing_spine_writes: Arc<std::sync::atomic::AtomicBool>,
    failing_table_writes: Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
impl FailingStorage {
    pub(crate) fn over(inner: MemoryStorage) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// The next `count` spine reads fail.
    pub(crate) fn fail_reads(&self, count: usize) {
        self.failing_reads
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    pub(crate) fn fail_spine_writes(&self, fail: bool) {
        self.failing_spine_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub(crate) fn fail_table_writes(&self, fail: bool) {
        self.failing_table_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn broken() -> std::io::Error {
        std::io::Error::other("storage unavailable")
    }
}

#[cfg(test)]
impl SpineStorage for FailingStorage {
    fn read_spine(&self, index: u32) -> std::io::Result<Option<Bytes>> {
        use std::sync::atomic::Ordering;
        let failing = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Self::broken());
        }
        self.inner.read_spine(index)
    }

    fn write_spine(&self, index: u32, data: &[u8]) -> std::io::Result<()> {
        if self
            .failing_spine_writes
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(Self::broken());
        }
        self.inner.write_spine(index, data)
    }

    fn spine_indices(&self) -> std::io::Result<Vec<u32>> {
        self.inner.spine_indices()
    }

    fn read_table(&self, name: &str) -> std::io::Result<Option<Bytes>> {
        self.inner.read_table(name)
    }

    fn write_table(&self, name: &str, data: &[u8]) -> std::io::Result<()> {
        if self
            .failing_table_writes
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(Self::broken());
        }
        self.inner.write_table(name, data)
    }
}
