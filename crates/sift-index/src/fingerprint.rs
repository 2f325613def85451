//! Content fingerprint store.
//!
//! Tracks, per indexed file, the content hash that produced the file's
//! current chunks. The change detector compares against it and the
//! indexing pipeline updates it only after both index writes succeed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{IndexError, Result};

/// One tracked source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the project root, `/`-separated.
    pub path: String,
    /// Hex SHA-256 of the bytes that produced the current chunks.
    pub content_hash: String,
    /// Modification time in Unix milliseconds. Advisory only.
    pub last_modified: u64,
    /// Size in bytes.
    pub size: u64,
    /// When the file's chunks were last committed, Unix milliseconds.
    pub indexed_at: u64,
    /// Number of chunks committed for this content.
    pub chunk_count: usize,
}

/// Persistent map from path to [`FileRecord`], iterated in path order.
///
/// Every method is a potential I/O boundary; callers must not hold locks
/// across these calls.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<FileRecord>>;

    async fn put(&self, path: &str, record: FileRecord) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// All tracked paths in ascending order.
    async fn all_paths(&self) -> Result<Vec<String>>;

    /// All records in path order.
    async fn all_records(&self) -> Result<Vec<FileRecord>> {
        let mut records = Vec::new();
        for path in self.all_paths().await? {
            if let Some(record) = self.get(&path).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Make buffered mutations durable.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory store, mainly for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryFingerprintStore {
    records: RwLock<BTreeMap<String, FileRecord>>,
}

impl MemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    async fn get(&self, path: &str) -> Result<Option<FileRecord>> {
        Ok(self.records.read().await.get(path).cloned())
    }

    async fn put(&self, path: &str, record: FileRecord) -> Result<()> {
        self.records.write().await.insert(path.to_string(), record);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.records.write().await.remove(path);
        Ok(())
    }

    async fn all_paths(&self) -> Result<Vec<String>> {
        Ok(self.records.read().await.keys().cloned().collect())
    }

    async fn all_records(&self) -> Result<Vec<FileRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

/// On-disk layout of [`JsonFingerprintStore`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct FingerprintFile {
    version: u32,
    records: BTreeMap<String, FileRecord>,
}

const FINGERPRINT_VERSION: u32 = 1;

/// Store persisted as a single JSON document.
///
/// Mutations are buffered in memory and written by [`flush`](FingerprintStore::flush)
/// via write-to-temp + rename, so a crash never leaves a torn file.
pub struct JsonFingerprintStore {
    path: PathBuf,
    state: RwLock<(BTreeMap<String, FileRecord>, bool)>,
}

impl JsonFingerprintStore {
    /// Open (or start) a store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let file: FingerprintFile =
                    serde_json::from_str(&content).map_err(IndexError::store)?;
                if file.version != FINGERPRINT_VERSION {
                    return Err(IndexError::StoreUnavailable(format!(
                        "unsupported fingerprint format version {}",
                        file.version
                    )));
                }
                info!("Loaded {} fingerprints from {:?}", file.records.len(), path);
                file.records
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(IndexError::store(e)),
        };

        Ok(Self {
            path,
            state: RwLock::new((records, false)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FingerprintStore for JsonFingerprintStore {
    async fn get(&self, path: &str) -> Result<Option<FileRecord>> {
        Ok(self.state.read().await.0.get(path).cloned())
    }

    async fn put(&self, path: &str, record: FileRecord) -> Result<()> {
        let mut state = self.state.write().await;
        state.0.insert(path.to_string(), record);
        state.1 = true;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.0.remove(path).is_some() {
            state.1 = true;
        }
        Ok(())
    }

    async fn all_paths(&self) -> Result<Vec<String>> {
        Ok(self.state.read().await.0.keys().cloned().collect())
    }

    async fn all_records(&self) -> Result<Vec<FileRecord>> {
        Ok(self.state.read().await.0.values().cloned().collect())
    }

    async fn flush(&self) -> Result<()> {
        // Held for the write so concurrent flushes cannot interleave.
        let mut state = self.state.write().await;
        if !state.1 {
            debug!("Fingerprints not dirty, skipping flush");
            return Ok(());
        }

        let file = FingerprintFile {
            version: FINGERPRINT_VERSION,
            records: state.0.clone(),
        };
        let json = serde_json::to_string(&file).map_err(IndexError::store)?;
        write_atomic(&self.path, json.as_bytes())
            .await
            .map_err(IndexError::store)?;
        state.1 = false;
        debug!("Flushed {} fingerprints to {:?}", file.records.len(), self.path);
        Ok(())
    }
}

/// Write `bytes` to `path` through a sibling temp file and a rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Current time as Unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Convert a filesystem timestamp to Unix milliseconds.
pub fn system_time_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
