//! The chunk catalog: which chunks are live, per file.
//!
//! Search backends may briefly hold ids that are not (or no longer) live
//! while a file is being replaced. Query results are filtered through the
//! catalog, so swapping a file's entry is the single point at which its
//! new chunks become visible and its old ones disappear.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;
use uuid::Uuid;

use crate::chunker::CodeChunk;
use crate::error::{IndexError, Result};
use crate::fingerprint::write_atomic;

#[derive(Debug, Default)]
struct CatalogState {
    files: HashMap<String, Vec<Uuid>>,
    chunks: HashMap<Uuid, Arc<CodeChunk>>,
}

/// Live chunks keyed by id and grouped by file.
#[derive(Debug, Default)]
pub struct ChunkCatalog {
    state: RwLock<CatalogState>,
    path: Option<PathBuf>,
}

impl ChunkCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the catalog persisted at `path`, or start empty.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut state = CatalogState::default();
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => {
                let files: BTreeMap<String, Vec<CodeChunk>> = serde_json::from_str(&json)
                    .map_err(|e| IndexError::store(format!("{}: {e}", path.display())))?;
                for (file, chunks) in files {
                    state.insert_file(file, chunks);
                }
                debug!(
                    "Loaded catalog with {} files, {} chunks",
                    state.files.len(),
                    state.chunks.len()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(IndexError::store(e)),
        }
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, CatalogState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CatalogState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `chunks` the live set for `file_path`. Returns the ids that were
    /// live before and are not part of the new set.
    pub fn replace_file(&self, file_path: &str, chunks: Vec<CodeChunk>) -> Vec<Uuid> {
        let mut state = self.write();
        let old = state.files.remove(file_path).unwrap_or_default();
        let new_ids: HashSet<Uuid> = chunks.iter().map(|c| c.chunk_id).collect();

        let superseded: Vec<Uuid> = old.into_iter().filter(|id| !new_ids.contains(id)).collect();
        for id in &superseded {
            state.chunks.remove(id);
        }
        if !chunks.is_empty() {
            state.insert_file(file_path.to_string(), chunks);
        }
        superseded
    }

    /// Drop every chunk of `file_path`, returning their ids.
    pub fn remove_file(&self, file_path: &str) -> Vec<Uuid> {
        self.replace_file(file_path, Vec::new())
    }

    /// Ids currently live for `file_path`, in chunk order.
    pub fn file_chunk_ids(&self, file_path: &str) -> Vec<Uuid> {
        self.read().files.get(file_path).cloned().unwrap_or_default()
    }

    /// Look up `ids` under one consistent view of the catalog.
    pub fn hydrate(&self, ids: &[Uuid]) -> Vec<Option<Arc<CodeChunk>>> {
        let state = self.read();
        ids.iter().map(|id| state.chunks.get(id).cloned()).collect()
    }

    pub fn get(&self, chunk_id: Uuid) -> Option<Arc<CodeChunk>> {
        self.read().chunks.get(&chunk_id).cloned()
    }

    pub fn contains(&self, chunk_id: Uuid) -> bool {
        self.read().chunks.contains_key(&chunk_id)
    }

    /// Number of live chunks.
    pub fn len(&self) -> usize {
        self.read().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn file_count(&self) -> usize {
        self.read().files.len()
    }

    /// Files with at least one live chunk, sorted.
    pub fn files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.read().files.keys().cloned().collect();
        files.sort();
        files
    }

    /// Persist the catalog, if it was opened from a file.
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = {
            let state = self.read();
            let files: BTreeMap<&str, Vec<&CodeChunk>> = state
                .files
                .iter()
                .map(|(file, ids)| {
                    let chunks = ids
                        .iter()
                        .filter_map(|id| state.chunks.get(id).map(|c| c.as_ref()))
                        .collect();
                    (file.as_str(), chunks)
                })
                .collect();
            serde_json::to_vec(&files)?
        };
        write_atomic(path, &json).await.map_err(IndexError::store)
    }
}

impl CatalogState {
    fn insert_file(&mut self, file_path: String, chunks: Vec<CodeChunk>) {
        let ids = chunks.iter().map(|c| c.chunk_id).collect();
        for chunk in chunks {
            self.chunks.insert(chunk.chunk_id, Arc::new(chunk));
        }
        self.files.insert(file_path, ids);
    }
}
