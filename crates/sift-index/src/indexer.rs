//! Main indexer orchestrator.
//!
//! The pipeline asks the change detector what changed, then indexes each
//! changed file on a bounded worker pool: read, extract symbols, chunk,
//! embed, commit. A file's commit is ordered so that readers never see a
//! mix of its old and new chunks:
//!
//! 1. insert the chunks that are new into the lexical and vector indexes
//!    (undone if either insert fails),
//! 2. swap the file's entry in the [`ChunkCatalog`], the single point at
//!    which queries switch over,
//! 3. delete the superseded chunks from both indexes,
//! 4. record the new fingerprint.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use sift_config::{ChunkingConfig, IndexingConfig};
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::ChunkCatalog;
use crate::chunker::{CodeChunk, SymbolChunker};
use crate::detector::{join_error, ChangeDetector, ChangeSet, DetectionStats};
use crate::embeddings::EmbeddingAdapter;
use crate::error::{IndexError, Result};
use crate::fingerprint::{now_millis, system_time_millis, FileRecord, FingerprintStore};
use crate::parser::SymbolExtractor;
use crate::scanner::{hash_bytes, scan_files, ScanOptions};
use crate::search::{LexicalFields, LexicalIndex, VectorIndex};

/// Lifecycle of one path as seen by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileState {
    Unindexed,
    Indexing,
    Indexed,
    Reindexing,
    Removed,
}

/// Summary of one indexing pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    /// Files whose new chunks were committed.
    pub files_processed: usize,
    pub files_removed: usize,
    /// Chunks committed for the processed files.
    pub chunks_indexed: usize,
    /// Chunks that had to be embedded; unchanged chunks are reused.
    pub chunks_embedded: usize,
    pub duration: Duration,
    /// `(path, reason)` for every file that failed.
    pub errors: Vec<(String, String)>,
    pub detection: DetectionStats,
}

/// What a single file update did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileOutcome {
    pub chunks: usize,
    pub embedded: usize,
    pub removed: bool,
}

/// The collaborators the pipeline writes through.
pub struct Backends {
    pub store: Arc<dyn FingerprintStore>,
    pub detector: Arc<dyn ChangeDetector>,
    pub extractor: Arc<dyn SymbolExtractor>,
    pub embedder: EmbeddingAdapter,
    pub lexical: Arc<dyn LexicalIndex>,
    pub vector: Arc<dyn VectorIndex>,
    pub catalog: Arc<ChunkCatalog>,
}

/// One async mutex per path, so the same file is never processed twice
/// at once.
#[derive(Default)]
struct PathLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PathLocks {
    async fn lock(&self, path: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            if locks.len() > 4096 {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            locks.entry(path.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

struct Prepared {
    chunks: Vec<CodeChunk>,
    /// Vectors for chunks not already live.
    fresh: Vec<(Uuid, Vec<f32>)>,
    record: FileRecord,
}

pub struct IndexingPipeline {
    root: PathBuf,
    backends: Backends,
    chunker: SymbolChunker,
    scan_options: ScanOptions,
    workers: usize,
    file_timeout: Duration,
    locks: PathLocks,
    states: StdMutex<HashMap<String, FileState>>,
}

impl IndexingPipeline {
    pub fn new(
        root: impl Into<PathBuf>,
        backends: Backends,
        indexing: &IndexingConfig,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            root: root.into(),
            backends,
            chunker: SymbolChunker::new(chunking),
            scan_options: ScanOptions::from(indexing),
            workers: indexing.workers.max(1),
            file_timeout: Duration::from_secs(indexing.file_timeout_secs),
            locks: PathLocks::default(),
            states: StdMutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog(&self) -> &Arc<ChunkCatalog> {
        &self.backends.catalog
    }

    /// Current state of `rel_path`.
    pub fn file_state(&self, rel_path: &str) -> FileState {
        if let Some(state) = self.lock_states().get(rel_path) {
            return *state;
        }
        if self.backends.catalog.file_chunk_ids(rel_path).is_empty() {
            FileState::Unindexed
        } else {
            FileState::Indexed
        }
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, HashMap<String, FileState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, rel_path: &str, state: FileState) {
        self.lock_states().insert(rel_path.to_string(), state);
    }

    /// Run one indexing pass. With `force`, every indexable file is
    /// re-chunked and re-embedded regardless of its fingerprint.
    pub async fn run(self: &Arc<Self>, force: bool) -> Result<IndexReport> {
        let started = Instant::now();
        info!(
            "Starting {} index of {:?} ({:?} detection)",
            if force { "full" } else { "incremental" },
            self.root,
            self.backends.detector.strategy()
        );

        let (changes, detection) = if force {
            (self.everything().await?, DetectionStats::default())
        } else {
            let changes = self.backends.detector.detect_changes(&self.root).await?;
            (changes, self.backends.detector.last_stats())
        };
        debug!(
            "{} added, {} modified, {} deleted",
            changes.added.len(),
            changes.modified.len(),
            changes.deleted.len()
        );

        let mut report = IndexReport {
            detection,
            ..IndexReport::default()
        };

        for path in &changes.deleted {
            match self.remove_file(path).await {
                Ok(_) => report.files_removed += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Failed to remove {}: {}", path, e);
                    report.errors.push((path.clone(), e.to_string()));
                }
            }
        }

        // Cancelled on the first fatal error: queued files are skipped and
        // files already in flight run to completion.
        let halt = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for path in changes.added.iter().chain(&changes.modified) {
            let this = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let halt = halt.clone();
            let path = path.clone();
            tasks.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) if halt.is_cancelled() => Err(IndexError::Aborted),
                    Ok(_permit) => {
                        let outcome = this.update_file(&path, force, Some(&halt)).await;
                        if matches!(&outcome, Err(e) if e.is_fatal()) {
                            halt.cancel();
                        }
                        outcome
                    }
                    Err(e) => Err(IndexError::Io(std::io::Error::other(e))),
                };
                (path, outcome)
            });
        }

        let mut fatal = None;
        let mut skipped = 0;
        while let Some(joined) = tasks.join_next().await {
            let (path, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!("Indexing task panicked: {}", e);
                    report.errors.push(("<task>".to_string(), e.to_string()));
                    continue;
                }
            };
            match outcome {
                Ok(outcome) => {
                    report.files_processed += 1;
                    report.chunks_indexed += outcome.chunks;
                    report.chunks_embedded += outcome.embedded;
                }
                Err(IndexError::Aborted) => skipped += 1,
                Err(e) if e.is_fatal() => {
                    warn!("Aborting pass: {}", e);
                    halt.cancel();
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    warn!("Failed to index {}: {}", path, e);
                    report.errors.push((path, e.to_string()));
                }
            }
        }
        if let Some(e) = fatal {
            warn!(
                "Pass aborted after {} files; {} files left for the next pass",
                report.files_processed, skipped
            );
            return Err(e);
        }

        self.persist().await?;

        report.errors.sort();
        report.duration = started.elapsed();
        info!(
            "Indexed {} files ({} chunks, {} embedded), removed {}, {} errors in {:?}",
            report.files_processed,
            report.chunks_indexed,
            report.chunks_embedded,
            report.files_removed,
            report.errors.len(),
            report.duration
        );
        Ok(report)
    }

    /// Change set that re-offers every indexable file.
    async fn everything(&self) -> Result<ChangeSet> {
        let root = self.root.clone();
        let options = self.scan_options.clone();
        let files = tokio::task::spawn_blocking(move || scan_files(&root, &options))
            .await
            .map_err(join_error)?;

        let known: HashSet<String> = self.backends.store.all_paths().await?.into_iter().collect();
        let present: HashSet<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();

        let mut changes = ChangeSet::default();
        for file in &files {
            if known.contains(&file.rel_path) {
                changes.modified.push(file.rel_path.clone());
            } else {
                changes.added.push(file.rel_path.clone());
            }
        }
        changes.deleted = known
            .into_iter()
            .filter(|p| !present.contains(p.as_str()))
            .collect();
        changes.sort();
        Ok(changes)
    }

    /// Flush every backend, then record the new baseline.
    async fn persist(&self) -> Result<()> {
        self.backends.lexical.flush().await?;
        self.backends.vector.flush().await?;
        self.backends.catalog.flush().await?;
        self.backends.store.flush().await?;
        self.backends.detector.commit().await
    }

    /// Index (or re-index) one file given relative to the project root.
    pub async fn index_file(&self, rel_path: &str) -> Result<FileOutcome> {
        self.update_file(rel_path, false, None).await
    }

    /// Prepare and commit one file. Once `halt` is cancelled a prepared
    /// file is not committed and keeps its previous state.
    async fn update_file(
        &self,
        rel_path: &str,
        force: bool,
        halt: Option<&CancellationToken>,
    ) -> Result<FileOutcome> {
        let _guard = self.locks.lock(rel_path).await;

        let previous = self.file_state(rel_path);
        self.set_state(
            rel_path,
            if previous == FileState::Indexed {
                FileState::Reindexing
            } else {
                FileState::Indexing
            },
        );

        let result = match tokio::time::timeout(self.file_timeout, self.prepare(rel_path, force)).await {
            Err(_) => Err(IndexError::Timeout(self.file_timeout.as_secs())),
            Ok(Err(e)) => Err(e),
            Ok(Ok(_)) if halt.is_some_and(CancellationToken::is_cancelled) => Err(IndexError::Aborted),
            Ok(Ok(None)) => self.remove_locked(rel_path).await,
            Ok(Ok(Some(prepared))) => self.commit(rel_path, prepared).await,
        };

        match &result {
            Ok(outcome) if outcome.removed => self.set_state(rel_path, FileState::Removed),
            Ok(_) => self.set_state(rel_path, FileState::Indexed),
            Err(_) => self.set_state(rel_path, previous),
        }
        result
    }

    /// Read, parse, chunk and embed. `None` if the file has disappeared.
    async fn prepare(&self, rel_path: &str, force: bool) -> Result<Option<Prepared>> {
        let abs_path = self.root.join(rel_path);
        let bytes = match tokio::fs::read(&abs_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata = tokio::fs::metadata(&abs_path).await.ok();
        let content_hash = hash_bytes(&bytes);
        let content = String::from_utf8_lossy(&bytes).into_owned();

        let extractor = Arc::clone(&self.backends.extractor);
        let chunker = self.chunker.clone();
        let path = rel_path.to_string();
        let chunks = tokio::task::spawn_blocking(move || {
            let symbols = extractor.parse(Path::new(&path), &content);
            chunker.chunk(&path, &content, &symbols)
        })
        .await
        .map_err(join_error)?;

        let live: HashSet<Uuid> = if force {
            HashSet::new()
        } else {
            self.backends.catalog.file_chunk_ids(rel_path).into_iter().collect()
        };
        let to_embed: Vec<&CodeChunk> = chunks.iter().filter(|c| !live.contains(&c.chunk_id)).collect();
        let texts: Vec<String> = to_embed.iter().map(|c| c.embedding_text()).collect();
        let vectors = self.backends.embedder.embed_batch(&texts).await?;
        let fresh = to_embed.iter().map(|c| c.chunk_id).zip(vectors).collect();

        let record = FileRecord {
            path: rel_path.to_string(),
            content_hash,
            last_modified: metadata
                .as_ref()
                .and_then(|m| m.modified().ok())
                .map(system_time_millis)
                .unwrap_or(0),
            size: bytes.len() as u64,
            indexed_at: 0,
            chunk_count: chunks.len(),
        };
        debug!("Prepared {} ({} chunks, {} to embed)", rel_path, chunks.len(), texts.len());
        Ok(Some(Prepared {
            chunks,
            fresh,
            record,
        }))
    }

    async fn commit(&self, rel_path: &str, prepared: Prepared) -> Result<FileOutcome> {
        let Prepared {
            chunks,
            fresh,
            mut record,
        } = prepared;

        let fresh_ids: Vec<Uuid> = fresh.iter().map(|(id, _)| *id).collect();
        let fresh_set: HashSet<Uuid> = fresh_ids.iter().copied().collect();
        let lexical_entries: Vec<(Uuid, LexicalFields)> = chunks
            .iter()
            .filter(|c| fresh_set.contains(&c.chunk_id))
            .map(|c| (c.chunk_id, LexicalFields::from(c)))
            .collect();

        if let Err(e) = self.backends.lexical.insert_batch(lexical_entries).await {
            self.rollback(&fresh_ids, false).await;
            return Err(e);
        }
        if let Err(e) = self.backends.vector.insert_batch(fresh).await {
            self.rollback(&fresh_ids, true).await;
            return Err(e);
        }

        let outcome = FileOutcome {
            chunks: chunks.len(),
            embedded: fresh_ids.len(),
            removed: false,
        };
        let superseded = self.backends.catalog.replace_file(rel_path, chunks);
        self.purge(rel_path, &superseded).await;

        record.indexed_at = now_millis();
        self.backends.store.put(rel_path, record).await?;
        debug!(
            "Committed {} ({} chunks, {} superseded)",
            rel_path,
            outcome.chunks,
            superseded.len()
        );
        Ok(outcome)
    }

    async fn rollback(&self, ids: &[Uuid], vector_too: bool) {
        if let Err(e) = self.backends.lexical.delete_batch(ids).await {
            warn!("Lexical rollback failed: {}", e);
        }
        if vector_too {
            if let Err(e) = self.backends.vector.delete_batch(ids).await {
                warn!("Vector rollback failed: {}", e);
            }
        }
    }

    /// Delete ids that are no longer in the catalog. Failures leave
    /// unreachable entries behind, which queries never surface.
    async fn purge(&self, rel_path: &str, ids: &[Uuid]) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.backends.lexical.delete_batch(ids).await {
            warn!("Failed to delete {} stale lexical entries of {}: {}", ids.len(), rel_path, e);
        }
        if let Err(e) = self.backends.vector.delete_batch(ids).await {
            warn!("Failed to delete {} stale vectors of {}: {}", ids.len(), rel_path, e);
        }
    }

    /// Remove a deleted file's chunks and fingerprint.
    pub async fn remove_file(&self, rel_path: &str) -> Result<FileOutcome> {
        let _guard = self.locks.lock(rel_path).await;
        let outcome = self.remove_locked(rel_path).await?;
        self.set_state(rel_path, FileState::Removed);
        Ok(outcome)
    }

    async fn remove_locked(&self, rel_path: &str) -> Result<FileOutcome> {
        let ids = self.backends.catalog.remove_file(rel_path);
        self.purge(rel_path, &ids).await;
        self.backends.store.delete(rel_path).await?;
        debug!("Removed {} ({} chunks)", rel_path, ids.len());
        Ok(FileOutcome {
            chunks: 0,
            embedded: 0,
            removed: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::LinearDetector;
    use crate::embeddings::{EmbeddingError, EmbeddingProvider, HashEmbeddings};
    use crate::fingerprint::MemoryFingerprintStore;
    use crate::parser::TreeSitterExtractor;
    use crate::search::{Bm25Index, FieldBoosts, MemoryVectorIndex, RankedHit};
    use async_trait::async_trait;
    use sift_config::EmbeddingConfig;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};

    const DIMS: usize = 32;

    struct Harness {
        dir: tempfile::TempDir,
        store: Arc<FlakyStore>,
        lexical: Arc<Bm25Index>,
        vector: Arc<FlakyVector>,
        catalog: Arc<ChunkCatalog>,
        pipeline: Arc<IndexingPipeline>,
    }

    /// Memory vector index whose writes can be made to fail.
    struct FlakyVector {
        inner: MemoryVectorIndex,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl VectorIndex for FlakyVector {
        async fn insert(&self, id: Uuid, vector: Vec<f32>) -> Result<()> {
            self.insert_batch(vec![(id, vector)]).await
        }
        async fn delete(&self, id: Uuid) -> Result<()> {
            self.inner.delete(id).await
        }
        async fn search(&self, query: &[f32], limit: usize) -> Result<Vec<RankedHit>> {
            self.inner.search(query, limit).await
        }
        async fn insert_batch(&self, entries: Vec<(Uuid, Vec<f32>)>) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(IndexError::write("vector", "injected failure"));
            }
            self.inner.insert_batch(entries).await
        }
    }

    /// Memory fingerprint store whose `put` can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryFingerprintStore,
        fail_puts: AtomicBool,
    }

    #[async_trait]
    impl FingerprintStore for FlakyStore {
        async fn get(&self, path: &str) -> Result<Option<FileRecord>> {
            self.inner.get(path).await
        }
        async fn put(&self, path: &str, record: FileRecord) -> Result<()> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(IndexError::store("disk full"));
            }
            self.inner.put(path, record).await
        }
        async fn delete(&self, path: &str) -> Result<()> {
            self.inner.delete(path).await
        }
        async fn all_paths(&self) -> Result<Vec<String>> {
            self.inner.all_paths().await
        }
    }

    /// Hash embeddings that hang while `stalled` is set.
    struct StallingEmbeddings {
        inner: HashEmbeddings,
        stalled: AtomicBool,
    }

    #[async_trait]
    impl EmbeddingProvider for StallingEmbeddings {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if self.stalled.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            self.inner.embed_batch(texts).await
        }
        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
    }

    fn harness() -> Harness {
        harness_with(IndexingConfig::default(), Arc::new(HashEmbeddings::new(DIMS)))
    }

    fn harness_with(config: IndexingConfig, provider: Arc<dyn EmbeddingProvider>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::default());
        let lexical = Arc::new(Bm25Index::in_memory(FieldBoosts::default()).unwrap());
        let vector = Arc::new(FlakyVector {
            inner: MemoryVectorIndex::new(DIMS),
            fail_writes: AtomicBool::new(false),
        });
        let catalog = Arc::new(ChunkCatalog::new());
        let embed_config = EmbeddingConfig {
            dimensions: DIMS,
            ..EmbeddingConfig::default()
        };
        let backends = Backends {
            store: store.clone(),
            detector: Arc::new(LinearDetector::new(store.clone(), ScanOptions::from(&config))),
            extractor: Arc::new(TreeSitterExtractor::new()),
            embedder: EmbeddingAdapter::new(provider, &embed_config),
            lexical: lexical.clone(),
            vector: vector.clone(),
            catalog: catalog.clone(),
        };
        let pipeline = Arc::new(IndexingPipeline::new(
            dir.path(),
            backends,
            &config,
            ChunkingConfig::default(),
        ));
        Harness {
            dir,
            store,
            lexical,
            vector,
            catalog,
            pipeline,
        }
    }

    const LIB: &str = "pub fn alpha() -> u32 {\n    1\n}\n\npub fn beta() -> u32 {\n    2\n}\n";

    #[tokio::test]
    async fn test_run_indexes_new_files() {
        let h = harness();
        fs::write(h.dir.path().join("lib.rs"), LIB).unwrap();

        let report = h.pipeline.run(false).await.unwrap();
        assert_eq!(report.files_processed, 1);
        assert_eq!(report.chunks_indexed, 2);
        assert!(report.errors.is_empty());
        assert_eq!(h.catalog.len(), 2);
        assert_eq!(h.lexical.len().await, 2);
        assert_eq!(h.vector.inner.len().await, 2);

        let record = h.store.get("lib.rs").await.unwrap().unwrap();
        assert_eq!(record.chunk_count, 2);
        assert_eq!(record.content_hash, hash_bytes(LIB.as_bytes()));
        assert_eq!(h.pipeline.file_state("lib.rs"), FileState::Indexed);
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let h = harness();
        fs::write(h.dir.path().join("lib.rs"), LIB).unwrap();
        h.pipeline.run(false).await.unwrap();

        let report = h.pipeline.run(false).await.unwrap();
        assert_eq!(report.files_processed, 0);
        assert_eq!(report.chunks_embedded, 0);
        assert_eq!(h.catalog.len(), 2);
    }

    #[tokio::test]
    async fn test_edit_reembeds_only_changed_chunks() {
        let h = harness();
        let path = h.dir.path().join("lib.rs");
        fs::write(&path, LIB).unwrap();
        h.pipeline.run(false).await.unwrap();
        let before = h.catalog.file_chunk_ids("lib.rs");

        fs::write(&path, LIB.replace("2\n", "20\n")).unwrap();
        let report = h.pipeline.run(false).await.unwrap();
        let after = h.catalog.file_chunk_ids("lib.rs");

        assert_eq!(report.files_processed, 1);
        assert_eq!(report.chunks_embedded, 1);
        assert_eq!(before[0], after[0]);
        assert_ne!(before[1], after[1]);
        assert_eq!(h.lexical.len().await, 2);
        assert!(!h.lexical.contains(before[1]).await);
        assert!(!h.vector.inner.contains(before[1]).await);
    }

    #[tokio::test]
    async fn test_failed_vector_write_rolls_back() {
        let h = harness();
        let path = h.dir.path().join("lib.rs");
        fs::write(&path, LIB).unwrap();
        h.pipeline.run(false).await.unwrap();
        let before = h.catalog.file_chunk_ids("lib.rs");
        let old_record = h.store.get("lib.rs").await.unwrap().unwrap();

        fs::write(&path, "pub fn gamma() {}\n").unwrap();
        h.vector.fail_writes.store(true, Ordering::SeqCst);
        let report = h.pipeline.run(false).await.unwrap();

        assert_eq!(report.files_processed, 0);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, "lib.rs");
        assert_eq!(h.catalog.file_chunk_ids("lib.rs"), before);
        assert_eq!(h.lexical.len().await, 2);
        assert_eq!(h.store.get("lib.rs").await.unwrap().unwrap(), old_record);
        assert_eq!(h.pipeline.file_state("lib.rs"), FileState::Indexed);

        // Re-offered once the backend recovers.
        h.vector.fail_writes.store(false, Ordering::SeqCst);
        let report = h.pipeline.run(false).await.unwrap();
        assert_eq!(report.files_processed, 1);
        assert_eq!(h.catalog.len(), 1);
    }

    #[tokio::test]
    async fn test_stalled_embedder_times_out_per_file() {
        let provider = Arc::new(StallingEmbeddings {
            inner: HashEmbeddings::new(DIMS),
            stalled: AtomicBool::new(false),
        });
        let config = IndexingConfig {
            file_timeout_secs: 1,
            ..IndexingConfig::default()
        };
        let h = harness_with(config, provider.clone());
        let path = h.dir.path().join("lib.rs");
        fs::write(&path, LIB).unwrap();
        h.pipeline.run(false).await.unwrap();
        let before = h.catalog.file_chunk_ids("lib.rs");
        let old_record = h.store.get("lib.rs").await.unwrap().unwrap();

        fs::write(&path, "pub fn gamma() {}\n").unwrap();
        provider.stalled.store(true, Ordering::SeqCst);
        let report = h.pipeline.run(false).await.unwrap();

        assert_eq!(report.files_processed, 0);
        assert_eq!(
            report.errors,
            vec![("lib.rs".to_string(), IndexError::Timeout(1).to_string())]
        );
        assert_eq!(h.catalog.file_chunk_ids("lib.rs"), before);
        assert_eq!(h.store.get("lib.rs").await.unwrap().unwrap(), old_record);
        assert_eq!(h.pipeline.file_state("lib.rs"), FileState::Indexed);

        provider.stalled.store(false, Ordering::SeqCst);
        let report = h.pipeline.run(false).await.unwrap();
        assert_eq!(report.files_processed, 1);
        assert_ne!(h.catalog.file_chunk_ids("lib.rs"), before);
    }

    #[tokio::test]
    async fn test_store_failure_aborts_pass_without_orphans() {
        let config = IndexingConfig {
            workers: 1,
            ..IndexingConfig::default()
        };
        let h = harness_with(config, Arc::new(HashEmbeddings::new(DIMS)));
        let files = ["a.rs", "b.rs", "c.rs"];
        for (i, file) in files.iter().enumerate() {
            fs::write(h.dir.path().join(file), format!("pub fn f{i}() -> u32 {{\n    {i}\n}}\n")).unwrap();
        }
        h.pipeline.run(false).await.unwrap();
        let ids_before: Vec<Vec<Uuid>> = files.iter().map(|f| h.catalog.file_chunk_ids(f)).collect();
        let records_before = h.store.all_records().await.unwrap();

        for (i, file) in files.iter().enumerate() {
            fs::write(h.dir.path().join(file), format!("pub fn g{i}() -> u32 {{\n    {i}\n}}\n")).unwrap();
        }
        h.store.fail_puts.store(true, Ordering::SeqCst);
        let err = h.pipeline.run(false).await.unwrap_err();
        assert!(matches!(err, IndexError::StoreUnavailable(_)));

        // One file reached its commit; the others were never started.
        let untouched = files
            .iter()
            .zip(&ids_before)
            .filter(|(f, ids)| h.catalog.file_chunk_ids(f) == **ids)
            .count();
        assert_eq!(untouched, 2);
        assert_eq!(h.store.all_records().await.unwrap(), records_before);
        for file in files {
            let state = h.pipeline.file_state(file);
            assert!(matches!(state, FileState::Indexed), "{file} left {state:?}");
        }
        assert_eq!(h.lexical.len().await, h.catalog.len());
        assert_eq!(h.vector.inner.len().await, h.catalog.len());

        h.store.fail_puts.store(false, Ordering::SeqCst);
        let report = h.pipeline.run(false).await.unwrap();
        assert_eq!(report.files_processed, 3);
        assert_eq!(h.lexical.len().await, 3);
    }

    #[tokio::test]
    async fn test_deleted_file_is_removed() {
        let h = harness();
        let path = h.dir.path().join("lib.rs");
        fs::write(&path, LIB).unwrap();
        h.pipeline.run(false).await.unwrap();

        fs::remove_file(&path).unwrap();
        let report = h.pipeline.run(false).await.unwrap();
        assert_eq!(report.files_removed, 1);
        assert!(h.catalog.is_empty());
        assert!(h.lexical.is_empty().await);
        assert!(h.vector.inner.is_empty().await);
        assert!(h.store.get("lib.rs").await.unwrap().is_none());
        assert_eq!(h.pipeline.file_state("lib.rs"), FileState::Removed);
    }

    #[tokio::test]
    async fn test_force_reembeds_everything() {
        let h = harness();
        fs::write(h.dir.path().join("lib.rs"), LIB).unwrap();
        h.pipeline.run(false).await.unwrap();

        let report = h.pipeline.run(true).await.unwrap();
        assert_eq!(report.files_processed, 1);
        assert_eq!(report.chunks_embedded, 2);
        assert_eq!(h.lexical.len().await, 2);
        assert_eq!(h.catalog.len(), 2);
    }

    #[tokio::test]
    async fn test_index_file_on_vanished_path_removes() {
        let h = harness();
        let outcome = h.pipeline.index_file("ghost.rs").await.unwrap();
        assert!(outcome.removed);
    }

    #[tokio::test]
    async fn test_path_locks_serialize_same_path() {
        let locks = Arc::new(PathLocks::default());
        let guard = locks.lock("a.rs").await;
        let other = locks.lock("b.rs").await;
        drop(other);

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("a.rs").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }
}
