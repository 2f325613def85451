//! Change detection: which files were added, modified or deleted since the
//! last successful indexing pass.
//!
//! Two strategies share the [`ChangeDetector`] trait:
//!
//! - [`LinearDetector`] hashes every file and compares with the
//!   fingerprint store.
//! - [`MerkleDetector`] keeps a Merkle tree of the working copy and diffs
//!   it against a persisted snapshot of the last committed state. With a
//!   [`DirtyPaths`] feed from the file watcher, only the reported files are
//!   rehashed and an untouched project is detected without reading a file.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::Serialize;
use sift_config::{DetectorStrategy, IndexingConfig};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{IndexError, Result};
use crate::fingerprint::{system_time_millis, FileRecord, FingerprintStore};
use crate::merkle::{decode_digest, MerkleTree};
use crate::scanner::{digest, hash_file, is_excluded_path, scan_files, ScanOptions};

/// Paths that changed, relative to the project root. Each list is sorted
/// and a path appears in at most one of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    pub(crate) fn sort(&mut self) {
        self.added.sort();
        self.modified.sort();
        self.deleted.sort();
    }

    /// Move `paths` into `modified`, whatever list they were in before.
    fn force_modified(&mut self, paths: &BTreeSet<String>) {
        if paths.is_empty() {
            return;
        }
        self.added.retain(|p| !paths.contains(p));
        self.deleted.retain(|p| !paths.contains(p));
        self.modified.retain(|p| !paths.contains(p));
        self.modified.extend(paths.iter().cloned());
        self.sort();
    }
}

/// Counters from the most recent detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetectionStats {
    pub files_scanned: usize,
    /// Files whose content was read and hashed.
    pub files_hashed: usize,
    pub nodes_compared: usize,
    /// Root hashes matched; no tree walk was needed.
    pub short_circuited: bool,
    /// The whole project tree was walked.
    pub full_scan: bool,
    /// No usable snapshot; compared against fingerprints instead.
    pub linear_fallback: bool,
}

#[async_trait]
pub trait ChangeDetector: Send + Sync {
    /// Compute the change set for the project at `root`.
    async fn detect_changes(&self, root: &Path) -> Result<ChangeSet>;

    /// Record the fingerprint store's current contents as the baseline for
    /// the next detection. Called once per pass, after all file updates.
    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    fn last_stats(&self) -> DetectionStats;

    fn strategy(&self) -> DetectorStrategy;
}

/// Build the detector selected by `config`.
pub fn from_config(
    config: &IndexingConfig,
    store: Arc<dyn FingerprintStore>,
    snapshot_path: Option<PathBuf>,
    dirty: Option<Arc<DirtyPaths>>,
) -> Arc<dyn ChangeDetector> {
    let options = ScanOptions::from(config);
    match config.detector {
        DetectorStrategy::Linear => Arc::new(LinearDetector::new(store, options)),
        DetectorStrategy::Merkle => {
            let mut detector = MerkleDetector::new(store, options, snapshot_path)
                .with_mtime_prefilter(config.mtime_prefilter);
            if let Some(dirty) = dirty {
                detector = detector.with_dirty_paths(dirty);
            }
            Arc::new(detector)
        }
    }
}

/// Paths reported changed by a file watcher since the last drain.
///
/// Detectors only trust the set while a watcher is attached; otherwise
/// they walk the tree.
#[derive(Debug, Default)]
pub struct DirtyPaths {
    state: StdMutex<DirtyBatch>,
    watching: AtomicBool,
}

/// A drained set of dirty paths.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirtyBatch {
    pub paths: BTreeSet<String>,
    /// Events were lost or too coarse; the next detection must walk the tree.
    pub rescan: bool,
}

impl DirtyPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a changed path (relative to the project root).
    pub fn mark(&self, rel_path: impl Into<String>) {
        self.lock().paths.insert(rel_path.into());
    }

    pub fn mark_rescan(&self) {
        self.lock().rescan = true;
    }

    /// Mark a watcher as attached. Changes made before this call were not
    /// observed, so the next detection rescans. Returns `false` if a
    /// watcher was already attached.
    pub fn start_watching(&self) -> bool {
        if self.watching.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.mark_rescan();
        true
    }

    pub fn stop_watching(&self) {
        self.watching.store(false, Ordering::SeqCst);
    }

    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    pub fn drain(&self) -> DirtyBatch {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DirtyBatch> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Hash-everything detector.
pub struct LinearDetector {
    store: Arc<dyn FingerprintStore>,
    options: ScanOptions,
    stats: StdMutex<DetectionStats>,
}

impl LinearDetector {
    pub fn new(store: Arc<dyn FingerprintStore>, options: ScanOptions) -> Self {
        Self {
            store,
            options,
            stats: StdMutex::new(DetectionStats::default()),
        }
    }
}

#[async_trait]
impl ChangeDetector for LinearDetector {
    async fn detect_changes(&self, root: &Path) -> Result<ChangeSet> {
        let root = root.to_path_buf();
        let options = self.options.clone();
        let current = tokio::task::spawn_blocking(move || {
            scan_files(&root, &options)
                .into_iter()
                .map(|file| {
                    let hash = if file.stat_failed {
                        None
                    } else {
                        hash_file(&file.abs_path)
                            .map_err(|e| debug!("Failed to hash {}: {}", file.rel_path, e))
                            .ok()
                    };
                    (file.rel_path, hash)
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(join_error)?;

        let records = self.store.all_records().await?;
        let changes = compare_with_records(&current, &records);

        *lock_stats(&self.stats) = DetectionStats {
            files_scanned: current.len(),
            files_hashed: current.iter().filter(|(_, h)| h.is_some()).count(),
            full_scan: true,
            ..DetectionStats::default()
        };
        Ok(changes)
    }

    fn last_stats(&self) -> DetectionStats {
        *lock_stats(&self.stats)
    }

    fn strategy(&self) -> DetectorStrategy {
        DetectorStrategy::Linear
    }
}

/// Compare `(path, hex hash)` pairs (`None` = unreadable) with the stored
/// fingerprints.
fn compare_with_records(current: &[(String, Option<String>)], records: &[FileRecord]) -> ChangeSet {
    let known: HashMap<&str, &str> = records
        .iter()
        .map(|r| (r.path.as_str(), r.content_hash.as_str()))
        .collect();

    let mut changes = ChangeSet::default();
    let mut seen = BTreeSet::new();
    for (path, hash) in current {
        seen.insert(path.as_str());
        match (hash, known.get(path.as_str())) {
            // Could not read it: report it so the pipeline retries.
            (None, _) => changes.modified.push(path.clone()),
            (Some(_), None) => changes.added.push(path.clone()),
            (Some(h), Some(stored)) if h != stored => changes.modified.push(path.clone()),
            _ => {}
        }
    }
    changes.deleted = records
        .iter()
        .filter(|r| !seen.contains(r.path.as_str()))
        .map(|r| r.path.clone())
        .collect();
    changes.sort();
    changes
}

/// State of the persisted baseline snapshot.
enum Baseline {
    Unloaded,
    /// Missing or failed validation; compare against fingerprints instead.
    Unusable,
    Loaded(Arc<MerkleTree>),
}

/// The working-copy tree from the previous detection.
#[derive(Clone)]
struct LiveTree {
    root: PathBuf,
    tree: MerkleTree,
    /// `(size, mtime)` at the time each leaf was hashed.
    meta: HashMap<String, (u64, u64)>,
    unreadable: BTreeSet<String>,
    files_hashed: usize,
    files_scanned: usize,
}

/// Merkle-tree detector.
pub struct MerkleDetector {
    store: Arc<dyn FingerprintStore>,
    options: ScanOptions,
    snapshot_path: Option<PathBuf>,
    mtime_prefilter: bool,
    dirty: Option<Arc<DirtyPaths>>,
    baseline: RwLock<Baseline>,
    live: Mutex<Option<LiveTree>>,
    stats: StdMutex<DetectionStats>,
}

impl MerkleDetector {
    /// `snapshot_path` of `None` keeps the baseline in memory only.
    pub fn new(
        store: Arc<dyn FingerprintStore>,
        options: ScanOptions,
        snapshot_path: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            options,
            snapshot_path,
            mtime_prefilter: false,
            dirty: None,
            baseline: RwLock::new(Baseline::Unloaded),
            live: Mutex::new(None),
            stats: StdMutex::new(DetectionStats::default()),
        }
    }

    /// Reuse a file's previous hash when its size and mtime are unchanged.
    ///
    /// Misses edits that preserve both, so it is off unless asked for.
    pub fn with_mtime_prefilter(mut self, enabled: bool) -> Self {
        self.mtime_prefilter = enabled;
        self
    }

    /// Take changed paths from a watcher instead of rehashing everything.
    pub fn with_dirty_paths(mut self, dirty: Arc<DirtyPaths>) -> Self {
        self.dirty = Some(dirty);
        self
    }

    async fn baseline(&self) -> Option<Arc<MerkleTree>> {
        {
            let baseline = self.baseline.read().await;
            match &*baseline {
                Baseline::Loaded(tree) => return Some(tree.clone()),
                Baseline::Unusable => return None,
                Baseline::Unloaded => {}
            }
        }

        let loaded = match &self.snapshot_path {
            Some(path) => match MerkleTree::load(path).await {
                Ok(tree) => tree,
                Err(e) => {
                    warn!("Ignoring snapshot at {:?}: {}", path, e);
                    None
                }
            },
            None => None,
        };

        let mut baseline = self.baseline.write().await;
        if let Baseline::Unloaded = &*baseline {
            *baseline = match loaded {
                Some(tree) => Baseline::Loaded(Arc::new(tree)),
                None => Baseline::Unusable,
            };
        }
        match &*baseline {
            Baseline::Loaded(tree) => Some(tree.clone()),
            _ => None,
        }
    }

    async fn refresh_live(&self, root: &Path) -> Result<LiveTree> {
        let previous = self.live.lock().await.take().filter(|l| l.root.as_path() == root);
        let batch = self
            .dirty
            .as_ref()
            .filter(|d| d.is_watching())
            .map(|d| d.drain());

        let options = self.options.clone();
        let root = root.to_path_buf();
        let prefilter = self.mtime_prefilter;

        match (previous, batch) {
            (Some(mut live), Some(batch)) if !batch.rescan => {
                live.files_hashed = 0;
                live.files_scanned = 0;
                if batch.paths.is_empty() {
                    return Ok(live);
                }
                tokio::task::spawn_blocking(move || {
                    match apply_dirty(live, &batch.paths, &options) {
                        Some(live) => Ok(live),
                        None => full_scan(root, &options, None),
                    }
                })
                .await
                .map_err(join_error)?
            }
            (previous, _) => tokio::task::spawn_blocking(move || {
                let reuse = previous.filter(|_| prefilter);
                full_scan(root, &options, reuse.as_ref())
            })
            .await
            .map_err(join_error)?,
        }
    }
}

#[async_trait]
impl ChangeDetector for MerkleDetector {
    async fn detect_changes(&self, root: &Path) -> Result<ChangeSet> {
        let baseline = self.baseline().await;
        let live = self.refresh_live(root).await?;

        let mut stats = DetectionStats {
            files_scanned: live.files_scanned,
            files_hashed: live.files_hashed,
            full_scan: live.files_scanned > 0,
            ..DetectionStats::default()
        };

        let changes = match &baseline {
            Some(snapshot) if snapshot.root_hash() == live.tree.root_hash() && live.unreadable.is_empty() => {
                stats.short_circuited = true;
                stats.nodes_compared = 1;
                ChangeSet::default()
            }
            Some(snapshot) => {
                let (mut changes, diff) = live.tree.diff(snapshot);
                stats.nodes_compared = diff.nodes_compared;
                changes.force_modified(&live.unreadable);
                changes
            }
            None => {
                info!("No usable snapshot, comparing against fingerprints");
                stats.linear_fallback = true;
                let records = self.store.all_records().await?;
                let current: Vec<(String, Option<String>)> = live
                    .tree
                    .leaves()
                    .into_iter()
                    .map(|(path, hash)| (path, Some(hex::encode(hash))))
                    .chain(live.unreadable.iter().map(|p| (p.clone(), None)))
                    .collect();
                compare_with_records(&current, &records)
            }
        };

        debug!(
            "Merkle detection: {} added, {} modified, {} deleted ({} hashed)",
            changes.added.len(),
            changes.modified.len(),
            changes.deleted.len(),
            stats.files_hashed
        );
        *lock_stats(&self.stats) = stats;
        *self.live.lock().await = Some(live);
        Ok(changes)
    }

    async fn commit(&self) -> Result<()> {
        let records = self.store.all_records().await?;
        let leaves = records.into_iter().filter_map(|r| match decode_digest(&r.content_hash) {
            Some(hash) => Some((r.path, hash)),
            None => {
                warn!("Fingerprint for {} has a malformed hash, leaving it out", r.path);
                None
            }
        });
        let tree = MerkleTree::from_leaves(leaves)?;
        if let Some(path) = &self.snapshot_path {
            tree.save(path).await?;
        }
        debug!("Committed snapshot with {} leaves", tree.len());
        *self.baseline.write().await = Baseline::Loaded(Arc::new(tree));
        Ok(())
    }

    fn last_stats(&self) -> DetectionStats {
        *lock_stats(&self.stats)
    }

    fn strategy(&self) -> DetectorStrategy {
        DetectorStrategy::Merkle
    }
}

/// Walk and hash the project. With `reuse`, files whose size and mtime
/// match the previous pass keep their previous hash.
fn full_scan(root: PathBuf, options: &ScanOptions, reuse: Option<&LiveTree>) -> Result<LiveTree> {
    let files = scan_files(&root, options);
    let mut leaves = Vec::with_capacity(files.len());
    let mut meta = HashMap::with_capacity(files.len());
    let mut unreadable = BTreeSet::new();
    let mut files_hashed = 0;

    for file in &files {
        if file.stat_failed {
            unreadable.insert(file.rel_path.clone());
            continue;
        }
        let stamp = (file.size, file.modified);
        let reused = reuse
            .filter(|prev| prev.meta.get(&file.rel_path) == Some(&stamp))
            .and_then(|prev| prev.tree.leaf_hash(&file.rel_path));
        if let Some(hash) = reused {
            leaves.push((file.rel_path.clone(), hash));
            meta.insert(file.rel_path.clone(), stamp);
            continue;
        }
        match std::fs::read(&file.abs_path) {
            Ok(bytes) => {
                files_hashed += 1;
                leaves.push((file.rel_path.clone(), digest(&bytes)));
                meta.insert(file.rel_path.clone(), stamp);
            }
            Err(e) => {
                debug!("Failed to read {}: {}", file.rel_path, e);
                unreadable.insert(file.rel_path.clone());
            }
        }
    }

    Ok(LiveTree {
        tree: MerkleTree::from_leaves(leaves)?,
        root,
        meta,
        unreadable,
        files_hashed,
        files_scanned: files.len(),
    })
}

/// Rehash only `paths` in the live tree. `None` when a path turned out to
/// be a directory and the tree must be rebuilt by a full scan.
fn apply_dirty(mut live: LiveTree, paths: &BTreeSet<String>, options: &ScanOptions) -> Option<LiveTree> {
    for rel in paths {
        if live.tree.node(rel).map(|n| !n.is_leaf).unwrap_or(false) {
            return None;
        }
        let abs = live.root.join(rel);
        let metadata = match std::fs::metadata(&abs) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                live.tree.remove_leaf(rel);
                live.meta.remove(rel);
                live.unreadable.remove(rel);
                continue;
            }
            Err(e) => {
                debug!("Failed to stat {}: {}", rel, e);
                live.tree.remove_leaf(rel);
                live.unreadable.insert(rel.clone());
                continue;
            }
        };
        if metadata.is_dir() {
            return None;
        }

        let indexable = metadata.is_file()
            && options.matches_extension(&abs)
            && !is_excluded_path(rel)
            && metadata.len() <= options.max_file_bytes;
        if !indexable {
            live.tree.remove_leaf(rel);
            live.meta.remove(rel);
            live.unreadable.remove(rel);
            continue;
        }

        match std::fs::read(&abs) {
            Ok(bytes) => {
                live.files_hashed += 1;
                if let Err(e) = live.tree.upsert_leaf(rel, digest(&bytes)) {
                    debug!("Cannot place {} in the tree: {}", rel, e);
                    return None;
                }
                let modified = metadata.modified().map(system_time_millis).unwrap_or(0);
                live.meta.insert(rel.clone(), (metadata.len(), modified));
                live.unreadable.remove(rel);
            }
            Err(e) => {
                debug!("Failed to read {}: {}", rel, e);
                live.tree.remove_leaf(rel);
                live.unreadable.insert(rel.clone());
            }
        }
    }
    Some(live)
}

fn lock_stats(stats: &StdMutex<DetectionStats>) -> std::sync::MutexGuard<'_, DetectionStats> {
    stats.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn join_error(e: tokio::task::JoinError) -> IndexError {
    IndexError::Io(std::io::Error::other(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{now_millis, MemoryFingerprintStore};
    use crate::scanner::hash_bytes;
    use std::fs;
    use tempfile::tempdir;

    async fn record_all(store: &dyn FingerprintStore, root: &Path) {
        for file in scan_files(root, &ScanOptions::default()) {
            let content = fs::read(&file.abs_path).unwrap();
            store
                .put(
                    &file.rel_path,
                    FileRecord {
                        path: file.rel_path.clone(),
                        content_hash: hash_bytes(&content),
                        last_modified: file.modified,
                        size: file.size,
                        indexed_at: now_millis(),
                        chunk_count: 1,
                    },
                )
                .await
                .unwrap();
        }
    }

    fn project() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/util")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn a() {}").unwrap();
        fs::write(dir.path().join("src/util/mod.rs"), "pub fn b() {}").unwrap();
        fs::write(dir.path().join("main.py"), "def c(): pass").unwrap();
        dir
    }

    #[test]
    fn test_from_config_selects_strategy() {
        let store: Arc<dyn FingerprintStore> = Arc::new(MemoryFingerprintStore::new());
        for strategy in [DetectorStrategy::Linear, DetectorStrategy::Merkle] {
            let config = IndexingConfig {
                detector: strategy,
                ..IndexingConfig::default()
            };
            let detector = from_config(&config, store.clone(), None, None);
            assert_eq!(detector.strategy(), strategy);
        }
    }

    #[tokio::test]
    async fn test_linear_detects_all_kinds() {
        let dir = project();
        let store = Arc::new(MemoryFingerprintStore::new());
        let detector = LinearDetector::new(store.clone(), ScanOptions::default());

        let first = detector.detect_changes(dir.path()).await.unwrap();
        assert_eq!(first.added, vec!["main.py", "src/lib.rs", "src/util/mod.rs"]);

        record_all(store.as_ref(), dir.path()).await;
        assert!(detector.detect_changes(dir.path()).await.unwrap().is_empty());

        fs::write(dir.path().join("src/lib.rs"), "pub fn a2() {}").unwrap();
        fs::remove_file(dir.path().join("main.py")).unwrap();
        fs::write(dir.path().join("new.go"), "package x").unwrap();

        let changes = detector.detect_changes(dir.path()).await.unwrap();
        assert_eq!(changes.added, vec!["new.go"]);
        assert_eq!(changes.modified, vec!["src/lib.rs"]);
        assert_eq!(changes.deleted, vec!["main.py"]);
    }

    #[tokio::test]
    async fn test_merkle_matches_linear_after_commit() {
        let dir = project();
        let data = tempdir().unwrap();
        let store = Arc::new(MemoryFingerprintStore::new());
        let detector = MerkleDetector::new(
            store.clone(),
            ScanOptions::default(),
            Some(data.path().join("snapshot.json")),
        );

        let first = detector.detect_changes(dir.path()).await.unwrap();
        assert_eq!(first.added.len(), 3);
        assert!(detector.last_stats().linear_fallback);

        record_all(store.as_ref(), dir.path()).await;
        detector.commit().await.unwrap();
        assert!(data.path().join("snapshot.json").exists());

        let unchanged = detector.detect_changes(dir.path()).await.unwrap();
        assert!(unchanged.is_empty());
        assert!(detector.last_stats().short_circuited);

        fs::write(dir.path().join("src/util/mod.rs"), "pub fn b2() {}").unwrap();
        let changes = detector.detect_changes(dir.path()).await.unwrap();
        assert_eq!(changes.modified, vec!["src/util/mod.rs"]);
        assert!(changes.added.is_empty() && changes.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_uncommitted_file_is_offered_again() {
        let dir = project();
        let store = Arc::new(MemoryFingerprintStore::new());
        let detector = MerkleDetector::new(store.clone(), ScanOptions::default(), None);

        record_all(store.as_ref(), dir.path()).await;
        detector.commit().await.unwrap();

        fs::write(dir.path().join("main.py"), "def c2(): pass").unwrap();
        let changes = detector.detect_changes(dir.path()).await.unwrap();
        assert_eq!(changes.modified, vec!["main.py"]);

        // Indexing "failed": fingerprints untouched, so the baseline is too.
        detector.commit().await.unwrap();
        let again = detector.detect_changes(dir.path()).await.unwrap();
        assert_eq!(again.modified, vec!["main.py"]);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_falls_back_to_fingerprints() {
        let dir = project();
        let data = tempdir().unwrap();
        let snapshot = data.path().join("snapshot.json");
        fs::write(&snapshot, r#"{"version":1,"root_hash":"00","leaves":[]}"#).unwrap();

        let store = Arc::new(MemoryFingerprintStore::new());
        record_all(store.as_ref(), dir.path()).await;
        let detector = MerkleDetector::new(store.clone(), ScanOptions::default(), Some(snapshot.clone()));

        let changes = detector.detect_changes(dir.path()).await.unwrap();
        assert!(changes.is_empty(), "fingerprints say nothing changed: {changes:?}");
        assert!(detector.last_stats().linear_fallback);

        detector.commit().await.unwrap();
        assert!(MerkleTree::load(&snapshot).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dirty_paths_skip_rehash() {
        let dir = project();
        let store = Arc::new(MemoryFingerprintStore::new());
        let dirty = Arc::new(DirtyPaths::new());
        let detector = MerkleDetector::new(store.clone(), ScanOptions::default(), None)
            .with_dirty_paths(dirty.clone());
        assert!(dirty.start_watching());

        detector.detect_changes(dir.path()).await.unwrap();
        record_all(store.as_ref(), dir.path()).await;
        detector.commit().await.unwrap();

        let none = detector.detect_changes(dir.path()).await.unwrap();
        assert!(none.is_empty());
        assert_eq!(detector.last_stats().files_hashed, 0);

        fs::write(dir.path().join("src/lib.rs"), "pub fn changed() {}").unwrap();
        fs::write(dir.path().join("src/extra.rs"), "pub fn e() {}").unwrap();
        fs::remove_file(dir.path().join("main.py")).unwrap();
        dirty.mark("src/lib.rs");
        dirty.mark("src/extra.rs");
        dirty.mark("main.py");

        let changes = detector.detect_changes(dir.path()).await.unwrap();
        assert_eq!(changes.added, vec!["src/extra.rs"]);
        assert_eq!(changes.modified, vec!["src/lib.rs"]);
        assert_eq!(changes.deleted, vec!["main.py"]);
        assert_eq!(detector.last_stats().files_hashed, 2);
    }

    #[tokio::test]
    async fn test_rescan_flag_forces_full_walk() {
        let dir = project();
        let store = Arc::new(MemoryFingerprintStore::new());
        let dirty = Arc::new(DirtyPaths::new());
        let detector = MerkleDetector::new(store.clone(), ScanOptions::default(), None)
            .with_dirty_paths(dirty.clone());
        assert!(dirty.start_watching());
        detector.detect_changes(dir.path()).await.unwrap();
        record_all(store.as_ref(), dir.path()).await;
        detector.commit().await.unwrap();

        // Change without a matching event, then request a rescan.
        fs::write(dir.path().join("main.py"), "def other(): pass").unwrap();
        dirty.mark_rescan();
        let changes = detector.detect_changes(dir.path()).await.unwrap();
        assert_eq!(changes.modified, vec!["main.py"]);
        assert!(detector.last_stats().full_scan);
    }

    #[tokio::test]
    async fn test_unwatched_dirty_paths_are_ignored() {
        let dir = project();
        let store = Arc::new(MemoryFingerprintStore::new());
        let dirty = Arc::new(DirtyPaths::new());
        let detector = MerkleDetector::new(store.clone(), ScanOptions::default(), None)
            .with_dirty_paths(dirty.clone());
        detector.detect_changes(dir.path()).await.unwrap();
        record_all(store.as_ref(), dir.path()).await;
        detector.commit().await.unwrap();

        // No watcher: an unreported edit is still found.
        fs::write(dir.path().join("main.py"), "def other(): pass").unwrap();
        let changes = detector.detect_changes(dir.path()).await.unwrap();
        assert_eq!(changes.modified, vec!["main.py"]);

        assert!(dirty.start_watching());
        assert!(!dirty.start_watching());
        assert!(dirty.drain().rescan);
        dirty.stop_watching();
        assert!(!dirty.is_watching());
    }

    #[test]
    fn test_force_modified_moves_paths() {
        let mut changes = ChangeSet {
            added: vec!["a".into()],
            modified: vec![],
            deleted: vec!["b".into(), "c".into()],
        };
        changes.force_modified(&["b".to_string()].into_iter().collect());
        assert_eq!(changes.modified, vec!["b"]);
        assert_eq!(changes.deleted, vec!["c"]);
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn test_dirty_paths_drain_resets() {
        let dirty = DirtyPaths::new();
        dirty.mark("a.rs");
        dirty.mark("a.rs");
        dirty.mark_rescan();
        let batch = dirty.drain();
        assert_eq!(batch.paths.len(), 1);
        assert!(batch.rescan);
        assert_eq!(dirty.drain(), DirtyBatch::default());
    }
}
