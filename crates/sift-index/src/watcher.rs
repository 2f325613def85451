//! File watcher for automatic re-indexing.
//!
//! Raw notify events are debounced into batches. Each batch is written to
//! a shared [`DirtyPaths`] set, which the Merkle detector drains on its next
//! pass, and a [`WatchBatch`] notification is emitted so the caller can run
//! that pass. Lost or coarse events turn into a rescan request.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ignore::gitignore::Gitignore;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sift_config::IndexingConfig;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::detector::DirtyPaths;
use crate::error::IndexError;
use crate::indexer::IndexingPipeline;
use crate::scanner::{is_excluded_path, relative_path};

const RAW_CHANNEL_CAPACITY: usize = 1024;

/// Errors that can occur in the file watcher.
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to create watcher: {0}")]
    CreateError(String),

    #[error("Failed to watch path: {0}")]
    WatchError(String),

    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Configuration for the file watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Quiet period before a batch is emitted.
    pub debounce: Duration,

    /// File extensions to watch
    pub extensions: Vec<String>,

    /// Whether to respect the root .gitignore
    pub respect_gitignore: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self::from(&IndexingConfig::default())
    }
}

impl From<&IndexingConfig> for WatcherConfig {
    fn from(config: &IndexingConfig) -> Self {
        Self {
            debounce: Duration::from_millis(config.watch_debounce_ms),
            extensions: config.extensions.clone(),
            respect_gitignore: config.respect_gitignore,
        }
    }
}

/// A debounced group of changes, already recorded in [`DirtyPaths`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchBatch {
    pub paths: usize,
    pub rescan: bool,
}

#[derive(Debug)]
enum RawSignal {
    Changed(PathBuf),
    Rescan,
}

/// Decides which raw paths are worth reporting.
struct EventFilter {
    root: PathBuf,
    extensions: Vec<String>,
    gitignore: Option<Gitignore>,
}

impl EventFilter {
    fn new(root: &Path, config: &WatcherConfig) -> Self {
        let gitignore = config.respect_gitignore.then(|| {
            let (matcher, err) = Gitignore::new(root.join(".gitignore"));
            if let Some(e) = err {
                debug!("Partial .gitignore for watcher: {}", e);
            }
            matcher
        });
        Self {
            root: root.to_path_buf(),
            extensions: config.extensions.clone(),
            gitignore,
        }
    }

    /// Relative path for `path`, or `None` if the scanner would never index
    /// it. Extension-less paths are kept since they may be directories.
    fn relevant(&self, path: &Path) -> Option<String> {
        let rel = relative_path(&self.root, path)?;
        if rel.is_empty() || is_excluded_path(&rel) {
            return None;
        }
        let name = rel.rsplit('/').next().unwrap_or(&rel);
        if name.starts_with('.') {
            return None;
        }
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if !self.extensions.iter().any(|e| e == ext) {
                return None;
            }
        }
        if let Some(gitignore) = &self.gitignore {
            if gitignore.matched_path_or_any_parents(&rel, false).is_ignore() {
                return None;
            }
        }
        Some(rel)
    }
}

/// File watcher that monitors a directory for changes.
pub struct FileWatcher {
    config: WatcherConfig,
    root_path: PathBuf,
    dirty: Arc<DirtyPaths>,
    // The watcher needs to be kept alive
    watcher: Option<RecommendedWatcher>,
}

impl FileWatcher {
    pub fn new(root_path: PathBuf, config: WatcherConfig, dirty: Arc<DirtyPaths>) -> Self {
        Self {
            config,
            root_path,
            dirty,
            watcher: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Start watching and return a channel of debounced batches.
    pub fn start(&mut self) -> Result<mpsc::Receiver<WatchBatch>, WatcherError> {
        let (raw_tx, raw_rx) = mpsc::channel::<RawSignal>(RAW_CHANNEL_CAPACITY);
        let (batch_tx, batch_rx) = mpsc::channel(16);
        let overflowed = Arc::new(AtomicBool::new(false));

        let callback_overflow = Arc::clone(&overflowed);
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            for signal in convert_event(res) {
                if raw_tx.try_send(signal).is_err() {
                    callback_overflow.store(true, Ordering::SeqCst);
                }
            }
        })
        .map_err(|e| WatcherError::CreateError(e.to_string()))?;

        watcher
            .watch(&self.root_path, RecursiveMode::Recursive)
            .map_err(|e| WatcherError::WatchError(e.to_string()))?;
        if !self.dirty.start_watching() {
            return Err(WatcherError::WatchError(format!(
                "{} is already being watched",
                self.root_path.display()
            )));
        }
        self.watcher = Some(watcher);

        let filter = EventFilter::new(&self.root_path, &self.config);
        let dirty = Arc::clone(&self.dirty);
        let debounce = self.config.debounce;
        tokio::spawn(async move {
            debounce_events(raw_rx, batch_tx, filter, dirty, overflowed, debounce).await;
        });

        info!("Started watching {:?} with {:?} debounce", self.root_path, debounce);
        Ok(batch_rx)
    }

    /// Stop watching.
    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            self.dirty.stop_watching();
            info!("Stopped watching {:?}", self.root_path);
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Convert a notify callback result into signals.
fn convert_event(res: Result<Event, notify::Error>) -> Vec<RawSignal> {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            warn!("Watch error, scheduling rescan: {}", e);
            return vec![RawSignal::Rescan];
        }
    };
    if event.need_rescan() {
        return vec![RawSignal::Rescan];
    }
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
            event.paths.into_iter().map(RawSignal::Changed).collect()
        }
        _ => Vec::new(),
    }
}

/// Batch raw signals until `debounce` passes without a new one.
async fn debounce_events(
    mut raw_rx: mpsc::Receiver<RawSignal>,
    batch_tx: mpsc::Sender<WatchBatch>,
    filter: EventFilter,
    dirty: Arc<DirtyPaths>,
    overflowed: Arc<AtomicBool>,
    debounce: Duration,
) {
    let tick_interval = Duration::from_millis(50).min(debounce.max(Duration::from_millis(1)));
    let mut pending: BTreeSet<String> = BTreeSet::new();
    let mut rescan = false;
    let mut last_seen: Option<Instant> = None;

    loop {
        match tokio::time::timeout(tick_interval, raw_rx.recv()).await {
            Ok(Some(RawSignal::Changed(path))) => {
                if let Some(rel) = filter.relevant(&path) {
                    pending.insert(rel);
                    last_seen = Some(Instant::now());
                }
            }
            Ok(Some(RawSignal::Rescan)) => {
                rescan = true;
                last_seen = Some(Instant::now());
            }
            Ok(None) => break,
            Err(_) => {}
        }

        if overflowed.swap(false, Ordering::SeqCst) {
            rescan = true;
            last_seen = Some(Instant::now());
        }

        let quiet = last_seen.map(|t| t.elapsed() >= debounce).unwrap_or(false);
        if !quiet {
            continue;
        }

        let batch = WatchBatch {
            paths: pending.len(),
            rescan,
        };
        for path in std::mem::take(&mut pending) {
            dirty.mark(path);
        }
        if rescan {
            dirty.mark_rescan();
        }
        rescan = false;
        last_seen = None;

        debug!("Watch batch: {} paths, rescan: {}", batch.paths, batch.rescan);
        if batch_tx.send(batch).await.is_err() {
            // Receiver dropped
            return;
        }
    }
}

/// Background indexing service that re-runs the pipeline on every batch.
pub struct IndexingService {
    watcher: FileWatcher,
    pipeline: Arc<IndexingPipeline>,
}

impl IndexingService {
    pub fn new(watcher: FileWatcher, pipeline: Arc<IndexingPipeline>) -> Self {
        Self { watcher, pipeline }
    }

    /// Index once, then again after every batch until the watcher stops.
    /// Per-file failures are logged; fatal errors end the service.
    pub async fn run(mut self) -> Result<(), WatcherError> {
        let mut rx = self.watcher.start()?;
        info!("Initial indexing pass for {:?}", self.pipeline.root());
        self.pass().await?;

        while let Some(batch) = rx.recv().await {
            debug!(
                "Re-indexing after {} changed paths (rescan: {})",
                batch.paths,
                batch.rescan
            );
            self.pass().await?;
        }

        Ok(())
    }

    async fn pass(&self) -> Result<(), WatcherError> {
        match self.pipeline.run(false).await {
            Ok(report) => {
                for (path, reason) in &report.errors {
                    warn!("Failed to index {}: {}", path, reason);
                }
                if report.files_processed + report.files_removed > 0 {
                    info!(
                        "Indexed {} files, removed {} in {:?}",
                        report.files_processed, report.files_removed, report.duration
                    );
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                warn!("Indexing pass failed: {}", e);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use tempfile::tempdir;

    fn filter_for(root: &Path) -> EventFilter {
        EventFilter::new(root, &WatcherConfig::default())
    }

    #[test]
    fn test_watcher_config_from_indexing() {
        let config = WatcherConfig::default();
        assert_eq!(config.debounce, Duration::from_millis(500));
        assert!(config.extensions.contains(&"rs".to_string()));
        assert!(config.respect_gitignore);
    }

    #[test]
    fn test_filter_relevant_paths() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let filter = filter_for(root);

        assert_eq!(filter.relevant(&root.join("src/lib.rs")), Some("src/lib.rs".to_string()));
        assert_eq!(filter.relevant(&root.join("src/util")), Some("src/util".to_string()));
        assert_eq!(filter.relevant(&root.join("notes.txt")), None);
        assert_eq!(filter.relevant(&root.join("target/debug/build.rs")), None);
        assert_eq!(filter.relevant(&root.join(".git/index")), None);
        assert_eq!(filter.relevant(&root.join(".hidden.rs")), None);
        assert_eq!(filter.relevant(Path::new("/elsewhere/main.rs")), None);
    }

    #[test]
    fn test_filter_respects_gitignore() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "generated/\n*.gen.rs\n").unwrap();
        let filter = filter_for(dir.path());

        assert_eq!(filter.relevant(&dir.path().join("generated/api.rs")), None);
        assert_eq!(filter.relevant(&dir.path().join("src/schema.gen.rs")), None);
        assert!(filter.relevant(&dir.path().join("src/main.rs")).is_some());
    }

    #[test]
    fn test_convert_event_kinds() {
        let path = PathBuf::from("/p/a.rs");
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(path.clone());
        let modified = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(path.clone());
        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(path.clone());
        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any)).add_path(path);

        assert_eq!(convert_event(Ok(created)).len(), 1);
        assert_eq!(convert_event(Ok(modified)).len(), 1);
        assert_eq!(convert_event(Ok(removed)).len(), 1);
        assert!(convert_event(Ok(access)).is_empty());
        assert!(matches!(
            convert_event(Err(notify::Error::generic("boom")))[..],
            [RawSignal::Rescan]
        ));
    }

    #[tokio::test]
    async fn test_debounce_batches_into_dirty_paths() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let dirty = Arc::new(DirtyPaths::new());
        let (raw_tx, raw_rx) = mpsc::channel(16);
        let (batch_tx, mut batch_rx) = mpsc::channel(4);

        tokio::spawn(debounce_events(
            raw_rx,
            batch_tx,
            filter_for(&root),
            dirty.clone(),
            Arc::new(AtomicBool::new(false)),
            Duration::from_millis(20),
        ));

        for name in ["a.rs", "a.rs", "b.py", "readme.md"] {
            raw_tx.send(RawSignal::Changed(root.join(name))).await.unwrap();
        }
        let batch = batch_rx.recv().await.unwrap();
        assert_eq!(batch, WatchBatch { paths: 2, rescan: false });

        let drained = dirty.drain();
        let paths: Vec<_> = drained.paths.into_iter().collect();
        assert_eq!(paths, vec!["a.rs".to_string(), "b.py".to_string()]);

        raw_tx.send(RawSignal::Rescan).await.unwrap();
        let batch = batch_rx.recv().await.unwrap();
        assert!(batch.rescan);
        assert!(dirty.drain().rescan);
    }

    #[tokio::test]
    async fn test_file_watcher_start_stop() {
        let dir = tempdir().unwrap();
        let dirty = Arc::new(DirtyPaths::new());
        let mut watcher = FileWatcher::new(
            dir.path().to_path_buf(),
            WatcherConfig::default(),
            dirty.clone(),
        );
        assert!(!watcher.is_running());

        let _rx = watcher.start().unwrap();
        assert!(watcher.is_running());
        assert!(dirty.is_watching());

        let mut second = FileWatcher::new(
            dir.path().to_path_buf(),
            WatcherConfig::default(),
            dirty.clone(),
        );
        assert!(second.start().is_err());
        drop(second);
        assert!(dirty.is_watching());

        watcher.stop();
        assert!(!watcher.is_running());
        assert!(!dirty.is_watching());
    }
}
