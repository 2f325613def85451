//! Project registry: the entry point for indexing and searching projects
//! by name.
//!
//! Layout under the data directory:
//!
//! ```text
//! projects.json            name -> canonical root
//! <name>/fingerprints.json
//! <name>/snapshot.json
//! <name>/catalog.json
//! <name>/lexical/           tantivy index
//! <name>/vectors.json      (memory vector backend only)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sift_config::{Config, VectorBackend};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::catalog::ChunkCatalog;
use crate::detector::{self, DirtyPaths};
use crate::embeddings::{provider_from_config, EmbeddingAdapter};
use crate::error::{IndexError, Result};
use crate::fingerprint::{write_atomic, JsonFingerprintStore};
use crate::indexer::{Backends, IndexReport, IndexingPipeline};
use crate::parser::TreeSitterExtractor;
use crate::qdrant::QdrantVectorIndex;
use crate::search::{
    Bm25Index, FieldBoosts, MemoryVectorIndex, QueryEngine, SearchMode, SearchResponse,
    VectorIndex,
};
use crate::watcher::{FileWatcher, IndexingService, WatcherConfig};

const PROJECTS_FILE: &str = "projects.json";

/// An opened project: its pipeline and query engine share backends.
pub struct Project {
    pub name: String,
    pub root: PathBuf,
    pub pipeline: Arc<IndexingPipeline>,
    pub engine: QueryEngine,
    dirty: Arc<DirtyPaths>,
}

impl Project {
    /// Whether a file watcher currently feeds this project's detector.
    pub fn is_watched(&self) -> bool {
        self.dirty.is_watching()
    }
}

pub struct ProjectRegistry {
    config: Config,
    projects: Mutex<BTreeMap<String, PathBuf>>,
    open: Mutex<HashMap<String, Arc<Project>>>,
}

impl ProjectRegistry {
    /// Open the registry in `config.data_dir`.
    pub async fn open(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(IndexError::store)?;
        let path = config.data_dir.join(PROJECTS_FILE);
        let projects = match tokio::fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| IndexError::store(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(IndexError::store(e)),
        };
        Ok(Self {
            config,
            projects: Mutex::new(projects),
            open: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Index the project at `project_path`, registering it on first use.
    pub async fn index(&self, project_path: &Path, force_reindex: bool) -> Result<IndexReport> {
        let (name, _) = self.register(project_path).await?;
        let project = self.project(&name).await?;
        project.pipeline.run(force_reindex).await
    }

    /// Search a registered project.
    pub async fn search(
        &self,
        project_name: &str,
        query: &str,
        limit: usize,
        mode: SearchMode,
    ) -> Result<SearchResponse> {
        let project = self.project(project_name).await?;
        Ok(project.engine.search(query, limit, mode).await)
    }

    /// Registered project names, sorted.
    pub async fn list_projects(&self) -> Vec<String> {
        self.projects.lock().await.keys().cloned().collect()
    }

    /// Registered projects with their roots.
    pub async fn projects(&self) -> BTreeMap<String, PathBuf> {
        self.projects.lock().await.clone()
    }

    /// A service that keeps the project at `project_path` indexed as files
    /// change. Shares the project's pipeline with [`Self::index`] and
    /// [`Self::search`]; its first pass is a full detection.
    pub async fn watch(&self, project_path: &Path) -> Result<IndexingService> {
        let (name, root) = self.register(project_path).await?;
        let project = self.project(&name).await?;
        if project.is_watched() {
            return Err(IndexError::AlreadyWatched(name));
        }

        let watcher = FileWatcher::new(
            root,
            WatcherConfig::from(&self.config.indexing),
            project.dirty.clone(),
        );
        Ok(IndexingService::new(watcher, project.pipeline.clone()))
    }

    /// Open (or reuse) the named project.
    pub async fn project(&self, name: &str) -> Result<Arc<Project>> {
        if let Some(project) = self.open.lock().await.get(name) {
            return Ok(project.clone());
        }
        let root = self
            .projects
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| IndexError::UnknownProject(name.to_string()))?;

        let project = Arc::new(self.build(name, &root).await?);
        let mut open = self.open.lock().await;
        Ok(open.entry(name.to_string()).or_insert(project).clone())
    }

    /// Canonicalize `project_path` and give it a name. Roots already
    /// registered keep their name; a new root whose directory name is taken
    /// gets a numeric suffix.
    async fn register(&self, project_path: &Path) -> Result<(String, PathBuf)> {
        let root = tokio::fs::canonicalize(project_path).await?;
        let mut projects = self.projects.lock().await;

        if let Some((name, _)) = projects.iter().find(|(_, r)| **r == root) {
            return Ok((name.clone(), root));
        }

        let base = project_name(&root);
        let mut name = base.clone();
        let mut suffix = 2;
        while projects.contains_key(&name) {
            name = format!("{base}-{suffix}");
            suffix += 1;
        }
        info!("Registering project {} at {:?}", name, root);
        projects.insert(name.clone(), root.clone());

        let json = serde_json::to_vec_pretty(&*projects)?;
        write_atomic(&self.config.data_dir.join(PROJECTS_FILE), &json)
            .await
            .map_err(IndexError::store)?;
        Ok((name, root))
    }

    async fn build(&self, name: &str, root: &Path) -> Result<Project> {
        let dir = self.config.data_dir.join(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(IndexError::store)?;
        debug!("Opening project {} from {:?}", name, dir);

        let store = Arc::new(JsonFingerprintStore::open(dir.join("fingerprints.json")).await?);
        let dirty = Arc::new(DirtyPaths::new());
        let detector = detector::from_config(
            &self.config.indexing,
            store.clone(),
            Some(dir.join("snapshot.json")),
            Some(dirty.clone()),
        );

        let embedder = EmbeddingAdapter::new(
            provider_from_config(&self.config.embedding),
            &self.config.embedding,
        );
        let dimensions = embedder.dimensions();
        let lexical = Arc::new(
            Bm25Index::open(dir.join("lexical"), FieldBoosts::from(&self.config.search))
                .await?,
        );
        let vector: Arc<dyn VectorIndex> = match self.config.vector_store.backend {
            VectorBackend::Memory => {
                Arc::new(MemoryVectorIndex::open(dir.join("vectors.json"), dimensions).await?)
            }
            VectorBackend::Qdrant => Arc::new(
                QdrantVectorIndex::connect(&self.config.vector_store, name, dimensions).await?,
            ),
        };
        let catalog = Arc::new(ChunkCatalog::open(dir.join("catalog.json")).await?);

        let engine = QueryEngine::new(
            lexical.clone(),
            vector.clone(),
            embedder.clone(),
            catalog.clone(),
            self.config.search.clone(),
        );
        let pipeline = Arc::new(IndexingPipeline::new(
            root,
            Backends {
                store,
                detector,
                extractor: Arc::new(TreeSitterExtractor::new()),
                embedder,
                lexical,
                vector,
                catalog,
            },
            &self.config.indexing,
            self.config.chunking.clone(),
        ));

        Ok(Project {
            name: name.to_string(),
            root: root.to_path_buf(),
            pipeline,
            engine,
            dirty,
        })
    }
}

/// Final component of a canonical root, or `"root"` for `/`.
pub fn project_name(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "root".to_string())
}
