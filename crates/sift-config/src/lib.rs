//! Configuration for sift.
//!
//! Settings are layered: built-in defaults, then an optional TOML file,
//! then `SIFT_*` environment variables (`SIFT_SEARCH__RRF_K=30`, ...).
//! Two shortcuts are honoured on top: `SIFT_DATA_DIR` and
//! `SIFT_EMBEDDING_API_KEY`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the config file looked up under the user config directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Errors produced while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which change-detection strategy the indexing pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorStrategy {
    /// Hash every file and compare against the fingerprint store.
    Linear,
    /// Compare a Merkle tree against the last committed snapshot.
    Merkle,
}

/// Which embedding provider to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Local feature-hashing embedder. Needs no model or network.
    Hash,
    /// OpenAI-compatible `/embeddings` HTTP endpoint.
    Http,
}

/// Which vector backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    /// Exact cosine search held in memory and persisted as JSON.
    Memory,
    /// A Qdrant server, one collection per project.
    Qdrant,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where project registries and per-project index state live.
    pub data_dir: PathBuf,
    pub indexing: IndexingConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub vector_store: VectorStoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            indexing: IndexingConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            search: SearchConfig::default(),
            vector_store: VectorStoreConfig::default(),
        }
    }
}

/// Settings for walking, change detection and the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// File extensions to index (without the dot).
    pub extensions: Vec<String>,
    /// Maximum number of files processed concurrently.
    pub workers: usize,
    /// Per-file budget for read, parse, chunk and embed.
    pub file_timeout_secs: u64,
    pub detector: DetectorStrategy,
    /// Reuse the snapshot hash when size and mtime are unchanged.
    pub mtime_prefilter: bool,
    pub respect_gitignore: bool,
    /// Files larger than this are skipped by the scanner.
    pub max_file_bytes: u64,
    /// Debounce window for the file watcher.
    pub watch_debounce_ms: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            extensions: ["rs", "py", "js", "jsx", "ts", "tsx", "go"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            workers: 8,
            file_timeout_secs: 60,
            detector: DetectorStrategy::Merkle,
            mtime_prefilter: false,
            respect_gitignore: true,
            max_file_bytes: 2 * 1024 * 1024,
            watch_debounce_ms: 500,
        }
    }
}

/// Settings for the symbol chunker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Fraction of a neighbouring symbol copied into overlap fields.
    pub overlap_fraction: f32,
    pub max_imports: usize,
    pub max_calls: usize,
    pub max_type_references: usize,
    /// Window size of the fixed-size fallback, in characters.
    pub fallback_chunk_chars: usize,
    /// Characters shared by consecutive fallback segments.
    pub fallback_overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            overlap_fraction: 0.2,
            max_imports: 16,
            max_calls: 32,
            max_type_references: 32,
            fallback_chunk_chars: 1500,
            fallback_overlap_chars: 200,
        }
    }
}

/// Settings for the embedding provider and adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    pub dimensions: usize,
    pub base_url: String,
    pub api_key: Option<String>,
    pub batch_size: usize,
    /// Inputs are truncated to this many characters before embedding.
    pub max_input_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Hash,
            model: "text-embedding-3-small".to_string(),
            dimensions: 384,
            base_url: "https://api.openai.com/v1/embeddings".to_string(),
            api_key: None,
            batch_size: 32,
            max_input_chars: 8000,
        }
    }
}

/// Settings for query execution and fusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_limit: usize,
    /// RRF smoothing constant.
    pub rrf_k: f64,
    pub lexical_weight: f64,
    pub vector_weight: f64,
    /// Overall budget for one query.
    pub query_timeout_ms: u64,
    /// Budget for each of the lexical and vector sub-searches.
    pub backend_timeout_ms: u64,
    /// Each sub-search fetches `limit * fetch_multiplier` candidates.
    pub fetch_multiplier: usize,
    pub content_boost: f64,
    pub symbol_name_boost: f64,
    pub docstring_boost: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            rrf_k: 60.0,
            lexical_weight: 0.5,
            vector_weight: 0.5,
            query_timeout_ms: 5000,
            backend_timeout_ms: 3000,
            fetch_multiplier: 3,
            content_boost: 1.0,
            symbol_name_boost: 3.0,
            docstring_boost: 1.5,
        }
    }
}

/// Settings for the vector backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub backend: VectorBackend,
    pub url: String,
    pub api_key: Option<String>,
    /// Collections are named `<prefix>-<project>`.
    pub collection_prefix: String,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::Memory,
            url: "http://localhost:6334".to_string(),
            api_key: None,
            collection_prefix: "sift".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location when
    /// `path` is `None`. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(),
        };

        let defaults = config::Config::try_from(&Config::default())?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(file) = file {
            builder = builder.add_source(
                config::File::from(file)
                    .format(config::FileFormat::Toml)
                    .required(path.is_some()),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SIFT")
                .prefix_separator("_")
                .separator("__"),
        );

        let mut cfg: Config = builder.build()?.try_deserialize()?;
        cfg.apply_env_shortcuts();
        cfg.data_dir = expand_path(&cfg.data_dir);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse configuration from a TOML string layered over the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let defaults = config::Config::try_from(&Config::default())?;
        let cfg: Config = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write the configuration as TOML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    fn apply_env_shortcuts(&mut self) {
        if let Ok(dir) = std::env::var("SIFT_DATA_DIR") {
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(key) = std::env::var("SIFT_EMBEDDING_API_KEY") {
            if !key.is_empty() {
                self.embedding.api_key = Some(key);
            }
        }
    }

    /// Check the invariants that the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.search;
        for (name, w) in [("lexical_weight", s.lexical_weight), ("vector_weight", s.vector_weight)] {
            if !w.is_finite() || w < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "search.{name} must be a finite, non-negative number (got {w})"
                )));
            }
        }
        if s.lexical_weight == 0.0 && s.vector_weight == 0.0 {
            return Err(ConfigError::Invalid(
                "search weights cannot both be zero".to_string(),
            ));
        }
        if !s.rrf_k.is_finite() || s.rrf_k < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "search.rrf_k must be finite and non-negative (got {})",
                s.rrf_k
            )));
        }
        if s.fetch_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "search.fetch_multiplier must be at least 1".to_string(),
            ));
        }

        let c = &self.chunking;
        if !(0.0..1.0).contains(&c.overlap_fraction) {
            return Err(ConfigError::Invalid(format!(
                "chunking.overlap_fraction must be in [0, 1) (got {})",
                c.overlap_fraction
            )));
        }
        if c.fallback_chunk_chars == 0 || c.fallback_overlap_chars >= c.fallback_chunk_chars {
            return Err(ConfigError::Invalid(
                "chunking.fallback_overlap_chars must be smaller than fallback_chunk_chars"
                    .to_string(),
            ));
        }

        if self.indexing.workers == 0 {
            return Err(ConfigError::Invalid(
                "indexing.workers must be at least 1".to_string(),
            ));
        }
        if self.embedding.dimensions == 0 || self.embedding.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "embedding.dimensions and embedding.batch_size must be positive".to_string(),
            ));
        }
        if self.embedding.max_input_chars < 2 {
            return Err(ConfigError::Invalid(
                "embedding.max_input_chars must be at least 2".to_string(),
            ));
        }
        if self.embedding.provider == EmbeddingProviderKind::Http
            && self.embedding.base_url.trim().is_empty()
        {
            return Err(ConfigError::Invalid(
                "embedding.base_url is required for the http provider".to_string(),
            ));
        }
        Ok(())
    }
}

/// `~/.config/sift/config.toml` (platform equivalent), if a config dir exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("sift").join(CONFIG_FILE_NAME))
}

/// Default data directory: the platform local data dir, or `~/.sift`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("sift"))
        .unwrap_or_else(|| expand_path(Path::new("~/.sift")))
}

/// Expand `~` and environment variables in a path.
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(&raw).as_ref()),
    }
}
