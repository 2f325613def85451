//! Error taxonomy for indexing and search.

use thiserror::Error;

/// Errors surfaced by the indexing pipeline, the query engine and the
/// storage backends.
///
/// Parse failures never appear here: the symbol extractor returns an empty
/// list and the chunker falls back to fixed-size segmentation.
#[derive(Error, Debug)]
pub enum IndexError {
    /// The fingerprint / metadata store could not be read or written.
    /// Fatal for the current indexing pass.
    #[error("Fingerprint store unavailable: {0}")]
    StoreUnavailable(String),

    /// A chunk could not be embedded, even after a truncated retry.
    #[error("Embedding failed: {0}")]
    EmbeddingFailure(String),

    /// A lexical or vector index write failed. The file's update is rolled back.
    #[error("Index write failed ({backend}): {reason}")]
    IndexWriteFailure {
        backend: &'static str,
        reason: String,
    },

    /// A search backend failed to answer in time.
    #[error("Search backend '{0}' timed out")]
    QueryBackendTimeout(&'static str),

    /// A search backend returned an error.
    #[error("Search backend '{backend}' failed: {reason}")]
    QueryBackend {
        backend: &'static str,
        reason: String,
    },

    /// The persisted Merkle snapshot failed structural validation.
    #[error("Snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    /// The indexing pass stopped before this file was committed.
    #[error("Indexing pass aborted")]
    Aborted,

    /// Per-file processing exceeded its time budget.
    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Unknown project: {0}")]
    UnknownProject(String),

    #[error("Project {0} is already being watched")]
    AlreadyWatched(String),

    #[error("Configuration error: {0}")]
    Config(#[from] sift_config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl IndexError {
    pub(crate) fn write(backend: &'static str, err: impl std::fmt::Display) -> Self {
        IndexError::IndexWriteFailure {
            backend,
            reason: err.to_string(),
        }
    }

    pub(crate) fn store(err: impl std::fmt::Display) -> Self {
        IndexError::StoreUnavailable(err.to_string())
    }

    /// Whether this error must abort the whole indexing pass rather than
    /// a single file.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IndexError::StoreUnavailable(_) | IndexError::Config(_))
    }
}

pub type Result<T, E = IndexError> = std::result::Result<T, E>;
