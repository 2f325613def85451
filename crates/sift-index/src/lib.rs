//! Hybrid lexical + semantic code search with incremental indexing.
//!
//! This crate provides:
//! - Content-addressed change detection (linear scan or Merkle tree)
//! - Symbol-aware chunking using tree-sitter
//! - Embedding generation (OpenAI-compatible HTTP or local feature hashing)
//! - BM25F keyword search and cosine vector search (in memory or Qdrant)
//! - Reciprocal Rank Fusion of both rankings
//! - Background file watching for auto-indexing

pub mod catalog;
pub mod chunker;
pub mod detector;
pub mod embeddings;
pub mod error;
pub mod fingerprint;
pub mod indexer;
pub mod merkle;
pub mod parser;
pub mod qdrant;
pub mod registry;
pub mod scanner;
pub mod search;
pub mod watcher;

// Re-exports
pub use catalog::ChunkCatalog;
pub use chunker::{CodeChunk, SymbolChunker};
pub use detector::{
    ChangeDetector, ChangeSet, DetectionStats, DirtyPaths, LinearDetector, MerkleDetector,
};
pub use embeddings::{EmbeddingAdapter, EmbeddingProvider, HashEmbeddings, HttpEmbeddings};
pub use error::{IndexError, Result};
pub use fingerprint::{FileRecord, FingerprintStore, JsonFingerprintStore, MemoryFingerprintStore};
pub use indexer::{Backends, FileOutcome, FileState, IndexReport, IndexingPipeline};
pub use merkle::MerkleTree;
pub use parser::{Language, Symbol, SymbolExtractor, SymbolKind, TreeSitterExtractor, Visibility};
pub use qdrant::QdrantVectorIndex;
pub use registry::{Project, ProjectRegistry};
pub use search::{
    fuse, Bm25Index, FusionParams, LexicalIndex, MemoryVectorIndex, QueryEngine, RankedHit,
    RankedResult, SearchHit, SearchMode, SearchResponse, VectorIndex,
};
pub use watcher::{FileWatcher, IndexingService, WatchBatch, WatcherConfig, WatcherError};
