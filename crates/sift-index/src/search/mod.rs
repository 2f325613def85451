//! Hybrid search combining vector similarity and BM25.
//!
//! The lexical and vector backends rank chunks independently; their
//! rankings are combined with Reciprocal Rank Fusion and the winners are
//! resolved through the chunk catalog.

pub mod bm25;
pub mod engine;
pub mod fusion;
pub mod vector;

pub use bm25::{tokenize, Bm25Index, FieldBoosts, LexicalFields, LexicalIndex};
pub use engine::{QueryEngine, SearchHit, SearchMode, SearchResponse};
pub use fusion::{fuse, FusionParams, RankedResult};
pub use vector::{cosine_similarity, MemoryVectorIndex, VectorIndex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One entry of a backend's ranked result list.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankedHit {
    pub chunk_id: Uuid,
    /// 1-indexed position in the backend's list.
    pub rank: usize,
    /// Backend-specific score; only the rank is used for fusion.
    pub score: f64,
}
