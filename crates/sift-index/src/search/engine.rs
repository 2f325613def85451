//! Query execution.
//!
//! A hybrid query runs the lexical and vector sub-searches concurrently,
//! each under its own deadline. A backend that fails or times out is left
//! out of the fusion and the response is flagged as degraded.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sift_config::SearchConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::fusion::{fuse, FusionParams};
use super::{LexicalIndex, RankedHit, VectorIndex};
use crate::catalog::ChunkCatalog;
use crate::chunker::CodeChunk;
use crate::embeddings::EmbeddingAdapter;
use crate::error::{IndexError, Result};
use crate::parser::SymbolKind;

/// Which backends a query consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Lexical,
    Vector,
    #[default]
    Hybrid,
}

impl SearchMode {
    fn uses_lexical(self) -> bool {
        matches!(self, SearchMode::Lexical | SearchMode::Hybrid)
    }

    fn uses_vector(self) -> bool {
        matches!(self, SearchMode::Vector | SearchMode::Hybrid)
    }
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lexical" | "keyword" | "bm25" => Ok(SearchMode::Lexical),
            "vector" | "semantic" => Ok(SearchMode::Vector),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(format!("unknown search mode '{other}'")),
        }
    }
}

/// A search result with relevance score and location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: Uuid,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub symbol_name: Option<String>,
    pub symbol_kind: Option<SymbolKind>,
    pub content: String,
    /// Fused score (higher is better).
    pub score: f64,
    pub lexical_rank: Option<usize>,
    pub vector_rank: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    /// At least one requested backend failed or timed out.
    pub degraded: bool,
    /// One message per failed backend.
    pub errors: Vec<String>,
}

/// Answers queries against one project's indexes.
#[derive(Clone)]
pub struct QueryEngine {
    lexical: Arc<dyn LexicalIndex>,
    vector: Arc<dyn VectorIndex>,
    embedder: EmbeddingAdapter,
    catalog: Arc<ChunkCatalog>,
    config: SearchConfig,
}

impl QueryEngine {
    pub fn new(
        lexical: Arc<dyn LexicalIndex>,
        vector: Arc<dyn VectorIndex>,
        embedder: EmbeddingAdapter,
        catalog: Arc<ChunkCatalog>,
        config: SearchConfig,
    ) -> Self {
        Self {
            lexical,
            vector,
            embedder,
            catalog,
            config,
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Run `query` and return at most `limit` hits, best first.
    ///
    /// Never fails as a whole: backend errors are reported through
    /// [`SearchResponse::degraded`] and [`SearchResponse::errors`].
    pub async fn search(&self, query: &str, limit: usize, mode: SearchMode) -> SearchResponse {
        if limit == 0 || query.trim().is_empty() {
            return SearchResponse::default();
        }

        let started = Instant::now();
        let fetch = limit.saturating_mul(self.config.fetch_multiplier).max(limit);
        let budget = Duration::from_millis(
            self.config
                .backend_timeout_ms
                .min(self.config.query_timeout_ms),
        );

        // Dropping this future (client gone) stops both sub-searches.
        let token = CancellationToken::new();
        let _guard = token.clone().drop_guard();

        let lexical_task = mode.uses_lexical().then(|| {
            let lexical = self.lexical.clone();
            let query = query.to_string();
            spawn_guarded("lexical", budget, token.clone(), async move {
                lexical.search(&query, fetch).await
            })
        });

        let vector_task = mode.uses_vector().then(|| {
            let vector = self.vector.clone();
            let embedder = self.embedder.clone();
            let query = query.to_string();
            spawn_guarded("vector", budget, token.clone(), async move {
                let embedding = embedder.embed_query(&query).await?;
                vector.search(&embedding, fetch).await
            })
        });

        let mut errors = Vec::new();
        let lexical_hits = collect("lexical", lexical_task, &mut errors).await;
        let vector_hits = collect("vector", vector_task, &mut errors).await;

        // One catalog read decides which hits are live; ranks are counted
        // among live hits only.
        let ids: Vec<Uuid> = lexical_hits
            .iter()
            .chain(&vector_hits)
            .map(|h| h.chunk_id)
            .collect();
        let live: HashMap<Uuid, Arc<CodeChunk>> = ids
            .iter()
            .copied()
            .zip(self.catalog.hydrate(&ids))
            .filter_map(|(id, chunk)| Some((id, chunk?)))
            .collect();

        let fused = fuse(
            &live_ranking(lexical_hits, &live),
            &live_ranking(vector_hits, &live),
            FusionParams::from(&self.config),
            limit,
        );

        let results: Vec<SearchHit> = fused
            .into_iter()
            .filter_map(|ranked| {
                let chunk = live.get(&ranked.chunk_id)?;
                Some(SearchHit {
                    chunk_id: ranked.chunk_id,
                    file_path: chunk.file_path.clone(),
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    symbol_name: chunk.symbol_name.clone(),
                    symbol_kind: chunk.symbol_kind.clone(),
                    content: chunk.content.clone(),
                    score: ranked.fused_score,
                    lexical_rank: ranked.lexical_rank,
                    vector_rank: ranked.vector_rank,
                })
            })
            .collect();

        debug!(
            "Query {:?} ({:?}) returned {} results in {:?}",
            query,
            mode,
            results.len(),
            started.elapsed()
        );

        SearchResponse {
            degraded: !errors.is_empty(),
            results,
            errors,
        }
    }
}

/// Drop hits the catalog does not know and renumber the rest from 1.
fn live_ranking(hits: Vec<RankedHit>, live: &HashMap<Uuid, Arc<CodeChunk>>) -> Vec<RankedHit> {
    let mut hits: Vec<RankedHit> = hits
        .into_iter()
        .filter(|h| live.contains_key(&h.chunk_id))
        .collect();
    hits.sort_by_key(|h| h.rank);
    for (i, hit) in hits.iter_mut().enumerate() {
        hit.rank = i + 1;
    }
    hits
}

fn spawn_guarded<F>(
    backend: &'static str,
    budget: Duration,
    token: CancellationToken,
    search: F,
) -> JoinHandle<Result<Vec<RankedHit>>>
where
    F: Future<Output = Result<Vec<RankedHit>>> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => Err(IndexError::QueryBackend {
                backend,
                reason: "cancelled".to_string(),
            }),
            result = tokio::time::timeout(budget, search) => {
                result.unwrap_or(Err(IndexError::QueryBackendTimeout(backend)))
            }
        }
    })
}

async fn collect(
    backend: &'static str,
    task: Option<JoinHandle<Result<Vec<RankedHit>>>>,
    errors: &mut Vec<String>,
) -> Vec<RankedHit> {
    let Some(task) = task else {
        return Vec::new();
    };
    let outcome = task.await.unwrap_or_else(|e| {
        Err(IndexError::QueryBackend {
            backend,
            reason: e.to_string(),
        })
    });
    match outcome {
        Ok(hits) => hits,
        Err(e) => {
            warn!("{} search unavailable: {}", backend, e);
            errors.push(e.to_string());
            Vec::new()
        }
    }
}
