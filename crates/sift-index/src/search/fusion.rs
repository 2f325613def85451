//! Reciprocal Rank Fusion.
//!
//! `score = wl / (k + lexical_rank) + wv / (k + vector_rank)` with 1-indexed
//! ranks; a chunk missing from one list contributes nothing from it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sift_config::SearchConfig;
use uuid::Uuid;

use super::RankedHit;

/// Weights and smoothing constant for [`fuse`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionParams {
    pub k: f64,
    pub lexical_weight: f64,
    pub vector_weight: f64,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self::from(&SearchConfig::default())
    }
}

impl From<&SearchConfig> for FusionParams {
    fn from(config: &SearchConfig) -> Self {
        Self {
            k: config.rrf_k,
            lexical_weight: config.lexical_weight,
            vector_weight: config.vector_weight,
        }
    }
}

/// One fused candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    pub chunk_id: Uuid,
    pub fused_score: f64,
    pub lexical_rank: Option<usize>,
    pub vector_rank: Option<usize>,
}

fn contribution(weight: f64, k: f64, rank: usize) -> f64 {
    let score = weight / (k + rank as f64);
    if score.is_finite() {
        score
    } else {
        0.0
    }
}

/// Fuse two ranked lists into one, best first.
///
/// Ties on fused score are broken by chunk id ascending, so the output is a
/// pure function of the inputs. An empty input list leaves the other list's
/// order intact.
pub fn fuse(
    lexical: &[RankedHit],
    vector: &[RankedHit],
    params: FusionParams,
    limit: usize,
) -> Vec<RankedResult> {
    let mut fused: HashMap<Uuid, RankedResult> = HashMap::new();

    for hit in lexical {
        let entry = fused.entry(hit.chunk_id).or_insert_with(|| RankedResult {
            chunk_id: hit.chunk_id,
            fused_score: 0.0,
            lexical_rank: None,
            vector_rank: None,
        });
        // Duplicate ids keep their best rank.
        if entry.lexical_rank.is_none() {
            entry.lexical_rank = Some(hit.rank);
            entry.fused_score += contribution(params.lexical_weight, params.k, hit.rank);
        }
    }

    for hit in vector {
        let entry = fused.entry(hit.chunk_id).or_insert_with(|| RankedResult {
            chunk_id: hit.chunk_id,
            fused_score: 0.0,
            lexical_rank: None,
            vector_rank: None,
        });
        if entry.vector_rank.is_none() {
            entry.vector_rank = Some(hit.rank);
            entry.fused_score += contribution(params.vector_weight, params.k, hit.rank);
        }
    }

    let mut results: Vec<RankedResult> = fused.into_values().collect();
    results.sort_by(|a, b| {
        b.fused_score
            .total_cmp(&a.fused_score)
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
    results.truncate(limit);
    results
}
