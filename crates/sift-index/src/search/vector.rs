//! Nearest-neighbour search over chunk embeddings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::RankedHit;
use crate::error::{IndexError, Result};
use crate::fingerprint::write_atomic;

/// Vector store keyed by chunk id.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Store (or replace) the vector for a chunk.
    async fn insert(&self, chunk_id: Uuid, vector: Vec<f32>) -> Result<()>;

    async fn delete(&self, chunk_id: Uuid) -> Result<()>;

    /// Most similar first, rank 1-indexed.
    async fn search(&self, query: &[f32], limit: usize) -> Result<Vec<RankedHit>>;

    async fn insert_batch(&self, entries: Vec<(Uuid, Vec<f32>)>) -> Result<()> {
        for (id, vector) in entries {
            self.insert(id, vector).await?;
        }
        Ok(())
    }

    async fn delete_batch(&self, ids: &[Uuid]) -> Result<()> {
        for id in ids {
            self.delete(*id).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Cosine similarity in `[-1, 1]`; 0 when either vector has no magnitude
/// or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let similarity = dot / (norm_a * norm_b);
    if similarity.is_finite() {
        similarity.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VectorFile {
    dimensions: usize,
    vectors: HashMap<Uuid, Vec<f32>>,
}

/// Exact (brute-force) cosine search held in memory.
pub struct MemoryVectorIndex {
    dimensions: usize,
    vectors: RwLock<HashMap<Uuid, Vec<f32>>>,
    path: Option<PathBuf>,
}

impl MemoryVectorIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            vectors: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Open the index persisted at `path`. A file written for another
    /// dimension is discarded, since its vectors can no longer be compared.
    pub async fn open(path: impl AsRef<Path>, dimensions: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let vectors = match tokio::fs::read_to_string(&path).await {
            Ok(json) => {
                let file: VectorFile = serde_json::from_str(&json)?;
                if file.dimensions == dimensions {
                    debug!("Loaded {} vectors from {}", file.vectors.len(), path.display());
                    file.vectors
                } else {
                    warn!(
                        "Discarding vectors of dimension {} (expected {})",
                        file.dimensions, dimensions
                    );
                    HashMap::new()
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            dimensions,
            vectors: RwLock::new(vectors),
            path: Some(path),
        })
    }

    pub async fn len(&self) -> usize {
        self.vectors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, chunk_id: Uuid) -> bool {
        self.vectors.read().await.contains_key(&chunk_id)
    }

    fn check(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(IndexError::write(
                "vector",
                format!("expected dimension {}, got {}", self.dimensions, vector.len()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn insert(&self, chunk_id: Uuid, vector: Vec<f32>) -> Result<()> {
        self.check(&vector)?;
        self.vectors.write().await.insert(chunk_id, vector);
        Ok(())
    }

    async fn delete(&self, chunk_id: Uuid) -> Result<()> {
        self.vectors.write().await.remove(&chunk_id);
        Ok(())
    }

    async fn search(&self, query: &[f32], limit: usize) -> Result<Vec<RankedHit>> {
        if query.len() != self.dimensions {
            return Err(IndexError::QueryBackend {
                backend: "vector",
                reason: format!(
                    "query dimension {} does not match index dimension {}",
                    query.len(),
                    self.dimensions
                ),
            });
        }

        let vectors = self.vectors.read().await;
        let mut scored: Vec<(Uuid, f32)> = vectors
            .iter()
            .map(|(id, v)| (*id, cosine_similarity(query, v)))
            .collect();
        drop(vectors);

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(limit);
        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(i, (chunk_id, score))| RankedHit {
                chunk_id,
                rank: i + 1,
                score: f64::from(score),
            })
            .collect())
    }

    async fn insert_batch(&self, entries: Vec<(Uuid, Vec<f32>)>) -> Result<()> {
        for (_, vector) in &entries {
            self.check(vector)?;
        }
        let mut vectors = self.vectors.write().await;
        vectors.extend(entries);
        Ok(())
    }

    async fn delete_batch(&self, ids: &[Uuid]) -> Result<()> {
        let mut vectors = self.vectors.write().await;
        for id in ids {
            vectors.remove(id);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = {
            let vectors = self.vectors.read().await;
            serde_json::to_vec(&VectorFileRef {
                dimensions: self.dimensions,
                vectors: &vectors,
            })?
        };
        write_atomic(path, &json)
            .await
            .map_err(|e| IndexError::write("vector", e))
    }
}

#[derive(Serialize)]
struct VectorFileRef<'a> {
    dimensions: usize,
    vectors: &'a HashMap<Uuid, Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 1e-6);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 1e-6);

        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_search_orders_by_similarity() {
        let index = MemoryVectorIndex::new(2);
        index.insert(Uuid::from_u128(1), vec![1.0, 0.0]).await.unwrap();
        index.insert(Uuid::from_u128(2), vec![0.7, 0.7]).await.unwrap();
        index.insert(Uuid::from_u128(3), vec![0.0, 1.0]).await.unwrap();

        let hits = index.search(&[1.0, 0.1], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, Uuid::from_u128(1));
        assert_eq!(hits[0].rank, 1);
        assert_eq!(hits[1].chunk_id, Uuid::from_u128(2));
    }

    #[tokio::test]
    async fn test_ties_broken_by_chunk_id() {
        let index = MemoryVectorIndex::new(2);
        for n in [4u128, 2, 8] {
            index.insert(Uuid::from_u128(n), vec![1.0, 1.0]).await.unwrap();
        }
        let hits = index.search(&[1.0, 1.0], 10).await.unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.chunk_id.as_u128()).collect();
        assert_eq!(ids, vec![2, 4, 8]);
    }

    #[tokio::test]
    async fn test_wrong_dimension_rejected() {
        let index = MemoryVectorIndex::new(3);
        let err = index.insert(Uuid::from_u128(1), vec![1.0]).await.unwrap_err();
        assert!(matches!(err, IndexError::IndexWriteFailure { .. }));
        assert!(index
            .insert_batch(vec![
                (Uuid::from_u128(1), vec![1.0, 0.0, 0.0]),
                (Uuid::from_u128(2), vec![1.0]),
            ])
            .await
            .is_err());
        assert!(index.is_empty().await);
        assert!(index.search(&[1.0], 5).await.is_err());
    }

    #[tokio::test]
    async fn test_persist_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.json");

        let index = MemoryVectorIndex::open(&path, 2).await.unwrap();
        index.insert(Uuid::from_u128(1), vec![0.5, 0.5]).await.unwrap();
        index.insert(Uuid::from_u128(2), vec![0.1, 0.9]).await.unwrap();
        index.delete(Uuid::from_u128(2)).await.unwrap();
        index.flush().await.unwrap();

        let reopened = MemoryVectorIndex::open(&path, 2).await.unwrap();
        assert_eq!(reopened.len().await, 1);
        assert!(reopened.contains(Uuid::from_u128(1)).await);

        let other_dims = MemoryVectorIndex::open(&path, 3).await.unwrap();
        assert!(other_dims.is_empty().await);
    }
}
