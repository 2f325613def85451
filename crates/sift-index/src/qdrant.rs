//! Qdrant-backed vector index.
//!
//! One collection per project, cosine distance, point ids equal to chunk
//! ids. Chunk content lives in the catalog, so points carry only a small
//! payload for inspection.

use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::{
    CreateCollectionBuilder, DeletePointsBuilder, Distance, PointId, PointStruct, PointsIdsList,
    QuantizationType, ScalarQuantizationBuilder, SearchPointsBuilder, UpsertPointsBuilder, Value,
    VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use sift_config::VectorStoreConfig;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{IndexError, Result};
use crate::search::{RankedHit, VectorIndex};

/// Collection name for `project`: `<prefix>-<project>`, restricted to
/// characters Qdrant accepts.
pub fn collection_name(prefix: &str, project: &str) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    };
    format!("{}-{}", sanitize(prefix), sanitize(project))
}

fn point_to_chunk_id(id: Option<PointId>) -> Option<Uuid> {
    match id?.point_id_options? {
        PointIdOptions::Uuid(u) => Uuid::parse_str(&u).ok(),
        PointIdOptions::Num(_) => None,
    }
}

fn vector_error(err: impl std::fmt::Display) -> IndexError {
    IndexError::QueryBackend {
        backend: "vector",
        reason: err.to_string(),
    }
}

pub struct QdrantVectorIndex {
    client: Qdrant,
    collection: String,
    dimensions: usize,
}

impl QdrantVectorIndex {
    /// Connect and create the collection if it does not exist yet.
    pub async fn connect(
        config: &VectorStoreConfig,
        project: &str,
        dimensions: usize,
    ) -> Result<Self> {
        info!("Connecting to Qdrant at {}", config.url);

        let mut builder = Qdrant::from_url(&config.url).skip_compatibility_check();
        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| IndexError::write("vector", format!("failed to connect to Qdrant: {e}")))?;

        let index = Self {
            client,
            collection: collection_name(&config.collection_prefix, project),
            dimensions,
        };
        index.ensure_collection().await?;
        Ok(index)
    }

    async fn ensure_collection(&self) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| IndexError::write("vector", e))?;

        if exists {
            debug!("Collection {} already exists", self.collection);
            return Ok(());
        }

        info!(
            "Creating collection: {} with {} dimensions",
            self.collection, self.dimensions
        );
        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(
                        self.dimensions as u64,
                        Distance::Cosine,
                    ))
                    .quantization_config(
                        ScalarQuantizationBuilder::default()
                            .r#type(QuantizationType::Int8.into())
                            .quantile(0.99)
                            .always_ram(true),
                    ),
            )
            .await
            .map_err(|e| IndexError::write("vector", format!("failed to create collection: {e}")))?;
        Ok(())
    }

    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    /// Drop the whole collection.
    pub async fn delete_collection(&self) -> Result<()> {
        info!("Deleting collection: {}", self.collection);
        self.client
            .delete_collection(&self.collection)
            .await
            .map_err(|e| IndexError::write("vector", e))?;
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    async fn insert(&self, chunk_id: Uuid, vector: Vec<f32>) -> Result<()> {
        self.insert_batch(vec![(chunk_id, vector)]).await
    }

    async fn delete(&self, chunk_id: Uuid) -> Result<()> {
        self.delete_batch(&[chunk_id]).await
    }

    async fn search(&self, query: &[f32], limit: usize) -> Result<Vec<RankedHit>> {
        let results = self
            .client
            .search_points(SearchPointsBuilder::new(
                &self.collection,
                query.to_vec(),
                limit as u64,
            ))
            .await
            .map_err(vector_error)?;

        let mut hits: Vec<(Uuid, f32)> = results
            .result
            .into_iter()
            .filter_map(|p| match point_to_chunk_id(p.id) {
                Some(id) => Some((id, p.score)),
                None => {
                    warn!("Ignoring point without a chunk id in {}", self.collection);
                    None
                }
            })
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        debug!("Found {} search hits", hits.len());
        Ok(hits
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
        if entries.is_empty() {
            return Ok(());
        }
        if let Some((_, bad)) = entries.iter().find(|(_, v)| v.len() != self.dimensions) {
            return Err(IndexError::write(
                "vector",
                format!("expected dimension {}, got {}", self.dimensions, bad.len()),
            ));
        }

        debug!("Upserting {} points", entries.len());
        let points: Vec<PointStruct> = entries
            .into_iter()
            .map(|(id, vector)| {
                let mut payload: HashMap<String, Value> = HashMap::new();
                payload.insert("chunk_id".to_string(), Value::from(id.to_string()));
                PointStruct::new(id.to_string(), vector, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await
            .map_err(|e| IndexError::write("vector", e))?;
        Ok(())
    }

    async fn delete_batch(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        debug!("Deleting {} points", ids.len());
        let point_ids: Vec<PointId> = ids.iter().map(|id| PointId::from(id.to_string())).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(PointsIdsList { ids: point_ids })
                    .wait(true),
            )
            .await
            .map_err(|e| IndexError::write("vector", e))?;
        Ok(())
    }
}
