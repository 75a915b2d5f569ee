//! In-process [`ChunkStore`] partition.
//!
//! KNN is a brute-force scan over every stored vector; lexical ranking reads
//! the [`TermStats`] computed when the chunk was written. Locks are never
//! held across an await point.

use crate::error::SearchError;
use crate::lexical::{rank, LexicalQuery, TermStats};
use crate::models::Chunk;
use crate::store::{DistanceMetric, KnnHit, LexicalHandle, MetadataFilter};
use crate::traits::ChunkStore;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const BACKEND: &str = "memory";

struct StoredChunk {
    chunk_id: String,
    parent: String,
    content: String,
    metadata: Map<String, Value>,
    embedding: Vec<f32>,
    stats: TermStats,
}

impl StoredChunk {
    fn new(chunk: &Chunk, embedding: &[f32]) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            parent: chunk.parent.clone(),
            content: chunk.text.clone(),
            metadata: chunk.metadata.clone(),
            embedding: embedding.to_vec(),
            stats: TermStats::from_text(&chunk.text),
        }
    }
}

pub struct MemoryStore {
    dimension: usize,
    metric: DistanceMetric,
    chunks: RwLock<HashMap<String, StoredChunk>>,
}

impl MemoryStore {
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            dimension,
            metric,
            chunks: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.read().map(|chunks| chunks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chunk ids stored under `parent`, sorted.
    pub fn chunk_ids(&self, parent: &str) -> Result<Vec<String>, SearchError> {
        let chunks = self.read()?;
        let mut ids = chunks
            .values()
            .filter(|stored| stored.parent == parent)
            .map(|stored| stored.chunk_id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        Ok(ids)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, StoredChunk>>, SearchError> {
        self.chunks
            .read()
            .map_err(|_| SearchError::storage(BACKEND, "lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, StoredChunk>>, SearchError> {
        self.chunks
            .write()
            .map_err(|_| SearchError::storage(BACKEND, "lock poisoned"))
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<(), SearchError> {
        if embedding.len() == self.dimension {
            return Ok(());
        }
        Err(SearchError::storage(
            BACKEND,
            format!(
                "embedding has {} components, partition holds {}",
                embedding.len(),
                self.dimension
            ),
        ))
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    async fn put(&self, chunk: &Chunk, embedding: &[f32]) -> Result<(), SearchError> {
        self.check_dimension(embedding)?;
        let stored = StoredChunk::new(chunk, embedding);
        self.write()?.insert(stored.chunk_id.clone(), stored);
        Ok(())
    }

    async fn replace_document(
        &self,
        parent: &str,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<(), SearchError> {
        if chunks.len() != embeddings.len() {
            return Err(SearchError::storage(
                BACKEND,
                format!(
                    "{} chunks but {} embeddings for {parent}",
                    chunks.len(),
                    embeddings.len()
                ),
            ));
        }
        for embedding in embeddings {
            self.check_dimension(embedding)?;
        }

        let mut stored = self.write()?;
        stored.retain(|_, existing| existing.parent != parent);
        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            let entry = StoredChunk::new(chunk, embedding);
            stored.insert(entry.chunk_id.clone(), entry);
        }
        Ok(())
    }

    async fn knn_query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<KnnHit>, SearchError> {
        self.check_dimension(embedding)?;

        let chunks = self.read()?;
        let mut hits = chunks
            .values()
            .filter(|stored| filter.matches(&stored.metadata))
            .map(|stored| KnnHit {
                id: stored.chunk_id.clone(),
                content: stored.content.clone(),
                metadata: stored.metadata.clone(),
                distance: self.metric.distance(embedding, &stored.embedding),
                handle: LexicalHandle(stored.chunk_id.clone()),
            })
            .collect::<Vec<_>>();

        hits.sort_by(|left, right| {
            left.distance
                .total_cmp(&right.distance)
                .then_with(|| left.id.cmp(&right.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn lexical_rank(
        &self,
        handle: &LexicalHandle,
        query: &LexicalQuery,
    ) -> Result<f64, SearchError> {
        let chunks = self.read()?;
        Ok(chunks
            .get(&handle.0)
            .map(|stored| rank(&stored.stats, query))
            .unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkKind;
    use crate::store::PARENT_KEY;

    fn chunk(id: &str, parent: &str, text: &str) -> Chunk {
        let mut metadata = Map::new();
        metadata.insert(PARENT_KEY.to_string(), Value::from(parent));
        metadata.insert("type".to_string(), Value::from("txt"));
        Chunk {
            chunk_id: id.to_string(),
            parent: parent.to_string(),
            section_id: None,
            chunk_index: 0,
            text: text.to_string(),
            token_count: text.split_whitespace().count(),
            start_offset: 0,
            end_offset: text.len(),
            overlap_ratio: None,
            oversized: false,
            kind: ChunkKind::Paragraphs,
            metadata,
        }
    }

    #[tokio::test]
    async fn knn_orders_by_distance_and_bounds_k() -> Result<(), SearchError> {
        let store = MemoryStore::new(2, DistanceMetric::Cosine);
        store.put(&chunk("a", "doc-1", "pump"), &[1.0, 0.0]).await?;
        store.put(&chunk("b", "doc-1", "valve"), &[0.6, 0.8]).await?;
        store.put(&chunk("c", "doc-2", "seal"), &[0.0, 1.0]).await?;

        let hits = store
            .knn_query(&[1.0, 0.0], 2, &MetadataFilter::default())
            .await?;

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "b");
        assert!(hits[0].distance <= hits[1].distance);
        Ok(())
    }

    #[tokio::test]
    async fn knn_applies_metadata_filter() -> Result<(), SearchError> {
        let store = MemoryStore::new(2, DistanceMetric::Cosine);
        store.put(&chunk("a", "doc-1", "pump"), &[1.0, 0.0]).await?;
        store.put(&chunk("b", "doc-2", "valve"), &[1.0, 0.0]).await?;

        let filter = MetadataFilter::default().with(PARENT_KEY, "doc-2");
        let hits = store.knn_query(&[1.0, 0.0], 10, &filter).await?;

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].parent(), "doc-2");
        Ok(())
    }

    #[tokio::test]
    async fn replace_document_swaps_only_that_parent() -> Result<(), SearchError> {
        let store = MemoryStore::new(2, DistanceMetric::Cosine);
        store
            .replace_document(
                "doc-1",
                &[chunk("a", "doc-1", "old"), chunk("b", "doc-1", "old")],
                &[vec![1.0, 0.0], vec![0.0, 1.0]],
            )
            .await?;
        store.put(&chunk("z", "doc-2", "other"), &[1.0, 0.0]).await?;

        store
            .replace_document("doc-1", &[chunk("c", "doc-1", "new")], &[vec![1.0, 0.0]])
            .await?;

        assert_eq!(store.chunk_ids("doc-1")?, vec!["c".to_string()]);
        assert_eq!(store.chunk_ids("doc-2")?, vec!["z".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected() {
        let store = MemoryStore::new(3, DistanceMetric::L2);
        let result = store.put(&chunk("a", "doc-1", "pump"), &[1.0, 0.0]).await;
        assert!(matches!(result, Err(SearchError::Storage { .. })));
    }

    #[tokio::test]
    async fn lexical_rank_uses_stored_term_stats() -> Result<(), SearchError> {
        let store = MemoryStore::new(2, DistanceMetric::Cosine);
        store
            .put(&chunk("a", "doc-1", "relief valve and relief valve"), &[1.0, 0.0])
            .await?;

        let query = LexicalQuery::Phrase(vec!["relief".into(), "valve".into()]);
        let ranks = store
            .lexical_ranks(
                &[LexicalHandle("a".into()), LexicalHandle("missing".into())],
                &query,
            )
            .await?;

        assert!((ranks[0] - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(ranks[1], 0.0);
        Ok(())
    }
}
