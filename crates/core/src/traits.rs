use crate::error::SearchError;
use crate::lexical::LexicalQuery;
use crate::models::Chunk;
use crate::store::{DistanceMetric, KnnHit, LexicalHandle, MetadataFilter};
use async_trait::async_trait;
use std::sync::Arc;

/// One dimension-specific storage partition.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    fn dimension(&self) -> usize;

    fn metric(&self) -> DistanceMetric;

    async fn put(&self, chunk: &Chunk, embedding: &[f32]) -> Result<(), SearchError>;

    /// Replaces every chunk stored under `parent` with `chunks`.
    async fn replace_document(
        &self,
        parent: &str,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<(), SearchError>;

    /// Up to `k` hits ordered by ascending distance.
    async fn knn_query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<KnnHit>, SearchError>;

    async fn lexical_rank(
        &self,
        handle: &LexicalHandle,
        query: &LexicalQuery,
    ) -> Result<f64, SearchError>;

    /// Ranks for several handles, in the same order.
    async fn lexical_ranks(
        &self,
        handles: &[LexicalHandle],
        query: &LexicalQuery,
    ) -> Result<Vec<f64>, SearchError> {
        let mut ranks = Vec::with_capacity(handles.len());
        for handle in handles {
            ranks.push(self.lexical_rank(handle, query).await?);
        }
        Ok(ranks)
    }
}

#[async_trait]
impl<S: ChunkStore + ?Sized> ChunkStore for Arc<S> {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn metric(&self) -> DistanceMetric {
        (**self).metric()
    }

    async fn put(&self, chunk: &Chunk, embedding: &[f32]) -> Result<(), SearchError> {
        (**self).put(chunk, embedding).await
    }

    async fn replace_document(
        &self,
        parent: &str,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<(), SearchError> {
        (**self).replace_document(parent, chunks, embeddings).await
    }

    async fn knn_query(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<KnnHit>, SearchError> {
        (**self).knn_query(embedding, k, filter).await
    }

    async fn lexical_rank(
        &self,
        handle: &LexicalHandle,
        query: &LexicalQuery,
    ) -> Result<f64, SearchError> {
        (**self).lexical_rank(handle, query).await
    }

    async fn lexical_ranks(
        &self,
        handles: &[LexicalHandle],
        query: &LexicalQuery,
    ) -> Result<Vec<f64>, SearchError> {
        (**self).lexical_ranks(handles, query).await
    }
}

/// External pairwise relevance scorer.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn score(&self, query: &str, candidate: &str) -> Result<f64, SearchError>;

    async fn score_batch(
        &self,
        query: &str,
        candidates: &[&str],
    ) -> Result<Vec<f64>, SearchError> {
        let mut scores = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            scores.push(self.score(query, candidate).await?);
        }
        Ok(scores)
    }
}
