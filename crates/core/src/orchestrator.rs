use crate::config::RetrievalSettings;
use crate::embeddings::{embed_normalized, Embedder, EmbeddingProfile};
use crate::error::SearchError;
use crate::lexical::{lexical_score, LexicalQuery};
use crate::metrics::RetrievalMetrics;
use crate::models::{QueryRequest, ResultSet, RetrievalVariant, ScoredCandidate};
use crate::rerank::rerank;
use crate::store::{KnnHit, PartitionRegistry};
use crate::traits::{ChunkStore, Reranker};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Blends vector similarity with lexical rank.
///
/// Lexical weighting only applies when there is a lexical match; otherwise
/// the score is the similarity itself.
pub fn combine_score(similarity: f64, lexical_rank: f64, weight_vec: f64, weight_lex: f64) -> f64 {
    if lexical_rank > 0.0 {
        weight_vec * similarity + weight_lex * lexical_rank
    } else {
        similarity
    }
}

/// Keeps only the candidates of the parent whose best member scores highest.
/// Ties go to the lexicographically smallest parent id.
pub fn select_parent_group(candidates: Vec<ScoredCandidate>) -> Vec<ScoredCandidate> {
    let mut best_by_parent = BTreeMap::<&str, f64>::new();
    for candidate in &candidates {
        let best = best_by_parent
            .entry(candidate.parent.as_str())
            .or_insert(f64::NEG_INFINITY);
        if candidate.score > *best {
            *best = candidate.score;
        }
    }

    // BTreeMap iterates parents in ascending order, so a strict `>` keeps the
    // smallest id among equal maxima.
    let mut winner: Option<(&str, f64)> = None;
    for (parent, best) in best_by_parent {
        if winner.map_or(true, |(_, score)| best > score) {
            winner = Some((parent, best));
        }
    }

    let Some((parent, _)) = winner else {
        return candidates;
    };
    let parent = parent.to_string();

    candidates
        .into_iter()
        .filter(|candidate| candidate.parent == parent)
        .collect()
}

fn by_score_then_id(left: &ScoredCandidate, right: &ScoredCandidate) -> Ordering {
    right
        .score
        .total_cmp(&left.score)
        .then_with(|| left.chunk_id.cmp(&right.chunk_id))
}

fn validate(request: &QueryRequest) -> Result<(), SearchError> {
    if request.match_count == 0 {
        return Err(SearchError::InvalidRequest(
            "match_count must be at least 1".to_string(),
        ));
    }
    if request.pool_multiplier == 0 {
        return Err(SearchError::InvalidRequest(
            "pool_multiplier must be at least 1".to_string(),
        ));
    }
    if !request.weight_vec.is_finite() || !request.weight_lex.is_finite() {
        return Err(SearchError::InvalidRequest(
            "weights must be finite".to_string(),
        ));
    }
    if let RetrievalVariant::Precise { min_cos_sim } = request.variant {
        if !min_cos_sim.is_finite() {
            return Err(SearchError::InvalidRequest(
                "min_cos_sim must be finite".to_string(),
            ));
        }
    }
    Ok(())
}

pub struct SearchCoordinator<S: ChunkStore> {
    partitions: PartitionRegistry<S>,
    reranker: Option<Arc<dyn Reranker>>,
    metrics: Option<Arc<RetrievalMetrics>>,
}

impl<S: ChunkStore> SearchCoordinator<S> {
    pub fn new(partitions: PartitionRegistry<S>) -> Self {
        Self {
            partitions,
            reranker: None,
            metrics: None,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RetrievalMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn partitions(&self) -> &PartitionRegistry<S> {
        &self.partitions
    }

    pub async fn search(&self, request: &QueryRequest) -> Result<ResultSet, SearchError> {
        let started = Instant::now();
        let outcome = self.run(request).await;
        self.record(started, &outcome);
        outcome
    }

    /// Embeds `text` for `profile` and searches with `settings`.
    ///
    /// The partition is resolved before the embedder is called.
    pub async fn search_text(
        &self,
        embedder: &dyn Embedder,
        profile: &EmbeddingProfile,
        text: &str,
        settings: &RetrievalSettings,
    ) -> Result<ResultSet, SearchError> {
        let started = Instant::now();
        if let Err(error) = self.partitions.route(profile.dimension) {
            let outcome = Err(error);
            self.record(started, &outcome);
            return outcome;
        }

        let embedding = match embed_normalized(embedder, text, profile.dimension).await {
            Ok(embedding) => embedding,
            Err(error) => {
                let outcome = Err(error);
                self.record(started, &outcome);
                return outcome;
            }
        };
        let request = QueryRequest::from_settings(embedding, settings).with_text(text);
        self.search(&request).await
    }

    fn record(&self, started: Instant, outcome: &Result<ResultSet, SearchError>) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        match outcome {
            Ok(results) => metrics.record_success(results.len(), results.reranked, started.elapsed()),
            Err(error) => metrics.record_failure(
                matches!(error, SearchError::UnsupportedDimension { .. }),
                started.elapsed(),
            ),
        }
    }

    async fn run(&self, request: &QueryRequest) -> Result<ResultSet, SearchError> {
        validate(request)?;

        let dimension = request.embedding.len();
        let store = self.partitions.route(dimension)?;
        let metric = store.metric();
        let pool_size = request.pool_size();

        let mut pool = store
            .knn_query(&request.embedding, pool_size, &request.filter)
            .await?;
        pool.truncate(pool_size);
        let fetched = pool.len();

        if let RetrievalVariant::Precise { min_cos_sim } = request.variant {
            pool.retain(|hit| metric.cosine_similarity(hit.distance) >= min_cos_sim);
        }

        let lexical = self.lexical_stage(store, request, &pool).await?;

        let candidates = pool
            .into_iter()
            .zip(lexical)
            .map(|(hit, lexical_rank)| {
                let similarity = metric.similarity(hit.distance);
                let score =
                    combine_score(similarity, lexical_rank, request.weight_vec, request.weight_lex);
                let parent = hit.parent();
                ScoredCandidate {
                    chunk_id: hit.id,
                    content: hit.content,
                    metadata: hit.metadata,
                    parent,
                    similarity,
                    lexical_rank,
                    score,
                    rerank_score: None,
                }
            })
            .collect::<Vec<_>>();

        let candidates = match request.variant {
            RetrievalVariant::Hybrid => select_parent_group(candidates),
            RetrievalVariant::Precise { .. } => candidates,
        };

        let mut hits = candidates
            .into_iter()
            .filter(|candidate| candidate.score >= request.min_score)
            .collect::<Vec<_>>();
        hits.sort_by(by_score_then_id);
        hits.truncate(request.match_count);

        debug!(
            dimension,
            pool = pool_size,
            fetched,
            returned = hits.len(),
            "scored candidate pool"
        );

        let results = ResultSet {
            dimension,
            pool_size,
            reranked: false,
            hits,
        };

        match (&self.reranker, request.query_text()) {
            (Some(reranker), Some(text)) => {
                let results = rerank(reranker.as_ref(), text, results).await?;
                info!(returned = results.len(), "reranked results");
                Ok(results)
            }
            _ => Ok(results),
        }
    }

    async fn lexical_stage(
        &self,
        store: &S,
        request: &QueryRequest,
        pool: &[KnnHit],
    ) -> Result<Vec<f64>, SearchError> {
        let Some(text) = request.query_text() else {
            return Ok(vec![0.0; pool.len()]);
        };
        if pool.is_empty() {
            return Ok(Vec::new());
        }

        let ranks = match LexicalQuery::parse(text) {
            Some(query) => {
                let handles = pool.iter().map(|hit| hit.handle.clone()).collect::<Vec<_>>();
                store.lexical_ranks(&handles, &query).await?
            }
            None => vec![0.0; pool.len()],
        };

        if ranks.len() != pool.len() {
            return Err(SearchError::storage(
                "lexical",
                format!("expected {} ranks, got {}", pool.len(), ranks.len()),
            ));
        }

        Ok(pool
            .iter()
            .zip(ranks)
            .map(|(hit, rank)| lexical_score(rank, text, &hit.content))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::Chunk;
    use crate::store::{DistanceMetric, LexicalHandle, MetadataFilter, PARENT_KEY};
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[derive(Default)]
    struct FakeStore {
        dimension: usize,
        hits: Vec<KnnHit>,
        ranks: HashMap<String, f64>,
        knn_calls: Arc<AtomicUsize>,
        requested_k: Arc<AtomicUsize>,
    }

    impl FakeStore {
        fn new(dimension: usize, hits: Vec<KnnHit>) -> Self {
            Self {
                dimension,
                hits,
                ..Self::default()
            }
        }

        fn with_rank(mut self, id: &str, rank: f64) -> Self {
            self.ranks.insert(id.to_string(), rank);
            self
        }
    }

    #[async_trait]
    impl ChunkStore for FakeStore {
        fn dimension(&self) -> usize {
            self.dimension
        }

        fn metric(&self) -> DistanceMetric {
            DistanceMetric::Cosine
        }

        async fn put(&self, _chunk: &Chunk, _embedding: &[f32]) -> Result<(), SearchError> {
            Ok(())
        }

        async fn replace_document(
            &self,
            _parent: &str,
            _chunks: &[Chunk],
            _embeddings: &[Vec<f32>],
        ) -> Result<(), SearchError> {
            Ok(())
        }

        async fn knn_query(
            &self,
            _embedding: &[f32],
            k: usize,
            _filter: &MetadataFilter,
        ) -> Result<Vec<KnnHit>, SearchError> {
            self.knn_calls.fetch_add(1, AtomicOrdering::SeqCst);
            self.requested_k.store(k, AtomicOrdering::SeqCst);
            // Ignores `k` on purpose to exercise the coordinator's bound.
            Ok(self.hits.clone())
        }

        async fn lexical_rank(
            &self,
            handle: &LexicalHandle,
            _query: &LexicalQuery,
        ) -> Result<f64, SearchError> {
            Ok(self.ranks.get(&handle.0).copied().unwrap_or(0.0))
        }
    }

    struct FirstByte;

    #[async_trait]
    impl Reranker for FirstByte {
        async fn score(&self, _query: &str, candidate: &str) -> Result<f64, SearchError> {
            Ok(candidate.bytes().next().map(f64::from).unwrap_or(0.0))
        }
    }

    fn hit(id: &str, parent: &str, content: &str, distance: f64) -> KnnHit {
        let mut metadata = Map::new();
        metadata.insert(PARENT_KEY.to_string(), Value::from(parent));
        KnnHit {
            id: id.to_string(),
            content: content.to_string(),
            metadata,
            distance,
            handle: LexicalHandle(id.to_string()),
        }
    }

    fn coordinator(store: FakeStore) -> SearchCoordinator<FakeStore> {
        SearchCoordinator::new(PartitionRegistry::new().register(store))
    }

    fn request(match_count: usize) -> QueryRequest {
        let mut request = QueryRequest::new(vec![0.1; 4]);
        request.match_count = match_count;
        request
    }

    #[test]
    fn scenario_d_weighted_blend() {
        let score = combine_score(0.9, 0.5, 0.6, 0.4);
        assert!((score - 0.74).abs() < 1e-12);
    }

    #[test]
    fn zero_lexical_rank_scores_similarity_exactly() {
        assert_eq!(combine_score(0.8312, 0.0, 0.6, 0.4), 0.8312);
    }

    #[tokio::test]
    async fn scenario_e_precise_floor_excludes_before_scoring() -> Result<(), SearchError> {
        let store = FakeStore::new(
            4,
            vec![
                hit("low", "doc-1", "pump seal", 0.25),
                hit("high", "doc-1", "pump seal", 0.1),
            ],
        )
        .with_rank("low", 0.99);
        let coordinator = coordinator(store);

        let mut request = request(5)
            .with_text("seal")
            .with_variant(RetrievalVariant::Precise { min_cos_sim: 0.8 });
        request.min_score = 0.5;

        let results = coordinator.search(&request).await?;

        assert_eq!(results.len(), 1);
        assert_eq!(results.hits[0].chunk_id, "high");
        for candidate in &results.hits {
            assert!(candidate.similarity >= 0.8);
            assert!(candidate.score >= request.min_score);
        }
        Ok(())
    }

    #[tokio::test]
    async fn scenario_f_unsupported_dimension_fetches_no_pool() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = PartitionRegistry::new();
        for dimension in [384, 768, 1024, 1536] {
            let mut store = FakeStore::new(dimension, vec![hit("a", "doc-1", "pump", 0.1)]);
            store.knn_calls = Arc::clone(&calls);
            registry = registry.register(store);
        }
        let metrics = Arc::new(RetrievalMetrics::new());
        let coordinator = SearchCoordinator::new(registry).with_metrics(Arc::clone(&metrics));

        let result = coordinator.search(&QueryRequest::new(vec![0.0; 512])).await;

        match result {
            Err(SearchError::UnsupportedDimension {
                dimension,
                supported,
            }) => {
                assert_eq!(dimension, 512);
                assert_eq!(supported, vec![384, 768, 1024, 1536]);
            }
            other => panic!("expected UnsupportedDimension, got {other:?}"),
        }
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(metrics.snapshot().unsupported_dimension_total, 1);
    }

    #[tokio::test]
    async fn pool_never_exceeds_match_count_times_multiplier() -> Result<(), SearchError> {
        let hits = (0..10)
            .map(|index| hit(&format!("c{index}"), "doc-1", "pump", 0.01 * index as f64))
            .collect();
        let store = FakeStore::new(4, hits);
        let requested = Arc::clone(&store.requested_k);
        let coordinator = coordinator(store);

        let mut request = request(2);
        request.pool_multiplier = 3;
        let results = coordinator.search(&request).await?;

        assert_eq!(requested.load(AtomicOrdering::SeqCst), 6);
        assert_eq!(results.pool_size, 6);
        assert_eq!(results.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn hybrid_results_share_the_top_candidates_parent() -> Result<(), SearchError> {
        let store = FakeStore::new(
            4,
            vec![
                hit("a1", "doc-a", "pump", 0.2),
                hit("b1", "doc-b", "pump", 0.1),
                hit("a2", "doc-a", "pump", 0.15),
                hit("b2", "doc-b", "pump", 0.4),
            ],
        );
        let results = coordinator(store).search(&request(5)).await?;

        let ids = results
            .hits
            .iter()
            .map(|hit| hit.chunk_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["b1", "b2"]);
        assert!(results.hits.iter().all(|hit| hit.parent == "doc-b"));
        Ok(())
    }

    #[tokio::test]
    async fn lexical_match_can_change_the_winning_parent() -> Result<(), SearchError> {
        let store = FakeStore::new(
            4,
            vec![
                hit("a1", "doc-a", "pump housing", 0.2),
                hit("b1", "doc-b", "seal kit", 0.25),
            ],
        )
        .with_rank("b1", 0.95);
        let results = coordinator(store)
            .search(&request(5).with_text("seal"))
            .await?;

        // b1: 0.7 * 0.75 + 0.3 * 0.95 = 0.81 beats a1's bare similarity of 0.8.
        assert_eq!(results.len(), 1);
        assert_eq!(results.hits[0].chunk_id, "b1");
        assert!((results.hits[0].score - 0.81).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn parent_tie_goes_to_smallest_id() {
        let candidate = |id: &str, parent: &str, score: f64| ScoredCandidate {
            chunk_id: id.to_string(),
            content: String::new(),
            metadata: Map::new(),
            parent: parent.to_string(),
            similarity: score,
            lexical_rank: 0.0,
            score,
            rerank_score: None,
        };

        let selected = select_parent_group(vec![
            candidate("x", "doc-b", 0.9),
            candidate("y", "doc-a", 0.9),
            candidate("z", "doc-a", 0.3),
        ]);

        assert_eq!(selected.len(), 2);
        assert!(selected.iter().all(|hit| hit.parent == "doc-a"));
    }

    #[tokio::test]
    async fn substring_fallback_feeds_the_blend() -> Result<(), SearchError> {
        let store = FakeStore::new(4, vec![hit("a", "doc-1", "Replace gasket G-17/B now", 0.2)]);
        let results = coordinator(store)
            .search(&request(5).with_text("G-17/B"))
            .await?;

        let top = &results.hits[0];
        assert_eq!(top.lexical_rank, 1.0);
        assert!((top.score - (0.7 * 0.8 + 0.3 * 1.0)).abs() < 1e-12);
        Ok(())
    }

    #[tokio::test]
    async fn min_score_filters_and_ties_order_by_id() -> Result<(), SearchError> {
        let store = FakeStore::new(
            4,
            vec![
                hit("b", "doc-1", "pump", 0.1),
                hit("a", "doc-1", "pump", 0.1),
                hit("c", "doc-1", "pump", 0.6),
            ],
        );
        let mut request = request(5);
        request.min_score = 0.5;
        let results = coordinator(store).search(&request).await?;

        let ids = results
            .hits
            .iter()
            .map(|hit| hit.chunk_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b"]);
        Ok(())
    }

    #[tokio::test]
    async fn empty_pool_is_an_empty_result() -> Result<(), SearchError> {
        let results = coordinator(FakeStore::new(4, Vec::new()))
            .search(&request(5).with_text("pump"))
            .await?;
        assert!(results.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn zero_match_count_is_rejected() {
        let result = coordinator(FakeStore::new(4, Vec::new()))
            .search(&request(0))
            .await;
        assert!(matches!(result, Err(SearchError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn reranker_runs_only_with_query_text() -> Result<(), SearchError> {
        let hits = vec![
            hit("a", "doc-1", "alpha", 0.1),
            hit("b", "doc-1", "bravo", 0.2),
        ];
        let reranked = coordinator(FakeStore::new(4, hits.clone()))
            .with_reranker(Arc::new(FirstByte))
            .search(&request(5).with_text("anything"))
            .await?;
        assert!(reranked.reranked);
        assert_eq!(reranked.hits[0].chunk_id, "b");
        assert_eq!(reranked.len(), 2);

        let untouched = coordinator(FakeStore::new(4, hits))
            .with_reranker(Arc::new(FirstByte))
            .search(&request(5))
            .await?;
        assert!(!untouched.reranked);
        assert_eq!(untouched.hits[0].chunk_id, "a");
        Ok(())
    }

    #[tokio::test]
    async fn search_text_routes_before_embedding() -> Result<(), SearchError> {
        let store = FakeStore::new(384, vec![hit("a", "doc-1", "relief valve", 0.1)]);
        let coordinator = coordinator(store);
        let embedder = CharacterNgramEmbedder::default();
        let settings = RetrievalSettings::default();

        let profile = EmbeddingProfile {
            model: "char-ngram".to_string(),
            dimension: 384,
        };
        let results = coordinator
            .search_text(&embedder, &profile, "relief valve", &settings)
            .await?;
        assert_eq!(results.dimension, 384);
        assert_eq!(results.len(), 1);

        let unsupported = EmbeddingProfile {
            model: "char-ngram".to_string(),
            dimension: 512,
        };
        let result = coordinator
            .search_text(&embedder, &unsupported, "relief valve", &settings)
            .await;
        assert!(matches!(
            result,
            Err(SearchError::UnsupportedDimension { dimension: 512, .. })
        ));
        Ok(())
    }

    struct Offline;

    #[async_trait]
    impl Embedder for Offline {
        fn model_id(&self) -> &str {
            "offline"
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, SearchError> {
            Err(SearchError::Embedder {
                model: "offline".to_string(),
                details: "connection refused".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn embedder_failures_are_counted() {
        let store = FakeStore::new(384, vec![hit("a", "doc-1", "relief valve", 0.1)]);
        let calls = Arc::clone(&store.knn_calls);
        let metrics = Arc::new(RetrievalMetrics::new());
        let coordinator = coordinator(store).with_metrics(Arc::clone(&metrics));
        let profile = EmbeddingProfile {
            model: "offline".to_string(),
            dimension: 384,
        };

        let result = coordinator
            .search_text(&Offline, &profile, "relief valve", &RetrievalSettings::default())
            .await;

        assert!(matches!(result, Err(SearchError::Embedder { .. })));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 0);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.failed_queries_total, 1);
        assert_eq!(snapshot.unsupported_dimension_total, 0);
        assert_eq!(snapshot.queries_total, 1);
        assert_eq!(snapshot.results_total, 0);
    }
}
