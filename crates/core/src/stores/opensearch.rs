//! OpenSearch k-NN partition. One index per embedding dimension, named
//! `{prefix}_{dimension}`.

use crate::error::SearchError;
use crate::lexical::LexicalQuery;
use crate::models::Chunk;
use crate::store::{DistanceMetric, KnnHit, LexicalHandle, MetadataFilter};
use crate::traits::ChunkStore;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

const BACKEND: &str = "opensearch";

fn transport(error: reqwest::Error) -> SearchError {
    SearchError::storage(BACKEND, error.to_string())
}

pub struct OpenSearchStore {
    client: Client,
    endpoint: String,
    index_name: String,
    dimension: usize,
    metric: DistanceMetric,
}

impl OpenSearchStore {
    pub fn new(
        endpoint: impl Into<String>,
        index_prefix: &str,
        dimension: usize,
        metric: DistanceMetric,
        timeout: Duration,
    ) -> Result<Self, SearchError> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        url::Url::parse(&endpoint)?;

        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            endpoint,
            index_name: format!("{index_prefix}_{dimension}"),
            dimension,
            metric,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.index_name, path)
    }

    pub async fn ensure_index(&self) -> Result<(), SearchError> {
        let response = self
            .client
            .head(format!("{}/{}", self.endpoint, self.index_name))
            .send()
            .await
            .map_err(transport)?;

        if response.status() == StatusCode::OK {
            return Ok(());
        }

        if !response.status().is_client_error() {
            return Err(SearchError::storage(BACKEND, response.status().to_string()));
        }

        let response = self
            .client
            .put(format!("{}/{}", self.endpoint, self.index_name))
            .json(&index_definition(self.dimension, self.metric))
            .send()
            .await
            .map_err(transport)?;
        checked(response, "index setup").await?;

        debug!(index = %self.index_name, "created k-NN index");
        Ok(())
    }

    async fn bulk_index(&self, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<(), SearchError> {
        if chunks.is_empty() {
            return Ok(());
        }

        let mut lines = Vec::with_capacity(chunks.len() * 2);
        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            lines.push(serde_json::to_string(&json!({
                "index": {
                    "_index": self.index_name,
                    "_id": chunk.chunk_id,
                }
            }))?);
            lines.push(serde_json::to_string(&chunk_document(chunk, embedding))?);
        }
        let payload = lines.join("\n") + "\n";

        let response = self
            .client
            .post(format!("{}/_bulk?refresh=true", self.endpoint))
            .header("Content-Type", "application/x-ndjson")
            .body(payload)
            .send()
            .await
            .map_err(transport)?;

        let body = checked(response, "bulk index").await?;
        if body.get("errors").and_then(Value::as_bool).unwrap_or(false) {
            return Err(SearchError::storage(
                BACKEND,
                "bulk index reported item errors",
            ));
        }
        Ok(())
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<(), SearchError> {
        if embedding.len() == self.dimension {
            return Ok(());
        }
        Err(SearchError::storage(
            BACKEND,
            format!(
                "embedding has {} components, index {} holds {}",
                embedding.len(),
                self.index_name,
                self.dimension
            ),
        ))
    }
}

async fn checked(response: Response, action: &str) -> Result<Value, SearchError> {
    let status = response.status();
    if !status.is_success() {
        let details = response.text().await.unwrap_or_default();
        return Err(SearchError::storage(
            BACKEND,
            format!("{action} failed with {status}: {details}"),
        ));
    }
    response.json().await.map_err(transport)
}

fn index_definition(dimension: usize, metric: DistanceMetric) -> Value {
    let space_type = match metric {
        DistanceMetric::Cosine => "cosinesimil",
        DistanceMetric::L2 => "l2",
    };

    json!({
        "settings": {
            "index": { "knn": true },
            "number_of_shards": 1,
            "number_of_replicas": 0
        },
        "mappings": {
            "dynamic_templates": [{
                "metadata_strings": {
                    "path_match": "metadata.*",
                    "match_mapping_type": "string",
                    "mapping": { "type": "keyword" }
                }
            }],
            "properties": {
                "content": { "type": "text", "analyzer": "standard" },
                "parent": { "type": "keyword" },
                "section_id": { "type": "keyword" },
                "chunk_index": { "type": "long" },
                "token_count": { "type": "integer" },
                "oversized": { "type": "boolean" },
                "metadata": { "type": "object" },
                "embedding": {
                    "type": "knn_vector",
                    "dimension": dimension,
                    "method": {
                        "name": "hnsw",
                        "engine": "lucene",
                        "space_type": space_type
                    }
                }
            }
        }
    })
}

fn chunk_document(chunk: &Chunk, embedding: &[f32]) -> Value {
    json!({
        "content": chunk.text,
        "parent": chunk.parent,
        "section_id": chunk.section_id,
        "chunk_index": chunk.chunk_index,
        "token_count": chunk.token_count,
        "oversized": chunk.oversized,
        "metadata": chunk.metadata,
        "embedding": embedding,
    })
}

/// Term predicates on `metadata.*` equivalent to `MetadataFilter` containment.
fn build_filters(filter: &MetadataFilter) -> Vec<Value> {
    let mut predicates = Vec::new();
    for (key, value) in filter.entries() {
        push_predicates(&format!("metadata.{key}"), value, &mut predicates);
    }
    predicates
}

fn push_predicates(field: &str, value: &Value, predicates: &mut Vec<Value>) {
    match value {
        Value::Object(entries) => {
            for (key, inner) in entries {
                push_predicates(&format!("{field}.{key}"), inner, predicates);
            }
        }
        Value::Array(values) => {
            for inner in values {
                push_predicates(field, inner, predicates);
            }
        }
        Value::Null => predicates.push(json!({ "bool": { "must_not": { "exists": { "field": field } } } })),
        scalar => predicates.push(json!({ "term": { field: scalar } })),
    }
}

/// Chunks of `parent` other than the ones just written.
fn stale_chunks_query(parent: &str, kept: &[Chunk]) -> Value {
    let ids = kept.iter().map(|chunk| chunk.chunk_id.as_str()).collect::<Vec<_>>();
    json!({
        "query": {
            "bool": {
                "filter": [{ "term": { "parent": parent } }],
                "must_not": [{ "ids": { "values": ids } }]
            }
        }
    })
}

fn knn_body(embedding: &[f32], k: usize, filter: &MetadataFilter) -> Value {
    let mut knn = json!({ "vector": embedding, "k": k });
    let predicates = build_filters(filter);
    if !predicates.is_empty() {
        knn["filter"] = json!({ "bool": { "filter": predicates } });
    }

    json!({
        "size": k,
        "_source": ["content", "metadata", "parent"],
        "query": { "knn": { "embedding": knn } }
    })
}

fn lexical_body(handles: &[LexicalHandle], query: &LexicalQuery) -> Value {
    let ids = handles.iter().map(|handle| handle.0.as_str()).collect::<Vec<_>>();
    let text = query.terms().join(" ");
    let matcher = match query {
        LexicalQuery::Phrase(_) => json!({ "match_phrase": { "content": text } }),
        LexicalQuery::Terms(_) => {
            json!({ "match": { "content": { "query": text, "operator": "or" } } })
        }
    };

    json!({
        "size": handles.len(),
        "_source": false,
        "query": {
            "bool": {
                "filter": [{ "ids": { "values": ids } }],
                "must": [matcher]
            }
        }
    })
}

/// Inverts the lucene score transforms: cosine `(1 + cos) / 2`,
/// l2 `1 / (1 + d²)`.
fn score_to_distance(metric: DistanceMetric, score: f64) -> f64 {
    match metric {
        DistanceMetric::Cosine => 2.0 - 2.0 * score,
        DistanceMetric::L2 if score > 0.0 => (1.0 / score - 1.0).max(0.0).sqrt(),
        DistanceMetric::L2 => f64::INFINITY,
    }
}

/// BM25 scores are unbounded; `s / (s + 1)` keeps them in `[0, 1)`.
fn normalize_bm25(score: f64) -> f64 {
    if score <= 0.0 {
        0.0
    } else {
        score / (score + 1.0)
    }
}

fn hits_of(body: &Value) -> &[Value] {
    body.pointer("/hits/hits")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn parse_knn_hits(metric: DistanceMetric, body: &Value) -> Vec<KnnHit> {
    hits_of(body)
        .iter()
        .filter_map(|raw| {
            let id = raw.get("_id").and_then(Value::as_str)?.to_string();
            let score = raw.get("_score").and_then(Value::as_f64).unwrap_or(0.0);
            let source = raw.get("_source").cloned().unwrap_or(Value::Null);
            let content = source
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let metadata = match source.get("metadata") {
                Some(Value::Object(metadata)) => metadata.clone(),
                _ => Map::new(),
            };

            Some(KnnHit {
                handle: LexicalHandle(id.clone()),
                id,
                content,
                metadata,
                distance: score_to_distance(metric, score),
            })
        })
        .collect()
}

fn parse_scores(body: &Value) -> HashMap<String, f64> {
    hits_of(body)
        .iter()
        .filter_map(|raw| {
            let id = raw.get("_id").and_then(Value::as_str)?;
            let score = raw.get("_score").and_then(Value::as_f64).unwrap_or(0.0);
            Some((id.to_string(), normalize_bm25(score)))
        })
        .collect()
}

#[async_trait]
impl ChunkStore for OpenSearchStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    async fn put(&self, chunk: &Chunk, embedding: &[f32]) -> Result<(), SearchError> {
        self.check_dimension(embedding)?;
        let response = self
            .client
            .put(self.url(&format!("_doc/{}?refresh=true", chunk.chunk_id)))
            .json(&chunk_document(chunk, embedding))
            .send()
            .await
            .map_err(transport)?;
        checked(response, "index chunk").await?;
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
                format!("{} chunks but {} embeddings", chunks.len(), embeddings.len()),
            ));
        }
        for embedding in embeddings {
            self.check_dimension(embedding)?;
        }

        // new chunks land before stale ones go, so a failed write keeps the old set
        if let Err(error) = self.bulk_index(chunks, embeddings).await {
            warn!(document_id = %parent, %error, "re-index failed, previous chunks kept");
            return Err(error);
        }

        let response = self
            .client
            .post(self.url("_delete_by_query?refresh=true"))
            .json(&stale_chunks_query(parent, chunks))
            .send()
            .await
            .map_err(transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if let Err(error) = checked(response, "delete stale chunks").await {
            warn!(document_id = %parent, %error, "stale chunks remain after re-index");
            return Err(error);
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
        if k == 0 {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(self.url("_search"))
            .json(&knn_body(embedding, k, filter))
            .send()
            .await
            .map_err(transport)?;
        let body = checked(response, "knn query").await?;

        let mut hits = parse_knn_hits(self.metric, &body);
        hits.truncate(k);
        Ok(hits)
    }

    async fn lexical_rank(
        &self,
        handle: &LexicalHandle,
        query: &LexicalQuery,
    ) -> Result<f64, SearchError> {
        let ranks = self.lexical_ranks(std::slice::from_ref(handle), query).await?;
        Ok(ranks.first().copied().unwrap_or(0.0))
    }

    async fn lexical_ranks(
        &self,
        handles: &[LexicalHandle],
        query: &LexicalQuery,
    ) -> Result<Vec<f64>, SearchError> {
        if handles.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(self.url("_search"))
            .json(&lexical_body(handles, query))
            .send()
            .await
            .map_err(transport)?;
        let scores = parse_scores(&checked(response, "lexical query").await?);

        Ok(handles
            .iter()
            .map(|handle| scores.get(&handle.0).copied().unwrap_or(0.0))
            .collect())
    }
}
