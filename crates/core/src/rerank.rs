use crate::error::SearchError;
use crate::models::ResultSet;
use crate::traits::Reranker;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Reorders `results` by the reranker's scores, highest first.
///
/// Membership never changes. Equal scores keep their incoming order.
pub async fn rerank(
    reranker: &dyn Reranker,
    query: &str,
    mut results: ResultSet,
) -> Result<ResultSet, SearchError> {
    if results.is_empty() {
        return Ok(results);
    }

    let contents = results
        .hits
        .iter()
        .map(|hit| hit.content.as_str())
        .collect::<Vec<_>>();
    let scores = reranker.score_batch(query, &contents).await?;

    if scores.len() != results.hits.len() {
        return Err(SearchError::Reranker(format!(
            "expected {} scores, got {}",
            results.hits.len(),
            scores.len()
        )));
    }

    for (hit, score) in results.hits.iter_mut().zip(scores) {
        hit.rerank_score = Some(score);
    }

    let before = results
        .hits
        .first()
        .map(|hit| hit.chunk_id.clone())
        .unwrap_or_default();
    results.hits.sort_by(|left, right| {
        let left = left.rerank_score.unwrap_or(f64::NEG_INFINITY);
        let right = right.rerank_score.unwrap_or(f64::NEG_INFINITY);
        right.total_cmp(&left)
    });
    results.reranked = true;

    if let Some(top) = results.hits.first() {
        if top.chunk_id != before {
            debug!(previous = %before, current = %top.chunk_id, "reranker changed top result");
        }
    }

    Ok(results)
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    documents: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    scores: Vec<f64>,
}

/// Cross-encoder service taking `{"query", "documents"}` and answering
/// `{"scores": [...]}` in document order.
pub struct HttpReranker {
    client: Client,
    endpoint: Url,
}

impl HttpReranker {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, SearchError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            endpoint: Url::parse(endpoint)?,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn score(&self, query: &str, candidate: &str) -> Result<f64, SearchError> {
        let scores = self.score_batch(query, &[candidate]).await?;
        scores
            .first()
            .copied()
            .ok_or_else(|| SearchError::Reranker("empty score list".to_string()))
    }

    async fn score_batch(
        &self,
        query: &str,
        candidates: &[&str],
    ) -> Result<Vec<f64>, SearchError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&RerankRequest {
                query,
                documents: candidates,
            })
            .send()
            .await
            .map_err(|error| SearchError::Reranker(error.to_string()))?;

        if !response.status().is_success() {
            return Err(SearchError::Reranker(format!(
                "{} returned {}",
                self.endpoint,
                response.status()
            )));
        }

        let payload: RerankResponse = response
            .json()
            .await
            .map_err(|error| SearchError::Reranker(error.to_string()))?;
        Ok(payload.scores)
    }
}
