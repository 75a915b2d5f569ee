use crate::error::SearchError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;
pub const CHARACTER_NGRAM_MODEL: &str = "char-ngram";

/// Produces vectors of the model's native length.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError>;
}

/// The model a collection is embedded with and the width `D` it is stored at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingProfile {
    pub model: String,
    pub dimension: usize,
}

/// Truncates or zero-pads `vector` to exactly `target` components.
pub fn normalize_dimension(mut vector: Vec<f32>, target: usize) -> Vec<f32> {
    vector.resize(target, 0.0);
    vector
}

pub async fn embed_normalized(
    embedder: &dyn Embedder,
    text: &str,
    dimension: usize,
) -> Result<Vec<f32>, SearchError> {
    let native = embedder.embed(text).await?;
    if native.len() != dimension {
        debug!(
            model = embedder.model_id(),
            native = native.len(),
            target = dimension,
            "normalizing embedding dimension"
        );
    }
    Ok(normalize_dimension(native, dimension))
}

#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn model_id(&self) -> &str {
        CHARACTER_NGRAM_MODEL
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        Ok(self.vectorize(text))
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Client for an embedding server speaking `POST /api/embeddings`
/// with `{"model", "input"}` and answering `{"embedding": [...]}`.
pub struct HttpEmbedder {
    client: Client,
    endpoint: Url,
    model: String,
}

impl HttpEmbedder {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SearchError> {
        let endpoint = Url::parse(base_url)?.join("api/embeddings")?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            model: model.into(),
        })
    }

    fn failure(&self, details: impl Into<String>) -> SearchError {
        SearchError::Embedder {
            model: self.model.clone(),
            details: details.into(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&EmbeddingRequest {
                model: &self.model,
                input: text,
            })
            .send()
            .await
            .map_err(|error| self.failure(error.to_string()))?;

        if !response.status().is_success() {
            return Err(self.failure(format!(
                "{} returned {}",
                self.endpoint,
                response.status()
            )));
        }

        let payload: EmbeddingResponse = response
            .json()
            .await
            .map_err(|error| self.failure(error.to_string()))?;

        if payload.embedding.is_empty() {
            return Err(self.failure("empty embedding in response"));
        }

        Ok(payload.embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.vectorize("Hydraulic pressure and flow");
        let second = embedder.vectorize("Hydraulic pressure and flow");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.vectorize("abc");
        assert_eq!(vector.len(), 32);
    }

    #[test]
    fn scenario_b_longer_vectors_are_truncated() {
        let native = (0..1536).map(|value| value as f32).collect::<Vec<_>>();
        let normalized = normalize_dimension(native.clone(), 384);

        assert_eq!(normalized.len(), 384);
        assert_eq!(normalized.as_slice(), &native[..384]);
    }

    #[test]
    fn scenario_c_shorter_vectors_are_zero_padded() {
        let native = (0..300).map(|value| value as f32 + 0.5).collect::<Vec<_>>();
        let normalized = normalize_dimension(native.clone(), 384);

        assert_eq!(normalized.len(), 384);
        assert_eq!(&normalized[..300], native.as_slice());
        assert!(normalized[300..].iter().all(|value| *value == 0.0));
        assert_eq!(normalized[300..].len(), 84);
    }

    #[test]
    fn matching_vectors_pass_through() {
        let native = vec![0.25f32, -1.0, 3.5];
        assert_eq!(normalize_dimension(native.clone(), 3), native);
    }

    #[tokio::test]
    async fn embed_normalized_pads_native_output() -> Result<(), SearchError> {
        let embedder = CharacterNgramEmbedder { dimensions: 128 };
        let vector = embed_normalized(&embedder, "relief valve", 384).await?;

        assert_eq!(vector.len(), 384);
        assert_eq!(&vector[..128], embedder.vectorize("relief valve").as_slice());
        Ok(())
    }

    #[test]
    fn http_embedder_rejects_invalid_base_url() {
        let result = HttpEmbedder::new("not a url", "minilm", Duration::from_secs(1));
        assert!(matches!(result, Err(SearchError::Url(_))));
    }
}
