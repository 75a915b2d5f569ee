//! Layered engine configuration.
//!
//! Built-in defaults, then an optional TOML file, then `DOCRANK_*`
//! environment variables, where `__` separates sections:
//! `DOCRANK_RETRIEVAL__MATCH_COUNT=8` sets `retrieval.match_count`.

use crate::chunking::{
    ChunkingConfig, DEFAULT_HARD_CHAR_LIMIT, DEFAULT_MAX_TOKENS, DEFAULT_OVERLAP_RATIO,
    DEFAULT_SEPARATORS,
};
use crate::embeddings::{EmbeddingProfile, CHARACTER_NGRAM_MODEL};
use crate::error::ConfigError;
use crate::extractor::{ExtractionStrategy, OcrEndpointConfig, DEFAULT_OCR_THRESHOLD};
use crate::models::{QueryRequest, RetrievalVariant};
use crate::segment::{SegmentOptions, DEFAULT_HEADING_PATTERN, DEFAULT_MIN_PARAGRAPH_CHARS};
use crate::store::{DistanceMetric, MetadataFilter};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "DOCRANK_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub chunking: ChunkingOptions,
    pub retrieval: RetrievalSettings,
    pub embedding: EmbeddingSettings,
    pub storage: StorageSettings,
    pub ingest: IngestSettings,
}

impl EngineConfig {
    /// Loads and validates the configuration. A given `path` must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigError::Invalid(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chunking
            .chunking_config()
            .validate()
            .map_err(|error| ConfigError::Invalid(error.to_string()))?;
        if let Some(overlap) = self.chunking.chunk_overlap {
            if overlap >= self.chunking.max_tokens {
                return Err(ConfigError::Invalid(format!(
                    "chunk_overlap {overlap} must be below max_tokens {}",
                    self.chunking.max_tokens
                )));
            }
        }

        let retrieval = &self.retrieval;
        if retrieval.match_count == 0 {
            return Err(ConfigError::Invalid("retrieval.match_count must be positive".into()));
        }
        if retrieval.pool_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "retrieval.pool_multiplier must be positive".into(),
            ));
        }

        if self.embedding.models.is_empty() {
            return Err(ConfigError::Invalid("embedding.models is empty".into()));
        }
        for (model, dimension) in &self.embedding.models {
            if !self.storage.dimensions.contains(dimension) {
                return Err(ConfigError::Invalid(format!(
                    "model {model} targets dimension {dimension}, not one of storage.dimensions {:?}",
                    self.storage.dimensions
                )));
            }
        }
        self.profile(None)?;

        if self.ingest.workers == 0 {
            return Err(ConfigError::Invalid("ingest.workers must be positive".into()));
        }
        Ok(())
    }

    /// Target dimension for `model`, or for the default model.
    pub fn profile(&self, model: Option<&str>) -> Result<EmbeddingProfile, ConfigError> {
        let model = model.unwrap_or(&self.embedding.default_model);
        let dimension = self
            .embedding
            .models
            .get(model)
            .copied()
            .ok_or_else(|| ConfigError::UnknownModel(model.to_string()))?;
        Ok(EmbeddingProfile {
            model: model.to_string(),
            dimension,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingOptions {
    pub max_tokens: usize,
    /// Legacy overlap in tokens; ignored when a ratio is set.
    pub chunk_overlap: Option<usize>,
    pub sliding_window_overlap_ratio: Option<f32>,
    pub min_paragraph_chars: usize,
    pub hard_char_limit: usize,
    pub separators: Vec<String>,
    pub heading_pattern: String,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            chunk_overlap: None,
            sliding_window_overlap_ratio: None,
            min_paragraph_chars: DEFAULT_MIN_PARAGRAPH_CHARS,
            hard_char_limit: DEFAULT_HARD_CHAR_LIMIT,
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
            heading_pattern: DEFAULT_HEADING_PATTERN.to_string(),
        }
    }
}

impl ChunkingOptions {
    pub fn overlap_ratio(&self) -> f32 {
        match (self.sliding_window_overlap_ratio, self.chunk_overlap) {
            (Some(ratio), _) => ratio,
            (None, Some(overlap)) if self.max_tokens > 0 => overlap as f32 / self.max_tokens as f32,
            _ => DEFAULT_OVERLAP_RATIO,
        }
    }

    pub fn chunking_config(&self) -> ChunkingConfig {
        ChunkingConfig {
            max_tokens: self.max_tokens,
            overlap_ratio: self.overlap_ratio(),
            hard_char_limit: self.hard_char_limit,
            separators: self.separators.clone(),
        }
    }

    pub fn segment_options(&self) -> SegmentOptions {
        SegmentOptions {
            min_paragraph_chars: self.min_paragraph_chars,
            heading_pattern: self.heading_pattern.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantKind {
    #[default]
    Hybrid,
    Precise,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub match_count: usize,
    pub weight_vec: f64,
    pub weight_lex: f64,
    pub min_score: f64,
    pub min_cos_sim: f64,
    pub pool_multiplier: usize,
    pub variant: VariantKind,
    pub filter: MetadataFilter,
    pub reranker_endpoint: Option<String>,
    pub reranker_timeout_secs: u64,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            match_count: 5,
            weight_vec: 0.7,
            weight_lex: 0.3,
            min_score: 0.0,
            min_cos_sim: 0.5,
            pool_multiplier: 4,
            variant: VariantKind::Hybrid,
            filter: MetadataFilter::default(),
            reranker_endpoint: None,
            reranker_timeout_secs: 30,
        }
    }
}

impl RetrievalSettings {
    pub fn variant(&self) -> RetrievalVariant {
        match self.variant {
            VariantKind::Hybrid => RetrievalVariant::Hybrid,
            VariantKind::Precise => RetrievalVariant::Precise {
                min_cos_sim: self.min_cos_sim,
            },
        }
    }
}

impl QueryRequest {
    pub fn from_settings(embedding: Vec<f32>, settings: &RetrievalSettings) -> Self {
        Self {
            embedding,
            text: None,
            match_count: settings.match_count,
            filter: settings.filter.clone(),
            weight_vec: settings.weight_vec,
            weight_lex: settings.weight_lex,
            min_score: settings.min_score,
            pool_multiplier: settings.pool_multiplier,
            variant: settings.variant(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub default_model: String,
    /// Embedding server base URL; the built-in n-gram model is used when unset.
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
    /// Model id to the target dimension its vectors are stored at.
    pub models: BTreeMap<String, usize>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            default_model: CHARACTER_NGRAM_MODEL.to_string(),
            endpoint: None,
            timeout_secs: 30,
            models: BTreeMap::from([(CHARACTER_NGRAM_MODEL.to_string(), 384)]),
        }
    }
}

impl EmbeddingSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// OpenSearch endpoint; an in-process store is used when unset.
    pub endpoint: Option<String>,
    pub index_prefix: String,
    pub dimensions: Vec<usize>,
    pub metric: DistanceMetric,
    pub timeout_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            index_prefix: "documents".to_string(),
            dimensions: vec![384, 768, 1024, 1536],
            metric: DistanceMetric::Cosine,
            timeout_secs: 30,
        }
    }
}

impl StorageSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub workers: usize,
    pub strategy: ExtractionStrategy,
    pub ocr_endpoint: Option<String>,
    pub ocr_api_key: Option<String>,
    pub ocr_threshold: usize,
    pub ocr_timeout_secs: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            strategy: ExtractionStrategy::Auto,
            ocr_endpoint: None,
            ocr_api_key: None,
            ocr_threshold: DEFAULT_OCR_THRESHOLD,
            ocr_timeout_secs: 120,
        }
    }
}

impl IngestSettings {
    /// `None` unless a non-blank OCR endpoint is configured.
    pub fn ocr(&self) -> Option<OcrEndpointConfig> {
        let endpoint = self.ocr_endpoint.as_deref().map(str::trim)?;
        if endpoint.is_empty() {
            return None;
        }
        let api_key = self
            .ocr_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string);

        Some(OcrEndpointConfig {
            endpoint: endpoint.to_string(),
            api_key,
            threshold: self.ocr_threshold,
            timeout: Duration::from_secs(self.ocr_timeout_secs),
        })
    }
}
