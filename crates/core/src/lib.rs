pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod lexical;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod rerank;
pub mod segment;
pub mod store;
pub mod stores;
pub mod traits;

pub use chunking::{ChunkAssembler, ChunkingConfig, ChunkingReport};
pub use config::{EngineConfig, RetrievalSettings, VariantKind};
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, EmbeddingProfile, HttpEmbedder, CHARACTER_NGRAM_MODEL,
};
pub use error::{ConfigError, IngestError, SearchError};
pub use extractor::{build_extractor, DocumentKind, ExtractionStrategy, Extractor};
pub use ingest::{ingest_folder, DocumentChunker, DocumentPipeline, IngestionReport};
pub use lexical::LexicalQuery;
pub use metrics::{IngestMetrics, RetrievalMetrics};
pub use models::{
    Chunk, ChunkKind, DocumentFingerprint, QueryRequest, ResultSet, RetrievalVariant,
    ScoredCandidate,
};
pub use orchestrator::SearchCoordinator;
pub use rerank::HttpReranker;
pub use store::{DistanceMetric, MetadataFilter, PartitionRegistry};
pub use stores::{MemoryStore, OpenSearchStore};
pub use traits::{ChunkStore, Reranker};
