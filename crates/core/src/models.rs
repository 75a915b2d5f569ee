use crate::store::MetadataFilter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFingerprint {
    pub document_id: String,
    pub document_title: String,
    pub source_path: String,
    pub author: Option<String>,
    pub kind: String,
    pub checksum: String,
    pub ingested_at: DateTime<Utc>,
}

/// A numbered section heading such as `4.2 Hydraulic limits`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heading {
    pub numbering: String,
    pub title: String,
    pub level: usize,
}

impl Heading {
    pub fn label(&self) -> String {
        format!("{} {}", self.numbering, self.title)
    }
}

/// A filtered paragraph of extracted text.
///
/// `index` is the paragraph's ordinal among all raw paragraphs of the source,
/// so filtered-out paragraphs leave gaps. `start`/`end` are byte offsets into
/// the extracted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paragraph {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub document_id: String,
    pub heading: Option<Heading>,
    pub heading_lines: usize,
    pub heading_path: Vec<String>,
    pub section: Option<String>,
}

impl Paragraph {
    /// The paragraph carries a heading and no body text.
    pub fn is_heading_only(&self) -> bool {
        self.heading.is_some()
            && self.text.lines().filter(|line| !line.trim().is_empty()).count()
                <= self.heading_lines
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChunkKind {
    Paragraphs,
    Heading,
    Window,
    Segment,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub parent: String,
    pub section_id: Option<String>,
    pub chunk_index: u64,
    pub text: String,
    pub token_count: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub overlap_ratio: Option<f32>,
    pub oversized: bool,
    pub kind: ChunkKind,
    pub metadata: Map<String, Value>,
}

/// A chunk that stayed above the limits after every splitting stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkOverflow {
    pub document_id: String,
    pub chunk_index: u64,
    pub token_count: usize,
    pub char_count: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum RetrievalVariant {
    /// Results restricted to the best-scoring parent group.
    Hybrid,
    /// Hard cosine-similarity floor applied to the pool before scoring.
    Precise { min_cos_sim: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryRequest {
    pub embedding: Vec<f32>,
    pub text: Option<String>,
    pub match_count: usize,
    pub filter: MetadataFilter,
    pub weight_vec: f64,
    pub weight_lex: f64,
    pub min_score: f64,
    pub pool_multiplier: usize,
    pub variant: RetrievalVariant,
}

impl QueryRequest {
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            embedding,
            text: None,
            match_count: 5,
            filter: MetadataFilter::default(),
            weight_vec: 0.7,
            weight_lex: 0.3,
            min_score: 0.0,
            pool_multiplier: 4,
            variant: RetrievalVariant::Hybrid,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_variant(mut self, variant: RetrievalVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Number of nearest neighbours requested from storage.
    pub fn pool_size(&self) -> usize {
        self.match_count.saturating_mul(self.pool_multiplier)
    }

    pub fn query_text(&self) -> Option<&str> {
        self.text.as_deref().filter(|text| !text.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredCandidate {
    pub chunk_id: String,
    pub content: String,
    pub metadata: Map<String, Value>,
    pub parent: String,
    pub similarity: f64,
    pub lexical_rank: f64,
    pub score: f64,
    pub rerank_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultSet {
    pub dimension: usize,
    pub pool_size: usize,
    pub reranked: bool,
    pub hits: Vec<ScoredCandidate>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}
