use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("extraction failed for {path}: {reason}")]
    Extraction { path: String, reason: String },

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("docx parse error: {0}")]
    Docx(String),

    #[error("unsupported document type: {0}")]
    UnsupportedDocument(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("multimodal OCR failed: {0}")]
    OcrFailed(String),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("ingest worker failed: {0}")]
    Worker(String),
}

impl IngestError {
    /// True for failures that only concern the document being read.
    pub fn is_extraction_failure(&self) -> bool {
        matches!(
            self,
            Self::Extraction { .. }
                | Self::PdfParse(_)
                | Self::Docx(_)
                | Self::OcrFailed(_)
                | Self::UnsupportedDocument(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("no storage partition for embedding dimension {dimension} (supported: {supported:?})")]
    UnsupportedDimension {
        dimension: usize,
        supported: Vec<usize>,
    },

    #[error("storage backend {backend} failed: {details}")]
    Storage { backend: String, details: String },

    #[error("embedder {model} failed: {details}")]
    Embedder { model: String, details: String },

    #[error("reranker failed: {0}")]
    Reranker(String),

    #[error("invalid query request: {0}")]
    InvalidRequest(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SearchError {
    pub(crate) fn storage(backend: &str, details: impl Into<String>) -> Self {
        Self::Storage {
            backend: backend.to_string(),
            details: details.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("unknown embedding model: {0}")]
    UnknownModel(String),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
