use crate::chunking::{ChunkAssembler, ChunkingReport};
use crate::config::ChunkingOptions;
use crate::embeddings::{embed_normalized, Embedder, EmbeddingProfile};
use crate::error::IngestError;
use crate::extractor::{DocumentKind, Extractor, SourceMetadata};
use crate::metrics::IngestMetrics;
use crate::models::{ChunkOverflow, DocumentFingerprint};
use crate::segment::Segmenter;
use crate::traits::ChunkStore;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Recursively lists the supported documents under `folder`, sorted.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files = WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| DocumentKind::from_path(entry.path()).is_some())
        .map(|entry| entry.path().to_path_buf())
        .collect::<Vec<_>>();

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn generate_document_id(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn build_document_fingerprint(
    path: &Path,
    metadata: &SourceMetadata,
) -> Result<DocumentFingerprint, IngestError> {
    let checksum = digest_file(path)?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?;

    Ok(DocumentFingerprint {
        document_id: generate_document_id(path),
        document_title: metadata.title.clone().unwrap_or_else(|| name.to_string()),
        source_path: path.to_string_lossy().to_string(),
        author: metadata.author.clone(),
        kind: metadata.kind.as_str().to_string(),
        checksum,
        ingested_at: Utc::now(),
    })
}

#[derive(Debug)]
pub struct ChunkedDocument {
    pub fingerprint: DocumentFingerprint,
    pub report: ChunkingReport,
}

/// Extraction, segmentation, heading annotation and chunk assembly for one
/// document. Blocking.
pub struct DocumentChunker {
    extractor: Box<dyn Extractor>,
    segmenter: Segmenter,
    assembler: ChunkAssembler,
}

impl DocumentChunker {
    pub fn new(extractor: Box<dyn Extractor>, options: &ChunkingOptions) -> Result<Self, IngestError> {
        Ok(Self {
            extractor,
            segmenter: Segmenter::new(&options.segment_options())?,
            assembler: ChunkAssembler::new(options.chunking_config())?,
        })
    }

    pub fn chunk_document(&self, path: &Path) -> Result<ChunkedDocument, IngestError> {
        let extracted = self.extractor.extract(path)?;
        let fingerprint = build_document_fingerprint(path, &extracted.metadata)?;
        let text = extracted.text.replace('\0', "");
        let report = self.chunk_text(&fingerprint, &text);

        Ok(ChunkedDocument {
            fingerprint,
            report,
        })
    }

    pub fn chunk_text(&self, fingerprint: &DocumentFingerprint, text: &str) -> ChunkingReport {
        let mut paragraphs = self.segmenter.segment(text, &fingerprint.document_id);
        self.segmenter.headings().annotate(&mut paragraphs);
        self.assembler.assemble(fingerprint, &paragraphs)
    }
}

#[derive(Debug, Clone)]
pub struct DocumentOutcome {
    pub path: PathBuf,
    pub document_id: String,
    pub chunks: usize,
    pub overflows: Vec<ChunkOverflow>,
}

#[derive(Debug, Clone)]
pub struct SkippedDocument {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct IngestionReport {
    pub documents: Vec<DocumentOutcome>,
    pub skipped: Vec<SkippedDocument>,
}

impl IngestionReport {
    pub fn chunk_count(&self) -> usize {
        self.documents.iter().map(|document| document.chunks).sum()
    }

    pub fn oversized_count(&self) -> usize {
        self.documents
            .iter()
            .map(|document| document.overflows.len())
            .sum()
    }
}

/// Index-time pipeline writing one document's chunks into one partition.
pub struct DocumentPipeline<S: ChunkStore> {
    chunker: DocumentChunker,
    embedder: Arc<dyn Embedder>,
    store: S,
    profile: EmbeddingProfile,
    metrics: Arc<IngestMetrics>,
}

impl<S: ChunkStore + 'static> DocumentPipeline<S> {
    pub fn new(
        chunker: DocumentChunker,
        embedder: Arc<dyn Embedder>,
        store: S,
        profile: EmbeddingProfile,
    ) -> Result<Self, IngestError> {
        if store.dimension() != profile.dimension {
            return Err(IngestError::InvalidArgument(format!(
                "model {} targets dimension {} but the partition holds {}",
                profile.model,
                profile.dimension,
                store.dimension()
            )));
        }
        Ok(Self {
            chunker,
            embedder,
            store,
            profile,
            metrics: Arc::new(IngestMetrics::new()),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<IngestMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &IngestMetrics {
        &self.metrics
    }

    /// Chunks, embeds and stores one document, replacing its previous chunks.
    pub async fn process_document(
        self: Arc<Self>,
        path: PathBuf,
    ) -> Result<DocumentOutcome, IngestError> {
        let worker = Arc::clone(&self);
        let source = path.clone();
        let chunked = tokio::task::spawn_blocking(move || worker.chunker.chunk_document(&source))
            .await
            .map_err(|error| IngestError::Worker(error.to_string()))??;

        let ChunkedDocument {
            fingerprint,
            report,
        } = chunked;

        let mut embeddings = Vec::with_capacity(report.chunks.len());
        for chunk in &report.chunks {
            embeddings.push(
                embed_normalized(self.embedder.as_ref(), &chunk.text, self.profile.dimension)
                    .await?,
            );
        }

        self.store
            .replace_document(&fingerprint.document_id, &report.chunks, &embeddings)
            .await?;

        self.metrics
            .record_document(report.chunks.len(), report.overflows.len());
        info!(
            path = %path.display(),
            document_id = %fingerprint.document_id,
            chunks = report.chunks.len(),
            oversized = report.overflows.len(),
            "indexed document"
        );

        Ok(DocumentOutcome {
            path,
            document_id: fingerprint.document_id,
            chunks: report.chunks.len(),
            overflows: report.overflows,
        })
    }
}

/// Ingests every supported document under `folder` with at most `workers`
/// documents in flight. A failing document is recorded and skipped.
pub async fn ingest_folder<S: ChunkStore + 'static>(
    pipeline: Arc<DocumentPipeline<S>>,
    folder: &Path,
    workers: usize,
) -> Result<IngestionReport, IngestError> {
    let files = discover_documents(folder);

    if files.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no supported documents found in {}",
            folder.display()
        )));
    }

    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();

    for path in files {
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .map_err(|error| IngestError::Worker(error.to_string()))?;
        let pipeline = Arc::clone(&pipeline);
        tasks.spawn(async move {
            let _permit = permit;
            let outcome = pipeline.process_document(path.clone()).await;
            (path, outcome)
        });
    }

    let mut report = IngestionReport::default();
    while let Some(joined) = tasks.join_next().await {
        let (path, outcome) = match joined {
            Ok(result) => result,
            Err(error) => {
                warn!(%error, "ingest task aborted");
                pipeline.metrics().record_skipped();
                report.skipped.push(SkippedDocument {
                    path: PathBuf::new(),
                    reason: error.to_string(),
                });
                continue;
            }
        };

        match outcome {
            Ok(document) => report.documents.push(document),
            Err(error) => {
                warn!(
                    path = %path.display(),
                    %error,
                    extraction = error.is_extraction_failure(),
                    "skipping document"
                );
                pipeline.metrics().record_skipped();
                report.skipped.push(SkippedDocument {
                    path,
                    reason: error.to_string(),
                });
            }
        }
    }

    report.documents.sort_by(|left, right| left.path.cmp(&right.path));
    report.skipped.sort_by(|left, right| left.path.cmp(&right.path));
    Ok(report)
}
