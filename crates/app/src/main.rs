use anyhow::{anyhow, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use docrank_core::config::VariantKind;
use docrank_core::embeddings::EmbeddingProfile;
use docrank_core::{
    build_extractor, ingest_folder, CharacterNgramEmbedder, ChunkStore, DocumentChunker,
    DocumentPipeline, Embedder, EngineConfig, ExtractionStrategy, HttpEmbedder, HttpReranker,
    IngestMetrics, MemoryStore, OpenSearchStore, PartitionRegistry, RetrievalMetrics,
    SearchCoordinator, CHARACTER_NGRAM_MODEL,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type Partitions = PartitionRegistry<Arc<dyn ChunkStore>>;

#[derive(Parser)]
#[command(name = "docrank", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file. `DOCRANK_*` variables override it.
    #[arg(long, env = "DOCRANK_CONFIG")]
    config: Option<PathBuf>,

    /// OpenSearch base URL; overrides `storage.endpoint`.
    #[arg(long)]
    opensearch_url: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Chunk, embed and index every supported document under a folder.
    Ingest {
        folder: PathBuf,
        /// Documents processed concurrently.
        #[arg(long)]
        workers: Option<usize>,
        /// auto, lopdf, ocr, docx or plain-text.
        #[arg(long)]
        strategy: Option<ExtractionStrategy>,
        /// Embedding model; selects the partition.
        #[arg(long)]
        model: Option<String>,
    },
    /// Print the chunks of one document as JSON without indexing them.
    Chunk {
        file: PathBuf,
        #[arg(long)]
        strategy: Option<ExtractionStrategy>,
    },
    /// Run a hybrid or precise query against the partition of a model.
    Search {
        query: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, value_enum)]
        variant: Option<Variant>,
        #[arg(long)]
        match_count: Option<usize>,
        #[arg(long)]
        min_score: Option<f64>,
        #[arg(long)]
        min_cos_sim: Option<f64>,
        /// Metadata containment filter, `key=value`. Values are parsed as
        /// JSON when possible.
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, Value)>,
        /// Print the full result set as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Print per-hit score components and retrieval counters.
        #[arg(long, default_value_t = false)]
        explain: bool,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Variant {
    Hybrid,
    Precise,
}

impl From<Variant> for VariantKind {
    fn from(variant: Variant) -> Self {
        match variant {
            Variant::Hybrid => VariantKind::Hybrid,
            Variant::Precise => VariantKind::Precise,
        }
    }
}

fn parse_filter(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty filter key in {raw}"));
    }
    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| Value::String(value.trim().to_string()));
    Ok((key.to_string(), value))
}

fn build_embedder(
    config: &EngineConfig,
    profile: &EmbeddingProfile,
) -> anyhow::Result<Arc<dyn Embedder>> {
    if profile.model == CHARACTER_NGRAM_MODEL {
        return Ok(Arc::new(CharacterNgramEmbedder::default()));
    }
    let endpoint = config
        .embedding
        .endpoint
        .as_deref()
        .ok_or_else(|| anyhow!("model {} requires embedding.endpoint", profile.model))?;
    Ok(Arc::new(HttpEmbedder::new(
        endpoint,
        profile.model.clone(),
        config.embedding.timeout(),
    )?))
}

async fn build_partitions(config: &EngineConfig) -> anyhow::Result<Partitions> {
    let storage = &config.storage;
    let mut partitions = Partitions::new();

    for &dimension in &storage.dimensions {
        let store: Arc<dyn ChunkStore> = match storage.endpoint.as_deref() {
            Some(endpoint) => {
                let store = OpenSearchStore::new(
                    endpoint,
                    &storage.index_prefix,
                    dimension,
                    storage.metric,
                    storage.timeout(),
                )?;
                store
                    .ensure_index()
                    .await
                    .with_context(|| format!("preparing index {}", store.index_name()))?;
                Arc::new(store)
            }
            None => Arc::new(MemoryStore::new(dimension, storage.metric)),
        };
        partitions = partitions.register(store);
    }

    if storage.endpoint.is_none() {
        warn!("no storage endpoint configured; chunks live only for this process");
    }
    Ok(partitions)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.opensearch_url {
        config.storage.endpoint = Some(url);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Utc::now().to_rfc3339(),
        "docrank boot"
    );

    match cli.command {
        Command::Ingest {
            folder,
            workers,
            strategy,
            model,
        } => {
            let profile = config.profile(model.as_deref())?;
            let partitions = build_partitions(&config).await?;
            let store = Arc::clone(partitions.route(profile.dimension)?);

            let extractor = build_extractor(
                strategy.unwrap_or(config.ingest.strategy),
                config.ingest.ocr(),
            )?;
            let chunker = DocumentChunker::new(extractor, &config.chunking)?;
            let metrics = Arc::new(IngestMetrics::new());
            let pipeline = DocumentPipeline::new(
                chunker,
                build_embedder(&config, &profile)?,
                store,
                profile.clone(),
            )?
            .with_metrics(Arc::clone(&metrics));

            let report = ingest_folder(
                Arc::new(pipeline),
                &folder,
                workers.unwrap_or(config.ingest.workers),
            )
            .await?;

            for skipped in &report.skipped {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped document");
            }
            if report.oversized_count() > 0 {
                warn!(count = report.oversized_count(), "chunks above the hard limit");
            }

            println!(
                "{} chunks from {} documents indexed into dimension {} ({} skipped) at {}",
                report.chunk_count(),
                report.documents.len(),
                profile.dimension,
                report.skipped.len(),
                Utc::now().to_rfc3339()
            );
            info!(metrics = ?metrics.snapshot(), "ingest finished");
        }
        Command::Chunk { file, strategy } => {
            let extractor = build_extractor(
                strategy.unwrap_or(config.ingest.strategy),
                config.ingest.ocr(),
            )?;
            let chunker = DocumentChunker::new(extractor, &config.chunking)?;
            let chunked = chunker.chunk_document(&file)?;

            for overflow in &chunked.report.overflows {
                warn!(
                    chunk_index = overflow.chunk_index,
                    tokens = overflow.token_count,
                    chars = overflow.char_count,
                    "oversized chunk"
                );
            }
            println!("{}", serde_json::to_string_pretty(&chunked.report.chunks)?);
        }
        Command::Search {
            query,
            model,
            variant,
            match_count,
            min_score,
            min_cos_sim,
            filters,
            json,
            explain,
        } => {
            let settings = &mut config.retrieval;
            if let Some(variant) = variant {
                settings.variant = variant.into();
            }
            if let Some(match_count) = match_count {
                settings.match_count = match_count;
            }
            if let Some(min_score) = min_score {
                settings.min_score = min_score;
            }
            if let Some(min_cos_sim) = min_cos_sim {
                settings.min_cos_sim = min_cos_sim;
            }
            for (key, value) in filters {
                settings.filter = std::mem::take(&mut settings.filter).with(key, value);
            }
            config.validate()?;

            let profile = config.profile(model.as_deref())?;
            let embedder = build_embedder(&config, &profile)?;
            let metrics = Arc::new(RetrievalMetrics::new());
            let mut coordinator = SearchCoordinator::new(build_partitions(&config).await?)
                .with_metrics(Arc::clone(&metrics));
            if let Some(endpoint) = config.retrieval.reranker_endpoint.as_deref() {
                let timeout = std::time::Duration::from_secs(config.retrieval.reranker_timeout_secs);
                coordinator = coordinator.with_reranker(Arc::new(HttpReranker::new(endpoint, timeout)?));
            }

            let results = coordinator
                .search_text(embedder.as_ref(), &profile, &query, &config.retrieval)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                println!("query: {query}");
                for hit in &results.hits {
                    println!(
                        "score={:.4} chunk={} parent={}",
                        hit.score, hit.chunk_id, hit.parent
                    );
                    if explain {
                        println!(
                            "  similarity={:.4} lexical={:.4} rerank={}",
                            hit.similarity,
                            hit.lexical_rank,
                            hit.rerank_score
                                .map(|score| format!("{score:.4}"))
                                .unwrap_or_else(|| "-".to_string())
                        );
                    }
                    println!("  {}", hit.content.replace('\n', "\n  "));
                }
            }

            if explain {
                println!(
                    "explain: dimension={} pool_size={} reranked={}",
                    results.dimension, results.pool_size, results.reranked
                );
                println!("explain: {}", serde_json::to_string(&metrics.snapshot())?);
            }
        }
    }

    Ok(())
}
