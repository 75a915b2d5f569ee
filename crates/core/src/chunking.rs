use crate::error::IngestError;
use crate::models::{Chunk, ChunkKind, ChunkOverflow, DocumentFingerprint, Paragraph};
use crate::store::{CHUNK_INDEX_KEY, PARENT_KEY};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::warn;

pub const DEFAULT_MAX_TOKENS: usize = 256;
pub const DEFAULT_OVERLAP_RATIO: f32 = 0.2;
pub const DEFAULT_HARD_CHAR_LIMIT: usize = 4_096;
pub const DEFAULT_SEPARATORS: [&str; 7] = ["\n\n", "\n", ". ", "? ", "! ", "; ", ", "];

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub overlap_ratio: f32,
    pub hard_char_limit: usize,
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            overlap_ratio: DEFAULT_OVERLAP_RATIO,
            hard_char_limit: DEFAULT_HARD_CHAR_LIMIT,
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_tokens == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_tokens must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.overlap_ratio) {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap ratio {} is outside [0, 1)",
                self.overlap_ratio
            )));
        }
        if self.hard_char_limit == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "hard_char_limit must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stride(&self) -> usize {
        sliding_window_stride(self.max_tokens, self.overlap_ratio)
    }

    fn fits(&self, text: &str) -> bool {
        text.chars().count() <= self.hard_char_limit && count_tokens(text) <= self.max_tokens
    }
}

pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Byte spans of the whitespace-delimited tokens of `text`.
pub fn token_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut open = None;

    for (offset, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(start) = open.take() {
                spans.push((start, offset));
            }
        } else if open.is_none() {
            open = Some(offset);
        }
    }
    if let Some(start) = open {
        spans.push((start, text.len()));
    }

    spans
}

pub fn sliding_window_stride(window: usize, overlap_ratio: f32) -> usize {
    let stride = (window as f64 * (1.0 - f64::from(overlap_ratio))).round() as usize;
    stride.clamp(1, window.max(1))
}

/// Token offsets of the windows covering `total` tokens.
///
/// Windows start at multiples of the stride; the last window is right-aligned
/// to `total`, so every window is `window` tokens long and `[0, total)` is
/// covered without gaps.
pub fn sliding_window_starts(total: usize, window: usize, overlap_ratio: f32) -> Vec<usize> {
    if total == 0 || window == 0 {
        return Vec::new();
    }
    if total <= window {
        return vec![0];
    }

    let stride = sliding_window_stride(window, overlap_ratio);
    let mut starts = Vec::new();
    let mut start = 0;
    while start + window < total {
        starts.push(start);
        start += stride;
    }
    starts.push(total - window);
    starts
}

/// Splits `text` at the first separator, in priority order, whose segments
/// all stay within both limits. An empty separator splits between characters.
///
/// Returns trimmed byte spans into `text`, or `None` when no separator works.
pub fn split_with_separators(
    text: &str,
    separators: &[String],
    max_tokens: usize,
    hard_char_limit: usize,
) -> Option<Vec<(usize, usize)>> {
    let fits = |candidate: &str| {
        candidate.chars().count() <= hard_char_limit && count_tokens(candidate) <= max_tokens
    };

    for separator in separators {
        let pieces = split_keeping_separator(text, separator);
        if pieces.len() < 2 {
            continue;
        }

        let mut segments = Vec::new();
        let mut current: Option<(usize, usize)> = None;
        for (start, end) in pieces {
            current = match current {
                Some((open, _)) if fits(&text[open..end]) => Some((open, end)),
                Some(done) => {
                    segments.push(done);
                    Some((start, end))
                }
                None => Some((start, end)),
            };
        }
        segments.extend(current);

        if segments.iter().all(|&(start, end)| fits(&text[start..end])) {
            return Some(
                segments
                    .into_iter()
                    .filter_map(|(start, end)| trim_span(text, start, end))
                    .collect(),
            );
        }
    }

    None
}

fn split_keeping_separator(text: &str, separator: &str) -> Vec<(usize, usize)> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(offset, ch)| (offset, offset + ch.len_utf8()))
            .collect();
    }

    let mut pieces = Vec::new();
    let mut cursor = 0;
    for (offset, matched) in text.match_indices(separator) {
        let end = offset + matched.len();
        if end > cursor {
            pieces.push((cursor, end));
        }
        cursor = end;
    }
    if cursor < text.len() {
        pieces.push((cursor, text.len()));
    }
    pieces
}

fn trim_span(text: &str, start: usize, end: usize) -> Option<(usize, usize)> {
    let slice = &text[start..end];
    let trimmed_start = start + (slice.len() - slice.trim_start().len());
    let trimmed_end = start + slice.trim_end().len();
    (trimmed_start < trimmed_end).then_some((trimmed_start, trimmed_end))
}

#[derive(Debug, Default)]
pub struct ChunkingReport {
    pub chunks: Vec<Chunk>,
    pub overflows: Vec<ChunkOverflow>,
}

#[derive(Debug, Clone)]
struct Candidate {
    text: String,
    start: usize,
    end: usize,
    kind: ChunkKind,
    overlap_ratio: Option<f32>,
    oversized: bool,
    heading_path: Vec<String>,
    section: Option<String>,
}

impl Candidate {
    fn from_paragraphs(paragraphs: &[&Paragraph]) -> Option<Self> {
        let first = paragraphs.first()?;
        let last = paragraphs.last()?;
        let kind = if paragraphs.len() == 1 && first.is_heading_only() {
            ChunkKind::Heading
        } else {
            ChunkKind::Paragraphs
        };

        Some(Self {
            text: paragraphs
                .iter()
                .map(|paragraph| paragraph.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
            start: first.start,
            end: last.end,
            kind,
            overlap_ratio: None,
            oversized: false,
            heading_path: first.heading_path.clone(),
            section: first.section.clone(),
        })
    }
}

/// Turns annotated paragraphs into token-bounded chunks.
///
/// Paragraphs are packed greedily up to `max_tokens`. A section heading always
/// starts a new chunk. Paragraphs above `max_tokens` are cut into overlapping
/// sliding windows, and anything above the hard character limit goes through
/// the separator splitter. Chunks that still do not fit are kept, flagged as
/// oversized and reported.
pub struct ChunkAssembler {
    config: ChunkingConfig,
}

impl ChunkAssembler {
    pub fn new(config: ChunkingConfig) -> Result<Self, IngestError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    pub fn assemble(
        &self,
        document: &DocumentFingerprint,
        paragraphs: &[Paragraph],
    ) -> ChunkingReport {
        let mut candidates = Vec::new();
        let mut buffer: Vec<&Paragraph> = Vec::new();
        let mut buffered_tokens = 0;

        for paragraph in paragraphs {
            let tokens = count_tokens(&paragraph.text);

            if paragraph.heading.is_some()
                || (!buffer.is_empty() && buffered_tokens + tokens > self.config.max_tokens)
            {
                // a lone section opener stays attached to the body it overflows with
                let seed = match buffer.as_slice() {
                    [seed] if seed.heading.is_some() => Some(*seed),
                    _ => None,
                };
                if let Some(seed) = seed.filter(|_| paragraph.heading.is_none()) {
                    candidates.extend(self.windows(&[seed, paragraph]));
                    buffer.clear();
                    buffered_tokens = 0;
                    continue;
                }
                candidates.extend(Candidate::from_paragraphs(&buffer));
                buffer.clear();
                buffered_tokens = 0;
            }

            if tokens > self.config.max_tokens {
                candidates.extend(Candidate::from_paragraphs(&buffer));
                buffer.clear();
                buffered_tokens = 0;
                candidates.extend(self.windows(&[paragraph]));
                continue;
            }

            buffer.push(paragraph);
            buffered_tokens += tokens;
        }
        candidates.extend(Candidate::from_paragraphs(&buffer));

        let mut report = ChunkingReport::default();
        let bounded = candidates
            .into_iter()
            .flat_map(|candidate| self.enforce_limits(candidate));

        for (index, candidate) in bounded.enumerate() {
            let chunk = build_chunk(document, index as u64, candidate);
            if chunk.oversized {
                warn!(
                    document_id = %document.document_id,
                    chunk_index = chunk.chunk_index,
                    tokens = chunk.token_count,
                    chars = chunk.text.chars().count(),
                    "chunk exceeds limits after all splitting stages"
                );
                report.overflows.push(ChunkOverflow {
                    document_id: document.document_id.clone(),
                    chunk_index: chunk.chunk_index,
                    token_count: chunk.token_count,
                    char_count: chunk.text.chars().count(),
                });
            }
            report.chunks.push(chunk);
        }

        report
    }

    fn windows(&self, paragraphs: &[&Paragraph]) -> Vec<Candidate> {
        let Some(first) = paragraphs.first() else {
            return Vec::new();
        };

        // (paragraph position, byte span inside that paragraph)
        let tokens = paragraphs
            .iter()
            .enumerate()
            .flat_map(|(position, paragraph)| {
                token_spans(&paragraph.text)
                    .into_iter()
                    .map(move |span| (position, span))
            })
            .collect::<Vec<_>>();

        let window = self.config.max_tokens;
        sliding_window_starts(tokens.len(), window, self.config.overlap_ratio)
            .into_iter()
            .filter_map(|start| {
                let covered = &tokens[start..(start + window).min(tokens.len())];
                let (first_position, (first_start, _)) = *covered.first()?;
                let (last_position, (_, last_end)) = *covered.last()?;

                let text = (first_position..=last_position)
                    .map(|position| {
                        let paragraph = paragraphs[position];
                        let from = if position == first_position { first_start } else { 0 };
                        let to = if position == last_position {
                            last_end
                        } else {
                            paragraph.text.len()
                        };
                        &paragraph.text[from..to]
                    })
                    .collect::<Vec<_>>()
                    .join("\n\n");

                Some(Candidate {
                    text,
                    start: paragraphs[first_position].start + first_start,
                    end: paragraphs[last_position].start + last_end,
                    kind: ChunkKind::Window,
                    overlap_ratio: Some(self.config.overlap_ratio),
                    oversized: false,
                    heading_path: first.heading_path.clone(),
                    section: first.section.clone(),
                })
            })
            .collect()
    }

    fn enforce_limits(&self, candidate: Candidate) -> Vec<Candidate> {
        if self.config.fits(&candidate.text) {
            return vec![candidate];
        }

        match split_with_separators(
            &candidate.text,
            &self.config.separators,
            self.config.max_tokens,
            self.config.hard_char_limit,
        ) {
            Some(segments) if !segments.is_empty() => segments
                .into_iter()
                .map(|(start, end)| Candidate {
                    text: candidate.text[start..end].to_string(),
                    start: (candidate.start + start).min(candidate.end),
                    end: (candidate.start + end).min(candidate.end),
                    kind: ChunkKind::Segment,
                    overlap_ratio: None,
                    oversized: false,
                    heading_path: candidate.heading_path.clone(),
                    section: candidate.section.clone(),
                })
                .collect(),
            _ => vec![Candidate {
                oversized: true,
                ..candidate
            }],
        }
    }
}

fn build_chunk(document: &DocumentFingerprint, index: u64, candidate: Candidate) -> Chunk {
    let mut metadata = Map::new();
    metadata.insert(
        "title".to_string(),
        Value::String(document.document_title.clone()),
    );
    if let Some(author) = &document.author {
        metadata.insert("author".to_string(), Value::String(author.clone()));
    }
    metadata.insert("type".to_string(), Value::String(document.kind.clone()));
    metadata.insert(
        "source_path".to_string(),
        Value::String(document.source_path.clone()),
    );
    metadata.insert(
        "heading_path".to_string(),
        Value::Array(
            candidate
                .heading_path
                .iter()
                .cloned()
                .map(Value::String)
                .collect(),
        ),
    );
    metadata.insert(
        PARENT_KEY.to_string(),
        Value::String(document.document_id.clone()),
    );
    metadata.insert(CHUNK_INDEX_KEY.to_string(), Value::from(index));

    Chunk {
        chunk_id: make_chunk_id(&document.document_id, index, &candidate.text),
        parent: document.document_id.clone(),
        section_id: candidate
            .section
            .map(|section| format!("{}#{}", document.document_id, section)),
        chunk_index: index,
        token_count: count_tokens(&candidate.text),
        start_offset: candidate.start,
        end_offset: candidate.end,
        overlap_ratio: candidate.overlap_ratio,
        oversized: candidate.oversized,
        kind: candidate.kind,
        text: candidate.text,
        metadata,
    }
}

fn make_chunk_id(document_id: &str, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
