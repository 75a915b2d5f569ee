//! Paragraph segmentation, table-of-contents filtering and numeric heading
//! detection.
//!
//! Paragraphs are separated by blank lines or form feeds. Paragraphs shorter
//! than the configured minimum are dropped, except for a short numeric heading
//! line, which is folded into the next surviving paragraph so its section
//! information is not lost.

use crate::error::IngestError;
use crate::models::{Heading, Paragraph};
use regex::Regex;

pub const DEFAULT_MIN_PARAGRAPH_CHARS: usize = 50;

/// Dotted numbering, an optional trailing dot, then any non-blank title.
pub const DEFAULT_HEADING_PATTERN: &str = r"^\s*(\d+(?:\.\d+)*)\.?\s+(\S.*?)\s*$";

const PARAGRAPH_BOUNDARY: &str = r"\n[ \t\r]*\n|\x0C";
const TOC_LINE: &str = r"^\d+(?:\.\d+)*\s+.+\s+\d+$";
const DOTTED_LEADER: &str = r"(?:\.{4,}|…+|(?:\.\s){3,})\s*\d+$";
const TOC_KEYWORDS: [&str; 7] = [
    "contents",
    "table of contents",
    "index",
    "sumário",
    "sumario",
    "índice",
    "indice",
];

#[derive(Debug, Clone)]
pub struct SegmentOptions {
    pub min_paragraph_chars: usize,
    pub heading_pattern: String,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            min_paragraph_chars: DEFAULT_MIN_PARAGRAPH_CHARS,
            heading_pattern: DEFAULT_HEADING_PATTERN.to_string(),
        }
    }
}

pub struct Segmenter {
    min_chars: usize,
    boundary_re: Regex,
    toc_line_re: Regex,
    leader_re: Regex,
    headings: HeadingDetector,
}

impl Segmenter {
    pub fn new(options: &SegmentOptions) -> Result<Self, IngestError> {
        Ok(Self {
            min_chars: options.min_paragraph_chars,
            boundary_re: Regex::new(PARAGRAPH_BOUNDARY)?,
            toc_line_re: Regex::new(TOC_LINE)?,
            leader_re: Regex::new(DOTTED_LEADER)?,
            headings: HeadingDetector::new(&options.heading_pattern)?,
        })
    }

    /// Splits `source` into surviving paragraphs, in document order.
    pub fn segment(&self, source: &str, document_id: &str) -> Vec<Paragraph> {
        let mut paragraphs = Vec::new();
        let mut pending_heading: Option<(usize, usize)> = None;

        for (index, (start, end)) in self.raw_spans(source).into_iter().enumerate() {
            let text = &source[start..end];

            if self.looks_like_toc(text) {
                pending_heading = None;
                continue;
            }

            if text.chars().count() < self.min_chars {
                if self.is_heading_block(text) {
                    pending_heading.get_or_insert((index, start));
                } else {
                    pending_heading = None;
                }
                continue;
            }

            let (index, start) = pending_heading.take().unwrap_or((index, start));
            paragraphs.push(Paragraph {
                index,
                start,
                end,
                text: source[start..end].to_string(),
                document_id: document_id.to_string(),
                heading: None,
                heading_lines: 0,
                heading_path: Vec::new(),
                section: None,
            });
        }

        paragraphs
    }

    pub fn headings(&self) -> &HeadingDetector {
        &self.headings
    }

    pub fn looks_like_toc(&self, text: &str) -> bool {
        let lines = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>();

        let Some(first) = lines.first() else {
            return false;
        };

        let first = first.to_lowercase();
        if TOC_KEYWORDS.contains(&first.trim_end_matches(':')) {
            return true;
        }

        let toc_lines = lines
            .iter()
            .filter(|line| self.leader_re.is_match(line) || self.toc_line_re.is_match(line))
            .count();

        toc_lines * 2 >= lines.len()
    }

    fn is_heading_block(&self, text: &str) -> bool {
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .all(|line| self.headings.detect(line).is_some())
    }

    fn raw_spans(&self, source: &str) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        let mut cursor = 0;

        for boundary in self.boundary_re.find_iter(source) {
            push_trimmed(source, cursor, boundary.start(), &mut spans);
            cursor = boundary.end();
        }
        push_trimmed(source, cursor, source.len(), &mut spans);

        spans
    }
}

fn push_trimmed(source: &str, start: usize, end: usize, spans: &mut Vec<(usize, usize)>) {
    let slice = &source[start..end];
    let trimmed_start = start + (slice.len() - slice.trim_start().len());
    let trimmed_end = start + slice.trim_end().len();
    if trimmed_start < trimmed_end {
        spans.push((trimmed_start, trimmed_end));
    }
}

/// Tags paragraphs with the hierarchical path of numeric headings.
pub struct HeadingDetector {
    pattern: Regex,
}

impl HeadingDetector {
    pub fn new(pattern: &str) -> Result<Self, IngestError> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn detect(&self, line: &str) -> Option<Heading> {
        let captures = self.pattern.captures(line)?;
        let numbering = captures.get(1)?.as_str().to_string();
        let title = captures.get(2)?.as_str().trim().to_string();
        let level = numbering.split('.').count();

        Some(Heading {
            numbering,
            title,
            level,
        })
    }

    /// Sets `heading`, `heading_path` and `section` on every paragraph.
    ///
    /// Leading heading lines of a paragraph open new sections; a heading of
    /// level `n` closes every open section of level `n` or deeper.
    pub fn annotate(&self, paragraphs: &mut [Paragraph]) {
        let mut stack: Vec<Heading> = Vec::new();

        for paragraph in paragraphs.iter_mut() {
            let mut declared = None;
            let mut heading_lines = 0;

            for line in paragraph.text.lines().filter(|line| !line.trim().is_empty()) {
                let Some(heading) = self.detect(line) else {
                    break;
                };

                while stack.last().is_some_and(|open| open.level >= heading.level) {
                    stack.pop();
                }
                stack.push(heading.clone());
                declared = Some(heading);
                heading_lines += 1;
            }

            paragraph.heading = declared;
            paragraph.heading_lines = heading_lines;
            paragraph.heading_path = stack.iter().map(Heading::label).collect();
            paragraph.section = stack.last().map(|open| open.numbering.clone());
        }
    }
}
