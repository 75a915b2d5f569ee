//! Full-text relevance over pooled candidates.
//!
//! Every stored chunk carries a [`TermStats`] entry computed once at write
//! time; query time only parses the query and ranks the pooled candidates
//! against their entries. Ranks are in `[0, 1)`; the literal-substring
//! fallback assigns [`SUBSTRING_FALLBACK_RANK`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

pub const SUBSTRING_FALLBACK_RANK: f64 = 1.0;

// English and Portuguese.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "that", "the", "this", "to", "was", "were", "with", "o", "os", "de", "da", "do", "das",
    "dos", "e", "em", "na", "nos", "nas", "um", "uma", "para", "por", "com", "que", "se", "ao",
    "à", "é",
];

const OPENING_QUOTES: [char; 3] = ['"', '“', '„'];
const CLOSING_QUOTES: [char; 2] = ['"', '”'];

/// Lowercased alphanumeric words of `text`, stopwords removed, in order.
pub fn analyze(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
        .collect()
}

/// Removes one pair of surrounding quotation marks, if present.
pub fn strip_quotes(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let mut chars = trimmed.chars();
    let first = chars.next()?;
    let last = chars.next_back()?;

    if OPENING_QUOTES.contains(&first) && CLOSING_QUOTES.contains(&last) {
        Some(&trimmed[first.len_utf8()..trimmed.len() - last.len_utf8()])
    } else {
        None
    }
}

/// The query text with quotes removed, as matched by the substring fallback.
pub fn literal_text(raw: &str) -> &str {
    strip_quotes(raw).unwrap_or(raw).trim()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LexicalQuery {
    /// Quoted query: all terms, adjacent and in order.
    Phrase(Vec<String>),
    /// Unquoted query: any of the terms.
    Terms(Vec<String>),
}

impl LexicalQuery {
    /// `None` when the text has no searchable terms.
    pub fn parse(text: &str) -> Option<Self> {
        let query = match strip_quotes(text) {
            Some(inner) => Self::Phrase(analyze(inner)),
            None => {
                let mut seen = BTreeSet::new();
                let terms = analyze(text)
                    .into_iter()
                    .filter(|term| seen.insert(term.clone()))
                    .collect();
                Self::Terms(terms)
            }
        };

        if query.terms().is_empty() {
            None
        } else {
            Some(query)
        }
    }

    pub fn terms(&self) -> &[String] {
        match self {
            Self::Phrase(terms) | Self::Terms(terms) => terms,
        }
    }

    pub fn is_phrase(&self) -> bool {
        matches!(self, Self::Phrase(_))
    }
}

/// Precomputed full-text index entry of one chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TermStats {
    pub positions: Vec<String>,
    pub frequencies: HashMap<String, usize>,
}

impl TermStats {
    pub fn from_text(content: &str) -> Self {
        let positions = analyze(content);
        let mut frequencies = HashMap::new();
        for term in &positions {
            *frequencies.entry(term.clone()).or_insert(0) += 1;
        }
        Self {
            positions,
            frequencies,
        }
    }

    pub fn term_frequency(&self, term: &str) -> usize {
        self.frequencies.get(term).copied().unwrap_or(0)
    }

    pub fn phrase_occurrences(&self, phrase: &[String]) -> usize {
        if phrase.is_empty() || phrase.len() > self.positions.len() {
            return 0;
        }
        self.positions
            .windows(phrase.len())
            .filter(|window| *window == phrase)
            .count()
    }
}

fn saturate(count: usize) -> f64 {
    let count = count as f64;
    count / (count + 1.0)
}

/// Relevance of a chunk for a parsed query, in `[0, 1)`.
pub fn rank(stats: &TermStats, query: &LexicalQuery) -> f64 {
    match query {
        LexicalQuery::Phrase(terms) => saturate(stats.phrase_occurrences(terms)),
        LexicalQuery::Terms(terms) if terms.is_empty() => 0.0,
        LexicalQuery::Terms(terms) => {
            let total = terms
                .iter()
                .map(|term| saturate(stats.term_frequency(term)))
                .sum::<f64>();
            total / terms.len() as f64
        }
    }
}

/// Applies the literal-substring fallback to an engine rank.
pub fn lexical_score(rank: f64, raw_query: &str, content: &str) -> f64 {
    if rank > 0.0 {
        return rank;
    }

    let literal = literal_text(raw_query);
    if !literal.is_empty() && content.to_lowercase().contains(&literal.to_lowercase()) {
        SUBSTRING_FALLBACK_RANK
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyze_drops_stopwords_and_punctuation() {
        assert_eq!(
            analyze("The Relief-Valve of the pump, rated 40 bar."),
            vec!["relief", "valve", "pump", "rated", "40", "bar"]
        );
    }

    #[test]
    fn quoted_text_parses_as_phrase() {
        let query = LexicalQuery::parse("\"relief valve\"").expect("query has terms");
        assert_eq!(
            query,
            LexicalQuery::Phrase(vec!["relief".into(), "valve".into()])
        );

        let typographic = LexicalQuery::parse("“relief valve”").expect("query has terms");
        assert!(typographic.is_phrase());
    }

    #[test]
    fn unquoted_text_parses_as_deduplicated_terms() {
        let query = LexicalQuery::parse("valve pressure valve").expect("query has terms");
        assert_eq!(
            query,
            LexicalQuery::Terms(vec!["valve".into(), "pressure".into()])
        );
    }

    #[test]
    fn blank_or_stopword_only_text_has_no_query() {
        assert!(LexicalQuery::parse("   ").is_none());
        assert!(LexicalQuery::parse("the of and").is_none());
        assert!(LexicalQuery::parse("\"\"").is_none());
    }

    #[test]
    fn term_rank_is_mean_saturated_frequency() {
        let stats = TermStats::from_text("valve valve valve and a pump");
        let query = LexicalQuery::Terms(vec!["valve".into(), "seal".into()]);

        // valve: 3/4, seal: 0
        assert!((rank(&stats, &query) - 0.375).abs() < 1e-12);
    }

    #[test]
    fn phrase_rank_requires_adjacent_terms_in_order() {
        let stats = TermStats::from_text("relief valve checked; valve relief noted; relief valve ok");
        let phrase = LexicalQuery::Phrase(vec!["relief".into(), "valve".into()]);
        assert!((rank(&stats, &phrase) - 2.0 / 3.0).abs() < 1e-12);

        let reversed = TermStats::from_text("valve relief");
        assert_eq!(rank(&reversed, &phrase), 0.0);
    }

    #[test]
    fn ranks_stay_below_the_fallback_rank() {
        let stats = TermStats::from_text(&"pump ".repeat(500));
        let query = LexicalQuery::Terms(vec!["pump".into()]);
        assert!(rank(&stats, &query) < SUBSTRING_FALLBACK_RANK);
    }

    #[test]
    fn substring_fallback_applies_only_without_engine_match() {
        let content = "Model X-200/B must be torqued to 45 Nm.";

        assert_eq!(lexical_score(0.0, "X-200/B", content), SUBSTRING_FALLBACK_RANK);
        assert_eq!(lexical_score(0.0, "\"x-200/b\"", content), SUBSTRING_FALLBACK_RANK);
        assert_eq!(lexical_score(0.4, "X-200/B", content), 0.4);
        assert_eq!(lexical_score(0.0, "Y-300", content), 0.0);
        assert_eq!(lexical_score(0.0, "  ", content), 0.0);
    }
}
