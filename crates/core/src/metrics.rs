//! Process-scoped counters. Callers create one instance per process and
//! hand it to components behind an `Arc`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct RetrievalMetrics {
    queries: AtomicU64,
    failed: AtomicU64,
    unsupported_dimension: AtomicU64,
    results: AtomicU64,
    last_result_count: AtomicU64,
    reranked: AtomicU64,
    latency_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetrievalSnapshot {
    pub queries_total: u64,
    pub failed_queries_total: u64,
    pub unsupported_dimension_total: u64,
    pub results_total: u64,
    pub last_result_count: u64,
    pub reranked_total: u64,
    pub latency_micros_total: u64,
}

impl RetrievalMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, results: usize, reranked: bool, elapsed: Duration) {
        let results = results as u64;
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.results.fetch_add(results, Ordering::Relaxed);
        self.last_result_count.store(results, Ordering::Relaxed);
        if reranked {
            self.reranked.fetch_add(1, Ordering::Relaxed);
        }
        self.add_latency(elapsed);
    }

    pub fn record_failure(&self, unsupported_dimension: bool, elapsed: Duration) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        if unsupported_dimension {
            self.unsupported_dimension.fetch_add(1, Ordering::Relaxed);
        }
        self.add_latency(elapsed);
    }

    fn add_latency(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RetrievalSnapshot {
        RetrievalSnapshot {
            queries_total: self.queries.load(Ordering::Relaxed),
            failed_queries_total: self.failed.load(Ordering::Relaxed),
            unsupported_dimension_total: self.unsupported_dimension.load(Ordering::Relaxed),
            results_total: self.results.load(Ordering::Relaxed),
            last_result_count: self.last_result_count.load(Ordering::Relaxed),
            reranked_total: self.reranked.load(Ordering::Relaxed),
            latency_micros_total: self.latency_micros.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct IngestMetrics {
    documents: AtomicU64,
    chunks: AtomicU64,
    oversized: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub documents_total: u64,
    pub chunks_total: u64,
    pub oversized_chunks_total: u64,
    pub skipped_documents_total: u64,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_document(&self, chunks: usize, oversized: usize) {
        self.documents.fetch_add(1, Ordering::Relaxed);
        self.chunks.fetch_add(chunks as u64, Ordering::Relaxed);
        self.oversized.fetch_add(oversized as u64, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            documents_total: self.documents.load(Ordering::Relaxed),
            chunks_total: self.chunks.load(Ordering::Relaxed),
            oversized_chunks_total: self.oversized.load(Ordering::Relaxed),
            skipped_documents_total: self.skipped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieval_counters_accumulate() {
        let metrics = RetrievalMetrics::new();
        metrics.record_success(3, true, Duration::from_micros(120));
        metrics.record_success(0, false, Duration::from_micros(80));
        metrics.record_failure(true, Duration::from_micros(5));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queries_total, 3);
        assert_eq!(snapshot.failed_queries_total, 1);
        assert_eq!(snapshot.unsupported_dimension_total, 1);
        assert_eq!(snapshot.results_total, 3);
        assert_eq!(snapshot.last_result_count, 0);
        assert_eq!(snapshot.reranked_total, 1);
        assert_eq!(snapshot.latency_micros_total, 205);
    }

    #[test]
    fn ingest_counters_accumulate() {
        let metrics = IngestMetrics::new();
        metrics.record_document(4, 1);
        metrics.record_document(2, 0);
        metrics.record_skipped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.documents_total, 2);
        assert_eq!(snapshot.chunks_total, 6);
        assert_eq!(snapshot.oversized_chunks_total, 1);
        assert_eq!(snapshot.skipped_documents_total, 1);
    }
}
