//! Two-phase MRL vector search.
//!
//! Phase 1 scores the query against every hot-index entry (truncated,
//! unit-normalized MRL prefixes) and keeps a candidate pool. Phase 2
//! fetches full embeddings for exactly that pool from an injected
//! provider and reranks with full-dimension cosine similarity. Ids the
//! provider can't supply keep their Phase-1 score.
//!
//! The hot index is the only state the searcher owns; the cold side
//! lives entirely behind [`FullEmbeddingProvider`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, warn};

use super::{cosine_similarity, normalize, truncate_and_normalize, HotDimension};
use crate::error::Result;

/// Source of full-dimension embeddings for Phase-2 rerank.
///
/// Implementations typically page vectors in from a columnar cold
/// store. `fetch` receives exactly the candidate-pool ids; in merge
/// mode it may return additional cold-only ids.
pub trait FullEmbeddingProvider: Send + Sync {
    /// Returns full embeddings for the requested ids. A `None` value
    /// means the provider knows the id but has no full vector for it.
    fn fetch(&self, ids: &[String]) -> Result<HashMap<String, Option<Vec<f32>>>>;

    /// Number of documents on the cold side, if known.
    fn cold_len(&self) -> usize {
        0
    }
}

/// Optional tags attached to a hot-index entry.
#[derive(Clone, Debug, Default)]
pub struct HotMeta {
    /// Namespace filter tag.
    pub namespace: Option<String>,
    /// Type filter tag.
    pub kind: Option<String>,
    /// Opaque metadata returned with search hits.
    pub metadata: Option<Value>,
}

#[derive(Clone, Debug)]
struct HotEntry {
    vector: Vec<f32>,
    meta: HotMeta,
}

/// Options for [`TwoPhaseSearch::search`].
#[derive(Clone, Debug)]
pub struct SearchOptions {
    /// Number of results to return.
    pub top_k: usize,
    /// Phase-1 candidate pool size (effective pool is
    /// `max(candidate_pool_size, top_k)`).
    pub candidate_pool_size: usize,
    /// Only consider entries tagged with this namespace.
    pub namespace: Option<String>,
    /// Only consider entries tagged with this type.
    pub kind: Option<String>,
    /// Allow the provider to surface cold-only documents.
    pub merge_mode: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            candidate_pool_size: 50,
            namespace: None,
            kind: None,
            merge_mode: false,
        }
    }
}

impl SearchOptions {
    /// Creates options returning `top_k` results with defaults otherwise.
    pub fn top_k(top_k: usize) -> Self {
        Self {
            top_k,
            ..Default::default()
        }
    }
}

/// One search result.
#[derive(Clone, Debug)]
pub struct SearchHit {
    /// Document id.
    pub id: String,
    /// Final similarity score (Phase-2 when available, else Phase-1).
    pub score: f64,
    /// Metadata captured at index time; `None` for cold-only hits.
    pub metadata: Option<Value>,
}

/// Search statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SearchStats {
    /// Entries currently in the hot index.
    pub hot_index_size: usize,
    /// Cold-side size as reported by the provider.
    pub cold_index_size: usize,
    /// Mean Phase-1 scan time in milliseconds.
    pub average_phase1_ms: f64,
    /// Mean Phase-2 rerank time in milliseconds.
    pub average_phase2_ms: f64,
}

#[derive(Debug, Default)]
struct Timings {
    phase1_total_us: u128,
    phase1_runs: u32,
    phase2_total_us: u128,
    phase2_runs: u32,
}

/// Two-phase approximate-then-precise vector searcher.
///
/// # Thread Safety
///
/// `TwoPhaseSearch` is `Send + Sync`; the hot map sits behind an
/// `RwLock` so searches proceed concurrently with the odd insert.
pub struct TwoPhaseSearch {
    dim: HotDimension,
    hot: RwLock<HashMap<String, HotEntry>>,
    provider: RwLock<Option<Arc<dyn FullEmbeddingProvider>>>,
    timings: Mutex<Timings>,
}

impl std::fmt::Debug for TwoPhaseSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoPhaseSearch")
            .field("dim", &self.dim)
            .field("hot_index_size", &self.len())
            .finish_non_exhaustive()
    }
}

impl TwoPhaseSearch {
    /// Creates an empty searcher with the given hot dimension.
    pub fn new(dim: HotDimension) -> Self {
        Self {
            dim,
            hot: RwLock::new(HashMap::new()),
            provider: RwLock::new(None),
            timings: Mutex::new(Timings::default()),
        }
    }

    /// The hot-index truncation dimension, fixed for this instance.
    pub fn dimension(&self) -> HotDimension {
        self.dim
    }

    /// Injects the cold-side embedding provider.
    pub fn set_provider(&self, provider: Arc<dyn FullEmbeddingProvider>) {
        *self.provider.write().unwrap() = Some(provider);
    }

    /// Removes the provider; searches fall back to Phase 1 only.
    pub fn clear_provider(&self) {
        *self.provider.write().unwrap() = None;
    }

    /// Inserts a document into the hot index.
    ///
    /// `embedding` may be the full vector or an already-truncated one;
    /// either way it is truncated to the hot dimension and normalized.
    ///
    /// # Errors
    /// Rejects vectors shorter than the hot dimension and zero vectors.
    pub fn add_to_hot_index(
        &self,
        id: impl Into<String>,
        embedding: &[f32],
        meta: HotMeta,
    ) -> Result<()> {
        let vector = truncate_and_normalize(embedding, self.dim)?;
        self.hot
            .write()
            .unwrap()
            .insert(id.into(), HotEntry { vector, meta });
        Ok(())
    }

    /// Removes a document from the hot index.
    /// Returns `true` if it was present.
    pub fn remove(&self, id: &str) -> bool {
        self.hot.write().unwrap().remove(id).is_some()
    }

    /// Number of entries in the hot index.
    pub fn len(&self) -> usize {
        self.hot.read().unwrap().len()
    }

    /// Returns true if the hot index is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs a two-phase search.
    ///
    /// The query must be at least as long as the hot dimension; when it
    /// is exactly the hot dimension no rerank query exists, so Phase-2
    /// ids with differently-sized full embeddings keep their Phase-1
    /// score.
    pub fn search(&self, query: &[f32], opts: &SearchOptions) -> Result<Vec<SearchHit>> {
        if opts.top_k == 0 {
            return Ok(Vec::new());
        }

        let full_query = normalize(query)?;
        let hot_query = if query.len() == self.dim.size() {
            full_query.clone()
        } else {
            truncate_and_normalize(query, self.dim)?
        };

        // Phase 1: exact cosine scan over the hot map
        let phase1_start = Instant::now();
        let pool_size = opts.candidate_pool_size.max(opts.top_k);
        let mut candidates: Vec<SearchHit> = {
            let hot = self.hot.read().unwrap();
            let mut scored = Vec::with_capacity(hot.len());
            for (id, entry) in hot.iter() {
                if let Some(ns) = &opts.namespace {
                    if entry.meta.namespace.as_deref() != Some(ns.as_str()) {
                        continue;
                    }
                }
                if let Some(kind) = &opts.kind {
                    if entry.meta.kind.as_deref() != Some(kind.as_str()) {
                        continue;
                    }
                }
                let score = cosine_similarity(&hot_query, &entry.vector)?;
                scored.push(SearchHit {
                    id: id.clone(),
                    score,
                    metadata: entry.meta.metadata.clone(),
                });
            }
            scored
        };
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(pool_size);
        self.record_phase1(phase1_start);

        let provider = self.provider.read().unwrap().clone();
        let Some(provider) = provider else {
            candidates.truncate(opts.top_k);
            return Ok(candidates);
        };

        // Phase 2: rerank exactly the candidate pool with full embeddings
        let phase2_start = Instant::now();
        let ids: Vec<String> = candidates.iter().map(|hit| hit.id.clone()).collect();
        let full = provider.fetch(&ids)?;

        for hit in candidates.iter_mut() {
            match full.get(&hit.id) {
                Some(Some(vector)) if vector.len() == full_query.len() => {
                    hit.score = cosine_similarity(&full_query, vector)?;
                }
                Some(Some(vector)) => {
                    warn!(
                        id = %hit.id,
                        got = vector.len(),
                        want = full_query.len(),
                        "Full embedding length mismatch; keeping Phase-1 score"
                    );
                }
                // Provider returned None or omitted the id: keep Phase-1 score
                _ => {}
            }
        }

        if opts.merge_mode {
            // Cold-only documents the provider surfaced beyond the pool
            for (id, vector) in full.iter() {
                if candidates.iter().any(|hit| &hit.id == id) {
                    continue;
                }
                let Some(vector) = vector else { continue };
                if vector.len() != full_query.len() {
                    continue;
                }
                candidates.push(SearchHit {
                    id: id.clone(),
                    score: cosine_similarity(&full_query, vector)?,
                    metadata: None,
                });
            }
        }
        self.record_phase2(phase2_start);

        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(opts.top_k);
        debug!(results = candidates.len(), "Two-phase search complete");
        Ok(candidates)
    }

    /// Returns accumulated statistics.
    pub fn stats(&self) -> SearchStats {
        let timings = self.timings.lock().unwrap();
        let avg = |total_us: u128, runs: u32| {
            if runs == 0 {
                0.0
            } else {
                total_us as f64 / runs as f64 / 1000.0
            }
        };
        SearchStats {
            hot_index_size: self.len(),
            cold_index_size: self
                .provider
                .read()
                .unwrap()
                .as_ref()
                .map(|p| p.cold_len())
                .unwrap_or(0),
            average_phase1_ms: avg(timings.phase1_total_us, timings.phase1_runs),
            average_phase2_ms: avg(timings.phase2_total_us, timings.phase2_runs),
        }
    }

    fn record_phase1(&self, start: Instant) {
        let mut timings = self.timings.lock().unwrap();
        timings.phase1_total_us += start.elapsed().as_micros();
        timings.phase1_runs += 1;
    }

    fn record_phase2(&self, start: Instant) {
        let mut timings = self.timings.lock().unwrap();
        timings.phase2_total_us += start.elapsed().as_micros();
        timings.phase2_runs += 1;
    }
}
