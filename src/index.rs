//! In-memory embedding index with exact cosine search.
//!
//! An [`IndexSnapshot`] is an immutable set of [`EmbeddingRecord`]s plus the
//! embedding model and dimensionality it was built with. [`EmbeddingIndex`]
//! owns the current snapshot and the bound embedding function.
//!
//! # Invariants
//!
//! - Every record's vector has the snapshot's `dims`.
//! - `document_names` is the deduplicated, insertion-ordered list of the
//!   records' document ids.
//! - Rebuilding never merges: [`EmbeddingIndex::initialize`] replaces the
//!   whole snapshot, and only after the new one was fully built.
//!
//! # Search
//!
//! Brute-force scan over pre-normalised vectors. Results are sorted by
//! descending cosine similarity with a stable sort, so ties keep insertion
//! order and identical queries against identical contents always return
//! identical rankings.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::embedding::{cosine_with_norms, embed_query, l2_norm, EmbeddingProvider};
use crate::error::{RagError, Result};
use crate::models::{ScoredSegment, Segment};

/// One indexed segment and its embedding.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub segment: Segment,
    pub vector: Vec<f32>,
    pub norm: f32,
}

impl EmbeddingRecord {
    pub fn new(segment: Segment, vector: Vec<f32>) -> Self {
        let norm = l2_norm(&vector);
        Self {
            segment,
            vector,
            norm,
        }
    }
}

/// An immutable, fully built index.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    records: Vec<EmbeddingRecord>,
    document_names: Vec<String>,
    model: String,
    dims: usize,
    built_at: DateTime<Utc>,
}

impl IndexSnapshot {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            document_names: Vec::new(),
            model: String::new(),
            dims: 0,
            built_at: Utc::now(),
        }
    }

    /// Assemble a snapshot from records, checking the dimensionality invariant.
    pub fn from_records(
        records: Vec<EmbeddingRecord>,
        model: impl Into<String>,
        dims: usize,
        built_at: DateTime<Utc>,
    ) -> Result<Self> {
        if let Some(bad) = records.iter().find(|r| r.vector.len() != dims) {
            return Err(RagError::IndexMismatch {
                message: format!(
                    "segment {} has {} dimensions, index has {}",
                    bad.segment.id,
                    bad.vector.len(),
                    dims
                ),
            });
        }
        let document_names = derive_document_names(records.iter().map(|r| &r.segment));
        Ok(Self {
            records,
            document_names,
            model: model.into(),
            dims,
            built_at,
        })
    }

    pub fn records(&self) -> &[EmbeddingRecord] {
        &self.records
    }

    pub fn document_names(&self) -> &[String] {
        &self.document_names
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Fail fast when a provider differs from the one the snapshot was built with.
    pub fn check_compatible(&self, provider: &dyn EmbeddingProvider) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        if provider.model_name() != self.model || provider.dims() != self.dims {
            return Err(RagError::IndexMismatch {
                message: format!(
                    "index built with '{}' ({} dims), queried with '{}' ({} dims)",
                    self.model,
                    self.dims,
                    provider.model_name(),
                    provider.dims()
                ),
            });
        }
        Ok(())
    }

    /// The `k` records most similar to `query`.
    pub fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ScoredSegment>> {
        if k == 0 {
            return Err(RagError::invalid("k", "must be >= 1"));
        }
        if self.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != self.dims {
            return Err(RagError::IndexMismatch {
                message: format!(
                    "query has {} dimensions, index has {}",
                    query.len(),
                    self.dims
                ),
            });
        }

        let query_norm = l2_norm(query);
        let mut scored: Vec<(usize, f32)> = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let s = cosine_with_norms(query, query_norm, &r.vector, r.norm);
                (i, if s.is_nan() { f32::NEG_INFINITY } else { s })
            })
            .collect();

        // Stable: equal scores keep insertion order.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(i, score)| ScoredSegment {
                segment: self.records[i].segment.clone(),
                score,
            })
            .collect())
    }
}

impl Default for IndexSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

fn derive_document_names<'a>(segments: impl Iterator<Item = &'a Segment>) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for s in segments {
        if !names.iter().any(|n| n == &s.document_id) {
            names.push(s.document_id.clone());
        }
    }
    names
}

/// Embed segments and build a snapshot. Nothing is published; callers decide
/// when to swap the result in.
pub async fn build_snapshot(
    provider: &dyn EmbeddingProvider,
    segments: Vec<Segment>,
    document_names: &[String],
) -> Result<IndexSnapshot> {
    if let Some(empty) = segments.iter().find(|s| s.text.trim().is_empty()) {
        return Err(RagError::invalid(
            "segments",
            format!("segment {} of '{}' has empty text", empty.sequence_index, empty.document_id),
        ));
    }
    let derived = derive_document_names(segments.iter());
    if derived != document_names {
        return Err(RagError::invalid(
            "document_names",
            format!(
                "expected {:?} to match the segments' documents {:?}",
                document_names, derived
            ),
        ));
    }

    let texts: Vec<String> = segments.iter().map(|s| s.text.clone()).collect();
    let vectors = if texts.is_empty() {
        Vec::new()
    } else {
        provider.embed(&texts).await?
    };
    if vectors.len() != segments.len() {
        return Err(RagError::Embedding {
            message: format!(
                "provider returned {} vectors for {} segments",
                vectors.len(),
                segments.len()
            ),
            retryable: false,
        });
    }

    let records = segments
        .into_iter()
        .zip(vectors)
        .map(|(s, v)| EmbeddingRecord::new(s, v))
        .collect();
    IndexSnapshot::from_records(records, provider.model_name(), provider.dims(), Utc::now())
}

/// The searchable index for one corpus.
pub struct EmbeddingIndex {
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    snapshot: IndexSnapshot,
}

impl EmbeddingIndex {
    pub fn new() -> Self {
        Self {
            embedder: None,
            snapshot: IndexSnapshot::empty(),
        }
    }

    pub fn from_snapshot(snapshot: IndexSnapshot) -> Self {
        Self {
            embedder: None,
            snapshot,
        }
    }

    /// Bind the embedding function used for building and searching.
    pub fn configure(&mut self, provider: Arc<dyn EmbeddingProvider>) {
        debug!(model = provider.model_name(), dims = provider.dims(), "embedding function bound");
        self.embedder = Some(provider);
    }

    fn embedder(&self) -> Result<&Arc<dyn EmbeddingProvider>> {
        self.embedder
            .as_ref()
            .ok_or_else(|| RagError::Config("no embedding function configured".to_string()))
    }

    /// Rebuild the whole index from `segments`. On error the previous
    /// contents stay in place.
    pub async fn initialize(&mut self, segments: Vec<Segment>, document_names: &[String]) -> Result<()> {
        let embedder = Arc::clone(self.embedder()?);
        let next = build_snapshot(embedder.as_ref(), segments, document_names).await?;
        info!(
            documents = next.document_names().len(),
            segments = next.len(),
            "index rebuilt"
        );
        self.snapshot = next;
        Ok(())
    }

    /// Swap in a snapshot built elsewhere.
    pub fn replace(&mut self, snapshot: IndexSnapshot) {
        self.snapshot = snapshot;
    }

    /// Search with the configured embedding function.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredSegment>> {
        let embedder = self.embedder()?;
        self.search_with(embedder.as_ref(), query, k).await
    }

    /// Search with an explicit embedding function, which must match the
    /// one the index was built with.
    pub async fn search_with(
        &self,
        provider: &dyn EmbeddingProvider,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredSegment>> {
        if k == 0 {
            return Err(RagError::invalid("k", "must be >= 1"));
        }
        if self.snapshot.is_empty() {
            return Ok(Vec::new());
        }
        self.snapshot.check_compatible(provider)?;
        let query_vec = embed_query(provider, query).await?;
        self.snapshot.nearest(&query_vec, k)
    }

    /// Replace one document's segments, moving it to the end of the order.
    pub async fn upsert(&mut self, document_id: &str, segments: Vec<Segment>) -> Result<()> {
        if let Some(stray) = segments.iter().find(|s| s.document_id != document_id) {
            return Err(RagError::invalid(
                "segments",
                format!("segment belongs to '{}', not '{}'", stray.document_id, document_id),
            ));
        }
        let embedder = Arc::clone(self.embedder()?);
        self.snapshot.check_compatible(embedder.as_ref())?;

        let names = if segments.is_empty() {
            Vec::new()
        } else {
            vec![document_id.to_string()]
        };
        let added = build_snapshot(embedder.as_ref(), segments, &names).await?;

        let mut records: Vec<EmbeddingRecord> = self
            .snapshot
            .records
            .iter()
            .filter(|r| r.segment.document_id != document_id)
            .cloned()
            .collect();
        records.extend(added.records);
        self.snapshot =
            IndexSnapshot::from_records(records, embedder.model_name(), embedder.dims(), Utc::now())?;
        Ok(())
    }

    /// Drop a document and all its records. Returns whether it was indexed.
    pub fn remove(&mut self, document_id: &str) -> bool {
        let before = self.snapshot.records.len();
        self.snapshot
            .records
            .retain(|r| r.segment.document_id != document_id);
        self.snapshot.document_names.retain(|n| n != document_id);
        self.snapshot.records.len() != before
    }

    pub fn document_names(&self) -> &[String] {
        self.snapshot.document_names()
    }

    pub fn snapshot(&self) -> &IndexSnapshot {
        &self.snapshot
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }
}

impl Default for EmbeddingIndex {
    fn default() -> Self {
        Self::new()
    }
}
