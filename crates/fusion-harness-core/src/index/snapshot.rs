//! Immutable index snapshots.
//!
//! A snapshot is built once by the writer and then only read. Search runs
//! brute-force cosine similarity over every entry that passes the
//! metadata filters.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::embedding::{cosine_similarity, l2_norm};
use crate::error::RetrievalError;
use crate::models::{Document, DocumentRef, Metadata, RetrievalResult};

/// A published, read-only view of the index at one generation.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    generation: u64,
    dims: Option<usize>,
    populated: bool,
    docs: BTreeMap<DocumentRef, Arc<Document>>,
}

impl IndexSnapshot {
    pub(crate) fn new(
        generation: u64,
        dims: Option<usize>,
        populated: bool,
        docs: BTreeMap<DocumentRef, Arc<Document>>,
    ) -> Self {
        Self {
            generation,
            dims,
            populated,
            docs,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// True once any document has ever been published, even if all were
    /// later removed.
    pub fn ever_populated(&self) -> bool {
        self.populated
    }

    pub fn get(&self, id: &DocumentRef) -> Option<&Arc<Document>> {
        self.docs.get(id)
    }

    pub fn documents(&self) -> impl Iterator<Item = &Arc<Document>> {
        self.docs.values()
    }

    /// Top-`k` documents by cosine similarity to `query`.
    ///
    /// Results are ordered by score descending, ties broken by document id
    /// ascending, and ranked from 1.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filters: &Metadata,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        if !self.populated {
            return Err(RetrievalError::IndexEmpty);
        }
        if k == 0 {
            return Err(RetrievalError::MalformedQuery("k must be at least 1".into()));
        }
        validate_query(query, self.dims)?;

        let mut scored: Vec<(f32, &DocumentRef)> = Vec::new();
        for (id, doc) in &self.docs {
            if !matches_filters(&doc.metadata, filters) {
                continue;
            }
            if doc.embedding.len() != query.len() {
                return Err(RetrievalError::Corrupted(format!(
                    "document {} has {} dims, index has {}",
                    id,
                    doc.embedding.len(),
                    query.len()
                )));
            }
            let score = cosine_similarity(query, &doc.embedding);
            if !score.is_finite() {
                return Err(RetrievalError::Corrupted(format!(
                    "non-finite similarity for document {}",
                    id
                )));
            }
            scored.push((score, id));
        }

        scored.sort_by(|a, b| match b.0.total_cmp(&a.0) {
            Ordering::Equal => a.1.cmp(b.1),
            other => other,
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(i, (score, id))| RetrievalResult {
                document_ref: id.clone(),
                similarity_score: score,
                rank: i + 1,
            })
            .collect())
    }
}

fn validate_query(query: &[f32], dims: Option<usize>) -> Result<(), RetrievalError> {
    if query.is_empty() {
        return Err(RetrievalError::MalformedQuery("empty query vector".into()));
    }
    if let Some(expected) = dims {
        if query.len() != expected {
            return Err(RetrievalError::DimensionMismatch {
                expected,
                actual: query.len(),
            });
        }
    }
    if query.iter().any(|x| !x.is_finite()) {
        return Err(RetrievalError::MalformedQuery(
            "query vector contains non-finite values".into(),
        ));
    }
    if l2_norm(query) <= f32::EPSILON {
        return Err(RetrievalError::MalformedQuery("query vector has zero norm".into()));
    }
    Ok(())
}

fn matches_filters(metadata: &Metadata, filters: &Metadata) -> bool {
    filters
        .iter()
        .all(|(k, v)| metadata.get(k).map(|m| m == v).unwrap_or(false))
}
