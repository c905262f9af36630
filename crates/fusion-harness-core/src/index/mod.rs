//! Snapshot-isolated vector index.
//!
//! The index is single-writer / multi-reader:
//!
//! ```text
//!  upsert / remove ──▶ Mutex<WriterState>  (staged document set)
//!                            │ publish / rebuild
//!                            ▼
//!  search ◀── RwLock<Arc<IndexSnapshot>>   (atomic pointer swap)
//! ```
//!
//! Writers mutate a private staged copy under a mutex and publish a fresh
//! [`IndexSnapshot`] by swapping an `Arc`. Readers clone the `Arc` and
//! search without holding any lock, so a rebuild never blocks a search
//! and a search never observes a half-built index.
//!
//! Documents are keyed by the SHA-256 of their text, so re-ingesting an
//! identical chunk replaces it in place and returns the same reference.

mod snapshot;

pub use snapshot::IndexSnapshot;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info};

use crate::error::RetrievalError;
use crate::models::{Document, DocumentRef, Metadata, RetrievalResult};

#[derive(Debug, Clone, Default)]
struct WriterState {
    docs: BTreeMap<DocumentRef, Arc<Document>>,
    dims: Option<usize>,
    generation: u64,
    populated: bool,
    dirty: bool,
}

/// Cosine-similarity vector index with atomic snapshot publication.
#[derive(Debug, Default)]
pub struct VectorIndex {
    writer: Mutex<WriterState>,
    current: RwLock<Arc<IndexSnapshot>>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an index from persisted documents at a known generation.
    pub fn restore(generation: u64, docs: Vec<Document>) -> Result<Self, RetrievalError> {
        let index = Self::new();
        {
            let mut w = index.lock_writer();
            for doc in docs {
                stage(&mut w, doc)?;
            }
            w.generation = generation;
            w.populated |= generation > 0;
            w.dirty = false;
            let snap = build_snapshot(&w);
            index.swap(snap);
        }
        Ok(index)
    }

    /// Store or replace a document and publish immediately.
    pub fn upsert(&self, doc: Document) -> Result<DocumentRef, RetrievalError> {
        let mut w = self.lock_writer();
        let id = stage(&mut w, doc)?;
        self.publish(&mut w);
        Ok(id)
    }

    /// Stage a document without publishing. Call [`VectorIndex::rebuild`]
    /// after a bulk load.
    pub fn upsert_staged(&self, doc: Document) -> Result<DocumentRef, RetrievalError> {
        let mut w = self.lock_writer();
        stage(&mut w, doc)
    }

    /// Stage every document and publish them in one new generation, or
    /// none of them: if any document is rejected the staged set is left
    /// exactly as it was.
    pub fn upsert_batch(
        &self,
        docs: Vec<Document>,
    ) -> Result<(Vec<DocumentRef>, u64), RetrievalError> {
        let mut w = self.lock_writer();
        let mut next = w.clone();
        let ids = docs
            .into_iter()
            .map(|doc| stage(&mut next, doc))
            .collect::<Result<Vec<_>, _>>()?;
        next.dirty = true;
        *w = next;
        self.publish(&mut w);
        Ok((ids, w.generation))
    }

    /// Remove a document and publish. Returns `false` if it was absent.
    pub fn remove(&self, id: &DocumentRef) -> bool {
        let mut w = self.lock_writer();
        if w.docs.remove(id).is_none() {
            return false;
        }
        if w.docs.is_empty() {
            w.dims = None;
        }
        w.dirty = true;
        self.publish(&mut w);
        true
    }

    /// Publish the staged document set as a new snapshot. Returns the
    /// generation readers now see.
    pub fn rebuild(&self) -> u64 {
        let mut w = self.lock_writer();
        w.dirty = true;
        self.publish(&mut w);
        w.generation
    }

    /// Search the current snapshot. See [`IndexSnapshot::search`].
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filters: &Metadata,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        self.snapshot().search(query, k, filters)
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn get(&self, id: &DocumentRef) -> Option<Arc<Document>> {
        self.snapshot().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().generation()
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, WriterState> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, w: &mut WriterState) {
        if !w.dirty {
            return;
        }
        w.generation += 1;
        w.dirty = false;
        let snap = build_snapshot(w);
        info!(
            generation = snap.generation(),
            documents = snap.len(),
            "index snapshot published"
        );
        self.swap(snap);
    }

    fn swap(&self, snap: IndexSnapshot) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(snap);
    }
}

fn build_snapshot(w: &WriterState) -> IndexSnapshot {
    IndexSnapshot::new(w.generation, w.dims, w.populated, w.docs.clone())
}

/// Validate and stage one document. The id is always re-derived from the
/// text so callers cannot alias two different chunks.
fn stage(w: &mut WriterState, mut doc: Document) -> Result<DocumentRef, RetrievalError> {
    if doc.embedding.is_empty() {
        return Err(RetrievalError::MalformedDocument("empty embedding".into()));
    }
    if doc.embedding.iter().any(|x| !x.is_finite()) {
        return Err(RetrievalError::MalformedDocument(
            "embedding contains non-finite values".into(),
        ));
    }
    if let Some(expected) = w.dims {
        if doc.embedding.len() != expected {
            return Err(RetrievalError::DimensionMismatch {
                expected,
                actual: doc.embedding.len(),
            });
        }
    }

    doc.id = DocumentRef::from_content(&doc.text_chunk);
    let id = doc.id.clone();
    let unchanged = w
        .docs
        .get(&id)
        .map(|existing| existing.as_ref() == &doc)
        .unwrap_or(false);
    if !unchanged {
        debug!(document = %id, "staged document");
        w.dims = Some(doc.embedding.len());
        w.docs.insert(id.clone(), Arc::new(doc));
        w.dirty = true;
    }
    w.populated = true;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(text: &str, v: Vec<f32>) -> Document {
        Document::new(text, v, Metadata::new())
    }

    fn tagged(text: &str, v: Vec<f32>, key: &str, value: &str) -> Document {
        let mut m = Metadata::new();
        m.insert(key.into(), value.into());
        Document::new(text, v, m)
    }

    #[test]
    fn test_empty_index_errors_until_first_ingest() {
        let index = VectorIndex::new();
        let err = index.search(&[1.0, 0.0], 3, &Metadata::new()).unwrap_err();
        assert!(matches!(err, RetrievalError::IndexEmpty));

        let id = index.upsert(doc("a", vec![1.0, 0.0])).unwrap();
        assert!(index.remove(&id));
        let results = index.search(&[1.0, 0.0], 3, &Metadata::new()).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let index = VectorIndex::new();
        let a = index.upsert(doc("same text", vec![1.0, 0.0])).unwrap();
        let gen = index.generation();
        let b = index.upsert(doc("same text", vec![1.0, 0.0])).unwrap();
        assert_eq!(a, b);
        assert_eq!(index.len(), 1);
        assert_eq!(index.generation(), gen);
    }

    #[test]
    fn test_reingest_replaces_embedding() {
        let index = VectorIndex::new();
        let a = index.upsert(doc("t", vec![1.0, 0.0])).unwrap();
        let b = index.upsert(doc("t", vec![0.0, 1.0])).unwrap();
        assert_eq!(a, b);
        assert_eq!(index.get(&a).unwrap().embedding, vec![0.0, 1.0]);
    }

    #[test]
    fn test_search_orders_and_ranks() {
        let index = VectorIndex::new();
        index.upsert(doc("x", vec![1.0, 0.0])).unwrap();
        index.upsert(doc("y", vec![0.6, 0.8])).unwrap();
        index.upsert(doc("z", vec![0.0, 1.0])).unwrap();

        let results = index.search(&[1.0, 0.0], 5, &Metadata::new()).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].document_ref, DocumentRef::from_content("x"));
        assert_eq!(
            results.iter().map(|r| r.rank).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(results[0].similarity_score > results[1].similarity_score);
        assert!(results[1].similarity_score > results[2].similarity_score);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let index = VectorIndex::new();
        index.upsert(doc("first", vec![1.0, 0.0])).unwrap();
        index.upsert(doc("second", vec![2.0, 0.0])).unwrap();
        let results = index.search(&[1.0, 0.0], 2, &Metadata::new()).unwrap();
        assert!(results[0].document_ref < results[1].document_ref);
    }

    #[test]
    fn test_filters_restrict_candidates() {
        let index = VectorIndex::new();
        index
            .upsert(tagged("cardio", vec![1.0, 0.0], "topic", "heart"))
            .unwrap();
        index
            .upsert(tagged("endo", vec![1.0, 0.1], "topic", "diabetes"))
            .unwrap();

        let mut filters = Metadata::new();
        filters.insert("topic".into(), "diabetes".into());
        let results = index.search(&[1.0, 0.0], 5, &filters).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_ref, DocumentRef::from_content("endo"));
    }

    #[test]
    fn test_malformed_queries() {
        let index = VectorIndex::new();
        index.upsert(doc("a", vec![1.0, 0.0])).unwrap();
        let none = Metadata::new();
        assert!(matches!(
            index.search(&[1.0, 0.0], 0, &none),
            Err(RetrievalError::MalformedQuery(_))
        ));
        assert!(matches!(
            index.search(&[1.0, 0.0, 0.0], 1, &none),
            Err(RetrievalError::DimensionMismatch { expected: 2, actual: 3 })
        ));
        assert!(matches!(
            index.search(&[f32::NAN, 0.0], 1, &none),
            Err(RetrievalError::MalformedQuery(_))
        ));
        assert!(matches!(
            index.search(&[0.0, 0.0], 1, &none),
            Err(RetrievalError::MalformedQuery(_))
        ));
    }

    #[test]
    fn test_upsert_rejects_dimension_change() {
        let index = VectorIndex::new();
        index.upsert(doc("a", vec![1.0, 0.0])).unwrap();
        let err = index.upsert(doc("b", vec![1.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(err, RetrievalError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_staged_writes_invisible_until_rebuild() {
        let index = VectorIndex::new();
        index.upsert(doc("a", vec![1.0, 0.0])).unwrap();
        let before = index.snapshot();

        index.upsert_staged(doc("b", vec![0.0, 1.0])).unwrap();
        index.upsert_staged(doc("c", vec![0.7, 0.7])).unwrap();
        assert_eq!(index.len(), 1);

        let gen = index.rebuild();
        assert_eq!(gen, before.generation() + 1);
        assert_eq!(index.len(), 3);
        // a reader holding the old snapshot still sees the old world
        assert_eq!(before.len(), 1);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let index = VectorIndex::new();
        index.upsert(doc("a", vec![1.0, 0.0])).unwrap();
        let gen = index.generation();

        let err = index
            .upsert_batch(vec![doc("b", vec![0.0, 1.0]), doc("c", vec![1.0, 0.0, 0.0])])
            .unwrap_err();
        assert!(matches!(err, RetrievalError::DimensionMismatch { .. }));
        assert_eq!(index.generation(), gen);

        // a later publish must not drag in the rejected batch
        index.upsert(doc("d", vec![0.5, 0.5])).unwrap();
        assert_eq!(index.len(), 2);
        assert!(index.get(&DocumentRef::from_content("b")).is_none());

        let (ids, published) = index
            .upsert_batch(vec![doc("e", vec![0.0, 1.0]), doc("f", vec![1.0, 1.0])])
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(published, index.generation());
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_snapshot_resolves_its_own_hits_after_remove() {
        let index = VectorIndex::new();
        let a = index.upsert(doc("a", vec![1.0, 0.0])).unwrap();
        index.upsert(doc("b", vec![0.0, 1.0])).unwrap();

        let snap = index.snapshot();
        let hits = snap.search(&[1.0, 0.0], 2, &Metadata::new()).unwrap();
        assert!(index.remove(&a));

        // the live index has moved on; the held snapshot has not
        assert!(index.get(&a).is_none());
        for hit in &hits {
            assert!(snap.get(&hit.document_ref).is_some());
        }
    }

    #[test]
    fn test_restore_keeps_generation() {
        let docs = vec![doc("a", vec![1.0, 0.0]), doc("b", vec![0.0, 1.0])];
        let index = VectorIndex::restore(7, docs).unwrap();
        assert_eq!(index.generation(), 7);
        assert_eq!(index.len(), 2);
        index.upsert(doc("c", vec![0.5, 0.5])).unwrap();
        assert_eq!(index.generation(), 8);
    }

    #[test]
    fn test_concurrent_readers_during_rebuild() {
        let index = Arc::new(VectorIndex::new());
        for i in 0..20 {
            index
                .upsert(doc(&format!("doc {i}"), vec![1.0, i as f32]))
                .unwrap();
        }
        let mut handles = Vec::new();
        for _ in 0..4 {
            let idx = Arc::clone(&index);
            handles.push(std::thread::spawn(move || {
                for _ in 0..50 {
                    let snap = idx.snapshot();
                    let n = snap.len();
                    let res = snap.search(&[1.0, 1.0], 100, &Metadata::new()).unwrap();
                    assert_eq!(res.len(), n);
                }
            }));
        }
        for i in 20..40 {
            index
                .upsert_staged(doc(&format!("doc {i}"), vec![1.0, i as f32]))
                .unwrap();
            if i % 5 == 0 {
                index.rebuild();
            }
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
