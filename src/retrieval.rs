//! Retrieval index over extracted document chunks.

use crate::documents::DocumentChunk;
use crate::error::{Error, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, trace};

static TERM_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\p{L}\p{N}_]+").expect("Invalid term regex"));

/// A store that is populated once per run and then queried.
#[async_trait]
pub trait RetrievalIndex: Send + Sync {
    /// Adds the documents of a run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexAlreadyInitialized`] if documents were already added.
    async fn index_documents(&self, documents: Vec<DocumentChunk>) -> Result<usize>;

    /// Returns up to `k` documents, best match first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexNotInitialized`] before [`RetrievalIndex::index_documents`].
    async fn query(&self, question: &str, k: usize) -> Result<Vec<DocumentChunk>>;

    /// Whether documents have been added.
    fn is_initialized(&self) -> bool;
}

struct IndexedChunk {
    chunk: DocumentChunk,
    terms: HashSet<String>,
}

/// In-memory index scoring documents by term overlap with the question.
#[derive(Default)]
pub struct MemoryIndex {
    entries: RwLock<Option<Vec<IndexedChunk>>>,
}

impl MemoryIndex {
    /// Creates an empty, uninitialized index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().as_ref().map_or(0, Vec::len)
    }

    /// Returns true if nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RetrievalIndex for MemoryIndex {
    async fn index_documents(&self, documents: Vec<DocumentChunk>) -> Result<usize> {
        let mut entries = self.entries.write();
        if entries.is_some() {
            return Err(Error::IndexAlreadyInitialized);
        }

        let indexed: Vec<IndexedChunk> = documents
            .into_iter()
            .map(|chunk| IndexedChunk {
                terms: terms(&chunk.page_content),
                chunk,
            })
            .collect();

        let count = indexed.len();
        *entries = Some(indexed);
        debug!("Indexed {} documents", count);
        Ok(count)
    }

    async fn query(&self, question: &str, k: usize) -> Result<Vec<DocumentChunk>> {
        let entries = self.entries.read();
        let indexed = entries.as_ref().ok_or(Error::IndexNotInitialized)?;

        let query_terms = terms(question);
        let mut scored: Vec<(f64, usize)> = indexed
            .iter()
            .enumerate()
            .map(|(position, entry)| (score(&query_terms, &entry.terms), position))
            .collect();

        // Best score first; earlier documents win ties.
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        let results: Vec<DocumentChunk> = scored
            .into_iter()
            .take(k)
            .map(|(_, position)| indexed[position].chunk.clone())
            .collect();

        trace!("Query {:?} matched {} documents", question, results.len());
        Ok(results)
    }

    fn is_initialized(&self) -> bool {
        self.entries.read().is_some()
    }
}

fn terms(text: &str) -> HashSet<String> {
    TERM_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Fraction of query terms present in the document, with Jaccard
/// similarity as a small tie-breaker favouring focused chunks.
fn score(query: &HashSet<String>, document: &HashSet<String>) -> f64 {
    if query.is_empty() || document.is_empty() {
        return 0.0;
    }

    let shared = query.intersection(document).count() as f64;
    let union = query.union(document).count() as f64;

    shared / query.len() as f64 + 0.1 * (shared / union)
}
