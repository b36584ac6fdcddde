use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::KnowledgeError;

/// Key/value metadata attached to sources and inherited by their chunks
pub type Metadata = BTreeMap<String, String>;

/// Represents a chunk of knowledge content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub id: String,
    /// Document the chunk was cut from (file path, URL or inline-text id)
    pub source_id: String,
    pub collection: String,
    pub chunk_index: usize,
    pub content: String,
    /// Character span within the normalized document text, end exclusive
    pub char_start: usize,
    pub char_end: usize,
    /// Hash of the whole normalized document
    pub content_hash: String,
    pub metadata: Metadata,
}

/// A chunk with its similarity to the query
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: KnowledgeChunk,
    pub score: f32,
    /// Insertion order within the collection, used to break score ties
    pub sequence: u64,
}

/// Score-descending hits of one collection query, already limited and thresholded
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalResult {
    pub entries: Vec<ScoredChunk>,
}

impl RetrievalResult {
    pub fn new(entries: Vec<ScoredChunk>) -> Self {
        Self { entries }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ScoredChunk> {
        self.entries.iter()
    }

    pub fn passages(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|e| e.chunk.content.as_str())
            .collect()
    }
}

impl IntoIterator for RetrievalResult {
    type Item = ScoredChunk;
    type IntoIter = std::vec::IntoIter<ScoredChunk>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Statistics about one collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStats {
    pub collection: String,
    pub total_sources: usize,
    pub total_chunks: usize,
    pub dimension: Option<usize>,
    pub provider: Option<String>,
}

impl CollectionStats {
    pub fn empty(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            total_sources: 0,
            total_chunks: 0,
            dimension: None,
            provider: None,
        }
    }
}

/// Whether a failing source aborts the whole ingestion call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IngestMode {
    /// Each source succeeds or fails on its own
    #[default]
    Isolated,
    /// Nothing is stored unless every source succeeds
    AllOrNothing,
}

/// Result of ingesting one knowledge source
#[derive(Debug)]
pub struct SourceOutcome {
    pub source_id: String,
    pub documents: usize,
    pub chunks_created: usize,
    /// Documents skipped because identical content was already stored
    pub documents_cached: usize,
    pub error: Option<KnowledgeError>,
}

impl SourceOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of an ingestion call, one outcome per source in input order
#[derive(Debug, Default)]
pub struct IngestReport {
    pub outcomes: Vec<SourceOutcome>,
}

impl IngestReport {
    pub fn chunks_created(&self) -> usize {
        self.outcomes.iter().map(|o| o.chunks_created).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SourceOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.is_success())
    }
}
