use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::constants::MAX_COLLECTION_NAME_LEN;
use crate::error::{KnowledgeError, KnowledgeResult};
use crate::knowledge::types::{CollectionStats, KnowledgeChunk, RetrievalResult, ScoredChunk};

/// Named collections of chunk + embedding records with nearest-neighbour search.
///
/// A collection is bound to one embedding provider and dimension by its first
/// insert and forgets that binding once its last record is removed. Inserts are
/// atomic: a concurrent query sees all of them or none.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Append records; `chunks[i]` is embedded as `embeddings[i]`. Returns rows added.
    async fn insert(
        &self,
        collection: &str,
        provider: &str,
        chunks: Vec<KnowledgeChunk>,
        embeddings: Vec<Vec<f32>>,
    ) -> KnowledgeResult<usize> {
        self.replace(collection, provider, &[], chunks, embeddings).await
    }

    /// Append records and drop the older records of `stale_sources`.
    ///
    /// The embedding space is checked before anything is removed, so a rejected
    /// call leaves the collection untouched.
    async fn replace(
        &self,
        collection: &str,
        provider: &str,
        stale_sources: &[String],
        chunks: Vec<KnowledgeChunk>,
        embeddings: Vec<Vec<f32>>,
    ) -> KnowledgeResult<usize>;

    /// Top `limit` records scoring at least `score_threshold`, score-descending,
    /// earliest insert first on ties. A missing collection yields an empty result.
    async fn query(
        &self,
        collection: &str,
        provider: &str,
        query_vector: &[f32],
        limit: usize,
        score_threshold: f32,
    ) -> KnowledgeResult<RetrievalResult>;

    /// Remove every record of a collection. Returns rows removed.
    async fn clear(&self, collection: &str) -> KnowledgeResult<usize>;

    /// Remove the records cut from one document. Returns rows removed.
    async fn delete_source(&self, collection: &str, source_id: &str) -> KnowledgeResult<usize>;

    /// Content hash stored for a document, if the collection holds it
    async fn source_hash(&self, collection: &str, source_id: &str)
        -> KnowledgeResult<Option<String>>;

    async fn stats(&self, collection: &str) -> KnowledgeResult<CollectionStats>;

    async fn list_collections(&self) -> KnowledgeResult<Vec<String>>;
}

/// Collection names double as table names: `[A-Za-z0-9_-]{1,64}`
pub fn validate_collection_name(name: &str) -> KnowledgeResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_COLLECTION_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(KnowledgeError::configuration(format!(
            "invalid collection name '{}': use 1-{} ASCII letters, digits, '_' or '-'",
            name, MAX_COLLECTION_NAME_LEN
        )))
    }
}

/// Cosine similarity; 0 when either vector has zero norm
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Checks shared by every backend before vectors are written
pub(crate) fn check_insert_shape(
    chunks: &[KnowledgeChunk],
    embeddings: &[Vec<f32>],
) -> KnowledgeResult<usize> {
    if chunks.len() != embeddings.len() {
        return Err(KnowledgeError::configuration(format!(
            "{} chunks but {} embeddings",
            chunks.len(),
            embeddings.len()
        )));
    }
    let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
    if dimension == 0 {
        return Err(KnowledgeError::configuration("embeddings must not be empty"));
    }
    if embeddings.iter().any(|e| e.len() != dimension) {
        return Err(KnowledgeError::configuration(
            "embeddings within one insert must share a dimension",
        ));
    }
    Ok(dimension)
}

/// Reject vectors from another embedding space
pub(crate) fn check_embedding_space(
    collection: &str,
    stored_provider: &str,
    stored_dimension: usize,
    provider: &str,
    dimension: usize,
) -> KnowledgeResult<()> {
    if stored_dimension != dimension {
        return Err(KnowledgeError::configuration(format!(
            "collection '{}' holds {}-dimensional embeddings, got {} dimensions",
            collection, stored_dimension, dimension
        )));
    }
    if stored_provider != provider {
        return Err(KnowledgeError::configuration(format!(
            "collection '{}' was built with embedding provider '{}', got '{}'",
            collection, stored_provider, provider
        )));
    }
    Ok(())
}

/// A stored record as seen by the ranking step
pub(crate) struct Candidate<'a> {
    pub sequence: u64,
    pub embedding: &'a [f32],
    pub chunk: &'a KnowledgeChunk,
}

/// Score candidates, drop those below threshold, order by score then insertion
pub(crate) fn rank<'a>(
    candidates: impl IntoIterator<Item = Candidate<'a>>,
    query_vector: &[f32],
    limit: usize,
    score_threshold: f32,
) -> RetrievalResult {
    if limit == 0 {
        return RetrievalResult::empty();
    }

    let mut scored: Vec<(f32, Candidate<'a>)> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let score = cosine_similarity(query_vector, candidate.embedding);
            (score >= score_threshold).then_some((score, candidate))
        })
        .collect();

    scored.sort_by(|(score_a, a), (score_b, b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.sequence.cmp(&b.sequence))
    });
    scored.truncate(limit);

    RetrievalResult::new(
        scored
            .into_iter()
            .map(|(score, candidate)| ScoredChunk {
                chunk: candidate.chunk.clone(),
                score,
                sequence: candidate.sequence,
            })
            .collect(),
    )
}

struct Record {
    sequence: u64,
    chunk: KnowledgeChunk,
    embedding: Vec<f32>,
}

struct Collection {
    provider: String,
    dimension: usize,
    next_sequence: u64,
    records: Vec<Record>,
}

/// Process-local store guarded by a reader/writer lock
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn replace(
        &self,
        collection: &str,
        provider: &str,
        stale_sources: &[String],
        chunks: Vec<KnowledgeChunk>,
        embeddings: Vec<Vec<f32>>,
    ) -> KnowledgeResult<usize> {
        validate_collection_name(collection)?;
        if chunks.is_empty() && embeddings.is_empty() {
            let mut removed = 0;
            for source_id in stale_sources {
                removed += self.delete_source(collection, source_id).await?;
            }
            debug!(collection, removed, "Removed stale knowledge chunks");
            return Ok(0);
        }
        let dimension = check_insert_shape(&chunks, &embeddings)?;

        let mut collections = self.collections.write().await;
        let entry = collections
            .entry(collection.to_string())
            .or_insert_with(|| Collection {
                provider: provider.to_string(),
                dimension,
                next_sequence: 0,
                records: Vec::new(),
            });
        check_embedding_space(collection, &entry.provider, entry.dimension, provider, dimension)?;

        let stale: HashSet<&str> = stale_sources.iter().map(String::as_str).collect();
        entry
            .records
            .retain(|r| !stale.contains(r.chunk.source_id.as_str()));

        let count = chunks.len();
        for (chunk, embedding) in chunks.into_iter().zip(embeddings) {
            entry.records.push(Record {
                sequence: entry.next_sequence,
                chunk,
                embedding,
            });
            entry.next_sequence += 1;
        }

        debug!(collection, count, "Inserted knowledge chunks");
        Ok(count)
    }

    async fn query(
        &self,
        collection: &str,
        provider: &str,
        query_vector: &[f32],
        limit: usize,
        score_threshold: f32,
    ) -> KnowledgeResult<RetrievalResult> {
        let collections = self.collections.read().await;
        let Some(entry) = collections.get(collection) else {
            return Ok(RetrievalResult::empty());
        };
        check_embedding_space(
            collection,
            &entry.provider,
            entry.dimension,
            provider,
            query_vector.len(),
        )?;

        let candidates = entry.records.iter().map(|r| Candidate {
            sequence: r.sequence,
            embedding: &r.embedding,
            chunk: &r.chunk,
        });
        Ok(rank(candidates, query_vector, limit, score_threshold))
    }

    async fn clear(&self, collection: &str) -> KnowledgeResult<usize> {
        let removed = self
            .collections
            .write()
            .await
            .remove(collection)
            .map(|c| c.records.len())
            .unwrap_or(0);
        info!(collection, removed, "Cleared knowledge collection");
        Ok(removed)
    }

    async fn delete_source(&self, collection: &str, source_id: &str) -> KnowledgeResult<usize> {
        let mut collections = self.collections.write().await;
        let Some(entry) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = entry.records.len();
        entry.records.retain(|r| r.chunk.source_id != source_id);
        let removed = before - entry.records.len();
        if entry.records.is_empty() {
            collections.remove(collection);
        }
        Ok(removed)
    }

    async fn source_hash(
        &self,
        collection: &str,
        source_id: &str,
    ) -> KnowledgeResult<Option<String>> {
        let collections = self.collections.read().await;
        Ok(collections.get(collection).and_then(|entry| {
            entry
                .records
                .iter()
                .find(|r| r.chunk.source_id == source_id)
                .map(|r| r.chunk.content_hash.clone())
        }))
    }

    async fn stats(&self, collection: &str) -> KnowledgeResult<CollectionStats> {
        let collections = self.collections.read().await;
        let Some(entry) = collections.get(collection) else {
            return Ok(CollectionStats::empty(collection));
        };
        let sources: HashSet<&str> = entry
            .records
            .iter()
            .map(|r| r.chunk.source_id.as_str())
            .collect();

        Ok(CollectionStats {
            collection: collection.to_string(),
            total_sources: sources.len(),
            total_chunks: entry.records.len(),
            dimension: Some(entry.dimension),
            provider: Some(entry.provider.clone()),
        })
    }

    async fn list_collections(&self) -> KnowledgeResult<Vec<String>> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
