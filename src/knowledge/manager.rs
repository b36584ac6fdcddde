use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::{Config, KnowledgeConfig, StoreBackend, StoreConfig};
use crate::constants::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::embedding::Embedder;
use crate::error::{KnowledgeError, KnowledgeResult};
use crate::knowledge::chunker::{ChunkParams, TextChunker};
use crate::knowledge::lance::LanceStore;
use crate::knowledge::source::{KnowledgeSource, SourceLoader};
use crate::knowledge::store::{validate_collection_name, MemoryStore, VectorStore};
use crate::knowledge::types::{
    CollectionStats, IngestMode, IngestReport, KnowledgeChunk, RetrievalResult, SourceOutcome,
};

const DEFAULT_BATCH_SIZE: usize = 32;
const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Open the store backend named by the configuration
pub async fn open_store(config: &StoreConfig) -> KnowledgeResult<Arc<dyn VectorStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Lance => {
            let path = match &config.path {
                Some(path) => path.clone(),
                None => crate::storage::get_knowledge_database_path().map_err(|e| {
                    KnowledgeError::configuration(format!("no knowledge store location: {:#}", e))
                })?,
            };
            Ok(Arc::new(LanceStore::open(&path).await?))
        }
    }
}

/// One collection plus the pipeline that fills it: load, chunk, embed, store.
///
/// Knowledge bases for different scopes can share one store and one embedder;
/// each only ever touches its own collection.
#[derive(Clone)]
pub struct KnowledgeBase {
    collection: String,
    store: Arc<dyn VectorStore>,
    embedder: Arc<Embedder>,
    loader: SourceLoader,
    chunk_params: ChunkParams,
    batch_size: usize,
    permits: Arc<Semaphore>,
    config: Option<KnowledgeConfig>,
}

/// Chunks and vectors for one source, ready to be committed
struct PreparedSource {
    source_id: String,
    documents: usize,
    documents_cached: usize,
    /// Documents whose stored chunks are outdated
    replaced: Vec<String>,
    chunks: Vec<KnowledgeChunk>,
    embeddings: Vec<Vec<f32>>,
}

impl PreparedSource {
    /// Drop documents an earlier source of the same call already carries
    fn skip_claimed(&mut self, claimed: &mut HashSet<String>) {
        let mine: HashSet<String> = self
            .chunks
            .iter()
            .map(|c| c.source_id.clone())
            .chain(self.replaced.iter().cloned())
            .collect();
        let taken: HashSet<String> = mine
            .into_iter()
            .filter(|id| !claimed.insert(id.clone()))
            .collect();
        if taken.is_empty() {
            return;
        }

        debug!(source = %self.source_id, documents = taken.len(), "Skipping duplicate documents");
        let pairs = std::mem::take(&mut self.chunks)
            .into_iter()
            .zip(std::mem::take(&mut self.embeddings));
        let (chunks, embeddings): (Vec<KnowledgeChunk>, Vec<Vec<f32>>) = pairs
            .filter(|(chunk, _)| !taken.contains(&chunk.source_id))
            .unzip();
        self.chunks = chunks;
        self.embeddings = embeddings;
        self.replaced.retain(|id| !taken.contains(id));
        self.documents_cached += taken.len();
    }
}

impl KnowledgeBase {
    pub fn new(
        collection: impl Into<String>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<Embedder>,
    ) -> KnowledgeResult<Self> {
        let collection = collection.into();
        validate_collection_name(&collection)?;

        Ok(Self {
            collection,
            store,
            embedder,
            loader: SourceLoader::new(DEFAULT_FETCH_TIMEOUT)?,
            chunk_params: ChunkParams::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)?,
            batch_size: DEFAULT_BATCH_SIZE,
            permits: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
            config: None,
        })
    }

    /// Build the crew-level knowledge base described by the configuration
    pub async fn from_config(config: &Config) -> KnowledgeResult<Self> {
        config.validate()?;
        let store = open_store(&config.store).await?;
        let embedder = Arc::new(Embedder::from_config(&config.embedding).await?);

        Ok(Self::new(&config.knowledge.collection_name, store, embedder)?
            .with_chunking(ChunkParams::new(
                config.knowledge.chunk_size,
                config.knowledge.chunk_overlap,
            )?)
            .with_loader(SourceLoader::new(Duration::from_secs(
                config.knowledge.fetch_timeout_secs,
            ))?)
            .with_batching(config.embedding.batch_size, config.embedding.concurrency)
            .with_config(config.search))
    }

    pub fn with_chunking(mut self, params: ChunkParams) -> Self {
        self.chunk_params = params;
        self
    }

    pub fn with_loader(mut self, loader: SourceLoader) -> Self {
        self.loader = loader;
        self
    }

    /// Texts per embedding request and how many requests may run at once
    pub fn with_batching(mut self, batch_size: usize, concurrency: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self.permits = Arc::new(Semaphore::new(concurrency.max(1)));
        self
    }

    /// Retrieval parameters used when this knowledge base is queried as a scope
    pub fn with_config(mut self, config: KnowledgeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Same store, embedder and ingestion settings, different collection
    pub fn for_collection(&self, collection: impl Into<String>) -> KnowledgeResult<Self> {
        let collection = collection.into();
        validate_collection_name(&collection)?;
        Ok(Self {
            collection,
            config: None,
            ..self.clone()
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn embedder(&self) -> &Arc<Embedder> {
        &self.embedder
    }

    pub fn config(&self) -> Option<KnowledgeConfig> {
        self.config
    }

    /// Ingest one source, failing if it fails
    pub async fn add(&self, source: KnowledgeSource) -> KnowledgeResult<SourceOutcome> {
        let mut report = self.add_sources(vec![source], IngestMode::Isolated).await?;
        let outcome = report.outcomes.remove(0);
        match outcome.error {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    /// Ingest sources concurrently and commit them in input order.
    ///
    /// In `Isolated` mode every source gets its own outcome and the call only
    /// fails on errors that affect the whole collection. In `AllOrNothing` mode
    /// every source is written by one store call; the first failing source is
    /// returned as the error and nothing is stored.
    ///
    /// A document id claimed by an earlier source of the same call is skipped
    /// in later sources.
    pub async fn add_sources(
        &self,
        sources: Vec<KnowledgeSource>,
        mode: IngestMode,
    ) -> KnowledgeResult<IngestReport> {
        let total = sources.len();
        info!(collection = %self.collection, sources = total, ?mode, "Ingesting knowledge sources");

        let concurrency = total.clamp(1, 16);
        let prepared: Vec<(String, KnowledgeResult<PreparedSource>)> = stream::iter(sources)
            .map(|source| async move {
                let id = source.id().to_string();
                let result = self.prepare(&source).await;
                (id, result)
            })
            .buffered(concurrency)
            .collect()
            .await;

        let mut claimed = HashSet::new();

        if mode == IngestMode::AllOrNothing {
            let mut ready = Vec::with_capacity(prepared.len());
            for (source_id, result) in prepared {
                match result {
                    Ok(mut source) => {
                        source.skip_claimed(&mut claimed);
                        ready.push(source);
                    }
                    Err(err) => {
                        warn!(source = %source_id, error = %err, "Source failed, nothing stored");
                        return Err(err);
                    }
                }
            }
            return self.commit_all(ready).await;
        }

        let mut report = IngestReport::default();
        for (source_id, result) in prepared {
            let outcome = match result {
                Ok(mut source) => {
                    source.skip_claimed(&mut claimed);
                    self.commit(source).await
                }
                Err(err) => {
                    warn!(source = %source_id, error = %err, "Knowledge source failed");
                    SourceOutcome {
                        source_id,
                        documents: 0,
                        chunks_created: 0,
                        documents_cached: 0,
                        error: Some(err),
                    }
                }
            };
            report.outcomes.push(outcome);
        }

        info!(
            collection = %self.collection,
            chunks = report.chunks_created(),
            failed = report.failures().count(),
            "Knowledge ingestion finished"
        );
        Ok(report)
    }

    /// Load, chunk and embed one source without touching the store's contents
    async fn prepare(&self, source: &KnowledgeSource) -> KnowledgeResult<PreparedSource> {
        let documents = source.load(&self.loader).await?;
        let chunker = TextChunker::from_params(source.chunking().unwrap_or(self.chunk_params));

        let mut prepared = PreparedSource {
            source_id: source.id().to_string(),
            documents: documents.len(),
            documents_cached: 0,
            replaced: Vec::new(),
            chunks: Vec::new(),
            embeddings: Vec::new(),
        };

        for document in &documents {
            let hash = crate::storage::content_hash(&document.text);
            match self.store.source_hash(&self.collection, &document.id).await? {
                Some(stored) if stored == hash => {
                    debug!(document = %document.id, "Unchanged document, skipping");
                    prepared.documents_cached += 1;
                    continue;
                }
                Some(_) => prepared.replaced.push(document.id.clone()),
                None => {}
            }
            prepared
                .chunks
                .extend(chunker.chunk_document(document, &self.collection));
        }

        prepared.embeddings = self.embed_chunks(&prepared.chunks).await?;
        debug!(
            source = %prepared.source_id,
            documents = prepared.documents,
            chunks = prepared.chunks.len(),
            "Prepared knowledge source"
        );
        Ok(prepared)
    }

    /// Embed chunk contents batch by batch, keeping chunk order
    async fn embed_chunks(&self, chunks: &[KnowledgeChunk]) -> KnowledgeResult<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let _permit = self.permits.acquire().await.map_err(|e| {
                KnowledgeError::provider_with(
                    self.embedder.fingerprint(),
                    "embedding pool closed",
                    e,
                )
            })?;
            embeddings.extend(self.embedder.embed_batch(texts).await?);
        }
        Ok(embeddings)
    }

    async fn commit(&self, source: PreparedSource) -> SourceOutcome {
        let mut outcome = SourceOutcome {
            source_id: source.source_id,
            documents: source.documents,
            chunks_created: 0,
            documents_cached: source.documents_cached,
            error: None,
        };

        match self
            .store
            .replace(
                &self.collection,
                &self.embedder.fingerprint(),
                &source.replaced,
                source.chunks,
                source.embeddings,
            )
            .await
        {
            Ok(count) => outcome.chunks_created = count,
            Err(err) => outcome.error = Some(err),
        }
        outcome
    }

    /// Write every prepared source with a single store call
    async fn commit_all(&self, sources: Vec<PreparedSource>) -> KnowledgeResult<IngestReport> {
        let mut report = IngestReport::default();
        let mut replaced = Vec::new();
        let mut chunks = Vec::new();
        let mut embeddings = Vec::new();

        for source in sources {
            report.outcomes.push(SourceOutcome {
                source_id: source.source_id,
                documents: source.documents,
                chunks_created: source.chunks.len(),
                documents_cached: source.documents_cached,
                error: None,
            });
            replaced.extend(source.replaced);
            chunks.extend(source.chunks);
            embeddings.extend(source.embeddings);
        }

        let count = self
            .store
            .replace(
                &self.collection,
                &self.embedder.fingerprint(),
                &replaced,
                chunks,
                embeddings,
            )
            .await?;
        info!(collection = %self.collection, chunks = count, "Knowledge ingestion committed");
        Ok(report)
    }

    /// Embed `text` and search this collection
    pub async fn query(
        &self,
        text: &str,
        config: &KnowledgeConfig,
    ) -> KnowledgeResult<RetrievalResult> {
        let vector = self.embedder.embed(text).await?;
        self.query_vector(&vector, config).await
    }

    /// Search this collection with an already computed query vector
    pub async fn query_vector(
        &self,
        vector: &[f32],
        config: &KnowledgeConfig,
    ) -> KnowledgeResult<RetrievalResult> {
        config.validate()?;
        self.store
            .query(
                &self.collection,
                &self.embedder.fingerprint(),
                vector,
                config.results_limit,
                config.score_threshold,
            )
            .await
    }

    /// Destructive, unconditional wipe of this collection
    pub async fn reset(&self) -> KnowledgeResult<usize> {
        self.store.clear(&self.collection).await
    }

    pub async fn delete_source(&self, source_id: &str) -> KnowledgeResult<usize> {
        self.store.delete_source(&self.collection, source_id).await
    }

    pub async fn stats(&self) -> KnowledgeResult<CollectionStats> {
        self.store.stats(&self.collection).await
    }

    pub async fn list_collections(&self) -> KnowledgeResult<Vec<String>> {
        self.store.list_collections().await
    }
}
