use arrow::record_batch::RecordBatchIterator;
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, StringArray,
    TimestampMillisecondArray,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use lancedb::{
    connect,
    query::{ExecutableQuery, QueryBase},
    Connection, Table,
};
use std::collections::{HashMap, HashSet};
use std::iter::once;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::constants::COLLECTION_TABLE_PREFIX;
use crate::error::{KnowledgeError, KnowledgeResult};
use crate::knowledge::store::{
    check_embedding_space, check_insert_shape, rank, validate_collection_name, Candidate,
    VectorStore,
};
use crate::knowledge::types::{CollectionStats, KnowledgeChunk, Metadata, RetrievalResult};

/// LanceDB-backed store, one table per collection.
///
/// Every insert is a single `add` commit, so a concurrent scan sees all of its
/// rows or none. A replacing insert adds before it deletes: a scan may briefly
/// see both versions of a document, never neither. Writers inside one process
/// are serialised so insertion sequence numbers stay dense and ordered.
pub struct LanceStore {
    db: Connection,
    /// Next insertion sequence per collection, loaded lazily from the table
    sequences: Mutex<HashMap<String, u64>>,
}

/// One decoded row
struct StoredRow {
    sequence: u64,
    provider: String,
    chunk: KnowledgeChunk,
    embedding: Vec<f32>,
}

impl LanceStore {
    pub async fn open(path: &Path) -> KnowledgeResult<Self> {
        std::fs::create_dir_all(path).map_err(|e| {
            KnowledgeError::storage_with(
                format!("failed to create store directory {}", path.display()),
                e,
            )
        })?;
        let uri = path.to_str().ok_or_else(|| {
            KnowledgeError::configuration(format!(
                "store path is not valid UTF-8: {}",
                path.display()
            ))
        })?;

        let db = connect(uri).execute().await?;
        debug!(path = %path.display(), "Opened LanceDB knowledge store");

        Ok(Self {
            db,
            sequences: Mutex::new(HashMap::new()),
        })
    }

    fn table_name(collection: &str) -> String {
        format!("{}{}", COLLECTION_TABLE_PREFIX, collection)
    }

    fn quote_filter_string(input: &str) -> String {
        input.replace('\'', "''")
    }

    fn schema(dimension: usize) -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("sequence", DataType::Int64, false),
            Field::new("id", DataType::Utf8, false),
            Field::new("source_id", DataType::Utf8, false),
            Field::new("collection", DataType::Utf8, false),
            Field::new("chunk_index", DataType::Int64, false),
            Field::new("content", DataType::Utf8, false),
            Field::new("char_start", DataType::Int64, false),
            Field::new("char_end", DataType::Int64, false),
            Field::new("content_hash", DataType::Utf8, false),
            Field::new("metadata", DataType::Utf8, false), // JSON serialized
            Field::new("provider", DataType::Utf8, false),
            Field::new(
                "indexed_at",
                DataType::Timestamp(TimeUnit::Millisecond, None),
                false,
            ),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension as i32,
                ),
                false,
            ),
        ]))
    }

    async fn has_table(&self, collection: &str) -> KnowledgeResult<bool> {
        let table_names = self.db.table_names().execute().await?;
        Ok(table_names.contains(&Self::table_name(collection)))
    }

    async fn open_table(&self, collection: &str) -> KnowledgeResult<Option<Table>> {
        if !self.has_table(collection).await? {
            return Ok(None);
        }
        let table = self
            .db
            .open_table(Self::table_name(collection))
            .execute()
            .await?;
        Ok(Some(table))
    }

    /// Provider of the first stored row, if the collection has any
    async fn stored_provider(table: &Table) -> KnowledgeResult<Option<String>> {
        let batches: Vec<RecordBatch> = table
            .query()
            .limit(1)
            .execute()
            .await?
            .try_collect()
            .await?;
        for batch in &batches {
            if batch.num_rows() > 0 {
                let providers = column::<StringArray>(batch, "provider")?;
                return Ok(Some(providers.value(0).to_string()));
            }
        }
        Ok(None)
    }

    async fn read_rows(table: &Table) -> KnowledgeResult<Vec<StoredRow>> {
        let mut results = table.query().execute().await?;

        let mut rows = Vec::new();
        while let Some(batch) = results.try_next().await? {
            if batch.num_rows() > 0 {
                decode_batch(&batch, &mut rows)?;
            }
        }
        Ok(rows)
    }

    /// Next sequence number for a collection, scanning the table once per process
    async fn next_sequence(
        sequences: &mut HashMap<String, u64>,
        collection: &str,
        table: &Table,
    ) -> KnowledgeResult<u64> {
        if let Some(next) = sequences.get(collection) {
            return Ok(*next);
        }
        let next = Self::read_rows(table)
            .await?
            .iter()
            .map(|r| r.sequence + 1)
            .max()
            .unwrap_or(0);
        sequences.insert(collection.to_string(), next);
        Ok(next)
    }
}

#[async_trait]
impl VectorStore for LanceStore {
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
            let mut sequences = self.sequences.lock().await;
            if let Some(table) = self.open_table(collection).await? {
                self.remove_sources(&mut sequences, collection, &table, stale_sources, None)
                    .await?;
            }
            return Ok(0);
        }
        let dimension = check_insert_shape(&chunks, &embeddings)?;

        // Held until the rows are committed
        let mut sequences = self.sequences.lock().await;

        let table = match self.open_table(collection).await? {
            Some(table) => {
                let stored_dimension = Self::dimension_of(&table).await?;
                match Self::stored_provider(&table).await? {
                    Some(stored_provider) => {
                        check_embedding_space(
                            collection,
                            &stored_provider,
                            stored_dimension,
                            provider,
                            dimension,
                        )?;
                        table
                    }
                    None if stored_dimension != dimension => {
                        // Empty table left over from another embedding space
                        self.db.drop_table(&Self::table_name(collection), &[]).await?;
                        sequences.remove(collection);
                        self.create_table(collection, dimension).await?
                    }
                    None => table,
                }
            }
            None => self.create_table(collection, dimension).await?,
        };

        let first = Self::next_sequence(&mut sequences, collection, &table).await?;
        let count = chunks.len();
        let batch = build_batch(
            Self::schema(dimension),
            first,
            provider,
            &chunks,
            &embeddings,
            dimension,
        )?;

        let schema = batch.schema();
        let batch_reader = RecordBatchIterator::new(once(Ok(batch)), schema);
        table.add(batch_reader).execute().await?;
        sequences.insert(collection.to_string(), first + count as u64);

        // New rows land before old ones go, so a failed delete leaves both versions
        self.remove_sources(&mut sequences, collection, &table, stale_sources, Some(first))
            .await?;

        debug!(collection, count, first_sequence = first, "Inserted knowledge chunks");
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
        let Some(table) = self.open_table(collection).await? else {
            return Ok(RetrievalResult::empty());
        };
        let rows = Self::read_rows(&table).await?;
        let Some(first) = rows.first() else {
            return Ok(RetrievalResult::empty());
        };
        check_embedding_space(
            collection,
            &first.provider,
            first.embedding.len(),
            provider,
            query_vector.len(),
        )?;

        let candidates = rows.iter().map(|r| Candidate {
            sequence: r.sequence,
            embedding: &r.embedding,
            chunk: &r.chunk,
        });
        Ok(rank(candidates, query_vector, limit, score_threshold))
    }

    async fn clear(&self, collection: &str) -> KnowledgeResult<usize> {
        let mut sequences = self.sequences.lock().await;
        let Some(table) = self.open_table(collection).await? else {
            return Ok(0);
        };
        let removed = table.count_rows(None).await?;
        self.db.drop_table(&Self::table_name(collection), &[]).await?;
        sequences.remove(collection);

        info!(collection, removed, "Cleared knowledge collection");
        Ok(removed)
    }

    async fn delete_source(&self, collection: &str, source_id: &str) -> KnowledgeResult<usize> {
        let mut sequences = self.sequences.lock().await;
        let Some(table) = self.open_table(collection).await? else {
            return Ok(0);
        };
        self.remove_sources(
            &mut sequences,
            collection,
            &table,
            &[source_id.to_string()],
            None,
        )
        .await
    }

    async fn source_hash(
        &self,
        collection: &str,
        source_id: &str,
    ) -> KnowledgeResult<Option<String>> {
        let Some(table) = self.open_table(collection).await? else {
            return Ok(None);
        };
        let batches: Vec<RecordBatch> = table
            .query()
            .only_if(format!(
                "source_id = '{}'",
                Self::quote_filter_string(source_id)
            ))
            .limit(1)
            .execute()
            .await?
            .try_collect()
            .await?;

        for batch in &batches {
            if batch.num_rows() > 0 {
                let hashes = column::<StringArray>(batch, "content_hash")?;
                return Ok(Some(hashes.value(0).to_string()));
            }
        }
        Ok(None)
    }

    async fn stats(&self, collection: &str) -> KnowledgeResult<CollectionStats> {
        let Some(table) = self.open_table(collection).await? else {
            return Ok(CollectionStats::empty(collection));
        };
        let rows = Self::read_rows(&table).await?;
        let Some(first) = rows.first() else {
            return Ok(CollectionStats::empty(collection));
        };
        let sources: HashSet<&str> = rows.iter().map(|r| r.chunk.source_id.as_str()).collect();

        Ok(CollectionStats {
            collection: collection.to_string(),
            total_sources: sources.len(),
            total_chunks: rows.len(),
            dimension: Some(first.embedding.len()),
            provider: Some(first.provider.clone()),
        })
    }

    async fn list_collections(&self) -> KnowledgeResult<Vec<String>> {
        let mut names: Vec<String> = self
            .db
            .table_names()
            .execute()
            .await?
            .into_iter()
            .filter_map(|name| name.strip_prefix(COLLECTION_TABLE_PREFIX).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }
}

impl LanceStore {
    /// Delete the rows of `source_ids`, only those older than `before` when given.
    /// A table left without rows is dropped so the collection forgets its
    /// embedding space. Callers hold the sequence lock.
    async fn remove_sources(
        &self,
        sequences: &mut HashMap<String, u64>,
        collection: &str,
        table: &Table,
        source_ids: &[String],
        before: Option<u64>,
    ) -> KnowledgeResult<usize> {
        if source_ids.is_empty() {
            return Ok(0);
        }
        let quoted: Vec<String> = source_ids
            .iter()
            .map(|id| format!("'{}'", Self::quote_filter_string(id)))
            .collect();
        let mut filter = format!("source_id IN ({})", quoted.join(", "));
        if let Some(before) = before {
            filter.push_str(&format!(" AND sequence < {}", before));
        }

        let removed = table.count_rows(Some(filter.clone())).await?;
        if removed == 0 {
            return Ok(0);
        }
        table.delete(&filter).await?;

        if table.count_rows(None).await? == 0 {
            self.db.drop_table(&Self::table_name(collection), &[]).await?;
            sequences.remove(collection);
            debug!(collection, "Dropped emptied knowledge collection");
        }
        Ok(removed)
    }

    async fn create_table(&self, collection: &str, dimension: usize) -> KnowledgeResult<Table> {
        let table = self
            .db
            .create_empty_table(Self::table_name(collection), Self::schema(dimension))
            .execute()
            .await?;
        info!(collection, dimension, "Created knowledge collection table");
        Ok(table)
    }

    async fn dimension_of(table: &Table) -> KnowledgeResult<usize> {
        match table.schema().await?.field_with_name("embedding")?.data_type() {
            DataType::FixedSizeList(_, size) => Ok(*size as usize),
            other => Err(KnowledgeError::Storage {
                message: format!("unexpected embedding column type {:?}", other),
                cause: None,
            }),
        }
    }
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> KnowledgeResult<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| KnowledgeError::Storage {
            message: format!("column '{}' missing or of unexpected type", name),
            cause: None,
        })
}

fn build_batch(
    schema: SchemaRef,
    first_sequence: u64,
    provider: &str,
    chunks: &[KnowledgeChunk],
    embeddings: &[Vec<f32>],
    dimension: usize,
) -> KnowledgeResult<RecordBatch> {
    let now_millis = Utc::now().timestamp_millis();

    let sequences: Vec<i64> = (0..chunks.len())
        .map(|i| (first_sequence + i as u64) as i64)
        .collect();
    let ids: Vec<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
    let source_ids: Vec<&str> = chunks.iter().map(|c| c.source_id.as_str()).collect();
    let collections: Vec<&str> = chunks.iter().map(|c| c.collection.as_str()).collect();
    let chunk_indices: Vec<i64> = chunks.iter().map(|c| c.chunk_index as i64).collect();
    let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
    let char_starts: Vec<i64> = chunks.iter().map(|c| c.char_start as i64).collect();
    let char_ends: Vec<i64> = chunks.iter().map(|c| c.char_end as i64).collect();
    let content_hashes: Vec<&str> = chunks.iter().map(|c| c.content_hash.as_str()).collect();
    let metadata = chunks
        .iter()
        .map(|c| serde_json::to_string(&c.metadata))
        .collect::<Result<Vec<String>, _>>()
        .map_err(|e| KnowledgeError::storage_with("failed to serialize chunk metadata", e))?;
    let providers: Vec<&str> = chunks.iter().map(|_| provider).collect();
    let indexed_ats: Vec<i64> = chunks.iter().map(|_| now_millis).collect();

    let embedding_values: Vec<f32> = embeddings.iter().flat_map(|e| e.iter().copied()).collect();
    let embedding_array = FixedSizeListArray::try_new(
        Arc::new(Field::new("item", DataType::Float32, true)),
        dimension as i32,
        Arc::new(Float32Array::from(embedding_values)),
        None,
    )?;

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(sequences)),
            Arc::new(StringArray::from(ids)),
            Arc::new(StringArray::from(source_ids)),
            Arc::new(StringArray::from(collections)),
            Arc::new(Int64Array::from(chunk_indices)),
            Arc::new(StringArray::from(contents)),
            Arc::new(Int64Array::from(char_starts)),
            Arc::new(Int64Array::from(char_ends)),
            Arc::new(StringArray::from(content_hashes)),
            Arc::new(StringArray::from(metadata)),
            Arc::new(StringArray::from(providers)),
            Arc::new(TimestampMillisecondArray::from(indexed_ats)),
            Arc::new(embedding_array),
        ],
    )?;
    Ok(batch)
}

fn decode_batch(batch: &RecordBatch, rows: &mut Vec<StoredRow>) -> KnowledgeResult<()> {
    let sequences = column::<Int64Array>(batch, "sequence")?;
    let ids = column::<StringArray>(batch, "id")?;
    let source_ids = column::<StringArray>(batch, "source_id")?;
    let collections = column::<StringArray>(batch, "collection")?;
    let chunk_indices = column::<Int64Array>(batch, "chunk_index")?;
    let contents = column::<StringArray>(batch, "content")?;
    let char_starts = column::<Int64Array>(batch, "char_start")?;
    let char_ends = column::<Int64Array>(batch, "char_end")?;
    let content_hashes = column::<StringArray>(batch, "content_hash")?;
    let metadata_json = column::<StringArray>(batch, "metadata")?;
    let providers = column::<StringArray>(batch, "provider")?;
    let embeddings = column::<FixedSizeListArray>(batch, "embedding")?;

    for i in 0..batch.num_rows() {
        let metadata: Metadata = serde_json::from_str(metadata_json.value(i))
            .map_err(|e| KnowledgeError::storage_with("corrupt chunk metadata", e))?;
        let vector = embeddings.value(i);
        let vector = vector
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| KnowledgeError::Storage {
                message: "embedding values are not float32".to_string(),
                cause: None,
            })?;

        rows.push(StoredRow {
            sequence: sequences.value(i) as u64,
            provider: providers.value(i).to_string(),
            chunk: KnowledgeChunk {
                id: ids.value(i).to_string(),
                source_id: source_ids.value(i).to_string(),
                collection: collections.value(i).to_string(),
                chunk_index: chunk_indices.value(i) as usize,
                content: contents.value(i).to_string(),
                char_start: char_starts.value(i) as usize,
                char_end: char_ends.value(i) as usize,
                content_hash: content_hashes.value(i).to_string(),
                metadata,
            },
            embedding: vector.values().to_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROVIDER: &str = "stub:2d";

    fn chunk(source_id: &str, index: usize, content: &str) -> KnowledgeChunk {
        let mut metadata = Metadata::new();
        metadata.insert("origin".to_string(), source_id.to_string());
        KnowledgeChunk {
            id: format!("{}-{}", source_id, index),
            source_id: source_id.to_string(),
            collection: "knowledge".to_string(),
            chunk_index: index,
            content: content.to_string(),
            char_start: index * 10,
            char_end: index * 10 + content.chars().count(),
            content_hash: format!("hash-{}", source_id),
            metadata,
        }
    }

    #[tokio::test]
    async fn test_lance_store_round_trip_and_ranking() {
        let dir = tempfile::tempdir().unwrap();
        let store = LanceStore::open(dir.path()).await.unwrap();

        let empty = store
            .query("knowledge", PROVIDER, &[1.0, 0.0], 3, 0.0)
            .await
            .unwrap();
        assert!(empty.is_empty());

        store
            .insert(
                "knowledge",
                PROVIDER,
                vec![chunk("a", 0, "low"), chunk("a", 1, "high")],
                vec![vec![0.4, 0.9165], vec![0.9, 0.4359]],
            )
            .await
            .unwrap();
        store
            .insert("knowledge", PROVIDER, vec![chunk("b", 0, "tie")], vec![vec![0.9, 0.4359]])
            .await
            .unwrap();

        let result = store
            .query("knowledge", PROVIDER, &[1.0, 0.0], 2, 0.35)
            .await
            .unwrap();
        let contents: Vec<&str> = result.iter().map(|e| e.chunk.content.as_str()).collect();
        assert_eq!(contents, vec!["high", "tie"]);
        assert_eq!(
            result.entries[0].chunk.metadata.get("origin").map(String::as_str),
            Some("a")
        );

        let stats = store.stats("knowledge").await.unwrap();
        assert_eq!(stats.total_chunks, 3);
        assert_eq!(stats.total_sources, 2);
        assert_eq!(stats.dimension, Some(2));
        assert_eq!(store.list_collections().await.unwrap(), vec!["knowledge"]);
    }

    #[tokio::test]
    async fn test_lance_store_rejects_other_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let store = LanceStore::open(dir.path()).await.unwrap();
        store
            .insert("knowledge", PROVIDER, vec![chunk("a", 0, "x")], vec![vec![1.0, 0.0]])
            .await
            .unwrap();

        let err = store
            .query("knowledge", PROVIDER, &[1.0, 0.0, 0.0], 3, 0.0)
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_lance_store_clear_and_delete_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = LanceStore::open(dir.path()).await.unwrap();
        store
            .insert(
                "knowledge",
                PROVIDER,
                vec![chunk("a", 0, "x"), chunk("b", 0, "y")],
                vec![vec![1.0, 0.0], vec![1.0, 0.0]],
            )
            .await
            .unwrap();

        assert_eq!(
            store.source_hash("knowledge", "b").await.unwrap().as_deref(),
            Some("hash-b")
        );
        assert_eq!(store.delete_source("knowledge", "b").await.unwrap(), 1);
        assert!(store.source_hash("knowledge", "b").await.unwrap().is_none());

        assert_eq!(store.clear("knowledge").await.unwrap(), 1);
        let result = store
            .query("knowledge", PROVIDER, &[1.0, 0.0], 3, 0.0)
            .await
            .unwrap();
        assert!(result.is_empty());
        assert!(store.list_collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lance_replace_keeps_old_rows_on_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let store = LanceStore::open(dir.path()).await.unwrap();
        store
            .insert("knowledge", PROVIDER, vec![chunk("a", 0, "old")], vec![vec![1.0, 0.0]])
            .await
            .unwrap();

        let err = store
            .replace(
                "knowledge",
                "other:3d",
                &["a".to_string()],
                vec![chunk("a", 0, "new")],
                vec![vec![1.0, 0.0, 0.0]],
            )
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(store.stats("knowledge").await.unwrap().total_chunks, 1);

        store
            .replace(
                "knowledge",
                PROVIDER,
                &["a".to_string()],
                vec![chunk("a", 0, "new")],
                vec![vec![1.0, 0.0]],
            )
            .await
            .unwrap();
        let result = store
            .query("knowledge", PROVIDER, &[1.0, 0.0], 10, 0.0)
            .await
            .unwrap();
        let contents: Vec<&str> = result.iter().map(|e| e.chunk.content.as_str()).collect();
        assert_eq!(contents, vec!["new"]);
        assert_eq!(result.entries[0].sequence, 1);
    }

    #[tokio::test]
    async fn test_lance_emptied_collection_forgets_embedding_space() {
        let dir = tempfile::tempdir().unwrap();
        let store = LanceStore::open(dir.path()).await.unwrap();
        store
            .insert("knowledge", PROVIDER, vec![chunk("a", 0, "x")], vec![vec![1.0, 0.0]])
            .await
            .unwrap();
        assert_eq!(store.delete_source("knowledge", "a").await.unwrap(), 1);
        assert!(store.list_collections().await.unwrap().is_empty());

        store
            .insert("knowledge", "other:3d", vec![chunk("b", 0, "y")], vec![vec![1.0; 3]])
            .await
            .unwrap();
        let stats = store.stats("knowledge").await.unwrap();
        assert_eq!(stats.provider.as_deref(), Some("other:3d"));
        assert_eq!(stats.dimension, Some(3));
    }
}
