use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{KnowledgeError, KnowledgeResult};
use crate::knowledge::chunker::ChunkParams;
use crate::knowledge::formats::{
    self, check_document_size, normalize_text, DocumentFormat, ExtractedText, UnitMark,
};
use crate::knowledge::types::Metadata;

/// Where a knowledge source's content comes from
#[derive(Debug, Clone, PartialEq)]
pub enum SourceKind {
    Text { content: String },
    Files { paths: Vec<PathBuf> },
    Remote { urls: Vec<String> },
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Files { .. } => "files",
            Self::Remote { .. } => "remote",
        }
    }
}

/// Reference material handed to an agent or crew, consumed once at ingestion
#[derive(Debug, Clone)]
pub struct KnowledgeSource {
    id: String,
    kind: SourceKind,
    chunking: Option<ChunkParams>,
    metadata: Metadata,
    tolerate_partial: bool,
}

impl KnowledgeSource {
    pub fn text(content: impl Into<String>) -> Self {
        let content = content.into();
        let id = format!("text:{}", crate::storage::short_hash(&content));
        Self::with_kind(id, SourceKind::Text { content })
    }

    pub fn files<P: Into<PathBuf>>(paths: impl IntoIterator<Item = P>) -> Self {
        let paths: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
        let joined = paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        let id = format!("files:{}", crate::storage::short_hash(&joined));
        Self::with_kind(id, SourceKind::Files { paths })
    }

    pub fn remote<S: Into<String>>(urls: impl IntoIterator<Item = S>) -> Self {
        let urls: Vec<String> = urls.into_iter().map(Into::into).collect();
        let id = format!("remote:{}", crate::storage::short_hash(&urls.join("\n")));
        Self::with_kind(id, SourceKind::Remote { urls })
    }

    fn with_kind(id: String, kind: SourceKind) -> Self {
        Self {
            id,
            kind,
            chunking: None,
            metadata: Metadata::new(),
            tolerate_partial: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Override the knowledge base's chunking parameters for this source
    pub fn with_chunking(
        mut self,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> KnowledgeResult<Self> {
        self.chunking = Some(ChunkParams::new(chunk_size, chunk_overlap)?);
        Ok(self)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Skip failing files or URLs instead of failing the whole source
    pub fn tolerate_partial(mut self, tolerate: bool) -> Self {
        self.tolerate_partial = tolerate;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &SourceKind {
        &self.kind
    }

    pub fn chunking(&self) -> Option<ChunkParams> {
        self.chunking
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Extract normalized text for every unit of this source, in declaration order
    pub async fn load(&self, loader: &SourceLoader) -> KnowledgeResult<Vec<SourceDocument>> {
        match &self.kind {
            SourceKind::Text { content } => {
                let mut metadata = self.base_metadata();
                metadata.insert("format".to_string(), "text".to_string());
                Ok(vec![SourceDocument {
                    id: self.id.clone(),
                    text: normalize_text(content),
                    metadata,
                    units: Vec::new(),
                }])
            }
            SourceKind::Files { paths } => {
                if paths.is_empty() {
                    return Err(KnowledgeError::source_error(&self.id, "no files given"));
                }
                let mut results = Vec::with_capacity(paths.len());
                for path in paths {
                    let result = loader
                        .load_file(path)
                        .await
                        .map(|doc| self.attach(doc));
                    results.push(result);
                }
                self.collect_units(results)
            }
            SourceKind::Remote { urls } => {
                if urls.is_empty() {
                    return Err(KnowledgeError::source_error(&self.id, "no URLs given"));
                }
                let mut results = Vec::with_capacity(urls.len());
                for url in urls {
                    let result = loader.fetch_url(url).await.map(|doc| self.attach(doc));
                    results.push(result);
                }
                self.collect_units(results)
            }
        }
    }

    fn base_metadata(&self) -> Metadata {
        let mut metadata = self.metadata.clone();
        metadata.insert("source".to_string(), self.id.clone());
        metadata.insert("source_kind".to_string(), self.kind.as_str().to_string());
        metadata
    }

    /// Source-level metadata underneath the unit's own keys
    fn attach(&self, mut document: SourceDocument) -> SourceDocument {
        let mut metadata = self.base_metadata();
        metadata.append(&mut document.metadata);
        document.metadata = metadata;
        document
    }

    fn collect_units(
        &self,
        results: Vec<KnowledgeResult<SourceDocument>>,
    ) -> KnowledgeResult<Vec<SourceDocument>> {
        let total = results.len();
        let mut documents = Vec::with_capacity(total);
        let mut first_error = None;

        for result in results {
            match result {
                Ok(document) => documents.push(document),
                Err(e) if !self.tolerate_partial => return Err(e),
                Err(e) => {
                    warn!(source = %self.id, error = %e, "Skipping unreadable unit");
                    first_error.get_or_insert(e);
                }
            }
        }

        // Tolerance covers partial failure only; nothing loaded is still a failure
        match first_error {
            Some(e) if documents.is_empty() => Err(e),
            _ => {
                debug!(source = %self.id, loaded = documents.len(), total, "Loaded source");
                Ok(documents)
            }
        }
    }
}

/// One loaded unit (inline text, file or fetched document)
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    /// Pages or table rows the text was assembled from, in text order
    pub units: Vec<UnitMark>,
}

/// Performs the I/O for file and remote sources
#[derive(Debug, Clone)]
pub struct SourceLoader {
    client: reqwest::Client,
}

impl SourceLoader {
    pub fn new(fetch_timeout: Duration) -> KnowledgeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .user_agent("Groundwork/1.0")
            .build()
            .map_err(|e| KnowledgeError::configuration(format!("invalid HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn load_file(&self, path: &Path) -> KnowledgeResult<SourceDocument> {
        let id = path.display().to_string();
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| KnowledgeError::source_with(&id, "failed to read file metadata", e))?
            .len();
        check_document_size(size)
            .map_err(|e| KnowledgeError::source_with(&id, "file rejected", e))?;

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| KnowledgeError::source_with(&id, "failed to read file", e))?;

        let format = DocumentFormat::from_path(path);
        let extracted = extract_blocking(format, bytes).await.map_err(|e| {
            KnowledgeError::source_with(&id, format!("failed to parse {}", format.as_str()), e)
        })?;

        let mut metadata = Metadata::new();
        metadata.insert("path".to_string(), id.clone());
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            metadata.insert("file_name".to_string(), name.to_string());
        }
        metadata.insert("format".to_string(), format.as_str().to_string());

        Ok(SourceDocument {
            id,
            text: extracted.text,
            metadata,
            units: extracted.units,
        })
    }

    async fn fetch_url(&self, url: &str) -> KnowledgeResult<SourceDocument> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(KnowledgeError::source_error(url, "URL cannot be empty"));
        }
        if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
            return Err(KnowledgeError::source_error(
                url,
                "invalid URL: must start with http:// or https://",
            ));
        }

        let response = self
            .client
            .get(trimmed)
            .send()
            .await
            .map_err(|e| KnowledgeError::source_with(trimmed, "failed to fetch URL", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(KnowledgeError::source_error(
                trimmed,
                format!("HTTP error: {}", status),
            ));
        }

        let format = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(DocumentFormat::from_content_type)
            .unwrap_or(DocumentFormat::Html);

        if let Some(length) = response.content_length() {
            check_document_size(length)
                .map_err(|e| KnowledgeError::source_with(trimmed, "response rejected", e))?;
        }

        let bytes = response.bytes().await.map_err(|e| {
            KnowledgeError::source_with(trimmed, "failed to read response body", e)
        })?;

        let extracted = extract_blocking(format, bytes.to_vec()).await.map_err(|e| {
            KnowledgeError::source_with(trimmed, format!("failed to parse {}", format.as_str()), e)
        })?;

        let mut metadata = Metadata::new();
        metadata.insert("url".to_string(), trimmed.to_string());
        metadata.insert("format".to_string(), format.as_str().to_string());

        Ok(SourceDocument {
            id: trimmed.to_string(),
            text: extracted.text,
            metadata,
            units: extracted.units,
        })
    }
}

/// PDF and DOCX parsing is CPU bound; keep it off the async workers
async fn extract_blocking(
    format: DocumentFormat,
    bytes: Vec<u8>,
) -> anyhow::Result<ExtractedText> {
    tokio::task::spawn_blocking(move || formats::extract_text(format, &bytes)).await?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader() -> SourceLoader {
        SourceLoader::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_text_source_id_is_content_derived() {
        let a = KnowledgeSource::text("same content");
        let b = KnowledgeSource::text("same content");
        let c = KnowledgeSource::text("other content");
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert!(a.id().starts_with("text:"));
    }

    #[test]
    fn test_invalid_chunking_rejected() {
        let err = KnowledgeSource::text("x").with_chunking(10, 10).unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_load_text_source() {
        let source = KnowledgeSource::text("Users name is John.\r\n")
            .with_id("profile")
            .with_metadata("topic", "user");
        let docs = source.load(&loader()).await.unwrap();

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "profile");
        assert_eq!(docs[0].text, "Users name is John.");
        assert_eq!(docs[0].metadata.get("topic").unwrap(), "user");
        assert_eq!(docs[0].metadata.get("source_kind").unwrap(), "text");
    }

    #[tokio::test]
    async fn test_load_files_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let txt = dir.path().join("notes.txt");
        let csv = dir.path().join("people.csv");
        std::fs::write(&txt, "Deployments happen on Fridays.").unwrap();
        std::fs::write(&csv, "name,city\nJohn,San Francisco\n").unwrap();

        let source = KnowledgeSource::files([&txt, &csv]).with_metadata("team", "ops");
        let docs = source.load(&loader()).await.unwrap();

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].text, "Deployments happen on Fridays.");
        assert_eq!(docs[0].metadata.get("file_name").unwrap(), "notes.txt");
        assert_eq!(docs[0].metadata.get("team").unwrap(), "ops");
        assert_eq!(docs[1].text, "name: John, city: San Francisco");
        assert_eq!(docs[1].metadata.get("format").unwrap(), "csv");
        assert!(docs[0].units.is_empty());
        assert_eq!(docs[1].units.len(), 1);
        assert_eq!((docs[1].units[0].key, docs[1].units[0].number), ("row", 2));
    }

    #[tokio::test]
    async fn test_csv_chunks_name_their_rows() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("people.csv");
        std::fs::write(&csv, "name,city\nJohn,San Francisco\nMaria,Lisbon\nAmir,Cairo\n").unwrap();

        let docs = KnowledgeSource::files([&csv]).load(&loader()).await.unwrap();
        let chunker = crate::knowledge::chunker::TextChunker::new(40, 0).unwrap();
        let chunks = chunker.chunk_document(&docs[0], "knowledge");

        assert_eq!(chunks[0].metadata.get("row").unwrap(), "2-3");
        assert_eq!(chunks.last().unwrap().metadata.get("row").unwrap(), "4");
    }

    #[tokio::test]
    async fn test_oversized_file_rejected_before_read() {
        let dir = tempfile::tempdir().unwrap();
        let big = dir.path().join("dump.txt");
        let file = std::fs::File::create(&big).unwrap();
        file.set_len(formats::MAX_DOCUMENT_SIZE + 1).unwrap();

        let err = KnowledgeSource::files([&big]).load(&loader()).await.unwrap_err();
        assert!(err.is_source());
        assert!(err.to_string().contains("file rejected"));
    }

    #[tokio::test]
    async fn test_missing_file_fails_whole_source() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.txt");
        std::fs::write(&good, "present").unwrap();
        let missing = dir.path().join("missing.txt");

        let err = KnowledgeSource::files([&good, &missing])
            .load(&loader())
            .await
            .unwrap_err();
        assert!(err.is_source());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn test_partial_tolerance_skips_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.txt");
        std::fs::write(&good, "present").unwrap();
        let missing = dir.path().join("missing.txt");

        let docs = KnowledgeSource::files([&good, &missing])
            .tolerate_partial(true)
            .load(&loader())
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].text, "present");
    }

    #[tokio::test]
    async fn test_partial_tolerance_all_missing_still_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = KnowledgeSource::files([dir.path().join("nope.txt")])
            .tolerate_partial(true)
            .load(&loader())
            .await
            .unwrap_err();
        assert!(err.is_source());
    }

    #[tokio::test]
    async fn test_malformed_json_is_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{\"a\": ").unwrap();

        let err = KnowledgeSource::files([&path])
            .load(&loader())
            .await
            .unwrap_err();
        assert!(err.is_source());
    }

    #[tokio::test]
    async fn test_invalid_url_scheme_is_source_error() {
        let err = KnowledgeSource::remote(["ftp://example.com/doc"])
            .load(&loader())
            .await
            .unwrap_err();
        assert!(err.is_source());
    }
}
