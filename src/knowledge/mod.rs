pub mod chunker;
pub mod formats;
pub mod formatting;
pub mod lance;
pub mod manager;
pub mod rewriter;
pub mod scope;
pub mod source;
pub mod store;
pub mod types;

pub use chunker::{ChunkParams, TextChunker};
pub use lance::LanceStore;
pub use manager::{open_store, KnowledgeBase};
pub use rewriter::{QueryRewriter, RewrittenQuery};
pub use scope::{
    agent_collection_name, AgentScope, CrewScope, KnowledgeRetrieval, KnowledgeRetriever,
    ScopeLevel, ScopedChunk,
};
pub use source::{KnowledgeSource, SourceDocument, SourceKind, SourceLoader};
pub use store::{cosine_similarity, MemoryStore, VectorStore};
pub use types::{
    CollectionStats, IngestMode, IngestReport, KnowledgeChunk, Metadata, RetrievalResult,
    ScoredChunk, SourceOutcome,
};
