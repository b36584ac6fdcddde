use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{Config, KnowledgeConfig};
use crate::constants::MAX_COLLECTION_NAME_LEN;
use crate::error::{KnowledgeError, KnowledgeResult};
use crate::knowledge::manager::KnowledgeBase;
use crate::knowledge::rewriter::{QueryRewriter, RewrittenQuery};
use crate::knowledge::store::validate_collection_name;
use crate::knowledge::types::{RetrievalResult, ScoredChunk};
use crate::llm::{ChatCompletionModel, LanguageModel};

/// Which scope a retrieved chunk came from. Agent sorts before crew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeLevel {
    Agent,
    Crew,
}

impl ScopeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Crew => "crew",
        }
    }
}

/// Knowledge shared by every agent of a crew
#[derive(Clone)]
pub struct CrewScope {
    knowledge: Arc<KnowledgeBase>,
    config: Option<KnowledgeConfig>,
}

impl CrewScope {
    pub fn new(knowledge: Arc<KnowledgeBase>) -> Self {
        Self {
            knowledge,
            config: None,
        }
    }

    pub fn with_config(mut self, config: KnowledgeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeBase> {
        &self.knowledge
    }

    pub fn collection(&self) -> &str {
        self.knowledge.collection()
    }

    /// Scope config, else the knowledge base's, else defaults
    pub fn config(&self) -> KnowledgeConfig {
        self.config
            .or_else(|| self.knowledge.config())
            .unwrap_or_default()
    }
}

/// Knowledge owned by one agent, kept in its own collection
#[derive(Clone)]
pub struct AgentScope {
    role: String,
    knowledge: Arc<KnowledgeBase>,
    config: Option<KnowledgeConfig>,
}

impl AgentScope {
    pub fn new(role: impl Into<String>, knowledge: Arc<KnowledgeBase>) -> Self {
        Self {
            role: role.into(),
            knowledge,
            config: None,
        }
    }

    /// Agent collection next to the crew's, sharing its store and embedder
    pub fn for_crew(role: impl Into<String>, crew: &CrewScope) -> KnowledgeResult<Self> {
        let role = role.into();
        let collection = agent_collection_name(crew.collection(), &role)?;
        let knowledge = Arc::new(crew.knowledge().for_collection(collection)?);
        Ok(Self::new(role, knowledge))
    }

    pub fn with_config(mut self, config: KnowledgeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeBase> {
        &self.knowledge
    }

    pub fn collection(&self) -> &str {
        self.knowledge.collection()
    }

    /// Agent config overrides the crew's for the agent's own queries
    pub fn config(&self, crew: Option<&CrewScope>) -> KnowledgeConfig {
        self.config
            .or_else(|| self.knowledge.config())
            .or_else(|| crew.map(CrewScope::config))
            .unwrap_or_default()
    }
}

/// `<base>_agent_<role>` with the role reduced to `[a-z0-9_]`
pub fn agent_collection_name(base: &str, role: &str) -> KnowledgeResult<String> {
    let mut sanitized = String::with_capacity(role.len());
    for c in role.trim().chars() {
        if c.is_ascii_alphanumeric() {
            sanitized.push(c.to_ascii_lowercase());
        } else if !sanitized.ends_with('_') {
            sanitized.push('_');
        }
    }
    let sanitized = sanitized.trim_matches('_');
    if sanitized.is_empty() {
        return Err(KnowledgeError::configuration(format!(
            "agent role '{}' has no usable characters for a collection name",
            role
        )));
    }

    let mut name = format!("{}_agent_{}", base, sanitized);
    if name.len() > MAX_COLLECTION_NAME_LEN {
        // Long roles keep a stable short form
        name = format!("{}_agent_{}", base, crate::storage::short_hash(role));
    }
    validate_collection_name(&name)?;
    Ok(name)
}

/// A retrieved chunk with the scope it was found in
#[derive(Debug, Clone, Serialize)]
pub struct ScopedChunk {
    pub scope: ScopeLevel,
    pub collection: String,
    #[serde(flatten)]
    pub scored: ScoredChunk,
}

/// Merged, ranked passages for one task
#[derive(Debug, Clone)]
pub struct KnowledgeRetrieval {
    pub query: RewrittenQuery,
    pub entries: Vec<ScopedChunk>,
    /// Scopes whose contribution was dropped after a provider failure
    pub skipped: Vec<ScopeLevel>,
}

impl KnowledgeRetrieval {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn passages(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|e| e.scored.chunk.content.as_str())
            .collect()
    }

    /// The merged entries without scope labels
    pub fn result(&self) -> RetrievalResult {
        RetrievalResult::new(self.entries.iter().map(|e| e.scored.clone()).collect())
    }
}

/// Task-time retrieval: rewrite once, query every applicable scope, merge.
///
/// The language model is an explicit collaborator; without one the task text
/// is used as the query.
#[derive(Clone)]
pub struct KnowledgeRetriever {
    rewriter: QueryRewriter,
    llm: Option<Arc<dyn LanguageModel>>,
    embed_timeout: Duration,
}

impl Default for KnowledgeRetriever {
    fn default() -> Self {
        Self {
            rewriter: QueryRewriter::default(),
            llm: None,
            embed_timeout: Duration::from_secs(30),
        }
    }
}

impl KnowledgeRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> KnowledgeResult<Self> {
        let mut retriever = Self::new()
            .with_rewriter(QueryRewriter::from_config(&config.rewriter))
            .with_embed_timeout(Duration::from_secs(config.embedding.timeout_secs));
        if config.rewriter.enabled {
            retriever = retriever.with_llm(Arc::new(ChatCompletionModel::from_config(
                &config.rewriter,
            )?));
        }
        Ok(retriever)
    }

    pub fn with_llm(mut self, llm: Arc<dyn LanguageModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_rewriter(mut self, rewriter: QueryRewriter) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    /// Rewrite the task into a query, then search the given scopes
    pub async fn retrieve(
        &self,
        task: &str,
        crew: Option<&CrewScope>,
        agent: Option<&AgentScope>,
    ) -> KnowledgeResult<KnowledgeRetrieval> {
        if crew.is_none() && agent.is_none() {
            return Ok(KnowledgeRetrieval {
                query: RewrittenQuery {
                    text: task.to_string(),
                    rewritten: false,
                },
                entries: Vec::new(),
                skipped: Vec::new(),
            });
        }
        let query = self.rewriter.rewrite(self.llm.as_deref(), task).await;
        self.search(query, crew, agent).await
    }

    /// Search the given scopes with a ready query.
    ///
    /// A scope whose embedding call fails or times out is skipped; configuration
    /// and storage failures abort the call.
    pub async fn search(
        &self,
        query: RewrittenQuery,
        crew: Option<&CrewScope>,
        agent: Option<&AgentScope>,
    ) -> KnowledgeResult<KnowledgeRetrieval> {
        let mut scopes: Vec<(ScopeLevel, &KnowledgeBase, KnowledgeConfig)> = Vec::new();
        if let Some(agent) = agent {
            scopes.push((ScopeLevel::Agent, agent.knowledge(), agent.config(crew)));
        }
        if let Some(crew) = crew {
            scopes.push((ScopeLevel::Crew, crew.knowledge(), crew.config()));
        }

        let cap = scopes
            .iter()
            .map(|(_, _, config)| config.results_limit)
            .max()
            .unwrap_or(0);

        // Query vectors per embedding space; None marks a failed provider
        let mut vectors: HashMap<String, Option<Vec<f32>>> = HashMap::new();
        let mut entries = Vec::new();
        let mut skipped = Vec::new();

        for (level, knowledge, config) in scopes {
            config.validate()?;
            let fingerprint = knowledge.embedder().fingerprint();
            if !vectors.contains_key(&fingerprint) {
                let vector = self.embed_query(knowledge, &query.text).await?;
                vectors.insert(fingerprint.clone(), vector);
            }
            let Some(Some(vector)) = vectors.get(&fingerprint) else {
                warn!(scope = level.as_str(), "Skipping knowledge scope without a query vector");
                skipped.push(level);
                continue;
            };

            let result = knowledge.query_vector(vector, &config).await?;
            debug!(
                scope = level.as_str(),
                collection = knowledge.collection(),
                hits = result.len(),
                "Queried knowledge scope"
            );
            entries.extend(result.into_iter().map(|scored| ScopedChunk {
                scope: level,
                collection: knowledge.collection().to_string(),
                scored,
            }));
        }

        entries.sort_by(compare_entries);
        entries.truncate(cap);

        info!(
            query = %query.text,
            rewritten = query.rewritten,
            passages = entries.len(),
            "Retrieved knowledge"
        );
        Ok(KnowledgeRetrieval {
            query,
            entries,
            skipped,
        })
    }

    /// Provider failures and timeouts yield None; configuration errors propagate
    async fn embed_query(
        &self,
        knowledge: &KnowledgeBase,
        text: &str,
    ) -> KnowledgeResult<Option<Vec<f32>>> {
        let embedder = knowledge.embedder();
        match tokio::time::timeout(self.embed_timeout, embedder.embed(text)).await {
            Ok(Ok(vector)) => Ok(Some(vector)),
            Ok(Err(err)) if err.is_provider() => {
                warn!(provider = %embedder.fingerprint(), error = %err, "Query embedding failed");
                Ok(None)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!(
                    provider = %embedder.fingerprint(),
                    timeout_ms = self.embed_timeout.as_millis() as u64,
                    "Query embedding timed out"
                );
                Ok(None)
            }
        }
    }
}

/// Score descending, then agent before crew, then insertion order
fn compare_entries(a: &ScopedChunk, b: &ScopedChunk) -> Ordering {
    b.scored
        .score
        .partial_cmp(&a.scored.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.scope.cmp(&b.scope))
        .then_with(|| a.scored.sequence.cmp(&b.scored.sequence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{Embedder, EmbeddingFunction};
    use crate::knowledge::source::KnowledgeSource;
    use crate::knowledge::store::{MemoryStore, VectorStore};
    use async_trait::async_trait;

    /// Maps known texts to fixed vectors; the query "q" is [1, 0]
    struct Lookup {
        vectors: HashMap<String, Vec<f32>>,
        fail_queries: bool,
    }

    impl Lookup {
        fn new(scores: &[(&str, f32)], fail_queries: bool) -> Self {
            let mut vectors: HashMap<String, Vec<f32>> = scores
                .iter()
                .map(|(text, s)| (text.to_string(), vec![*s, (1.0 - s * s).sqrt()]))
                .collect();
            vectors.insert("q".to_string(), vec![1.0, 0.0]);
            Self {
                vectors,
                fail_queries,
            }
        }
    }

    #[async_trait]
    impl EmbeddingFunction for Lookup {
        fn name(&self) -> String {
            "lookup:2".to_string()
        }

        async fn embed_batch(&self, texts: &[String]) -> KnowledgeResult<Vec<Vec<f32>>> {
            if self.fail_queries && texts.iter().any(|t| t == "q") {
                return Err(KnowledgeError::provider_error("lookup:2", "service unavailable"));
            }
            Ok(texts
                .iter()
                .map(|t| self.vectors.get(t).cloned().unwrap_or_else(|| vec![0.0, 1.0]))
                .collect())
        }
    }

    async fn scopes(fail_queries: bool) -> (CrewScope, AgentScope) {
        let store: Arc<dyn VectorStore> = Arc::new(MemoryStore::new());
        let embedder = Arc::new(Embedder::custom(Arc::new(Lookup::new(
            &[("crew high", 0.9), ("crew low", 0.6), ("agent top", 0.95)],
            fail_queries,
        ))));
        let crew_kb = KnowledgeBase::new("knowledge", store, embedder).unwrap();
        crew_kb.add(KnowledgeSource::text("crew high")).await.unwrap();
        crew_kb.add(KnowledgeSource::text("crew low")).await.unwrap();

        let crew = CrewScope::new(Arc::new(crew_kb));
        let agent = AgentScope::for_crew("Researcher", &crew).unwrap();
        agent
            .knowledge()
            .add(KnowledgeSource::text("agent top"))
            .await
            .unwrap();
        (crew, agent)
    }

    fn raw(text: &str) -> RewrittenQuery {
        RewrittenQuery {
            text: text.to_string(),
            rewritten: false,
        }
    }

    #[test]
    fn test_agent_collection_name() {
        assert_eq!(
            agent_collection_name("knowledge", "Senior Researcher").unwrap(),
            "knowledge_agent_senior_researcher"
        );
        assert_eq!(
            agent_collection_name("knowledge", "  QA / Tester!! ").unwrap(),
            "knowledge_agent_qa_tester"
        );
        assert!(agent_collection_name("knowledge", "!!!").unwrap_err().is_configuration());

        let long = agent_collection_name("knowledge", &"writer ".repeat(20)).unwrap();
        assert!(long.len() <= MAX_COLLECTION_NAME_LEN);
        assert!(long.starts_with("knowledge_agent_"));
    }

    #[tokio::test]
    async fn test_merge_agent_and_crew() {
        let (crew, agent) = scopes(false).await;
        let crew = crew.with_config(KnowledgeConfig::new(2, 0.35).unwrap());

        let retrieval = KnowledgeRetriever::new()
            .search(raw("q"), Some(&crew), Some(&agent))
            .await
            .unwrap();

        assert_eq!(retrieval.passages(), vec!["agent top", "crew high"]);
        assert_eq!(retrieval.entries[0].scope, ScopeLevel::Agent);
        assert_eq!(retrieval.entries[1].scope, ScopeLevel::Crew);
        assert!((retrieval.entries[0].scored.score - 0.95).abs() < 1e-4);
        assert!((retrieval.entries[1].scored.score - 0.9).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_cap_is_largest_scope_limit() {
        let (crew, agent) = scopes(false).await;
        let crew = crew.with_config(KnowledgeConfig::new(1, 0.35).unwrap());
        let agent = agent.with_config(KnowledgeConfig::new(3, 0.35).unwrap());

        let retrieval = KnowledgeRetriever::new()
            .search(raw("q"), Some(&crew), Some(&agent))
            .await
            .unwrap();
        // crew contributes at most one, the cap comes from the agent's limit
        assert_eq!(retrieval.passages(), vec!["agent top", "crew high"]);
    }

    #[tokio::test]
    async fn test_agent_inherits_crew_config() {
        let (crew, agent) = scopes(false).await;
        let crew = crew.with_config(KnowledgeConfig::new(5, 0.7).unwrap());
        assert_eq!(agent.config(Some(&crew)), KnowledgeConfig::new(5, 0.7).unwrap());
        assert_eq!(agent.config(None), KnowledgeConfig::default());

        let retrieval = KnowledgeRetriever::new()
            .search(raw("q"), Some(&crew), Some(&agent))
            .await
            .unwrap();
        assert_eq!(retrieval.passages(), vec!["agent top", "crew high"]);
    }

    #[tokio::test]
    async fn test_equal_scores_prefer_agent() {
        let store: Arc<dyn VectorStore> = Arc::new(MemoryStore::new());
        let embedder = Arc::new(Embedder::custom(Arc::new(Lookup::new(
            &[("crew same", 0.8), ("agent same", 0.8)],
            false,
        ))));
        let crew_kb = KnowledgeBase::new("knowledge", store, embedder).unwrap();
        crew_kb.add(KnowledgeSource::text("crew same")).await.unwrap();
        let crew = CrewScope::new(Arc::new(crew_kb));
        let agent = AgentScope::for_crew("writer", &crew).unwrap();
        agent
            .knowledge()
            .add(KnowledgeSource::text("agent same"))
            .await
            .unwrap();

        let retrieval = KnowledgeRetriever::new()
            .search(raw("q"), Some(&crew), Some(&agent))
            .await
            .unwrap();
        assert_eq!(retrieval.passages(), vec!["agent same", "crew same"]);
    }

    #[tokio::test]
    async fn test_provider_failure_skips_scopes() {
        let (crew, agent) = scopes(true).await;
        let retrieval = KnowledgeRetriever::new()
            .search(raw("q"), Some(&crew), Some(&agent))
            .await
            .unwrap();
        assert!(retrieval.is_empty());
        assert_eq!(retrieval.skipped, vec![ScopeLevel::Agent, ScopeLevel::Crew]);
    }

    #[tokio::test]
    async fn test_no_scopes_is_empty() {
        let retrieval = KnowledgeRetriever::new()
            .retrieve("anything at all", None, None)
            .await
            .unwrap();
        assert!(retrieval.is_empty());
        assert_eq!(retrieval.query.text, "anything at all");
    }

    #[tokio::test]
    async fn test_empty_collections_are_not_errors() {
        let store: Arc<dyn VectorStore> = Arc::new(MemoryStore::new());
        let embedder = Arc::new(Embedder::custom(Arc::new(Lookup::new(&[], false))));
        let crew = CrewScope::new(Arc::new(
            KnowledgeBase::new("knowledge", store, embedder).unwrap(),
        ));
        let retrieval = KnowledgeRetriever::new()
            .retrieve("q", Some(&crew), None)
            .await
            .unwrap();
        assert!(retrieval.is_empty());
        assert!(retrieval.skipped.is_empty());
    }
}
