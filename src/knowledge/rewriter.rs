use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RewriterConfig;
use crate::constants::QUERY_REWRITE_SYSTEM_PROMPT;
use crate::llm::LanguageModel;

/// Search query derived from a task prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenQuery {
    pub text: String,
    /// False when the raw task text is used as is
    pub rewritten: bool,
}

impl RewrittenQuery {
    fn raw(task: &str) -> Self {
        Self {
            text: task.to_string(),
            rewritten: false,
        }
    }
}

/// Single-shot, stateless rewrite of a task prompt into a retrieval query.
///
/// The language model is passed per call. Any failure of the model (error,
/// timeout, empty answer) falls back to the raw task text; rewriting never
/// aborts retrieval.
#[derive(Debug, Clone)]
pub struct QueryRewriter {
    timeout: Duration,
    system_prompt: String,
}

impl Default for QueryRewriter {
    fn default() -> Self {
        Self::new(Duration::from_secs(RewriterConfig::default().timeout_secs))
    }
}

impl QueryRewriter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            system_prompt: QUERY_REWRITE_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn from_config(config: &RewriterConfig) -> Self {
        Self::new(Duration::from_secs(config.timeout_secs))
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn rewrite(&self, llm: Option<&dyn LanguageModel>, task: &str) -> RewrittenQuery {
        let Some(llm) = llm else {
            return RewrittenQuery::raw(task);
        };

        match tokio::time::timeout(self.timeout, llm.complete(&self.system_prompt, task)).await {
            Ok(Ok(answer)) => match clean_answer(&answer) {
                Some(text) => {
                    debug!(model = llm.name(), query = %text, "Rewrote task into search query");
                    RewrittenQuery {
                        text,
                        rewritten: true,
                    }
                }
                None => {
                    warn!(model = llm.name(), "Query rewrite returned nothing, using task text");
                    RewrittenQuery::raw(task)
                }
            },
            Ok(Err(e)) => {
                warn!(model = llm.name(), error = %e, "Query rewrite failed, using task text");
                RewrittenQuery::raw(task)
            }
            Err(_) => {
                warn!(
                    model = llm.name(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Query rewrite timed out, using task text"
                );
                RewrittenQuery::raw(task)
            }
        }
    }
}

/// Trim whitespace and wrapping quotes; None when nothing is left
fn clean_answer(answer: &str) -> Option<String> {
    let trimmed = answer
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{KnowledgeError, KnowledgeResult};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Scripted {
        answer: KnowledgeResult<String>,
        delay: Duration,
        seen: Mutex<Vec<(String, String)>>,
    }

    impl Scripted {
        fn answering(answer: &str) -> Self {
            Self {
                answer: Ok(answer.to_string()),
                delay: Duration::ZERO,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                answer: Err(KnowledgeError::provider_error("scripted", "quota exceeded")),
                delay: Duration::ZERO,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::answering("never used")
            }
        }
    }

    #[async_trait]
    impl LanguageModel for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, system: &str, prompt: &str) -> KnowledgeResult<String> {
            self.seen
                .lock()
                .unwrap()
                .push((system.to_string(), prompt.to_string()));
            tokio::time::sleep(self.delay).await;
            match &self.answer {
                Ok(text) => Ok(text.clone()),
                Err(_) => Err(KnowledgeError::provider_error("scripted", "quota exceeded")),
            }
        }
    }

    const TASK: &str = "Answer the question: Where does John live? Respond in JSON.";

    #[tokio::test]
    async fn test_rewrite_uses_model_answer() {
        let llm = Scripted::answering("  \"John's place of residence\"\n");
        let rewriter = QueryRewriter::new(Duration::from_secs(1));

        let query = rewriter.rewrite(Some(&llm), TASK).await;
        assert!(query.rewritten);
        assert_eq!(query.text, "John's place of residence");

        let seen = llm.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, QUERY_REWRITE_SYSTEM_PROMPT);
        assert_eq!(seen[0].1, TASK);
    }

    #[tokio::test]
    async fn test_without_model_uses_task_text() {
        let query = QueryRewriter::default().rewrite(None, TASK).await;
        assert_eq!(query, RewrittenQuery::raw(TASK));
    }

    #[tokio::test]
    async fn test_model_error_falls_back() {
        let llm = Scripted::failing();
        let query = QueryRewriter::default().rewrite(Some(&llm), TASK).await;
        assert!(!query.rewritten);
        assert_eq!(query.text, TASK);
    }

    #[tokio::test]
    async fn test_timeout_falls_back() {
        let llm = Scripted::slow(Duration::from_secs(5));
        let rewriter = QueryRewriter::new(Duration::from_millis(50));
        let query = rewriter.rewrite(Some(&llm), TASK).await;
        assert!(!query.rewritten);
        assert_eq!(query.text, TASK);
    }

    #[tokio::test]
    async fn test_empty_answer_falls_back() {
        let llm = Scripted::answering("  \"\" ");
        let query = QueryRewriter::default().rewrite(Some(&llm), TASK).await;
        assert!(!query.rewritten);
        assert_eq!(query.text, TASK);
    }
}
