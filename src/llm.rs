// Copyright 2026 Muvon Un Limited
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Language-model collaborator used by the query rewriter.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::RewriterConfig;
use crate::error::{KnowledgeError, KnowledgeResult};

/// Single-shot completion: one system instruction, one user message, one reply
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, system: &str, prompt: &str) -> KnowledgeResult<String>;
}

/// Chat completions against any OpenAI-compatible endpoint
pub struct ChatCompletionModel {
    model: String,
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ChatCompletionModel {
    pub fn new(
        model: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> KnowledgeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("Groundwork/1.0")
            .build()
            .map_err(|e| KnowledgeError::configuration(format!("invalid HTTP client: {}", e)))?;

        Ok(Self {
            model: model.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    /// API key: environment variable named by `api_key_env`, absent for local servers
    pub fn from_config(config: &RewriterConfig) -> KnowledgeResult<Self> {
        if config.model.trim().is_empty() {
            return Err(KnowledgeError::configuration("rewriter.model cannot be empty"));
        }
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());

        Self::new(
            config.model.clone(),
            config.endpoint.clone(),
            api_key,
            Duration::from_secs(config.timeout_secs.max(1)),
        )
    }

    fn extract_content(&self, body: &Value) -> KnowledgeResult<String> {
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                KnowledgeError::provider_error(&self.model, "response has no message content")
            })
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, prompt: &str) -> KnowledgeResult<String> {
        let body = json!({
            "model": self.model,
            "temperature": 0.0,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt },
            ],
        });

        let url = format!("{}/chat/completions", self.endpoint);
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            KnowledgeError::provider_with(&self.model, format!("request to {} failed", url), e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(KnowledgeError::provider_error(
                &self.model,
                format!("HTTP {}: {}", status, text),
            ));
        }

        let payload: Value = response.json().await.map_err(|e| {
            KnowledgeError::provider_with(&self.model, "invalid completion response", e)
        })?;
        self.extract_content(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ChatCompletionModel {
        ChatCompletionModel::new(
            "gpt-4o-mini",
            "http://localhost:11434/v1/",
            None,
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_endpoint_trailing_slash_trimmed() {
        assert_eq!(model().endpoint, "http://localhost:11434/v1");
    }

    #[test]
    fn test_extract_content() {
        let body = json!({
            "choices": [{ "message": { "role": "assistant", "content": "john residence" } }]
        });
        assert_eq!(model().extract_content(&body).unwrap(), "john residence");
    }

    #[test]
    fn test_extract_content_missing() {
        let err = model().extract_content(&json!({ "choices": [] })).unwrap_err();
        assert!(err.is_provider());
    }

    #[test]
    fn test_from_config_rejects_empty_model() {
        let config = RewriterConfig {
            model: "  ".to_string(),
            ..RewriterConfig::default()
        };
        assert!(ChatCompletionModel::from_config(&config)
            .err()
            .unwrap()
            .is_configuration());
    }
}
