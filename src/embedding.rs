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

//! Embedding adapter.
//!
//! [`Embedder`] is a closed set of backends selected from `provider:model`
//! configuration. Remote and local-model providers are delegated to octolib,
//! `hash` is a non-semantic feature-hashing provider for tests and offline
//! smoke runs, and `Custom` wraps any [`EmbeddingFunction`] supplied by the caller.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

// Re-export embedding functionality from octolib
pub use octolib::embedding::{
    parse_provider_model, provider::create_embedding_provider_from_parts,
    provider::EmbeddingProvider, types::InputType,
};

use crate::config::EmbeddingConfig;
use crate::error::{KnowledgeError, KnowledgeResult};

/// Providers accepted in `embedding.model`
pub const REGISTERED_PROVIDERS: &[&str] = &[
    "hash",
    "openai",
    "voyage",
    "jina",
    "google",
    "fastembed",
    "huggingface",
];

/// Capability implemented by caller-supplied embedding backends
#[async_trait]
pub trait EmbeddingFunction: Send + Sync {
    /// Stable identifier of the provider and model, e.g. `acme:small-v2`
    fn name(&self) -> String;

    async fn embed_batch(&self, texts: &[String]) -> KnowledgeResult<Vec<Vec<f32>>>;
}

pub enum Embedder {
    Hash(HashEmbedder),
    Remote(RemoteEmbedder),
    Custom(Arc<dyn EmbeddingFunction>),
}

impl std::fmt::Debug for Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Embedder").field(&self.fingerprint()).finish()
    }
}

impl Embedder {
    /// Create embedder from config
    pub async fn from_config(config: &EmbeddingConfig) -> KnowledgeResult<Self> {
        let (provider, model) = config.model.split_once(':').ok_or_else(|| {
            KnowledgeError::configuration(format!(
                "embedding model must be in provider:model form, got '{}'",
                config.model
            ))
        })?;
        let provider = provider.trim().to_lowercase();

        if !REGISTERED_PROVIDERS.contains(&provider.as_str()) {
            return Err(KnowledgeError::configuration(format!(
                "unknown embedding provider '{}' (known: {})",
                provider,
                REGISTERED_PROVIDERS.join(", ")
            )));
        }

        if provider == "hash" {
            let dimension = model.trim().parse::<usize>().map_err(|_| {
                KnowledgeError::configuration(format!(
                    "hash provider expects a dimension, e.g. hash:256, got '{}'",
                    model
                ))
            })?;
            return Ok(Self::Hash(HashEmbedder::new(dimension)?));
        }

        Ok(Self::Remote(
            RemoteEmbedder::connect(&config.model, config.batch_size).await?,
        ))
    }

    pub fn custom(function: Arc<dyn EmbeddingFunction>) -> Self {
        Self::Custom(function)
    }

    /// Identifier of the embedding space; vectors are only comparable within one fingerprint
    pub fn fingerprint(&self) -> String {
        match self {
            Self::Hash(hash) => format!("hash:{}", hash.dimension),
            Self::Remote(remote) => remote.model.clone(),
            Self::Custom(function) => function.name(),
        }
    }

    /// Generate embedding for a single text
    pub async fn embed(&self, text: &str) -> KnowledgeResult<Vec<f32>> {
        let mut vectors = self.embed_batch(vec![text.to_string()]).await?;
        vectors.pop().ok_or_else(|| {
            KnowledgeError::provider_error(self.fingerprint(), "provider returned no embedding")
        })
    }

    /// Generate embeddings for multiple texts, one vector per input in input order
    pub async fn embed_batch(&self, texts: Vec<String>) -> KnowledgeResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let expected = texts.len();

        let vectors = match self {
            Self::Hash(hash) => texts.iter().map(|t| hash.embed(t)).collect(),
            Self::Remote(remote) => remote.embed_batch(texts).await?,
            Self::Custom(function) => function.embed_batch(&texts).await?,
        };

        check_batch_shape(&self.fingerprint(), expected, &vectors)?;
        debug!(
            provider = %self.fingerprint(),
            count = vectors.len(),
            "Generated embeddings"
        );
        Ok(vectors)
    }
}

/// Every input must get exactly one non-empty vector, all of one dimension
fn check_batch_shape(provider: &str, expected: usize, vectors: &[Vec<f32>]) -> KnowledgeResult<()> {
    if vectors.len() != expected {
        return Err(KnowledgeError::provider_error(
            provider,
            format!(
                "provider returned {} embeddings for {} inputs",
                vectors.len(),
                expected
            ),
        ));
    }
    let dimension = vectors.first().map(|v| v.len()).unwrap_or(0);
    if dimension == 0 {
        return Err(KnowledgeError::provider_error(
            provider,
            "provider returned empty embeddings",
        ));
    }
    if vectors.iter().any(|v| v.len() != dimension) {
        return Err(KnowledgeError::provider_error(
            provider,
            "provider returned embeddings of mixed dimensionality",
        ));
    }
    Ok(())
}

/// octolib-backed provider (API or local model)
pub struct RemoteEmbedder {
    provider: Box<dyn EmbeddingProvider>,
    model: String,
    batch_size: usize,
}

impl RemoteEmbedder {
    pub async fn connect(model: &str, batch_size: usize) -> KnowledgeResult<Self> {
        let (provider, model_name) = parse_provider_model(model).map_err(|e| {
            KnowledgeError::configuration(format!("invalid embedding model '{}': {}", model, e))
        })?;
        let provider = create_embedding_provider_from_parts(&provider, &model_name)
            .await
            .map_err(|e| {
                KnowledgeError::provider_with(model, "failed to initialize embedding provider", e)
            })?;

        Ok(Self {
            provider,
            model: model.to_string(),
            batch_size: batch_size.max(1),
        })
    }

    async fn embed_batch(&self, texts: Vec<String>) -> KnowledgeResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let embedded = self
                .provider
                .generate_embeddings_batch(batch.to_vec(), InputType::None)
                .await
                .map_err(|e| {
                    KnowledgeError::provider_with(&self.model, "embedding request failed", e)
                })?;
            vectors.extend(embedded);
        }
        Ok(vectors)
    }
}

/// Deterministic offline embeddings: signed feature hashing of lowercase word
/// tokens, L2-normalized. Texts sharing vocabulary land close together.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> KnowledgeResult<Self> {
        if dimension == 0 {
            return Err(KnowledgeError::configuration(
                "hash embedding dimension must be positive",
            ));
        }
        Ok(Self { dimension })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let hash = fnv1a(token.as_bytes());
            let index = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

/// Tokenize text into lowercase words, removing punctuation
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
