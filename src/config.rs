// Copyright 2025 Muvon Un Limited
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

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::{
    DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, DEFAULT_COLLECTION_NAME, DEFAULT_EMBEDDING_MODEL,
    DEFAULT_RESULTS_LIMIT, DEFAULT_SCORE_THRESHOLD,
};
use crate::error::{KnowledgeError, KnowledgeResult};

/// Embedding provider selection and batching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Provider and model in `provider:model` form
    pub model: String,
    pub batch_size: usize,
    /// Maximum embedding requests in flight during ingestion
    pub concurrency: usize,
    /// Upper bound for a query-time embedding call
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            batch_size: 32,
            concurrency: 4,
            timeout_secs: 30,
        }
    }
}

/// Ingestion parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub collection_name: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Skip unreadable files in multi-file sources instead of failing the whole source
    pub tolerate_partial: bool,
    pub fetch_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            collection_name: DEFAULT_COLLECTION_NAME.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            tolerate_partial: false,
            fetch_timeout_secs: 30,
        }
    }
}

/// Per-scope retrieval parameters.
///
/// Attached to a crew or to a single agent; an agent's own config wins for
/// queries against that agent's collection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub results_limit: usize,
    pub score_threshold: f32,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            results_limit: DEFAULT_RESULTS_LIMIT,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
        }
    }
}

impl KnowledgeConfig {
    pub fn new(results_limit: usize, score_threshold: f32) -> KnowledgeResult<Self> {
        let config = Self {
            results_limit,
            score_threshold,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> KnowledgeResult<()> {
        if self.results_limit == 0 {
            return Err(KnowledgeError::configuration(
                "results_limit must be a positive integer",
            ));
        }
        if !(0.0..=1.0).contains(&self.score_threshold) {
            return Err(KnowledgeError::configuration(format!(
                "score_threshold must be within [0, 1], got {}",
                self.score_threshold
            )));
        }
        Ok(())
    }
}

/// Query rewriting through an OpenAI-compatible chat endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriterConfig {
    pub enabled: bool,
    pub model: String,
    pub endpoint: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for RewriterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: "gpt-4o-mini".to_string(),
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// LanceDB tables on disk
    Lance,
    /// Process-local store, lost on exit
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database directory; defaults to the system storage directory
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Lance,
            path: None,
        }
    }
}

/// Main configuration for groundwork
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub embedding: EmbeddingConfig,
    pub knowledge: IngestConfig,
    pub search: KnowledgeConfig,
    pub rewriter: RewriterConfig,
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from config.toml file
    /// First tries to load from system config directory, falls back to embedded template
    pub fn load() -> anyhow::Result<Self> {
        let config_path = crate::storage::get_system_config_path()?;

        if config_path.exists() {
            Ok(Self::load_from(&config_path)?)
        } else {
            // Config doesn't exist, create from template
            let template_content = include_str!("../config-templates/default.toml");
            let config: Self = toml::from_str(template_content)?;

            if let Some(parent) = config_path.parent() {
                if !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(&config_path, template_content)?;

            config.validate()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> KnowledgeResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KnowledgeError::configuration(format!(
                "failed to read config {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            KnowledgeError::configuration(format!(
                "failed to parse config {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> KnowledgeResult<()> {
        crate::knowledge::chunker::ChunkParams::new(
            self.knowledge.chunk_size,
            self.knowledge.chunk_overlap,
        )?;
        crate::knowledge::store::validate_collection_name(&self.knowledge.collection_name)?;
        self.search.validate()?;

        if self.embedding.batch_size == 0 {
            return Err(KnowledgeError::configuration(
                "embedding.batch_size must be a positive integer",
            ));
        }
        if self.embedding.concurrency == 0 {
            return Err(KnowledgeError::configuration(
                "embedding.concurrency must be a positive integer",
            ));
        }
        if !self.embedding.model.contains(':') {
            return Err(KnowledgeError::configuration(format!(
                "embedding.model must be in provider:model form, got '{}'",
                self.embedding.model
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.knowledge.collection_name, "knowledge");
        assert_eq!(config.knowledge.chunk_size, 4000);
        assert_eq!(config.knowledge.chunk_overlap, 200);
        assert_eq!(config.search.results_limit, 3);
        assert!((config.search.score_threshold - 0.35).abs() < f32::EPSILON);
        assert!(config.embedding.model.starts_with("fastembed:"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_template_parses_and_validates() {
        let template = include_str!("../config-templates/default.toml");
        let config: Config = toml::from_str(template).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.backend, StoreBackend::Lance);
        assert_eq!(config.embedding.model, Config::default().embedding.model);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [search]
            results_limit = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.search.results_limit, 5);
        assert!((config.search.score_threshold - 0.35).abs() < f32::EPSILON);
        assert_eq!(config.embedding.batch_size, 32);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_size() {
        let mut config = Config::default();
        config.knowledge.chunk_overlap = config.knowledge.chunk_size;
        let err = config.validate().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        assert!(KnowledgeConfig::new(3, 1.5).unwrap_err().is_configuration());
        assert!(KnowledgeConfig::new(0, 0.5).unwrap_err().is_configuration());
        assert!(KnowledgeConfig::new(1, 0.0).is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [knowledge]
            collection_name = "team_docs"
            chunk_size = 500
            chunk_overlap = 50

            [store]
            backend = "memory"
            "#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.knowledge.collection_name, "team_docs");
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_load_from_rejects_bad_collection_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[knowledge]\ncollection_name = \"bad name!\"\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.is_configuration());
    }
}
