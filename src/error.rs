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

//! Error taxonomy for the knowledge pipeline.
//!
//! Every fallible library call returns [`KnowledgeResult`]. The variants map
//! to how a failure is handled upstream:
//!
//! - `Configuration`: invalid parameters or mismatched embedding spaces; fatal, never retried
//! - `Source`: a knowledge source could not be loaded; fatal for that source only
//! - `Provider`: an embedding or language-model call failed
//! - `Storage`: the vector store backend failed

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type KnowledgeResult<T> = std::result::Result<T, KnowledgeError>;

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("source error ({source_id}): {message}")]
    Source {
        source_id: String,
        message: String,
        #[source]
        cause: Option<BoxError>,
    },

    #[error("provider error ({provider}): {message}")]
    Provider {
        provider: String,
        message: String,
        #[source]
        cause: Option<BoxError>,
    },

    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        cause: Option<BoxError>,
    },
}

impl KnowledgeError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn source_error(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            source_id: source_id.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn source_with(
        source_id: impl Into<String>,
        message: impl Into<String>,
        cause: impl Into<BoxError>,
    ) -> Self {
        Self::Source {
            source_id: source_id.into(),
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn provider_error(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn provider_with(
        provider: impl Into<String>,
        message: impl Into<String>,
        cause: impl Into<BoxError>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn storage_with(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::Storage {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    pub fn is_source(&self) -> bool {
        matches!(self, Self::Source { .. })
    }

    pub fn is_provider(&self) -> bool {
        matches!(self, Self::Provider { .. })
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}

impl From<lancedb::Error> for KnowledgeError {
    fn from(err: lancedb::Error) -> Self {
        Self::storage_with("lancedb operation failed", err)
    }
}

impl From<arrow_schema::ArrowError> for KnowledgeError {
    fn from(err: arrow_schema::ArrowError) -> Self {
        Self::storage_with("arrow conversion failed", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_source_error_keeps_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.txt");
        let err = KnowledgeError::source_with("files:abc", "failed to read file", io);

        assert!(err.is_source());
        assert!(!err.is_configuration());
        let cause = err.source().expect("cause should be attached");
        assert!(cause.to_string().contains("missing.txt"));
    }

    #[test]
    fn test_display_includes_context() {
        let err = KnowledgeError::provider_error("openai:text-embedding-3-small", "quota exceeded");
        assert_eq!(
            err.to_string(),
            "provider error (openai:text-embedding-3-small): quota exceeded"
        );
        assert!(err.is_provider());
    }

    #[test]
    fn test_configuration_has_no_cause() {
        let err = KnowledgeError::configuration("chunk_overlap must be smaller than chunk_size");
        assert!(err.source().is_none());
        assert!(err.is_configuration());
    }
}
