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

//! Knowledge ingestion and retrieval for task-executing agents.
//!
//! Sources are loaded, cut into overlapping chunks, embedded and stored per
//! collection. At task time the task text is rewritten into a query, every
//! applicable scope (crew, agent) is searched and the hits are merged into one
//! ranked, bounded list of passages.

pub mod config;
pub mod constants;
pub mod embedding;
pub mod error;
pub mod knowledge;
pub mod llm;
pub mod storage;

pub use config::{Config, KnowledgeConfig};
pub use embedding::Embedder;
pub use error::{KnowledgeError, KnowledgeResult};
pub use knowledge::{
    AgentScope, CrewScope, IngestMode, KnowledgeBase, KnowledgeRetrieval, KnowledgeRetriever,
    KnowledgeSource, RetrievalResult,
};
