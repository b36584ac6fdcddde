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

/// Collection used when no name is configured
pub const DEFAULT_COLLECTION_NAME: &str = "knowledge";

pub const DEFAULT_RESULTS_LIMIT: usize = 3;
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.35;

/// Chunking defaults, in characters
pub const DEFAULT_CHUNK_SIZE: usize = 4000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Local ONNX model run through octolib's fastembed backend; needs no credentials
pub const DEFAULT_EMBEDDING_MODEL: &str = "fastembed:BAAI/bge-small-en-v1.5";

pub const MAX_COLLECTION_NAME_LEN: usize = 64;

/// Prefix of LanceDB tables that hold knowledge collections
pub const COLLECTION_TABLE_PREFIX: &str = "kc_";

/// Instruction sent to the language model when turning a task prompt into a search query
pub const QUERY_REWRITE_SYSTEM_PROMPT: &str = "You rewrite task descriptions into search \
queries for a knowledge base. \
Keep the core information need of the task. \
Drop output formatting instructions, examples and boilerplate. \
Respond with the rewritten query only, without any explanation or quotes.";
