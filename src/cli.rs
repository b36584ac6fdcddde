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

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "groundwork")]
#[command(version, author = "Muvon Un Limited <opensource@muvon.io>")]
#[command(about = "Knowledge ingestion and retrieval for task-executing agents", long_about = None)]
pub struct Cli {
    /// Write JSON logs to a daily rotated file instead of the console
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Use this config file instead of the system one
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Which collection a command targets
#[derive(Args, Debug, Clone, Default)]
pub struct ScopeArgs {
    /// Agent role; targets that agent's own collection instead of the crew's
    #[arg(short, long)]
    pub agent: Option<String>,

    /// Crew collection name (defaults to knowledge.collection_name)
    #[arg(long)]
    pub collection: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest knowledge sources into a collection
    Add {
        /// Inline text to ingest (repeatable)
        #[arg(short, long)]
        text: Vec<String>,

        /// Files to ingest as one source (txt, md, html, json, csv, pdf, docx)
        #[arg(short, long)]
        files: Vec<PathBuf>,

        /// Remote documents to fetch and ingest as one source
        #[arg(short, long)]
        url: Vec<String>,

        /// Characters per chunk (overrides config)
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Characters shared by consecutive chunks (overrides config)
        #[arg(long)]
        chunk_overlap: Option<usize>,

        /// Skip unreadable files or URLs instead of failing their source
        #[arg(long)]
        tolerate_partial: bool,

        /// Store nothing unless every source succeeds
        #[arg(long)]
        all_or_nothing: bool,

        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Retrieve ranked passages for a task or question
    Search {
        /// Task or question text
        task: String,

        /// Use the text as the query without rewriting it
        #[arg(long)]
        raw: bool,

        /// Maximum number of passages (overrides config)
        #[arg(short, long)]
        limit: Option<usize>,

        /// Minimum similarity score 0.0-1.0 (overrides config)
        #[arg(long)]
        threshold: Option<f32>,

        /// Output format: text or json
        #[arg(long, default_value = "text")]
        format: String,

        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Remove every record of a collection (DANGEROUS: cannot be undone)
    Reset {
        /// Confirm deletion without prompting
        #[arg(short = 'y', long)]
        yes: bool,

        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Remove the chunks of one document from a collection
    Forget {
        /// Document id (file path, URL or inline text id)
        source_id: String,

        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Show collection statistics
    Stats {
        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// List knowledge collections
    Collections,
}
