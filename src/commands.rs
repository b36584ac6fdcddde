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

use anyhow::{Context, Result};
use serde_json::json;
use std::io::{self, Write};
use std::sync::Arc;

use groundwork::config::{Config, KnowledgeConfig};
use groundwork::knowledge::formatting::{
    format_collection_list, format_ingest_report, format_retrieval, format_stats,
};
use groundwork::knowledge::{
    AgentScope, ChunkParams, CrewScope, IngestMode, KnowledgeBase, KnowledgeRetriever,
    KnowledgeSource, RewrittenQuery,
};

use crate::cli::{Commands, ScopeArgs};

pub async fn execute(config: &Config, command: Commands) -> Result<()> {
    match command {
        Commands::Add {
            text,
            files,
            url,
            chunk_size,
            chunk_overlap,
            tolerate_partial,
            all_or_nothing,
            scope,
        } => {
            let mut sources: Vec<KnowledgeSource> =
                text.into_iter().map(KnowledgeSource::text).collect();
            if !files.is_empty() {
                sources.push(KnowledgeSource::files(files));
            }
            if !url.is_empty() {
                sources.push(KnowledgeSource::remote(url));
            }
            if sources.is_empty() {
                anyhow::bail!("Nothing to add: pass --text, --files or --url");
            }

            let tolerate = tolerate_partial || config.knowledge.tolerate_partial;
            let sources = sources
                .into_iter()
                .map(|s| s.tolerate_partial(tolerate))
                .collect();

            let (crew, agent) = open_scopes(config, &scope).await?;
            let mut knowledge = target(&crew, agent.as_ref()).as_ref().clone();
            if chunk_size.is_some() || chunk_overlap.is_some() {
                knowledge = knowledge.with_chunking(ChunkParams::new(
                    chunk_size.unwrap_or(config.knowledge.chunk_size),
                    chunk_overlap.unwrap_or(config.knowledge.chunk_overlap),
                )?);
            }

            let mode = if all_or_nothing {
                IngestMode::AllOrNothing
            } else {
                IngestMode::Isolated
            };
            let report = knowledge.add_sources(sources, mode).await?;
            print!("{}", format_ingest_report(&report));

            if !report.is_success() {
                anyhow::bail!(
                    "{} of {} sources failed",
                    report.failures().count(),
                    report.outcomes.len()
                );
            }
        }

        Commands::Search {
            task,
            raw,
            limit,
            threshold,
            format,
            scope,
        } => {
            let (mut crew, agent) = open_scopes(config, &scope).await?;
            if limit.is_some() || threshold.is_some() {
                crew = crew.with_config(KnowledgeConfig::new(
                    limit.unwrap_or(config.search.results_limit),
                    threshold.unwrap_or(config.search.score_threshold),
                )?);
            }

            let retriever = KnowledgeRetriever::from_config(config)?;
            let retrieval = if raw {
                let query = RewrittenQuery {
                    text: task,
                    rewritten: false,
                };
                retriever.search(query, Some(&crew), agent.as_ref()).await?
            } else {
                retriever.retrieve(&task, Some(&crew), agent.as_ref()).await?
            };

            match format.as_str() {
                "json" => {
                    let output = json!({
                        "query": retrieval.query.text,
                        "rewritten": retrieval.query.rewritten,
                        "skipped": retrieval.skipped,
                        "results": retrieval.entries,
                    });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                "text" => println!("{}", format_retrieval(&retrieval)),
                other => anyhow::bail!("Unknown format '{}': use text or json", other),
            }
        }

        Commands::Reset { yes, scope } => {
            let (crew, agent) = open_scopes(config, &scope).await?;
            let knowledge = target(&crew, agent.as_ref());

            if !yes
                && !confirm(&format!(
                    "Remove ALL knowledge in collection '{}'?",
                    knowledge.collection()
                ))?
            {
                println!("Aborted");
                return Ok(());
            }

            let removed = knowledge.reset().await?;
            println!(
                "Removed {} chunks from collection '{}'",
                removed,
                knowledge.collection()
            );
        }

        Commands::Forget { source_id, scope } => {
            let (crew, agent) = open_scopes(config, &scope).await?;
            let knowledge = target(&crew, agent.as_ref());
            let removed = knowledge.delete_source(&source_id).await?;
            println!("Removed {} chunks of '{}'", removed, source_id);
        }

        Commands::Stats { scope } => {
            let (crew, agent) = open_scopes(config, &scope).await?;
            let stats = target(&crew, agent.as_ref()).stats().await?;
            print!("{}", format_stats(&stats));
        }

        Commands::Collections => {
            let (crew, _) = open_scopes(config, &ScopeArgs::default()).await?;
            let knowledge = crew.knowledge();
            let mut all = Vec::new();
            for name in knowledge.list_collections().await? {
                all.push(knowledge.for_collection(name)?.stats().await?);
            }
            println!("{}", format_collection_list(&all));
        }
    }

    Ok(())
}

/// Crew scope from config, plus the agent scope when a role is given
async fn open_scopes(
    config: &Config,
    scope: &ScopeArgs,
) -> Result<(CrewScope, Option<AgentScope>)> {
    let mut knowledge = KnowledgeBase::from_config(config)
        .await
        .context("Failed to open knowledge base")?;
    if let Some(collection) = &scope.collection {
        knowledge = knowledge.for_collection(collection)?;
    }

    let crew = CrewScope::new(Arc::new(knowledge)).with_config(config.search);
    let agent = match &scope.agent {
        Some(role) => Some(AgentScope::for_crew(role, &crew)?),
        None => None,
    };
    Ok((crew, agent))
}

/// Collection a write or admin command applies to
fn target<'a>(crew: &'a CrewScope, agent: Option<&'a AgentScope>) -> &'a Arc<KnowledgeBase> {
    match agent {
        Some(agent) => agent.knowledge(),
        None => crew.knowledge(),
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N]: ", prompt);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
