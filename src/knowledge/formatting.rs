use colored::Colorize;

use crate::knowledge::scope::KnowledgeRetrieval;
use crate::knowledge::types::{CollectionStats, IngestReport, Metadata};

pub fn format_retrieval(retrieval: &KnowledgeRetrieval) -> String {
    let mut output = String::new();

    if retrieval.query.rewritten {
        output.push_str(&format!("Query: {}", retrieval.query.text).bright_black().to_string());
        output.push_str("\n\n");
    }

    for scope in &retrieval.skipped {
        output.push_str(
            &format!("{} knowledge skipped: embedding provider unavailable", scope.as_str())
                .yellow()
                .to_string(),
        );
        output.push('\n');
    }

    if retrieval.is_empty() {
        output.push_str("No relevant knowledge found");
        return output;
    }

    for entry in &retrieval.entries {
        let chunk = &entry.scored.chunk;
        output.push_str(&"━".repeat(60));
        output.push('\n');

        // Source and position
        output.push_str(&chunk.source_id.blue().bold().to_string());
        if let Some(location) = unit_location(&chunk.metadata) {
            output.push_str(&format!(" ({})", location).blue().to_string());
        }
        output.push_str(
            &format!(
                "  #{} [{}..{}]",
                chunk.chunk_index, chunk.char_start, chunk.char_end
            )
            .bright_black()
            .to_string(),
        );
        output.push('\n');

        output.push_str(
            &format!("{} / {}", entry.scope.as_str(), entry.collection)
                .cyan()
                .to_string(),
        );
        output.push('\n');

        // Content preview (first 200 chars)
        let content = if chunk.content.chars().count() > 200 {
            format!("{}...", truncate_chars(&chunk.content, 200))
        } else {
            chunk.content.clone()
        };
        output.push_str(&content);
        output.push('\n');

        let score_pct = (entry.scored.score.max(0.0) * 100.0) as u32;
        output.push_str(&format!("{}% relevant", score_pct).green().to_string());
        output.push_str("\n\n");
    }

    output
}

pub fn format_ingest_report(report: &IngestReport) -> String {
    let mut output = String::new();

    for outcome in &report.outcomes {
        match &outcome.error {
            None => {
                let mut line = format!(
                    "{} {}: {} chunks from {} documents",
                    "✓".green(),
                    outcome.source_id,
                    outcome.chunks_created,
                    outcome.documents
                );
                if outcome.documents_cached > 0 {
                    line.push_str(&format!(" ({} unchanged)", outcome.documents_cached));
                }
                output.push_str(&line);
            }
            Some(err) => {
                output.push_str(&format!("{} {}: {}", "✗".red(), outcome.source_id, err));
            }
        }
        output.push('\n');
    }

    output
}

pub fn format_stats(stats: &CollectionStats) -> String {
    let mut output = String::new();

    output.push_str(&format!("Collection '{}'", stats.collection).bold().to_string());
    output.push('\n');
    output.push_str(&format!("Total Sources: {}", stats.total_sources));
    output.push('\n');
    output.push_str(&format!("Total Chunks: {}", stats.total_chunks));
    output.push('\n');

    if stats.total_sources > 0 {
        let avg = stats.total_chunks / stats.total_sources;
        output.push_str(&format!("Average Chunks/Source: {}", avg));
        output.push('\n');
    }

    if let Some(provider) = &stats.provider {
        output.push_str(&format!("Embedding Provider: {}", provider));
        output.push('\n');
    }

    if let Some(dimension) = stats.dimension {
        output.push_str(&format!("Dimension: {}", dimension));
        output.push('\n');
    }

    output
}

pub fn format_collection_list(stats: &[CollectionStats]) -> String {
    if stats.is_empty() {
        return "No knowledge collections".to_string();
    }

    let mut output = String::new();

    output.push_str(
        &format!(
            "{:<42} {:<8} {:<8} {}\n",
            "Collection", "Sources", "Chunks", "Provider"
        )
        .bold()
        .to_string(),
    );
    output.push_str(&"─".repeat(80));
    output.push('\n');

    for entry in stats {
        let name = if entry.collection.len() > 40 {
            format!("{}...", truncate_chars(&entry.collection, 37))
        } else {
            entry.collection.clone()
        };

        output.push_str(&format!(
            "{:<42} {:<8} {:<8} {}\n",
            name,
            entry.total_sources,
            entry.total_chunks,
            entry.provider.as_deref().unwrap_or("-")
        ));
    }

    output
}

/// `p. 3`, `sheet 1, row 12-18`
fn unit_location(metadata: &Metadata) -> Option<String> {
    let parts: Vec<String> = [("page", "p."), ("sheet", "sheet"), ("row", "row")]
        .iter()
        .filter_map(|(key, label)| metadata.get(*key).map(|v| format!("{} {}", label, v)))
        .collect();
    (!parts.is_empty()).then(|| parts.join(", "))
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}
