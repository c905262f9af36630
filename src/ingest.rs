//! `fuse ingest`: bulk-load passages from a JSONL file.
//!
//! Each non-empty line is `{"text": "...", "metadata": {"source": "..."}}`.
//! Passages are embedded and staged, then published with a single index
//! rebuild. Chunking happens upstream.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use fusion_harness_core::models::Metadata;

use crate::config::Config;
use crate::engine::RagEngine;

#[derive(Debug, Deserialize)]
struct IngestLine {
    text: String,
    #[serde(default)]
    metadata: Metadata,
}

/// Parse JSONL into `(text, metadata)` items, skipping blank lines.
pub fn parse_jsonl(content: &str) -> Result<Vec<(String, Metadata)>> {
    let mut items = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: IngestLine = serde_json::from_str(line)
            .with_context(|| format!("Invalid JSON on line {}", i + 1))?;
        if parsed.text.trim().is_empty() {
            bail!("Line {}: text must not be empty", i + 1);
        }
        items.push((parsed.text, parsed.metadata));
    }
    Ok(items)
}

pub async fn run_ingest(config: &Config, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let items = parse_jsonl(&content)?;
    if items.is_empty() {
        println!("No passages in {}", path.display());
        return Ok(());
    }

    let engine = RagEngine::from_config(config).await?;
    let report = engine.ingest_batch(items).await?;
    println!(
        "Ingested {} passage{} (index generation {}, {} documents total)",
        report.ingested,
        if report.ingested == 1 { "" } else { "s" },
        report.generation,
        engine.index().len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jsonl() {
        let items = parse_jsonl(
            "{\"text\": \"a\", \"metadata\": {\"source\": \"x.md\"}}\n\n{\"text\": \"b\"}\n",
        )
        .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].1["source"], "x.md");
        assert!(items[1].1.is_empty());
    }

    #[test]
    fn test_parse_jsonl_reports_line() {
        let err = parse_jsonl("{\"text\": \"a\"}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
        assert!(parse_jsonl("{\"text\": \"  \"}").is_err());
    }
}
