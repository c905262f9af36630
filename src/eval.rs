//! `fuse eval`: retrieval quality over labelled queries.
//!
//! Input is JSONL, one case per line:
//! `{"query": "...", "relevant": ["guide.md", "<document id>"]}`.
//! Relevant entries match a retrieved passage's `source` metadata, or its
//! document id when it has no source.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

use crate::config::Config;
use crate::engine::RagEngine;

#[derive(Debug, Deserialize)]
struct EvalCase {
    query: String,
    relevant: BTreeSet<String>,
}

pub fn parse_cases(content: &str) -> Result<Vec<(String, BTreeSet<String>)>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, line)| {
            let case: EvalCase = serde_json::from_str(line)
                .with_context(|| format!("Invalid JSON on line {}", i + 1))?;
            Ok((case.query, case.relevant))
        })
        .collect()
}

pub async fn run_eval(config: &Config, path: &Path, k: usize) -> Result<()> {
    if k == 0 {
        bail!("--k must be >= 1");
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let cases = parse_cases(&content)?;
    let engine = RagEngine::from_config(config).await?;
    let quality = engine.evaluate_retrieval(cases, k).await?;

    println!("Retrieval quality over {} queries (k = {})", quality.queries, quality.k);
    println!("  Precision@{}: {:.4}", k, quality.precision_at_k);
    println!("  Recall@{}:    {:.4}", k, quality.recall_at_k);
    println!("  MRR:          {:.4}", quality.mrr);
    println!("  NDCG@{}:      {:.4}", k, quality.ndcg_at_k);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cases() {
        let cases = parse_cases(
            "{\"query\": \"copd\", \"relevant\": [\"lungs.md\"]}\n\n{\"query\": \"flu\", \"relevant\": []}\n",
        )
        .unwrap();
        assert_eq!(cases.len(), 2);
        assert!(cases[0].1.contains("lungs.md"));
        assert!(parse_cases("{\"query\": 1}").is_err());
    }
}
