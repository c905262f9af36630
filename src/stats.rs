//! `fuse stats`: what is indexed and what has been measured.
//!
//! Prints row counts from the store, then a p50/p95 summary of every
//! metric recorded so far.

use anyhow::Result;

use fusion_harness_core::models::Metadata;

use crate::config::Config;
use crate::engine::RagEngine;

pub async fn run_stats(config: &Config) -> Result<()> {
    let engine = RagEngine::from_config(config).await?;
    let counts = match engine.store() {
        Some(store) => store.counts().await?,
        None => Default::default(),
    };

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Fusion Harness Stats");
    println!("====================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!();
    println!("  Documents:    {}", counts.documents);
    println!("  Generation:   {}", counts.generation);
    println!("  Experiments:  {}", counts.experiments);
    println!("  Assignments:  {}", counts.assignments);
    println!("  Feedback:     {}", counts.feedback_events);
    println!("  Metrics:      {}", counts.metric_records);

    let metrics = engine.metrics();
    let names = metrics.metric_names();
    if !names.is_empty() {
        println!();
        println!(
            "  {:<32} {:>8} {:>12} {:>12} {:>12}",
            "METRIC", "COUNT", "MEAN", "P50", "P95"
        );
        println!("  {}", "-".repeat(80));
        for name in names {
            let agg = metrics.aggregate(&name, None, &Metadata::new());
            println!(
                "  {:<32} {:>8} {:>12.3} {:>12.3} {:>12.3}",
                name, agg.count, agg.mean, agg.p50, agg.p95
            );
        }
    }

    let health = engine.gateway().health();
    if !health.is_empty() {
        println!();
        println!("  Providers:");
        for h in health {
            println!("    {:<16} {}", h.provider_id, h.state.as_str());
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
