//! `fuse experiment`: create, start, stop, list and analyze experiments.
//!
//! Experiments are defined in TOML:
//!
//! ```toml
//! id = "fusion-ab"
//! primary_metric = "answer.confidence"
//!
//! [guard_rails]
//! max_latency_ms = 3000
//! min_confidence = 0.4
//! control_variant = "control"
//!
//! [[variants]]
//! id = "control"
//! strategy = "weighted_average"
//! allocation_weight = 0.5
//!
//! [[variants]]
//! id = "routing"
//! strategy = "confidence_routing"
//! allocation_weight = 0.5
//! ```

use anyhow::{Context, Result};
use std::path::Path;

use fusion_harness_core::experiment::{Experiment, ExperimentReport};

use crate::config::Config;
use crate::engine::RagEngine;

pub fn parse_experiment(content: &str) -> Result<Experiment> {
    toml::from_str(content).with_context(|| "Failed to parse experiment definition")
}

pub async fn run_create(config: &Config, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let experiment = parse_experiment(&content)?;
    let engine = RagEngine::from_config(config).await?;
    let exp = engine.create_experiment(experiment).await?;
    println!(
        "Created experiment '{}' with {} variants (DRAFT)",
        exp.id,
        exp.variants.len()
    );
    Ok(())
}

pub async fn run_start(config: &Config, id: &str) -> Result<()> {
    let engine = RagEngine::from_config(config).await?;
    let exp = engine.start_experiment(id).await?;
    println!("Experiment '{}' is {}", exp.id, exp.status);
    Ok(())
}

pub async fn run_stop(config: &Config, id: &str) -> Result<()> {
    let engine = RagEngine::from_config(config).await?;
    let exp = engine.stop_experiment(id).await?;
    println!("Experiment '{}' is {}", exp.id, exp.status);
    Ok(())
}

pub async fn run_list(config: &Config) -> Result<()> {
    let engine = RagEngine::from_config(config).await?;
    let experiments = engine.experiments().list();
    if experiments.is_empty() {
        println!("No experiments.");
        return Ok(());
    }
    println!("{:<24} {:<9} {:<10} VARIANTS", "ID", "STATUS", "METRIC");
    println!("{}", "-".repeat(72));
    for exp in experiments {
        let variants: Vec<String> = exp
            .variants
            .iter()
            .map(|v| format!("{}={}@{:.2}", v.id, v.strategy, v.allocation_weight))
            .collect();
        println!(
            "{:<24} {:<9} {:<10} {}",
            exp.id,
            exp.status.as_str(),
            exp.primary_metric,
            variants.join(" ")
        );
    }
    Ok(())
}

pub async fn run_analyze(config: &Config, id: &str, json: bool) -> Result<()> {
    let engine = RagEngine::from_config(config).await?;
    let report = engine.analyze(id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &ExperimentReport) {
    println!(
        "Experiment {} ({})  metric: {} [{:?}]  control: {}  alpha: {}",
        report.experiment_id,
        report.status,
        report.primary_metric,
        report.metric_kind,
        report.control_variant,
        report.alpha
    );
    println!();
    println!(
        "  {:<16} {:<20} {:>6} {:>10} {:>22} {:>10} {:>4}",
        "VARIANT", "STRATEGY", "N", "MEAN", "95% CI", "P", "SIG"
    );
    for v in report.variants.values() {
        let ci = v
            .confidence_interval
            .map(|c| format!("[{:.4}, {:.4}]", c.lower, c.upper))
            .unwrap_or_else(|| "-".to_string());
        let p = v
            .comparison
            .map(|c| format!("{:.4}", c.p_value))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<16} {:<20} {:>6} {:>10.4} {:>22} {:>10} {:>4}",
            v.variant_id,
            v.strategy.id(),
            v.n,
            v.mean_metric,
            ci,
            p,
            if v.significant { "*" } else { "" }
        );
    }
    println!();
    println!("  Reports are advisory; serving is never blocked on them.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_harness_core::experiment::ExperimentStatus;
    use fusion_harness_core::fusion::FusionStrategy;

    #[test]
    fn test_parse_experiment_toml() {
        let exp = parse_experiment(
            r#"
id = "fusion-ab"

[guard_rails]
max_latency_ms = 3000
control_variant = "control"

[early_stopping]
min_samples_per_variant = 50

[[variants]]
id = "control"
strategy = "weighted_average"
allocation_weight = 0.5

[[variants]]
id = "vote"
strategy = "majority_vote"
allocation_weight = 0.5
providers = ["gpt", "llama"]
"#,
        )
        .unwrap();
        assert_eq!(exp.status, ExperimentStatus::Draft);
        assert_eq!(exp.variants[1].strategy, FusionStrategy::MajorityVote);
        assert_eq!(exp.variants[1].providers, vec!["gpt", "llama"]);
        assert_eq!(exp.guard_rails.max_latency_ms, Some(3000));
        assert_eq!(exp.early_stopping.as_ref().unwrap().alpha, 0.05);
        assert!(exp.validate().is_ok());
    }
}
