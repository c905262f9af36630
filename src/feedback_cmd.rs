//! `fuse feedback` and `fuse learn`.
//!
//! Feedback is only appended here. Weights move when the aggregation job
//! runs: once per `fuse learn`, or on every interval with `--watch`.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::engine::RagEngine;
use crate::learning;

pub async fn run_feedback(config: &Config, session: &str, provider: &str, reward: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&reward) {
        anyhow::bail!("--reward must be in [0.0, 1.0]");
    }
    let engine = RagEngine::from_config(config).await?;
    engine.record_feedback(session, provider, reward).await?;
    println!(
        "Recorded reward {:.2} for provider '{}' (session {})",
        reward, provider, session
    );
    Ok(())
}

pub async fn run_learn(config: &Config, watch: bool) -> Result<()> {
    let engine = Arc::new(RagEngine::from_config(config).await?);

    if watch {
        let every = Duration::from_secs(config.learning.interval_secs.max(1));
        println!(
            "Aggregating every {}s (Ctrl-C to stop)",
            every.as_secs()
        );
        let handle = learning::spawn(Arc::clone(&engine), every);
        tokio::signal::ctrl_c().await?;
        handle.abort();
        return Ok(());
    }

    let outcome = learning::run_once(&engine).await;
    println!("Provider weights:");
    for (provider, weight) in engine.fusion().weights().iter() {
        println!("  {:<16} {:.4}", provider, weight);
    }
    for id in &outcome.stopped_experiments {
        println!("Stopped experiment '{}' (early-stopping rule met)", id);
    }
    Ok(())
}
