//! Background aggregation job.
//!
//! Off the request path, on a fixed interval: fold new feedback events
//! into the provider weights, then apply early-stopping rules to running
//! experiments.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::engine::RagEngine;

/// What one tick changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    pub weights_updated: bool,
    pub stopped_experiments: Vec<String>,
}

pub async fn run_once(engine: &RagEngine) -> TickOutcome {
    let weights_updated = engine.refresh_weights();
    let stopped_experiments = engine
        .check_early_stopping()
        .await
        .into_iter()
        .map(|r| r.experiment_id)
        .collect();
    TickOutcome {
        weights_updated,
        stopped_experiments,
    }
}

/// Spawn the job. Abort the handle to stop it.
pub fn spawn(engine: Arc<RagEngine>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let outcome = run_once(&engine).await;
            if outcome.weights_updated || !outcome.stopped_experiments.is_empty() {
                info!(
                    weights_updated = outcome.weights_updated,
                    stopped = ?outcome.stopped_experiments,
                    "aggregation tick"
                );
            } else {
                debug!("aggregation tick, nothing new");
            }
        }
    })
}
