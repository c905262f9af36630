//! Per-variant experiment reports.
//!
//! Samples are the experiment's primary metric, read back from the
//! metrics collector by `experiment` / `variant` tags. Each non-control
//! variant is compared against control with Welch's t-test (continuous
//! metrics) or a pooled two-proportion z-test (binary metrics, where a
//! value ≥ 0.5 counts as a success). Reports are advisory only.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EarlyStopping, Experiment, ExperimentStatus, MetricKind};
use crate::fusion::FusionStrategy;
use crate::metrics::{tags, MetricsCollector};
use crate::models::Metadata;
use crate::stats::{
    mean_confidence_interval, proportion_confidence_interval, two_proportion_z_test,
    welch_t_test, ConfidenceInterval, TestOutcome,
};

pub const CONFIDENCE_LEVEL: f64 = 0.95;
pub const DEFAULT_ALPHA: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantReport {
    pub variant_id: String,
    pub strategy: FusionStrategy,
    pub n: usize,
    pub mean_metric: f64,
    pub confidence_interval: Option<ConfidenceInterval>,
    /// Comparison against control; `None` for control itself or when the
    /// data is too thin to test.
    pub comparison: Option<TestOutcome>,
    pub significant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub experiment_id: String,
    pub status: ExperimentStatus,
    pub primary_metric: String,
    pub metric_kind: MetricKind,
    pub control_variant: String,
    pub alpha: f64,
    pub variants: BTreeMap<String, VariantReport>,
    pub generated_at: DateTime<Utc>,
}

impl ExperimentReport {
    /// True when every variant has enough samples and at least one
    /// differs significantly from control.
    pub fn ready_to_stop(&self, rule: &EarlyStopping) -> bool {
        let enough = self
            .variants
            .values()
            .all(|v| v.n >= rule.min_samples_per_variant);
        let decided = self
            .variants
            .values()
            .filter_map(|v| v.comparison)
            .any(|c| c.significant(rule.alpha));
        enough && decided
    }

    pub fn total_samples(&self) -> usize {
        self.variants.values().map(|v| v.n).sum()
    }
}

fn is_success(value: f64) -> bool {
    value >= 0.5
}

pub(crate) fn build_report(experiment: &Experiment, metrics: &MetricsCollector) -> ExperimentReport {
    let alpha = experiment
        .early_stopping
        .as_ref()
        .map(|e| e.alpha)
        .unwrap_or(DEFAULT_ALPHA);
    let control_id = experiment
        .control_variant()
        .map(|v| v.id.clone())
        .unwrap_or_default();

    let samples: BTreeMap<&str, Vec<f64>> = experiment
        .variants
        .iter()
        .map(|v| {
            let mut filter = Metadata::new();
            filter.insert(tags::EXPERIMENT.to_string(), experiment.id.clone());
            filter.insert(tags::VARIANT.to_string(), v.id.clone());
            let values = metrics
                .records_matching(&experiment.primary_metric, &filter)
                .into_iter()
                .map(|r| r.value)
                .filter(|x| x.is_finite())
                .collect();
            (v.id.as_str(), values)
        })
        .collect();

    let empty = Vec::new();
    let control = samples.get(control_id.as_str()).unwrap_or(&empty);

    let variants = experiment
        .variants
        .iter()
        .map(|v| {
            let values = samples.get(v.id.as_str()).unwrap_or(&empty);
            let n = values.len();
            let mean_metric = if n == 0 {
                0.0
            } else {
                values.iter().sum::<f64>() / n as f64
            };

            let (confidence_interval, comparison) = match experiment.metric_kind {
                MetricKind::Continuous => (
                    mean_confidence_interval(values, CONFIDENCE_LEVEL),
                    if v.id == control_id {
                        None
                    } else {
                        welch_t_test(control, values)
                    },
                ),
                MetricKind::Binary => {
                    let successes = values.iter().filter(|x| is_success(**x)).count();
                    let control_successes = control.iter().filter(|x| is_success(**x)).count();
                    (
                        proportion_confidence_interval(successes, n, CONFIDENCE_LEVEL),
                        if v.id == control_id {
                            None
                        } else {
                            two_proportion_z_test(control_successes, control.len(), successes, n)
                        },
                    )
                }
            };

            let report = VariantReport {
                variant_id: v.id.clone(),
                strategy: v.strategy,
                n,
                mean_metric,
                confidence_interval,
                significant: comparison.map(|c| c.significant(alpha)).unwrap_or(false),
                comparison,
            };
            (v.id.clone(), report)
        })
        .collect();

    ExperimentReport {
        experiment_id: experiment.id.clone(),
        status: experiment.status,
        primary_metric: experiment.primary_metric.clone(),
        metric_kind: experiment.metric_kind,
        control_variant: control_id,
        alpha,
        variants,
        generated_at: Utc::now(),
    }
}
