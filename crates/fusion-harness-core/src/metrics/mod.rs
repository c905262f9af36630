//! Append-only metrics collection and windowed aggregation.
//!
//! The collector only ever appends [`MetricRecord`]s; readers take a
//! shared lock and never observe a record being modified. Experiment
//! analysis reads records back by their `experiment` / `variant` tags,
//! so the collector itself knows nothing about experiments.

pub mod retrieval;

use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Metadata, MetricRecord};

pub use retrieval::{RelevanceJudgment, RetrievalQuality};

/// Metric names recorded by the serving path.
pub mod names {
    pub const ANSWER_LATENCY_MS: &str = "answer.latency_ms";
    pub const ANSWER_CONFIDENCE: &str = "answer.confidence";
    /// 1.0 when fusion produced an answer, 0.0 when all providers failed.
    pub const ANSWER_SUCCESS: &str = "answer.success";
    pub const PROVIDER_LATENCY_MS: &str = "provider.latency_ms";
    pub const RETRIEVAL_TOP_SIMILARITY: &str = "retrieval.top_similarity";
    pub const RETRIEVAL_PRECISION_AT_K: &str = "retrieval.precision_at_k";
    pub const RETRIEVAL_RECALL_AT_K: &str = "retrieval.recall_at_k";
    pub const RETRIEVAL_MRR: &str = "retrieval.mrr";
    pub const RETRIEVAL_NDCG_AT_K: &str = "retrieval.ndcg_at_k";
    pub const GUARD_RAIL_BREACH: &str = "experiment.guard_rail_breach";
}

/// Tag keys.
pub mod tags {
    pub const EXPERIMENT: &str = "experiment";
    pub const VARIANT: &str = "variant";
    pub const SESSION: &str = "session";
    pub const STRATEGY: &str = "strategy";
    pub const PROVIDER: &str = "provider";
    pub const STATUS: &str = "status";
    pub const K: &str = "k";
}

/// Windowed summary of one metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
}

impl Aggregate {
    pub fn from_values(mut values: Vec<f64>) -> Self {
        values.retain(|v| v.is_finite());
        if values.is_empty() {
            return Self::default();
        }
        values.sort_by(|a, b| a.total_cmp(b));
        let count = values.len();
        Self {
            count,
            mean: values.iter().sum::<f64>() / count as f64,
            p50: percentile(&values, 0.50),
            p95: percentile(&values, 0.95),
        }
    }
}

/// Nearest-rank percentile of sorted, non-empty `values`.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Append-only metric store.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    records: RwLock<Vec<MetricRecord>>,
    judgments: RwLock<Vec<RelevanceJudgment>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with history loaded from storage.
    pub fn from_records(records: Vec<MetricRecord>) -> Self {
        Self {
            records: RwLock::new(records),
            judgments: RwLock::new(Vec::new()),
        }
    }

    pub fn record(&self, record: MetricRecord) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Build, append and return a record stamped now.
    pub fn record_value(&self, name: &str, value: f64, tags: Metadata) -> MetricRecord {
        let rec = MetricRecord::new(name, value, tags);
        self.record(rec.clone());
        rec
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records named `name` carrying every tag in `tags`.
    pub fn records_matching(&self, name: &str, tags: &Metadata) -> Vec<MetricRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.metric_name == name && r.has_tags(tags))
            .cloned()
            .collect()
    }

    /// Aggregate over the trailing `window` (all history when `None`).
    pub fn aggregate(&self, name: &str, window: Option<Duration>, tags: &Metadata) -> Aggregate {
        self.aggregate_at(name, window, tags, Utc::now())
    }

    pub fn aggregate_at(
        &self,
        name: &str,
        window: Option<Duration>,
        tags: &Metadata,
        now: DateTime<Utc>,
    ) -> Aggregate {
        let since = window.map(|w| now - w);
        let values: Vec<f64> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.metric_name == name && r.has_tags(tags))
            .filter(|r| since.map(|s| r.timestamp >= s).unwrap_or(true) && r.timestamp <= now)
            .map(|r| r.value)
            .collect();
        Aggregate::from_values(values)
    }

    /// Distinct metric names, sorted.
    pub fn metric_names(&self) -> Vec<String> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = records.iter().map(|r| r.metric_name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn judgment_count(&self) -> usize {
        self.judgments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Evaluate one batch of judgments at `k`, log them and append the four
    /// quality metrics tagged with `k`. Earlier batches are not rescored.
    /// Returns the computed quality and the appended records.
    pub fn evaluate_retrieval(
        &self,
        judgments: Vec<RelevanceJudgment>,
        k: usize,
    ) -> (RetrievalQuality, Vec<MetricRecord>) {
        let quality = retrieval::evaluate(&judgments, k);
        if quality.queries == 0 {
            return (quality, Vec::new());
        }
        self.judgments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(judgments);
        let mut t = Metadata::new();
        t.insert(tags::K.to_string(), k.to_string());
        let records = vec![
            self.record_value(names::RETRIEVAL_PRECISION_AT_K, quality.precision_at_k, t.clone()),
            self.record_value(names::RETRIEVAL_RECALL_AT_K, quality.recall_at_k, t.clone()),
            self.record_value(names::RETRIEVAL_MRR, quality.mrr, t.clone()),
            self.record_value(names::RETRIEVAL_NDCG_AT_K, quality.ndcg_at_k, t),
        ];
        (quality, records)
    }
}
