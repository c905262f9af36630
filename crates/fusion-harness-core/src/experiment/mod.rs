//! A/B experiments over fusion strategies.
//!
//! # Lifecycle
//!
//! ```text
//!   create ──▶ DRAFT ──start──▶ RUNNING ──stop / early stop──▶ STOPPED
//!               ▲  │
//!               └──┘ update
//! ```
//!
//! Configuration is validated on every create and update, and again on
//! `start`, so an experiment with allocation weights that do not sum to
//! 1.0 (± [`WEIGHT_EPSILON`]) can never reach `RUNNING`.
//!
//! # Assignment
//!
//! [`ExperimentManager::assign_variant`] resolves, in order:
//!
//! 1. a pending one-shot guard-rail override (→ control),
//! 2. a pinned assignment restored from storage,
//! 3. the stable hash bucket (see [`assignment`]).
//!
//! Hash assignment touches no shared mutable state. The override map is
//! written only after a guard-rail breach, and `assign_variant` locks it
//! only while the pending-override counter is non-zero.

pub mod analysis;
pub mod assignment;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ExperimentError;
use crate::fusion::FusionStrategy;
use crate::metrics::{names, MetricsCollector};

pub use analysis::{ExperimentReport, VariantReport};
pub use assignment::{Assignment, AssignmentSource};

/// Tolerance on the allocation weight sum.
pub const WEIGHT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    #[default]
    Draft,
    Running,
    Stopped,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Draft => "DRAFT",
            ExperimentStatus::Running => "RUNNING",
            ExperimentStatus::Stopped => "STOPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "DRAFT" => Some(ExperimentStatus::Draft),
            "RUNNING" => Some(ExperimentStatus::Running),
            "STOPPED" => Some(ExperimentStatus::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the primary metric is compared across variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    #[default]
    Continuous,
    Binary,
}

/// One arm of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub strategy: FusionStrategy,
    pub allocation_weight: f64,
    /// Providers to fan out to; empty means every registered provider.
    #[serde(default)]
    pub providers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardRails {
    #[serde(default)]
    pub max_latency_ms: Option<u64>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    /// Defaults to the first variant.
    #[serde(default)]
    pub control_variant: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopping {
    pub min_samples_per_variant: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

fn default_alpha() -> f64 {
    analysis::DEFAULT_ALPHA
}

fn default_primary_metric() -> String {
    names::ANSWER_CONFIDENCE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub guard_rails: GuardRails,
    #[serde(default = "default_primary_metric")]
    pub primary_metric: String,
    #[serde(default)]
    pub metric_kind: MetricKind,
    #[serde(default)]
    pub early_stopping: Option<EarlyStopping>,
    #[serde(default)]
    pub status: ExperimentStatus,
}

impl Experiment {
    pub fn new(id: impl Into<String>, variants: Vec<Variant>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            variants,
            guard_rails: GuardRails::default(),
            primary_metric: default_primary_metric(),
            metric_kind: MetricKind::default(),
            early_stopping: None,
            status: ExperimentStatus::Draft,
        }
    }

    pub fn variant(&self, id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == id)
    }

    pub fn control_variant(&self) -> Option<&Variant> {
        match &self.guard_rails.control_variant {
            Some(id) => self.variant(id),
            None => self.variants.first(),
        }
    }

    pub fn weight_sum(&self) -> f64 {
        self.variants.iter().map(|v| v.allocation_weight).sum()
    }

    fn invalid(&self, reason: impl Into<String>) -> ExperimentError {
        ExperimentError::InvalidExperiment {
            id: self.id.clone(),
            reason: reason.into(),
        }
    }

    /// Full configuration check, including the weight sum.
    pub fn validate(&self) -> Result<(), ExperimentError> {
        if self.id.trim().is_empty() {
            return Err(self.invalid("id must not be empty"));
        }
        if self.variants.is_empty() {
            return Err(self.invalid("at least one variant is required"));
        }
        let mut seen = HashSet::new();
        for v in &self.variants {
            if v.id.trim().is_empty() {
                return Err(self.invalid("variant id must not be empty"));
            }
            if !seen.insert(v.id.as_str()) {
                return Err(self.invalid(format!("duplicate variant id '{}'", v.id)));
            }
            if !v.allocation_weight.is_finite() || v.allocation_weight < 0.0 {
                return Err(self.invalid(format!(
                    "variant '{}' has invalid allocation weight {}",
                    v.id, v.allocation_weight
                )));
            }
        }
        if let Some(control) = &self.guard_rails.control_variant {
            if self.variant(control).is_none() {
                return Err(self.invalid(format!("control variant '{}' is not a variant", control)));
            }
        }
        if let Some(min) = self.guard_rails.min_confidence {
            if !(0.0..=1.0).contains(&min) {
                return Err(self.invalid("min_confidence must be within [0, 1]"));
            }
        }
        if self.primary_metric.trim().is_empty() {
            return Err(self.invalid("primary_metric must not be empty"));
        }
        if let Some(rule) = &self.early_stopping {
            if !(rule.alpha > 0.0 && rule.alpha < 1.0) {
                return Err(self.invalid("early_stopping.alpha must be within (0, 1)"));
            }
            if rule.min_samples_per_variant < 2 {
                return Err(self.invalid("early_stopping.min_samples_per_variant must be at least 2"));
            }
        }
        let sum = self.weight_sum();
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(ExperimentError::WeightsDoNotSumToOne {
                id: self.id.clone(),
                sum,
            });
        }
        Ok(())
    }
}

/// Which guard-rail thresholds an outcome violated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardRailBreach {
    pub experiment_id: String,
    pub session_id: String,
    pub variant_id: String,
    pub control_variant: String,
    pub latency_exceeded: bool,
    pub confidence_below: bool,
}

type SessionKey = (String, String);

/// Owns experiment configuration and assignment state.
#[derive(Debug)]
pub struct ExperimentManager {
    experiments: RwLock<BTreeMap<String, Arc<Experiment>>>,
    pinned: RwLock<HashMap<SessionKey, String>>,
    overrides: Mutex<HashMap<SessionKey, String>>,
    /// Entries in `overrides`; only changed while that lock is held.
    pending_overrides: AtomicUsize,
    metrics: Arc<MetricsCollector>,
}

impl ExperimentManager {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self {
            experiments: RwLock::new(BTreeMap::new()),
            pinned: RwLock::new(HashMap::new()),
            overrides: Mutex::new(HashMap::new()),
            pending_overrides: AtomicUsize::new(0),
            metrics,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<Experiment>>> {
        self.experiments.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<Experiment>>> {
        self.experiments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new experiment in `DRAFT`.
    pub fn create(&self, mut experiment: Experiment) -> Result<Arc<Experiment>, ExperimentError> {
        experiment.status = ExperimentStatus::Draft;
        experiment.validate()?;
        let mut map = self.write();
        if map.contains_key(&experiment.id) {
            return Err(ExperimentError::AlreadyExists(experiment.id));
        }
        let exp = Arc::new(experiment);
        map.insert(exp.id.clone(), Arc::clone(&exp));
        info!(experiment = %exp.id, variants = exp.variants.len(), "experiment created");
        Ok(exp)
    }

    /// Replace a `DRAFT` experiment's configuration.
    pub fn update(&self, mut experiment: Experiment) -> Result<Arc<Experiment>, ExperimentError> {
        let mut map = self.write();
        let current = map
            .get(&experiment.id)
            .ok_or_else(|| ExperimentError::NotFound(experiment.id.clone()))?;
        if current.status != ExperimentStatus::Draft {
            return Err(ExperimentError::NotDraft {
                id: experiment.id.clone(),
                status: current.status,
            });
        }
        experiment.status = ExperimentStatus::Draft;
        experiment.validate()?;
        let exp = Arc::new(experiment);
        map.insert(exp.id.clone(), Arc::clone(&exp));
        Ok(exp)
    }

    pub fn start(&self, id: &str) -> Result<Arc<Experiment>, ExperimentError> {
        self.transition(id, ExperimentStatus::Draft, ExperimentStatus::Running)
    }

    pub fn stop(&self, id: &str) -> Result<Arc<Experiment>, ExperimentError> {
        self.transition(id, ExperimentStatus::Running, ExperimentStatus::Stopped)
    }

    fn transition(
        &self,
        id: &str,
        from: ExperimentStatus,
        to: ExperimentStatus,
    ) -> Result<Arc<Experiment>, ExperimentError> {
        let mut map = self.write();
        let current = map
            .get(id)
            .ok_or_else(|| ExperimentError::NotFound(id.to_string()))?;
        if current.status != from {
            return Err(ExperimentError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to,
            });
        }
        if to == ExperimentStatus::Running {
            current.validate()?;
        }
        let mut next = current.as_ref().clone();
        next.status = to;
        let exp = Arc::new(next);
        map.insert(id.to_string(), Arc::clone(&exp));
        info!(experiment = %id, from = %from, to = %to, "experiment transition");
        Ok(exp)
    }

    /// Reinstate a persisted experiment with its stored status.
    pub fn restore(&self, experiment: Experiment) -> Result<(), ExperimentError> {
        experiment.validate()?;
        self.write()
            .insert(experiment.id.clone(), Arc::new(experiment));
        Ok(())
    }

    /// Reinstate a persisted `(session, experiment) → variant` record.
    pub fn pin(&self, session_id: &str, experiment_id: &str, variant_id: &str) {
        self.pinned
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (session_id.to_string(), experiment_id.to_string()),
                variant_id.to_string(),
            );
    }

    /// Sessions whose next assignment is routed to control.
    pub fn pending_overrides(&self) -> usize {
        self.pending_overrides.load(Ordering::Acquire)
    }

    /// Consume the session's one-shot override, if any.
    fn take_override(&self, key: &SessionKey) -> Option<String> {
        if self.pending_overrides.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut overrides = self.overrides.lock().unwrap_or_else(PoisonError::into_inner);
        let taken = overrides.remove(key);
        if taken.is_some() {
            self.pending_overrides.fetch_sub(1, Ordering::AcqRel);
        }
        taken
    }

    pub fn get(&self, id: &str) -> Option<Arc<Experiment>> {
        self.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<Experiment>> {
        self.read().values().cloned().collect()
    }

    /// Running experiments, ordered by id.
    pub fn running(&self) -> Vec<Arc<Experiment>> {
        self.read()
            .values()
            .filter(|e| e.status == ExperimentStatus::Running)
            .cloned()
            .collect()
    }

    pub fn assign_variant(
        &self,
        session_id: &str,
        experiment_id: &str,
    ) -> Result<Assignment, ExperimentError> {
        let exp = self
            .get(experiment_id)
            .ok_or_else(|| ExperimentError::NotFound(experiment_id.to_string()))?;
        if exp.status != ExperimentStatus::Running {
            return Err(ExperimentError::NotRunning {
                id: exp.id.clone(),
                status: exp.status,
            });
        }
        let key = (session_id.to_string(), experiment_id.to_string());
        let make = |variant_id: String, source| Assignment {
            session_id: session_id.to_string(),
            experiment_id: experiment_id.to_string(),
            variant_id,
            source,
        };

        if let Some(variant_id) = self.take_override(&key) {
            if exp.variant(&variant_id).is_some() {
                return Ok(make(variant_id, AssignmentSource::GuardRail));
            }
        }

        let pinned = self
            .pinned
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        if let Some(variant_id) = pinned {
            if exp.variant(&variant_id).is_some() {
                return Ok(make(variant_id, AssignmentSource::Pinned));
            }
        }

        let b = assignment::bucket(experiment_id, session_id);
        let variant = assignment::choose_variant(&exp.variants, b).ok_or_else(|| {
            ExperimentError::InvalidExperiment {
                id: exp.id.clone(),
                reason: "no variant has positive allocation weight".into(),
            }
        })?;
        Ok(make(variant.id.clone(), AssignmentSource::Hashed))
    }

    /// Check a served response against the guard-rails. On a breach the
    /// session's next assignment is routed to control; the response already
    /// served is left alone.
    pub fn observe_outcome(
        &self,
        session_id: &str,
        experiment_id: &str,
        variant_id: &str,
        latency_ms: u64,
        confidence: f64,
    ) -> Option<GuardRailBreach> {
        let exp = self.get(experiment_id)?;
        let rails = &exp.guard_rails;
        let latency_exceeded = rails.max_latency_ms.map(|m| latency_ms > m).unwrap_or(false);
        let confidence_below = rails.min_confidence.map(|m| confidence < m).unwrap_or(false);
        if !latency_exceeded && !confidence_below {
            return None;
        }
        let control = exp.control_variant()?.id.clone();
        warn!(
            experiment = %experiment_id,
            session = %session_id,
            variant = %variant_id,
            latency_ms,
            confidence,
            control = %control,
            "guard-rail breached; next assignment routed to control"
        );
        let mut overrides = self.overrides.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (session_id.to_string(), experiment_id.to_string());
        if overrides.insert(key, control.clone()).is_none() {
            self.pending_overrides.fetch_add(1, Ordering::AcqRel);
        }
        drop(overrides);
        Some(GuardRailBreach {
            experiment_id: experiment_id.to_string(),
            session_id: session_id.to_string(),
            variant_id: variant_id.to_string(),
            control_variant: control,
            latency_exceeded,
            confidence_below,
        })
    }

    pub fn analyze(&self, experiment_id: &str) -> Result<ExperimentReport, ExperimentError> {
        let exp = self
            .get(experiment_id)
            .ok_or_else(|| ExperimentError::NotFound(experiment_id.to_string()))?;
        Ok(analysis::build_report(&exp, &self.metrics))
    }

    /// Apply the early-stopping rule to one running experiment. Returns the
    /// deciding report when the experiment was stopped.
    pub fn evaluate_early_stop(
        &self,
        experiment_id: &str,
    ) -> Result<Option<ExperimentReport>, ExperimentError> {
        let exp = self
            .get(experiment_id)
            .ok_or_else(|| ExperimentError::NotFound(experiment_id.to_string()))?;
        let Some(rule) = exp.early_stopping.as_ref() else {
            return Ok(None);
        };
        if exp.status != ExperimentStatus::Running {
            return Ok(None);
        }
        let report = analysis::build_report(&exp, &self.metrics);
        if !report.ready_to_stop(rule) {
            return Ok(None);
        }
        let stopped = self.stop(experiment_id)?;
        info!(
            experiment = %experiment_id,
            samples = report.total_samples(),
            "experiment stopped early"
        );
        Ok(Some(ExperimentReport {
            status: stopped.status,
            ..report
        }))
    }
}
