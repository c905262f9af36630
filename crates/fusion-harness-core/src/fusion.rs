//! Response fusion.
//!
//! Combines the per-provider responses of one fan-out into a single
//! [`FusedResponse`] under a [`FusionStrategy`]:
//!
//! | Strategy | Answer | Confidence |
//! |----------|--------|------------|
//! | `weighted_average` | text of the highest effective weight | Σ wᵢ·cᵢ over OK providers |
//! | `confidence_routing` | most confident OK response | that response's confidence |
//! | `majority_vote` | modal normalised label | winners' Σ cᵢ / #OK |
//!
//! Only `OK` responses participate, one per provider id (the first wins).
//! With none, fusion fails with [`FusionError::AllFailed`] instead of
//! inventing an answer.
//!
//! Provider weights are held behind an `Arc` that the background weight
//! learner swaps wholesale; the request path only ever reads them.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FusionError, ProviderFailure};
use crate::models::{FusedResponse, FusionStatus, ProviderResponse};

/// Closed set of fusion strategies.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    #[default]
    WeightedAverage,
    ConfidenceRouting,
    MajorityVote,
}

impl FusionStrategy {
    pub const ALL: [FusionStrategy; 3] = [
        FusionStrategy::WeightedAverage,
        FusionStrategy::ConfidenceRouting,
        FusionStrategy::MajorityVote,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            FusionStrategy::WeightedAverage => "weighted_average",
            FusionStrategy::ConfidenceRouting => "confidence_routing",
            FusionStrategy::MajorityVote => "majority_vote",
        }
    }
}

impl fmt::Display for FusionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for FusionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "weighted_average" => Ok(FusionStrategy::WeightedAverage),
            "confidence_routing" | "best_confidence" => Ok(FusionStrategy::ConfidenceRouting),
            "majority_vote" => Ok(FusionStrategy::MajorityVote),
            other => Err(format!(
                "unknown fusion strategy '{}' (expected weighted_average, confidence_routing or majority_vote)",
                other
            )),
        }
    }
}

/// Per-provider weights. Providers without an entry weigh `1.0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderWeights(BTreeMap<String, f64>);

impl ProviderWeights {
    pub const DEFAULT_WEIGHT: f64 = 1.0;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, provider_id: &str) -> f64 {
        self.0
            .get(provider_id)
            .copied()
            .unwrap_or(Self::DEFAULT_WEIGHT)
    }

    /// Set a weight; negative or non-finite values are clamped to zero.
    pub fn set(&mut self, provider_id: impl Into<String>, weight: f64) {
        let w = if weight.is_finite() { weight.max(0.0) } else { 0.0 };
        self.0.insert(provider_id.into(), w);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    /// Effective weights over `providers`, summing to 1.0.
    ///
    /// Excluded providers' share is redistributed proportionally; if every
    /// remaining weight is zero the share is split equally.
    pub fn renormalize<'a>(
        &self,
        providers: impl IntoIterator<Item = &'a str>,
    ) -> BTreeMap<String, f64> {
        let raw: BTreeMap<String, f64> = providers
            .into_iter()
            .map(|p| (p.to_string(), self.get(p)))
            .collect();
        if raw.is_empty() {
            return raw;
        }
        let total: f64 = raw.values().sum();
        if total <= f64::EPSILON {
            let equal = 1.0 / raw.len() as f64;
            return raw.into_keys().map(|k| (k, equal)).collect();
        }
        raw.into_iter().map(|(k, w)| (k, w / total)).collect()
    }
}

impl FromIterator<(String, f64)> for ProviderWeights {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        let mut weights = ProviderWeights::new();
        for (k, v) in iter {
            weights.set(k, v);
        }
        weights
    }
}

/// Stateless combiner plus a swappable weight table.
#[derive(Debug, Default)]
pub struct FusionEngine {
    weights: RwLock<Arc<ProviderWeights>>,
}

impl FusionEngine {
    pub fn new(weights: ProviderWeights) -> Self {
        Self {
            weights: RwLock::new(Arc::new(weights)),
        }
    }

    pub fn weights(&self) -> Arc<ProviderWeights> {
        let guard = self.weights.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Atomically replace the weight table used by subsequent fusions.
    pub fn replace_weights(&self, weights: ProviderWeights) {
        let mut guard = self.weights.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(weights);
    }

    pub fn fuse(
        &self,
        strategy: FusionStrategy,
        responses: &[ProviderResponse],
    ) -> Result<FusedResponse, FusionError> {
        let ok = distinct_ok(responses);
        if ok.len() < responses.iter().filter(|r| r.is_ok()).count() {
            debug!(strategy = %strategy, kept = ok.len(), "duplicate provider responses dropped");
        }
        if ok.is_empty() {
            warn!(
                strategy = %strategy,
                providers = responses.len(),
                "fusion has no usable responses"
            );
            return Err(FusionError::AllFailed {
                strategy,
                failures: responses
                    .iter()
                    .map(|r| ProviderFailure {
                        provider_id: r.provider_id.clone(),
                        status: r.status,
                        message: r.error.clone(),
                    })
                    .collect(),
            });
        }

        let fused = match strategy {
            FusionStrategy::WeightedAverage => weighted_average(&self.weights(), &ok),
            FusionStrategy::ConfidenceRouting => confidence_routing(&ok),
            FusionStrategy::MajorityVote => majority_vote(&ok),
        };
        Ok(fused)
    }
}

fn distinct_ok(responses: &[ProviderResponse]) -> Vec<&ProviderResponse> {
    let mut seen = BTreeSet::new();
    responses
        .iter()
        .filter(|r| r.is_ok() && seen.insert(r.provider_id.as_str()))
        .collect()
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

fn weighted_average(weights: &ProviderWeights, ok: &[&ProviderResponse]) -> FusedResponse {
    let effective = weights.renormalize(ok.iter().map(|r| r.provider_id.as_str()));
    let weight_of = |r: &ProviderResponse| effective.get(&r.provider_id).copied().unwrap_or(0.0);

    let confidence: f64 = ok.iter().map(|r| weight_of(r) * r.confidence).sum();

    // Highest effective weight wins the text; then confidence, then id.
    let mut best = ok[0];
    for r in &ok[1..] {
        let order = cmp_f64(weight_of(r), weight_of(best))
            .then_with(|| cmp_f64(r.confidence, best.confidence))
            .then_with(|| best.provider_id.cmp(&r.provider_id));
        if order == Ordering::Greater {
            best = r;
        }
    }

    FusedResponse {
        text: best.text.clone(),
        confidence: confidence.clamp(0.0, 1.0),
        contributing_providers: ok.iter().map(|r| r.provider_id.clone()).collect(),
        strategy_id: FusionStrategy::WeightedAverage,
        status: FusionStatus::Ok,
    }
}

fn confidence_routing(ok: &[&ProviderResponse]) -> FusedResponse {
    let mut best = ok[0];
    for r in &ok[1..] {
        let order = cmp_f64(r.confidence, best.confidence)
            .then_with(|| best.latency_ms.cmp(&r.latency_ms))
            .then_with(|| best.provider_id.cmp(&r.provider_id));
        if order == Ordering::Greater {
            best = r;
        }
    }
    FusedResponse {
        text: best.text.clone(),
        confidence: best.confidence,
        contributing_providers: BTreeSet::from([best.provider_id.clone()]),
        strategy_id: FusionStrategy::ConfidenceRouting,
        status: FusionStatus::Ok,
    }
}

/// Normalised classification label: lowercase words, punctuation stripped.
pub fn normalize_label(text: &str) -> String {
    crate::embedding::tokenize(text).join(" ")
}

fn majority_vote(ok: &[&ProviderResponse]) -> FusedResponse {
    let mut groups: BTreeMap<String, Vec<&ProviderResponse>> = BTreeMap::new();
    for r in ok {
        groups.entry(normalize_label(&r.text)).or_default().push(r);
    }

    let score = |members: &[&ProviderResponse]| -> f64 { members.iter().map(|r| r.confidence).sum() };

    // BTreeMap iteration is label-ascending, so the first group wins any
    // remaining tie.
    let mut winner: Option<(&String, &Vec<&ProviderResponse>)> = None;
    for (label, members) in &groups {
        let better = match winner {
            None => true,
            Some((_, current)) => match members.len().cmp(&current.len()) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => cmp_f64(score(members), score(current)) == Ordering::Greater,
            },
        };
        if better {
            winner = Some((label, members));
        }
    }

    let members = match winner {
        Some((_, members)) => members.as_slice(),
        None => ok,
    };

    let mut representative = members[0];
    for r in &members[1..] {
        let order = cmp_f64(r.confidence, representative.confidence)
            .then_with(|| representative.provider_id.cmp(&r.provider_id));
        if order == Ordering::Greater {
            representative = r;
        }
    }

    FusedResponse {
        text: representative.text.clone(),
        confidence: (score(members) / ok.len() as f64).clamp(0.0, 1.0),
        contributing_providers: members.iter().map(|r| r.provider_id.clone()).collect(),
        strategy_id: FusionStrategy::MajorityVote,
        status: FusionStatus::Ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> FusionEngine {
        FusionEngine::new(ProviderWeights::new())
    }

    #[test]
    fn test_confidence_routing_ignores_timeouts() {
        let responses = vec![
            ProviderResponse::ok("A", "answer a", 0.7, 100),
            ProviderResponse::ok("B", "answer b", 0.9, 200),
            ProviderResponse {
                confidence: 0.95,
                ..ProviderResponse::timeout("C", 2000)
            },
        ];
        let fused = engine()
            .fuse(FusionStrategy::ConfidenceRouting, &responses)
            .unwrap();
        assert_eq!(fused.text, "answer b");
        assert!((fused.confidence - 0.9).abs() < 1e-12);
        assert_eq!(fused.contributing_providers, BTreeSet::from(["B".to_string()]));
    }

    #[test]
    fn test_confidence_routing_tie_prefers_lower_latency() {
        let responses = vec![
            ProviderResponse::ok("A", "slow", 0.8, 900),
            ProviderResponse::ok("B", "fast", 0.8, 100),
        ];
        let fused = engine()
            .fuse(FusionStrategy::ConfidenceRouting, &responses)
            .unwrap();
        assert_eq!(fused.text, "fast");
    }

    #[test]
    fn test_weighted_average_redistributes_excluded_weight() {
        let weights: ProviderWeights = [
            ("A".to_string(), 0.5),
            ("B".to_string(), 0.3),
            ("C".to_string(), 0.2),
        ]
        .into_iter()
        .collect();
        let engine = FusionEngine::new(weights);
        let responses = vec![
            ProviderResponse::ok("A", "from a", 0.6, 10),
            ProviderResponse::error("B", 10, "boom"),
            ProviderResponse::ok("C", "from c", 1.0, 10),
        ];
        let fused = engine
            .fuse(FusionStrategy::WeightedAverage, &responses)
            .unwrap();
        // effective weights: A = 0.5/0.7, C = 0.2/0.7
        let expected = (0.5 / 0.7) * 0.6 + (0.2 / 0.7) * 1.0;
        assert!((fused.confidence - expected).abs() < 1e-9);
        assert_eq!(fused.text, "from a");
        assert_eq!(fused.contributing_providers.len(), 2);
    }

    #[test]
    fn test_duplicate_provider_counts_once() {
        let weights: ProviderWeights = [("A".to_string(), 0.5), ("B".to_string(), 0.5)]
            .into_iter()
            .collect();
        let engine = FusionEngine::new(weights);
        let responses = vec![
            ProviderResponse::ok("A", "from a", 1.0, 10),
            ProviderResponse::ok("A", "again a", 1.0, 10),
            ProviderResponse::ok("B", "from b", 0.2, 10),
        ];
        let fused = engine
            .fuse(FusionStrategy::WeightedAverage, &responses)
            .unwrap();
        // A and B each carry half the weight
        assert!((fused.confidence - (0.5 * 1.0 + 0.5 * 0.2)).abs() < 1e-12);
        assert_eq!(fused.text, "from a");
        assert_eq!(fused.contributing_providers.len(), 2);

        let voted = engine
            .fuse(
                FusionStrategy::MajorityVote,
                &[
                    ProviderResponse::ok("A", "yes", 0.9, 10),
                    ProviderResponse::ok("A", "yes", 0.9, 10),
                    ProviderResponse::ok("B", "no", 0.6, 10),
                    ProviderResponse::ok("C", "no", 0.6, 10),
                ],
            )
            .unwrap();
        assert_eq!(voted.text, "no");
        assert!((voted.confidence - 1.2 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_renormalize_sums_to_one() {
        let weights: ProviderWeights = [("A".to_string(), 2.0), ("B".to_string(), 0.0)]
            .into_iter()
            .collect();
        let eff = weights.renormalize(["A", "B", "C"]);
        let sum: f64 = eff.values().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!((eff["A"] - 2.0 / 3.0).abs() < 1e-12);

        let zero: ProviderWeights = [("A".to_string(), 0.0), ("B".to_string(), 0.0)]
            .into_iter()
            .collect();
        let eff = zero.renormalize(["A", "B"]);
        assert_eq!(eff["A"], 0.5);
    }

    #[test]
    fn test_majority_vote_modal_label() {
        let responses = vec![
            ProviderResponse::ok("A", "Yes.", 0.6, 10),
            ProviderResponse::ok("B", "yes", 0.7, 10),
            ProviderResponse::ok("C", "No", 0.99, 10),
        ];
        let fused = engine()
            .fuse(FusionStrategy::MajorityVote, &responses)
            .unwrap();
        assert_eq!(fused.text, "yes");
        assert_eq!(fused.contributing_providers.len(), 2);
        assert!((fused.confidence - (0.6 + 0.7) / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_majority_vote_tie_breaks_on_aggregate_confidence() {
        let responses = vec![
            ProviderResponse::ok("A", "benign", 0.5, 10),
            ProviderResponse::ok("B", "malignant", 0.8, 10),
        ];
        let fused = engine()
            .fuse(FusionStrategy::MajorityVote, &responses)
            .unwrap();
        assert_eq!(fused.text, "malignant");
    }

    #[test]
    fn test_all_failed() {
        let responses = vec![
            ProviderResponse::error("A", 10, "x"),
            ProviderResponse::timeout("B", 2000),
        ];
        let err = engine()
            .fuse(FusionStrategy::WeightedAverage, &responses)
            .unwrap_err();
        let FusionError::AllFailed { failures, .. } = &err;
        assert_eq!(failures.len(), 2);
        assert_eq!(err.fused_response().status, FusionStatus::AllFailed);
    }

    #[test]
    fn test_replace_weights_swaps_table() {
        let engine = engine();
        assert_eq!(engine.weights().get("A"), 1.0);
        let mut w = ProviderWeights::new();
        w.set("A", 0.25);
        engine.replace_weights(w);
        assert_eq!(engine.weights().get("A"), 0.25);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "best_confidence".parse::<FusionStrategy>().unwrap(),
            FusionStrategy::ConfidenceRouting
        );
        assert_eq!(
            " Majority_Vote ".parse::<FusionStrategy>().unwrap(),
            FusionStrategy::MajorityVote
        );
        assert!("average".parse::<FusionStrategy>().is_err());
        for s in FusionStrategy::ALL {
            assert_eq!(s.id().parse::<FusionStrategy>().unwrap(), s);
        }
    }
}
