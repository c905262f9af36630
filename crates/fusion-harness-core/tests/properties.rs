use std::sync::Arc;

use fusion_harness_core::embedding::HashingEmbedder;
use fusion_harness_core::experiment::{
    Experiment, ExperimentManager, ExperimentStatus, Variant, WEIGHT_EPSILON,
};
use fusion_harness_core::fusion::{FusionEngine, FusionStrategy, ProviderWeights};
use fusion_harness_core::index::VectorIndex;
use fusion_harness_core::metrics::MetricsCollector;
use fusion_harness_core::models::{Document, DocumentRef, Metadata, ProviderResponse};
use proptest::prelude::*;

fn experiment_from(id: &str, raw: &[f64]) -> Experiment {
    let total: f64 = raw.iter().sum();
    let variants = raw
        .iter()
        .enumerate()
        .map(|(i, w)| Variant {
            id: format!("v{i}"),
            strategy: FusionStrategy::ALL[i % 3],
            allocation_weight: w / total,
            providers: Vec::new(),
        })
        .collect();
    Experiment::new(id, variants)
}

fn manager() -> ExperimentManager {
    ExperimentManager::new(Arc::new(MetricsCollector::new()))
}

proptest! {
    #[test]
    fn running_experiments_have_unit_weight_sum(raw in prop::collection::vec(0.01f64..10.0, 1..8)) {
        let m = manager();
        m.create(experiment_from("e", &raw)).unwrap();
        m.start("e").unwrap();
        for exp in m.list() {
            if exp.status == ExperimentStatus::Running {
                prop_assert!((exp.weight_sum() - 1.0).abs() <= WEIGHT_EPSILON);
            }
        }
    }

    #[test]
    fn off_by_more_than_epsilon_never_runs(
        raw in prop::collection::vec(0.01f64..10.0, 1..8),
        skew in 1e-4f64..0.5,
    ) {
        let mut exp = experiment_from("e", &raw);
        exp.variants[0].allocation_weight += skew;
        let m = manager();
        prop_assert!(m.create(exp).is_err());
        prop_assert!(m.running().is_empty());
    }

    #[test]
    fn assignment_is_stable(
        raw in prop::collection::vec(0.01f64..10.0, 1..6),
        sessions in prop::collection::vec("[a-z0-9-]{1,24}", 1..20),
    ) {
        let m = manager();
        m.create(experiment_from("e", &raw)).unwrap();
        m.start("e").unwrap();
        for s in &sessions {
            let first = m.assign_variant(s, "e").unwrap();
            for _ in 0..3 {
                prop_assert_eq!(&m.assign_variant(s, "e").unwrap(), &first);
            }
        }
    }

    #[test]
    fn renormalized_weights_sum_to_one(
        weights in prop::collection::vec(0.0f64..5.0, 1..8),
        keep_mask in prop::collection::vec(any::<bool>(), 8),
    ) {
        let table: ProviderWeights = weights
            .iter()
            .enumerate()
            .map(|(i, w)| (format!("p{i}"), *w))
            .collect();
        let ids: Vec<String> = (0..weights.len()).map(|i| format!("p{i}")).collect();
        let kept: Vec<&str> = ids
            .iter()
            .zip(keep_mask.iter())
            .filter(|(_, k)| **k)
            .map(|(id, _)| id.as_str())
            .collect();
        prop_assume!(!kept.is_empty());
        let eff = table.renormalize(kept.iter().copied());
        let sum: f64 = eff.values().sum();
        prop_assert!((sum - 1.0).abs() < 1e-9, "sum was {}", sum);
    }

    #[test]
    fn confidence_routing_picks_maximum(confs in prop::collection::vec(0.0f64..=1.0, 1..6)) {
        let responses: Vec<ProviderResponse> = confs
            .iter()
            .enumerate()
            .map(|(i, c)| ProviderResponse::ok(format!("p{i}"), format!("text {i}"), *c, 10))
            .collect();
        let fused = FusionEngine::default()
            .fuse(FusionStrategy::ConfidenceRouting, &responses)
            .unwrap();
        let max = confs.iter().cloned().fold(f64::MIN, f64::max);
        prop_assert_eq!(fused.confidence, max);
        prop_assert_eq!(fused.contributing_providers.len(), 1);
    }

    #[test]
    fn search_results_are_ranked(
        vectors in prop::collection::vec(prop::collection::vec(-1.0f32..1.0, 4), 1..12),
        query in prop::collection::vec(0.1f32..1.0, 4),
        k in 1usize..10,
    ) {
        let index = VectorIndex::new();
        let mut ids = std::collections::BTreeSet::new();
        for (i, v) in vectors.into_iter().enumerate() {
            prop_assume!(v.iter().any(|x| x.abs() > 1e-3));
            ids.insert(index.upsert(Document::new(format!("doc {i}"), v, Metadata::new())).unwrap());
        }
        let results = index.search(&query, k, &Metadata::new()).unwrap();
        prop_assert_eq!(results.len(), k.min(ids.len()));
        for (i, r) in results.iter().enumerate() {
            prop_assert_eq!(r.rank, i + 1);
        }
        for pair in results.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            prop_assert!(
                a.similarity_score > b.similarity_score
                    || (a.similarity_score == b.similarity_score && a.document_ref < b.document_ref)
            );
        }
    }

    #[test]
    fn exact_text_round_trips_to_top(words in prop::collection::vec("[a-z]{3,10}", 1..12)) {
        let embedder = HashingEmbedder::new(256);
        let index = VectorIndex::new();
        let text = words.join(" ");
        let embedding = embedder.embed_text(&text);
        // colliding tokens with opposite signs can cancel to the zero vector
        prop_assume!(embedding.iter().any(|x| *x != 0.0));
        index.upsert(Document::new(text.clone(), embedding, Metadata::new())).unwrap();
        index.upsert(Document::new("unrelated filler passage", embedder.embed_text("unrelated filler passage"), Metadata::new())).unwrap();

        let results = index.search(&embedder.embed_text(&text), 1, &Metadata::new()).unwrap();
        prop_assert!(results[0].similarity_score >= 0.99);
        let own = index
            .search(&embedder.embed_text(&text), 2, &Metadata::new())
            .unwrap()
            .into_iter()
            .find(|r| r.document_ref == DocumentRef::from_content(&text));
        prop_assert!(own.map(|r| r.similarity_score >= 0.99).unwrap_or(false));
    }
}

#[test]
fn search_k5_over_three_documents_returns_three() {
    let index = VectorIndex::new();
    for (text, v) in [
        ("alpha", vec![1.0, 0.0, 0.0]),
        ("beta", vec![0.0, 1.0, 0.0]),
        ("gamma", vec![0.0, 0.0, 1.0]),
    ] {
        index.upsert(Document::new(text, v, Metadata::new())).unwrap();
    }
    let results = index.search(&[1.0, 1.0, 0.5], 5, &Metadata::new()).unwrap();
    assert_eq!(results.len(), 3);
}
