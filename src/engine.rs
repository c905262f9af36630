//! The serving facade: [`RagEngine`].
//!
//! Wires the core components to the gateway and the store and exposes the
//! operations a serving layer needs:
//!
//! | Operation | Method |
//! |-----------|--------|
//! | Answer a question | [`RagEngine::answer`] |
//! | Index one passage | [`RagEngine::ingest_document`] |
//! | Bulk load | [`RagEngine::ingest_batch`] |
//! | Experiment report | [`RagEngine::analyze`] |
//! | Provider feedback | [`RagEngine::record_feedback`] |
//! | Background aggregation | [`RagEngine::refresh_weights`], [`RagEngine::check_early_stopping`] |
//!
//! ## Answer path
//!
//! ```text
//! question ─▶ variant assignment ─▶ expand ─▶ embed ─▶ top-k search
//!          ─▶ context + prompt ─▶ fan-out ─▶ fuse ─▶ guard-rails ─▶ metrics
//! ```
//!
//! Metric and assignment writes are best-effort: a persistence failure is
//! logged and never fails an answer that was already produced.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context as _, Result};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fusion_harness_core::embedding::{EmbeddingProvider, EmbeddingProviderError};
use fusion_harness_core::expand::{QueryExpander, SynonymTable};
use fusion_harness_core::experiment::{
    AssignmentSource, Experiment, ExperimentManager, ExperimentReport,
};
use fusion_harness_core::feedback::{FeedbackEvent, FeedbackLog, WeightLearner};
use fusion_harness_core::fusion::{FusionEngine, FusionStrategy, ProviderWeights};
use fusion_harness_core::index::VectorIndex;
use fusion_harness_core::metrics::{names, tags, MetricsCollector, RelevanceJudgment, RetrievalQuality};
use fusion_harness_core::models::{
    Document, DocumentRef, FusedResponse, Metadata, MetricRecord, ProviderResponse, Query,
    RetrievalResult,
};
use fusion_harness_core::{Error, RetrievalError};

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::gateway::{ProviderGateway, RetryPolicy};
use crate::prompt::{assemble_context, build_prompt};
use crate::store::SqliteStore;
use crate::{db, migrate};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub top_k: usize,
    pub max_context_chars: usize,
    pub min_similarity: f32,
    pub default_strategy: FusionStrategy,
    /// Backoff for transient embedding failures during ingestion.
    pub embed_retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            max_context_chars: 4000,
            min_similarity: 0.0,
            default_strategy: FusionStrategy::default(),
            embed_retry: RetryPolicy {
                max_retries: 5,
                base: Duration::from_millis(200),
                max: Duration::from_secs(10),
            },
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            max_context_chars: config.retrieval.max_context_chars,
            min_similarity: config.retrieval.min_similarity,
            default_strategy: config.fusion.default_strategy,
            embed_retry: RetryPolicy {
                max_retries: config.embedding.max_retries,
                ..EngineSettings::default().embed_retry
            },
        }
    }
}

/// Everything the serving layer gets back for one question.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub response: FusedResponse,
    pub strategy_used: FusionStrategy,
    pub experiment_id: Option<String>,
    pub variant_id: Option<String>,
    pub query: Query,
    pub retrieved: Vec<RetrievalResult>,
    pub provider_responses: Vec<ProviderResponse>,
    pub latency_ms: u64,
    pub guard_rail_breached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub ingested: usize,
    pub generation: u64,
}

/// Variant routing decided for one request.
struct Route {
    experiment_id: Option<String>,
    variant_id: Option<String>,
    strategy: FusionStrategy,
    providers: Vec<String>,
}

pub struct RagEngine {
    settings: EngineSettings,
    index: Arc<VectorIndex>,
    expander: QueryExpander,
    embedder: Arc<dyn EmbeddingProvider>,
    gateway: Arc<ProviderGateway>,
    fusion: Arc<FusionEngine>,
    metrics: Arc<MetricsCollector>,
    experiments: Arc<ExperimentManager>,
    feedback: Arc<FeedbackLog>,
    learner: Mutex<WeightLearner>,
    store: Option<SqliteStore>,
}

impl RagEngine {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        gateway: ProviderGateway,
        settings: EngineSettings,
    ) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        Self {
            settings,
            index: Arc::new(VectorIndex::new()),
            expander: QueryExpander::new(SynonymTable::with_defaults(), 0.5),
            embedder,
            gateway: Arc::new(gateway),
            fusion: Arc::new(FusionEngine::default()),
            experiments: Arc::new(ExperimentManager::new(Arc::clone(&metrics))),
            metrics,
            feedback: Arc::new(FeedbackLog::new()),
            learner: Mutex::new(WeightLearner::new(0.1, 0.05)),
            store: None,
        }
    }

    pub fn with_expander(mut self, expander: QueryExpander) -> Self {
        self.expander = expander;
        self
    }

    pub fn with_weights(self, weights: ProviderWeights) -> Self {
        self.fusion.replace_weights(weights);
        self
    }

    pub fn with_learner(mut self, learner: WeightLearner) -> Self {
        self.learner = Mutex::new(learner);
        self
    }

    /// Attach a store and restore everything it holds: the index snapshot
    /// at its stored generation, experiments, pinned assignments, metric
    /// history and the feedback log. Learned weights are replayed from the
    /// feedback log.
    pub async fn with_store(mut self, store: SqliteStore) -> Result<Self> {
        let (generation, docs) = store.load_index().await?;
        let doc_count = docs.len();
        self.index = Arc::new(
            VectorIndex::restore(generation, docs).context("Failed to restore vector index")?,
        );

        self.metrics = Arc::new(MetricsCollector::from_records(store.load_metrics().await?));
        self.experiments = Arc::new(ExperimentManager::new(Arc::clone(&self.metrics)));
        for exp in store.load_experiments().await? {
            let id = exp.id.clone();
            if let Err(e) = self.experiments.restore(exp) {
                warn!(experiment = %id, error = %e, "skipping invalid stored experiment");
            }
        }
        let assignments = store.load_assignments().await?;
        for (session, experiment, variant) in &assignments {
            self.experiments.pin(session, experiment, variant);
        }

        self.feedback = Arc::new(FeedbackLog::from_events(store.load_feedback().await?));
        self.store = Some(store);
        self.refresh_weights();

        info!(
            generation,
            documents = doc_count,
            experiments = self.experiments.list().len(),
            assignments = assignments.len(),
            metric_records = self.metrics.len(),
            "engine state restored"
        );
        Ok(self)
    }

    /// Build a fully wired engine from configuration: embedder, providers,
    /// synonym table, provider weights, and the SQLite store.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let gateway = ProviderGateway::from_config(&config.gateway, &config.providers)?;

        let mut table = if config.expansion.use_default_table {
            SynonymTable::with_defaults()
        } else {
            SynonymTable::new()
        };
        for (phrase, expansions) in &config.expansion.synonyms {
            table.insert(phrase, expansions.clone());
        }
        let expander = QueryExpander::new(table, config.expansion.confidence_floor)
            .with_max_expansions(config.expansion.max_expansions);

        let weights: ProviderWeights = config
            .providers
            .iter()
            .map(|p| (p.id.clone(), p.weight))
            .collect();

        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;

        RagEngine::new(embedder, gateway, EngineSettings::from(config))
            .with_expander(expander)
            .with_weights(weights)
            .with_learner(WeightLearner::new(
                config.learning.learning_rate,
                config.learning.min_weight,
            ))
            .with_store(SqliteStore::new(pool))
            .await
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn gateway(&self) -> &Arc<ProviderGateway> {
        &self.gateway
    }

    pub fn fusion(&self) -> &Arc<FusionEngine> {
        &self.fusion
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn experiments(&self) -> &Arc<ExperimentManager> {
        &self.experiments
    }

    pub fn feedback(&self) -> &Arc<FeedbackLog> {
        &self.feedback
    }

    pub fn store(&self) -> Option<&SqliteStore> {
        self.store.as_ref()
    }

    // ============ Ingestion ============

    /// Embed with exponential backoff on transient failures.
    async fn embed_with_retry(&self, text: &str) -> Result<Vec<f32>, EmbeddingProviderError> {
        let policy = self.settings.embed_retry;
        let mut attempt = 0;
        loop {
            match self.embedder.embed(text).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < policy.max_retries => {
                    attempt += 1;
                    let delay = policy.delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "embedding failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Embed and index one passage, publishing a new snapshot.
    pub async fn ingest_document(&self, text: &str, metadata: Metadata) -> Result<DocumentRef> {
        let embedding = self
            .embed_with_retry(text)
            .await
            .map_err(|e| Error::Retrieval(RetrievalError::Embedding(e)))?;
        let id = self
            .index
            .upsert(Document::new(text, embedding, metadata))
            .map_err(Error::from)?;
        if let Some(store) = &self.store {
            let snapshot = self.index.snapshot();
            if let Some(doc) = snapshot.get(&id) {
                store
                    .save_documents(&[Arc::clone(doc)], snapshot.generation())
                    .await?;
            }
        }
        Ok(id)
    }

    /// Embed every passage, then publish them together in one new
    /// generation. If any passage fails to embed or index, nothing from
    /// the batch is published or persisted.
    pub async fn ingest_batch(&self, items: Vec<(String, Metadata)>) -> Result<IngestReport> {
        let mut docs = Vec::with_capacity(items.len());
        for (text, metadata) in items {
            let embedding = self
                .embed_with_retry(&text)
                .await
                .map_err(|e| Error::Retrieval(RetrievalError::Embedding(e)))?;
            docs.push(Document::new(text, embedding, metadata));
        }
        let (ids, generation) = self.index.upsert_batch(docs).map_err(Error::from)?;

        if let Some(store) = &self.store {
            let snapshot = self.index.snapshot();
            let docs: Vec<_> = ids.iter().filter_map(|id| snapshot.get(id).cloned()).collect();
            store.save_documents(&docs, generation).await?;
        }
        info!(documents = ids.len(), generation, "batch ingested");
        Ok(IngestReport {
            ingested: ids.len(),
            generation,
        })
    }

    // ============ Answer ============

    /// Answer under the first running experiment, if any.
    pub async fn answer(&self, question: &str, session_id: &str) -> Result<Answer, Error> {
        self.answer_with_filters(question, session_id, Metadata::new())
            .await
    }

    pub async fn answer_with_filters(
        &self,
        question: &str,
        session_id: &str,
        filters: Metadata,
    ) -> Result<Answer, Error> {
        let experiment_id = self.experiments.running().first().map(|e| e.id.clone());
        self.answer_in(question, session_id, filters, experiment_id.as_deref())
            .await
    }

    /// Answer under a specific experiment (`None` serves the default
    /// strategy across every registered provider).
    pub async fn answer_in(
        &self,
        question: &str,
        session_id: &str,
        filters: Metadata,
        experiment_id: Option<&str>,
    ) -> Result<Answer, Error> {
        let start = Instant::now();
        let route = self.route(session_id, experiment_id).await?;

        let query = self.expander.expand_with_filters(question, filters);
        let query_vec = self.embedder.embed(&query.retrieval_text()).await?;
        // one snapshot for ranking and lookup
        let snapshot = self.index.snapshot();
        let retrieved = match snapshot.search(&query_vec, self.settings.top_k, &query.filters) {
            Ok(hits) => hits
                .into_iter()
                .filter(|r| r.similarity_score >= self.settings.min_similarity)
                .collect(),
            Err(RetrievalError::IndexEmpty) => {
                debug!("index never populated, answering without context");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let docs: Vec<_> = retrieved
            .iter()
            .filter_map(|r| snapshot.get(&r.document_ref).cloned())
            .collect();
        let context = assemble_context(docs.iter().map(|d| d.as_ref()), self.settings.max_context_chars);
        let prompt = build_prompt(question, &context);

        let responses = self.gateway.invoke_all(&route.providers, &prompt).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let base_tags = route_tags(&route, session_id);
        let mut records = Vec::new();
        for r in &responses {
            let mut t = base_tags.clone();
            t.insert(tags::PROVIDER.to_string(), r.provider_id.clone());
            t.insert(tags::STATUS.to_string(), r.status.as_str().to_string());
            records.push(
                self.metrics
                    .record_value(names::PROVIDER_LATENCY_MS, r.latency_ms as f64, t),
            );
        }

        let fused = match self.fusion.fuse(route.strategy, &responses) {
            Ok(f) => f,
            Err(err) => {
                warn!(
                    strategy = %route.strategy,
                    providers = responses.len(),
                    "all providers failed"
                );
                records.push(self.metrics.record_value(names::ANSWER_SUCCESS, 0.0, base_tags));
                self.persist_metrics(&records).await;
                return Err(err.into());
            }
        };

        let breach = match (&route.experiment_id, &route.variant_id) {
            (Some(exp), Some(variant)) => self.experiments.observe_outcome(
                session_id,
                exp,
                variant,
                latency_ms,
                fused.confidence,
            ),
            _ => None,
        };

        records.push(self.metrics.record_value(
            names::ANSWER_LATENCY_MS,
            latency_ms as f64,
            base_tags.clone(),
        ));
        records.push(self.metrics.record_value(
            names::ANSWER_CONFIDENCE,
            fused.confidence,
            base_tags.clone(),
        ));
        records.push(self.metrics.record_value(names::ANSWER_SUCCESS, 1.0, base_tags.clone()));
        if let Some(top) = retrieved.first() {
            records.push(self.metrics.record_value(
                names::RETRIEVAL_TOP_SIMILARITY,
                top.similarity_score as f64,
                base_tags.clone(),
            ));
        }
        if breach.is_some() {
            records.push(self.metrics.record_value(names::GUARD_RAIL_BREACH, 1.0, base_tags));
        }
        self.persist_metrics(&records).await;

        debug!(
            strategy = %route.strategy,
            confidence = fused.confidence,
            contributors = fused.contributing_providers.len(),
            latency_ms,
            "answered"
        );

        Ok(Answer {
            response: fused,
            strategy_used: route.strategy,
            experiment_id: route.experiment_id,
            variant_id: route.variant_id,
            query,
            retrieved,
            provider_responses: responses,
            latency_ms,
            guard_rail_breached: breach.is_some(),
        })
    }

    async fn route(&self, session_id: &str, experiment_id: Option<&str>) -> Result<Route, Error> {
        let all_providers = self.gateway.provider_ids();
        let Some(experiment_id) = experiment_id else {
            return Ok(Route {
                experiment_id: None,
                variant_id: None,
                strategy: self.settings.default_strategy,
                providers: all_providers,
            });
        };

        let assignment = self.experiments.assign_variant(session_id, experiment_id)?;
        if assignment.source == AssignmentSource::Hashed {
            self.experiments
                .pin(session_id, experiment_id, &assignment.variant_id);
            if let Some(store) = &self.store {
                if let Err(e) = store.record_assignment(&assignment).await {
                    warn!(error = %e, "failed to persist assignment");
                }
            }
        }

        let exp = self
            .experiments
            .get(experiment_id)
            .ok_or_else(|| fusion_harness_core::ExperimentError::NotFound(experiment_id.to_string()))?;
        let variant = exp.variant(&assignment.variant_id).ok_or_else(|| {
            fusion_harness_core::ExperimentError::InvalidExperiment {
                id: experiment_id.to_string(),
                reason: format!("unknown variant {}", assignment.variant_id),
            }
        })?;
        let providers = if variant.providers.is_empty() {
            all_providers
        } else {
            variant.providers.clone()
        };
        Ok(Route {
            experiment_id: Some(experiment_id.to_string()),
            variant_id: Some(variant.id.clone()),
            strategy: variant.strategy,
            providers,
        })
    }

    async fn persist_metrics(&self, records: &[MetricRecord]) {
        if let Some(store) = &self.store {
            if let Err(e) = store.append_metrics(records).await {
                warn!(error = %e, records = records.len(), "failed to persist metrics");
            }
        }
    }

    // ============ Experiments ============

    pub async fn create_experiment(&self, experiment: Experiment) -> Result<Arc<Experiment>> {
        let exp = self.experiments.create(experiment).map_err(Error::from)?;
        self.save_experiment(&exp).await?;
        Ok(exp)
    }

    pub async fn update_experiment(&self, experiment: Experiment) -> Result<Arc<Experiment>> {
        let exp = self.experiments.update(experiment).map_err(Error::from)?;
        self.save_experiment(&exp).await?;
        Ok(exp)
    }

    pub async fn start_experiment(&self, id: &str) -> Result<Arc<Experiment>> {
        let exp = self.experiments.start(id).map_err(Error::from)?;
        self.save_experiment(&exp).await?;
        Ok(exp)
    }

    pub async fn stop_experiment(&self, id: &str) -> Result<Arc<Experiment>> {
        let exp = self.experiments.stop(id).map_err(Error::from)?;
        self.save_experiment(&exp).await?;
        Ok(exp)
    }

    async fn save_experiment(&self, exp: &Experiment) -> Result<()> {
        if let Some(store) = &self.store {
            store.save_experiment(exp).await?;
        }
        Ok(())
    }

    pub fn analyze(&self, experiment_id: &str) -> Result<ExperimentReport, Error> {
        Ok(self.experiments.analyze(experiment_id)?)
    }

    /// Stop every running experiment whose early-stopping rule is met.
    /// Returns the deciding reports.
    pub async fn check_early_stopping(&self) -> Vec<ExperimentReport> {
        let mut stopped = Vec::new();
        for exp in self.experiments.running() {
            match self.experiments.evaluate_early_stop(&exp.id) {
                Ok(Some(report)) => {
                    if let Some(current) = self.experiments.get(&exp.id) {
                        if let Err(e) = self.save_experiment(&current).await {
                            warn!(experiment = %exp.id, error = %e, "failed to persist stop");
                        }
                    }
                    stopped.push(report);
                }
                Ok(None) => {}
                Err(e) => warn!(experiment = %exp.id, error = %e, "early-stop check failed"),
            }
        }
        stopped
    }

    // ============ Feedback ============

    /// Append a reward for a provider. Weights change only when the
    /// aggregation job next runs.
    pub async fn record_feedback(&self, session_id: &str, provider_id: &str, reward: f64) -> Result<()> {
        let event = FeedbackEvent::new(session_id, provider_id, reward);
        if let Some(store) = &self.store {
            store.append_feedback(&event).await?;
        }
        self.feedback.append(event);
        Ok(())
    }

    /// Fold new feedback into the provider weights and swap them in.
    /// Returns true when the weights changed.
    pub fn refresh_weights(&self) -> bool {
        let mut learner = self.learner.lock().unwrap_or_else(PoisonError::into_inner);
        match learner.update(&self.feedback, &self.fusion.weights()) {
            Some(next) => {
                self.fusion.replace_weights(next);
                true
            }
            None => false,
        }
    }

    // ============ Retrieval evaluation ============

    /// Run each query through expansion and retrieval, judge it against
    /// its relevant set, and record mean quality at `k` for this batch.
    ///
    /// Retrieved documents are labelled by their `source` metadata when
    /// present, else by document id, so relevant sets may use either.
    pub async fn evaluate_retrieval(
        &self,
        cases: Vec<(String, BTreeSet<String>)>,
        k: usize,
    ) -> Result<RetrievalQuality> {
        let mut judgments = Vec::with_capacity(cases.len());
        for (question, relevant) in cases {
            let query = self.expander.expand(&question);
            let vector = self
                .embedder
                .embed(&query.retrieval_text())
                .await
                .map_err(Error::from)?;
            let snapshot = self.index.snapshot();
            let hits = match snapshot.search(&vector, k.max(1), &query.filters) {
                Ok(h) => h,
                Err(RetrievalError::IndexEmpty) => Vec::new(),
                Err(e) => return Err(Error::from(e).into()),
            };
            let mut seen = BTreeSet::new();
            let retrieved: Vec<String> = hits
                .iter()
                .map(|h| {
                    snapshot
                        .get(&h.document_ref)
                        .and_then(|d| d.metadata.get("source").cloned())
                        .unwrap_or_else(|| h.document_ref.to_string())
                })
                .filter(|label| seen.insert(label.clone()))
                .collect();
            judgments.push(RelevanceJudgment {
                query: question,
                retrieved,
                relevant,
            });
        }
        let (quality, records) = self.metrics.evaluate_retrieval(judgments, k);
        self.persist_metrics(&records).await;
        Ok(quality)
    }
}

fn route_tags(route: &Route, session_id: &str) -> Metadata {
    let mut t = Metadata::new();
    t.insert(tags::SESSION.to_string(), session_id.to_string());
    t.insert(tags::STRATEGY.to_string(), route.strategy.id().to_string());
    if let Some(exp) = &route.experiment_id {
        t.insert(tags::EXPERIMENT.to_string(), exp.clone());
    }
    if let Some(variant) = &route.variant_id {
        t.insert(tags::VARIANT.to_string(), variant.clone());
    }
    t
}
