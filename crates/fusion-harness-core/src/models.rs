//! Core data models.
//!
//! These types flow through the retrieval → fan-out → fusion → metrics
//! pipeline. Documents are owned by the vector index and referenced
//! everywhere else only through their opaque [`DocumentRef`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::fusion::FusionStrategy;

/// String key/value metadata. Ordered so that serialized forms and
/// filter evaluation are deterministic.
pub type Metadata = BTreeMap<String, String>;

/// Opaque document identifier: the SHA-256 of the chunk text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentRef(String);

impl DocumentRef {
    /// Derive the reference from chunk content. Identical text always
    /// yields the same reference.
    pub fn from_content(text: &str) -> Self {
        DocumentRef(format!("{:x}", Sha256::digest(text.as_bytes())))
    }

    /// Wrap an existing identifier (e.g. one loaded from storage).
    pub fn new(id: impl Into<String>) -> Self {
        DocumentRef(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An indexed passage. Immutable once indexed; re-indexing replaces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentRef,
    pub text_chunk: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    pub fn new(text_chunk: impl Into<String>, embedding: Vec<f32>, metadata: Metadata) -> Self {
        let text_chunk = text_chunk.into();
        Self {
            id: DocumentRef::from_content(&text_chunk),
            text_chunk,
            embedding,
            metadata,
        }
    }
}

/// A per-request query after expansion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub raw_text: String,
    pub expanded_terms: Vec<String>,
    #[serde(default)]
    pub filters: Metadata,
}

impl Query {
    /// The text that is embedded for retrieval: the raw question followed
    /// by its expansion terms.
    pub fn retrieval_text(&self) -> String {
        if self.expanded_terms.is_empty() {
            return self.raw_text.clone();
        }
        format!("{} {}", self.raw_text, self.expanded_terms.join(" "))
    }
}

/// A ranked retrieval hit. `rank` starts at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub document_ref: DocumentRef,
    pub similarity_score: f32,
    pub rank: usize,
}

/// Outcome of one provider call as seen by fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderStatus {
    Ok,
    Timeout,
    Error,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Ok => "OK",
            ProviderStatus::Timeout => "TIMEOUT",
            ProviderStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single logical response per provider per query (retries are hidden).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub provider_id: String,
    pub text: String,
    /// In `[0, 1]`; `0.0` for non-OK responses.
    pub confidence: f64,
    pub latency_ms: u64,
    pub status: ProviderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProviderResponse {
    pub fn ok(
        provider_id: impl Into<String>,
        text: impl Into<String>,
        confidence: f64,
        latency_ms: u64,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
            latency_ms,
            status: ProviderStatus::Ok,
            tokens_used: None,
            error: None,
        }
    }

    pub fn timeout(provider_id: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            provider_id: provider_id.into(),
            text: String::new(),
            confidence: 0.0,
            latency_ms,
            status: ProviderStatus::Timeout,
            tokens_used: None,
            error: None,
        }
    }

    pub fn error(
        provider_id: impl Into<String>,
        latency_ms: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            text: String::new(),
            confidence: 0.0,
            latency_ms,
            status: ProviderStatus::Error,
            tokens_used: None,
            error: Some(message.into()),
        }
    }

    pub fn with_tokens(mut self, tokens_used: Option<u32>) -> Self {
        self.tokens_used = tokens_used;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ProviderStatus::Ok
    }
}

/// Whether fusion produced an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FusionStatus {
    Ok,
    AllFailed,
}

/// The combined answer. `contributing_providers` is non-empty unless
/// `status` is [`FusionStatus::AllFailed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedResponse {
    pub text: String,
    pub confidence: f64,
    pub contributing_providers: BTreeSet<String>,
    pub strategy_id: FusionStrategy,
    pub status: FusionStatus,
}

/// An append-only measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub value: f64,
    #[serde(default)]
    pub tags: Metadata,
}

impl MetricRecord {
    pub fn new(metric_name: impl Into<String>, value: f64, tags: Metadata) -> Self {
        Self {
            timestamp: Utc::now(),
            metric_name: metric_name.into(),
            value,
            tags,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// True when every `(key, value)` in `filter` is present in the tags.
    pub fn has_tags(&self, filter: &Metadata) -> bool {
        filter
            .iter()
            .all(|(k, v)| self.tags.get(k).map(|t| t == v).unwrap_or(false))
    }
}
