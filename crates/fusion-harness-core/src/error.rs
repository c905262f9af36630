//! Error taxonomy.
//!
//! Every failure that reaches a caller of the serving facade is one of
//! four kinds: [`RetrievalError`], [`ProviderError`], [`FusionError`], or
//! [`ExperimentError`]. Provider failures are normally absorbed by the
//! gateway (retry, then circuit-break) and only surface through a
//! [`FusionError`] when no provider produced a usable response.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

use crate::embedding::EmbeddingProviderError;
use crate::experiment::ExperimentStatus;
use crate::fusion::FusionStrategy;
use crate::models::{FusedResponse, FusionStatus, ProviderStatus};

/// Top-level error: one of the four taxonomy kinds.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Fusion(#[from] FusionError),
    #[error(transparent)]
    Experiment(#[from] ExperimentError),
}

/// Discriminant of [`Error`], used in structured logs and CLI output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Retrieval,
    Provider,
    Fusion,
    Experiment,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Retrieval => "retrieval",
            ErrorKind::Provider => "provider",
            ErrorKind::Fusion => "fusion",
            ErrorKind::Experiment => "experiment",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Retrieval(_) => ErrorKind::Retrieval,
            Error::Provider(_) => ErrorKind::Provider,
            Error::Fusion(_) => ErrorKind::Fusion,
            Error::Experiment(_) => ErrorKind::Experiment,
        }
    }
}

impl From<EmbeddingProviderError> for Error {
    fn from(err: EmbeddingProviderError) -> Self {
        Error::Retrieval(RetrievalError::Embedding(err))
    }
}

/// Index unavailable, malformed query vector, or corrupted index state.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// No document has ever been ingested.
    #[error("index is empty: no documents have been ingested yet")]
    IndexEmpty,

    #[error("malformed query: {0}")]
    MalformedQuery(String),

    #[error("embedding dimension mismatch: index holds {expected}-d vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("malformed document: {0}")]
    MalformedDocument(String),

    /// Fatal: the index can no longer be trusted to return correct neighbours.
    #[error("index corrupted: {0}")]
    Corrupted(String),

    #[error("index unavailable: {0}")]
    Unavailable(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingProviderError),
}

impl RetrievalError {
    /// True for errors that must never be papered over with an empty result.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RetrievalError::Corrupted(_))
    }
}

/// A failure of a single generation provider.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("provider {provider} timed out after {timeout_ms} ms")]
    Timeout { provider: String, timeout_ms: u64 },

    #[error("provider {provider} is rate limited: {message}")]
    RateLimited { provider: String, message: String },

    #[error("provider {provider} is unavailable: {message}")]
    Unavailable { provider: String, message: String },

    #[error("provider {provider} returned a malformed response: {message}")]
    Malformed { provider: String, message: String },

    #[error("provider {provider} rejected the request: {message}")]
    Rejected { provider: String, message: String },

    #[error("provider {provider} is short-circuited (breaker open)")]
    CircuitOpen { provider: String },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

impl ProviderError {
    /// Rate limits and transport failures are worth retrying; timeouts are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Unavailable { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProviderError::Timeout { .. })
    }
}

/// One provider's contribution to an all-failed fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub provider_id: String,
    pub status: ProviderStatus,
    pub message: Option<String>,
}

/// No usable responses to combine.
#[derive(Debug, Error)]
pub enum FusionError {
    #[error("all {} providers failed under {strategy}", failures.len())]
    AllFailed {
        strategy: FusionStrategy,
        failures: Vec<ProviderFailure>,
    },
}

impl FusionError {
    pub fn strategy(&self) -> FusionStrategy {
        match self {
            FusionError::AllFailed { strategy, .. } => *strategy,
        }
    }

    /// The `ALL_FAILED` response that accompanies this error.
    pub fn fused_response(&self) -> FusedResponse {
        FusedResponse {
            text: String::new(),
            confidence: 0.0,
            contributing_providers: BTreeSet::new(),
            strategy_id: self.strategy(),
            status: FusionStatus::AllFailed,
        }
    }
}

/// Invalid experiment configuration or lifecycle misuse.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExperimentError {
    #[error("invalid experiment {id}: {reason}")]
    InvalidExperiment { id: String, reason: String },

    #[error("experiment {id}: allocation weights sum to {sum}, expected 1.0")]
    WeightsDoNotSumToOne { id: String, sum: f64 },

    #[error("experiment not found: {0}")]
    NotFound(String),

    #[error("experiment already exists: {0}")]
    AlreadyExists(String),

    #[error("experiment {id}: cannot transition from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ExperimentStatus,
        to: ExperimentStatus,
    },

    #[error("experiment {id} is {status}, not running")]
    NotRunning { id: String, status: ExperimentStatus },

    #[error("experiment {id} is {status}; only DRAFT experiments can be edited")]
    NotDraft { id: String, status: ExperimentStatus },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        let err: Error = RetrievalError::IndexEmpty.into();
        assert_eq!(err.kind(), ErrorKind::Retrieval);
        assert_eq!(err.kind().as_str(), "retrieval");

        let err: Error = ExperimentError::NotFound("x".into()).into();
        assert_eq!(err.kind(), ErrorKind::Experiment);
    }

    #[test]
    fn test_transient_classification() {
        let rate = ProviderError::RateLimited {
            provider: "a".into(),
            message: "429".into(),
        };
        let timeout = ProviderError::Timeout {
            provider: "a".into(),
            timeout_ms: 10,
        };
        let rejected = ProviderError::Rejected {
            provider: "a".into(),
            message: "400".into(),
        };
        assert!(rate.is_transient());
        assert!(!timeout.is_transient());
        assert!(timeout.is_timeout());
        assert!(!rejected.is_transient());
    }

    #[test]
    fn test_all_failed_response_is_empty() {
        let err = FusionError::AllFailed {
            strategy: FusionStrategy::WeightedAverage,
            failures: vec![ProviderFailure {
                provider_id: "a".into(),
                status: ProviderStatus::Error,
                message: None,
            }],
        };
        let fused = err.fused_response();
        assert_eq!(fused.status, FusionStatus::AllFailed);
        assert!(fused.contributing_providers.is_empty());
        assert!(fused.text.is_empty());
        assert!(err.to_string().contains("all 1 providers failed"));
    }

    #[test]
    fn test_embedding_error_is_retrieval_kind() {
        let err: Error = EmbeddingProviderError::Timeout.into();
        assert_eq!(err.kind(), ErrorKind::Retrieval);
    }
}
