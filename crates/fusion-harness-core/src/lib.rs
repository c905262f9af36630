//! # Fusion Harness Core
//!
//! Shared, runtime-agnostic logic for Fusion Harness: data models, the
//! error taxonomy, the vector index, query expansion, response fusion,
//! the experiment manager, and the metrics collector.
//!
//! This crate contains no tokio, sqlx, network, or filesystem code. The
//! `fusion-harness` application crate wires these pieces to real
//! generation providers, an embedding backend, and SQLite persistence.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Documents, queries, provider and fused responses |
//! | [`error`] | Retrieval / provider / fusion / experiment errors |
//! | [`embedding`] | Embedding trait, hashing embedder, vector helpers |
//! | [`index`] | Snapshot-isolated cosine vector index |
//! | [`expand`] | Synonym-table query expansion |
//! | [`fusion`] | Fusion strategies and provider weights |
//! | [`feedback`] | Append-only feedback log and weight learner |
//! | [`experiment`] | A/B experiments, assignment, guard-rails, analysis |
//! | [`stats`] | Welch's t-test, two-proportion z-test, intervals |
//! | [`metrics`] | Append-only metric records and retrieval quality |

pub mod embedding;
pub mod error;
pub mod expand;
pub mod experiment;
pub mod feedback;
pub mod fusion;
pub mod index;
pub mod metrics;
pub mod models;
pub mod stats;

pub use error::{Error, ErrorKind, ExperimentError, FusionError, ProviderError, RetrievalError};
