//! # Fusion Harness
//!
//! Retrieval-augmented question answering over multiple language-model
//! providers, with response fusion and built-in A/B experimentation over
//! fusion strategies.
//!
//! The runtime-agnostic logic (index, expansion, fusion, experiments,
//! metrics) lives in `fusion-harness-core`. This crate adds configuration,
//! remote embedding backends, the provider gateway, SQLite persistence,
//! the [`engine::RagEngine`] serving facade and the `fuse` CLI.
//!
//! ## Architecture
//!
//! ```text
//! question ─▶ Query Expander ─▶ Vector Index (top-k) ─▶ context + prompt
//!                                                           │
//!            ┌──────────────────────────────────────────────┘
//!            ▼
//!   Provider Gateway ──(fan-out, timeout, retry, breaker)──▶ providers
//!            │
//!            ▼
//!   Fusion Engine ─▶ guard-rails ─▶ Metrics ─▶ answer + variant + strategy
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`embedding`] | OpenAI / Ollama embedding backends |
//! | [`gateway`] | Generation providers, retry, circuit breaker, fan-out |
//! | [`prompt`] | Context assembly and prompt text |
//! | [`engine`] | The serving facade |
//! | [`learning`] | Background weight learning and early stopping |
//! | [`store`] | SQLite persistence |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`ask`], [`ingest`], [`experiment_cmd`], [`feedback_cmd`], [`eval`], [`stats`] | `fuse` subcommands |

pub mod ask;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod eval;
pub mod experiment_cmd;
pub mod feedback_cmd;
pub mod gateway;
pub mod ingest;
pub mod learning;
pub mod logging;
pub mod migrate;
pub mod prompt;
pub mod stats;
pub mod store;
