use anyhow::{Context, Result};
use fusion_harness_core::expand::Expansion;
use fusion_harness_core::fusion::FusionStrategy;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub expansion: ExpansionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub learning: LearningConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default)]
    pub min_similarity: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_context_chars: default_max_context_chars(),
            min_similarity: 0.0,
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_max_context_chars() -> usize {
    4000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExpansionConfig {
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
    #[serde(default = "default_max_expansions")]
    pub max_expansions: usize,
    #[serde(default = "default_true")]
    pub use_default_table: bool,
    /// Extra phrase → expansions, merged over the default table.
    #[serde(default)]
    pub synonyms: BTreeMap<String, Vec<Expansion>>,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            confidence_floor: default_confidence_floor(),
            max_expansions: default_max_expansions(),
            use_default_table: true,
            synonyms: BTreeMap::new(),
        }
    }
}

fn default_confidence_floor() -> f64 {
    0.5
}
fn default_max_expansions() -> usize {
    5
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hashing".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_fanout_deadline_ms")]
    pub fanout_deadline_ms: u64,
    #[serde(default = "default_gateway_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            fanout_deadline_ms: default_fanout_deadline_ms(),
            max_retries: default_gateway_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            failure_threshold: default_failure_threshold(),
            failure_window_ms: default_failure_window_ms(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

fn default_call_timeout_ms() -> u64 {
    2000
}
fn default_fanout_deadline_ms() -> u64 {
    2500
}
fn default_gateway_retries() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    100
}
fn default_backoff_max_ms() -> u64 {
    2000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_failure_window_ms() -> u64 {
    60_000
}
fn default_cooldown_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: String,
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_weight() -> f64 {
    1.0
}
fn default_temperature() -> f64 {
    0.1
}
fn default_max_tokens() -> u32 {
    1000
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FusionConfig {
    #[serde(default)]
    pub default_strategy: FusionStrategy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LearningConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_min_weight")]
    pub min_weight: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_interval_secs(),
            learning_rate: default_learning_rate(),
            min_weight: default_min_weight(),
        }
    }
}

fn default_interval_secs() -> u64 {
    60
}
fn default_learning_rate() -> f64 {
    0.1
}
fn default_min_weight() -> f64 {
    0.05
}

impl EmbeddingConfig {
    pub fn is_remote(&self) -> bool {
        self.provider != "hashing"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.max_context_chars == 0 {
        anyhow::bail!("retrieval.max_context_chars must be > 0");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_similarity) {
        anyhow::bail!("retrieval.min_similarity must be in [-1.0, 1.0]");
    }

    // Validate expansion
    if !(0.0..=1.0).contains(&config.expansion.confidence_floor) {
        anyhow::bail!("expansion.confidence_floor must be in [0.0, 1.0]");
    }
    for (phrase, terms) in &config.expansion.synonyms {
        for t in terms {
            if !(0.0..=1.0).contains(&t.weight) {
                anyhow::bail!(
                    "expansion.synonyms.{}: weight for '{}' must be in [0.0, 1.0]",
                    phrase,
                    t.term
                );
            }
        }
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "hashing" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hashing, openai, or ollama.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.is_remote() {
        if config.embedding.dims.is_none() {
            anyhow::bail!(
                "embedding.dims must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    // Validate gateway
    let g = &config.gateway;
    if g.call_timeout_ms == 0 {
        anyhow::bail!("gateway.call_timeout_ms must be > 0");
    }
    if g.fanout_deadline_ms == 0 {
        anyhow::bail!("gateway.fanout_deadline_ms must be > 0");
    }
    if g.failure_threshold < 1 {
        anyhow::bail!("gateway.failure_threshold must be >= 1");
    }
    if g.backoff_base_ms > g.backoff_max_ms {
        anyhow::bail!("gateway.backoff_base_ms must be <= gateway.backoff_max_ms");
    }

    // Validate providers
    let mut ids = HashSet::new();
    for p in &config.providers {
        if p.id.trim().is_empty() {
            anyhow::bail!("providers: id must not be empty");
        }
        if !ids.insert(p.id.as_str()) {
            anyhow::bail!("providers: duplicate id '{}'", p.id);
        }
        match p.kind.as_str() {
            "openai" | "ollama" => {}
            other => anyhow::bail!(
                "providers.{}: unknown kind '{}'. Must be openai or ollama.",
                p.id,
                other
            ),
        }
        if !(0.0..=1.0).contains(&p.weight) {
            anyhow::bail!("providers.{}: weight must be in [0.0, 1.0]", p.id);
        }
    }

    // Validate learning
    let l = &config.learning;
    if !(0.0..=1.0).contains(&l.learning_rate) {
        anyhow::bail!("learning.learning_rate must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&l.min_weight) {
        anyhow::bail!("learning.min_weight must be in [0.0, 1.0]");
    }
    if l.enabled && l.interval_secs == 0 {
        anyhow::bail!("learning.interval_secs must be > 0 when learning is enabled");
    }

    Ok(())
}
