//! Embedding backends for the application.
//!
//! Implements the core [`EmbeddingProvider`] trait for:
//! - **[`HashingEmbedder`]** (from the core crate): deterministic and offline, the default.
//! - **[`OpenAIEmbedder`]**: `POST /v1/embeddings` on the OpenAI API.
//! - **[`OllamaEmbedder`]**: `POST /api/embed` on a local Ollama instance.
//!
//! Remote providers make exactly one HTTP attempt per call and classify
//! the failure. Retrying transient failures (timeouts, 429, 5xx, network
//! errors) is the caller's job: ingestion retries with exponential backoff.
//!
//! | HTTP outcome | Error |
//! |--------------|-------|
//! | timeout | [`EmbeddingProviderError::Timeout`] |
//! | 429 | [`EmbeddingProviderError::Quota`] |
//! | 5xx / connection error | [`EmbeddingProviderError::Unavailable`] |
//! | other 4xx / bad body | [`EmbeddingProviderError::Malformed`] |

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use fusion_harness_core::embedding::{EmbeddingProvider, EmbeddingProviderError, HashingEmbedder};

use crate::config::EmbeddingConfig;

// ============ Shared HTTP plumbing ============

fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

fn classify_transport(err: reqwest::Error, url: &str) -> EmbeddingProviderError {
    if err.is_timeout() {
        EmbeddingProviderError::Timeout
    } else {
        EmbeddingProviderError::Unavailable(format!("connection error at {}: {}", url, err))
    }
}

async fn classify_status(response: reqwest::Response, backend: &str) -> EmbeddingProviderError {
    let status = response.status();
    let body_text = response.text().await.unwrap_or_default();
    let message = format!("{} API error {}: {}", backend, status, body_text);
    if status.as_u16() == 429 {
        EmbeddingProviderError::Quota(message)
    } else if status.is_server_error() {
        EmbeddingProviderError::Unavailable(message)
    } else {
        EmbeddingProviderError::Malformed(message)
    }
}

fn parse_vector(value: &serde_json::Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|x| x as f32))
        .collect()
}

fn check_dims(v: Vec<f32>, dims: usize) -> Result<Vec<f32>, EmbeddingProviderError> {
    if v.len() != dims {
        return Err(EmbeddingProviderError::Malformed(format!(
            "expected {}-d embedding, got {}",
            dims,
            v.len()
        )));
    }
    Ok(v)
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Reads the API key from `OPENAI_API_KEY` at construction.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    api_key: String,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            client: build_client(config.timeout_secs)?,
            model,
            dims,
            url,
            api_key,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingProviderError> {
        let endpoint = format!("{}/embeddings", self.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let response = self
            .client
            .post(&endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(e, &endpoint))?;

        if !response.status().is_success() {
            return Err(classify_status(response, "OpenAI").await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbeddingProviderError::Malformed(e.to_string()))?;
        check_dims(parse_openai_response(&json)?, self.dims)
    }
}

/// Extract `data[0].embedding`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<f32>, EmbeddingProviderError> {
    json.get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(parse_vector)
        .ok_or_else(|| {
            EmbeddingProviderError::Malformed("Invalid OpenAI response: missing embedding".into())
        })
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance (default
/// `http://localhost:11434`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            client: build_client(config.timeout_secs)?,
            model,
            dims,
            url,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingProviderError> {
        let endpoint = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let response = self
            .client
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(e, &endpoint))?;

        if !response.status().is_success() {
            return Err(classify_status(response, "Ollama").await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbeddingProviderError::Malformed(e.to_string()))?;
        check_dims(parse_ollama_response(&json)?, self.dims)
    }
}

/// Extract `embeddings[0]`.
fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<f32>, EmbeddingProviderError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
        .and_then(parse_vector)
        .ok_or_else(|| {
            EmbeddingProviderError::Malformed(
                "Invalid Ollama response: missing embeddings array".into(),
            )
        })
}

/// Create the configured [`EmbeddingProvider`].
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"hashing"` | [`HashingEmbedder`] (`dims` defaults to 384) |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(
            config.dims.unwrap_or(HashingEmbedder::DEFAULT_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_openai_response() {
        let json = serde_json::json!({
            "data": [{ "index": 0, "embedding": [0.5, -0.25, 1.0] }]
        });
        assert_eq!(parse_openai_response(&json).unwrap(), vec![0.5, -0.25, 1.0]);
        let bad = serde_json::json!({ "data": [] });
        assert!(matches!(
            parse_openai_response(&bad),
            Err(EmbeddingProviderError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({ "embeddings": [[1.0, 2.0]] });
        assert_eq!(parse_ollama_response(&json).unwrap(), vec![1.0, 2.0]);
        let bad = serde_json::json!({ "embeddings": [["x"]] });
        assert!(parse_ollama_response(&bad).is_err());
    }

    #[test]
    fn test_dimension_check() {
        assert!(check_dims(vec![1.0, 2.0], 2).is_ok());
        assert!(check_dims(vec![1.0], 2).is_err());
    }

    #[test]
    fn test_create_hashing_default() {
        let provider = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert_eq!(provider.model_name(), "hashing-bow");
        assert_eq!(provider.dims(), HashingEmbedder::DEFAULT_DIMS);
    }

    #[test]
    fn test_create_ollama_requires_model() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            dims: Some(768),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());
    }
}
