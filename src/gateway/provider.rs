//! HTTP generation providers.
//!
//! | Kind | Endpoint |
//! |------|----------|
//! | `openai` | `POST {url}/chat/completions` (default `https://api.openai.com/v1`) |
//! | `ollama` | `POST {url}/api/generate` (default `http://localhost:11434`) |
//!
//! Each call is a single HTTP attempt; the gateway owns timeouts, retries
//! and circuit breaking. Failures are classified as:
//!
//! | HTTP outcome | Error |
//! |--------------|-------|
//! | client timeout | [`ProviderError::Timeout`] |
//! | 429 | [`ProviderError::RateLimited`] |
//! | 5xx / connection error | [`ProviderError::Unavailable`] |
//! | other 4xx | [`ProviderError::Rejected`] |
//! | unparseable body | [`ProviderError::Malformed`] |

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use fusion_harness_core::ProviderError;

use crate::config::ProviderConfig;

/// What a provider produced for one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub tokens_used: Option<u32>,
}

/// A text generation backend.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<Generation, ProviderError>;
}

/// Length-based confidence used when the backend reports nothing better.
pub fn heuristic_confidence(text: &str) -> f64 {
    (text.chars().count() as f64 / 1000.0 + 0.3).min(0.9)
}

// ============ Shared HTTP plumbing ============

fn classify_transport(provider: &str, err: reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout {
            provider: provider.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    } else {
        ProviderError::Unavailable {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }
}

async fn classify_status(provider: &str, response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = format!("HTTP {}: {}", status, body);
    let provider = provider.to_string();
    if status.as_u16() == 429 {
        ProviderError::RateLimited { provider, message }
    } else if status.is_server_error() {
        ProviderError::Unavailable { provider, message }
    } else {
        ProviderError::Rejected { provider, message }
    }
}

fn malformed(provider: &str, message: impl Into<String>) -> ProviderError {
    ProviderError::Malformed {
        provider: provider.to_string(),
        message: message.into(),
    }
}

// ============ OpenAI chat ============

pub struct OpenAIChatProvider {
    id: String,
    client: reqwest::Client,
    timeout: Duration,
    url: String,
    model: String,
    api_key: String,
    temperature: f64,
    max_tokens: u32,
}

impl OpenAIChatProvider {
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self> {
        let key_var = config.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY");
        let api_key = std::env::var(key_var).map_err(|_| {
            anyhow::anyhow!("providers.{}: {} environment variable not set", config.id, key_var)
        })?;
        Ok(Self {
            id: config.id.clone(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
            timeout,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAIChatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, prompt: &str) -> Result<Generation, ProviderError> {
        let endpoint = format!("{}/chat/completions", self.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "logprobs": true,
        });

        let response = self
            .client
            .post(&endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&self.id, e, self.timeout))?;

        if !response.status().is_success() {
            return Err(classify_status(&self.id, response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| malformed(&self.id, e.to_string()))?;
        parse_chat_response(&self.id, &json)
    }
}

/// `choices[0].message.content`; confidence from the mean token
/// log-probability when present.
fn parse_chat_response(
    provider: &str,
    json: &serde_json::Value,
) -> Result<Generation, ProviderError> {
    let choice = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| malformed(provider, "missing choices"))?;
    let text = choice
        .pointer("/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| malformed(provider, "missing message content"))?
        .to_string();

    let logprobs: Vec<f64> = choice
        .pointer("/logprobs/content")
        .and_then(|c| c.as_array())
        .map(|tokens| {
            tokens
                .iter()
                .filter_map(|t| t.get("logprob").and_then(|l| l.as_f64()))
                .collect()
        })
        .unwrap_or_default();
    let confidence = if logprobs.is_empty() {
        heuristic_confidence(&text)
    } else {
        (logprobs.iter().sum::<f64>() / logprobs.len() as f64)
            .exp()
            .clamp(0.0, 1.0)
    };

    let tokens_used = json
        .pointer("/usage/total_tokens")
        .and_then(|t| t.as_u64())
        .map(|t| t as u32);

    Ok(Generation {
        text,
        confidence,
        tokens_used,
    })
}

// ============ Ollama ============

pub struct OllamaProvider {
    id: String,
    client: reqwest::Client,
    timeout: Duration,
    url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl OllamaProvider {
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            id: config.id.clone(),
            client: reqwest::Client::builder().timeout(timeout).build()?,
            timeout,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl GenerationProvider for OllamaProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, prompt: &str) -> Result<Generation, ProviderError> {
        let endpoint = format!("{}/api/generate", self.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            },
        });

        let response = self
            .client
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&self.id, e, self.timeout))?;

        if !response.status().is_success() {
            return Err(classify_status(&self.id, response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| malformed(&self.id, e.to_string()))?;
        parse_ollama_response(&self.id, &json)
    }
}

fn parse_ollama_response(
    provider: &str,
    json: &serde_json::Value,
) -> Result<Generation, ProviderError> {
    let text = json
        .get("response")
        .and_then(|r| r.as_str())
        .ok_or_else(|| malformed(provider, "missing response field"))?
        .to_string();
    let count = |key: &str| json.get(key).and_then(|v| v.as_u64());
    let tokens_used = match (count("prompt_eval_count"), count("eval_count")) {
        (None, None) => None,
        (p, e) => Some((p.unwrap_or(0) + e.unwrap_or(0)) as u32),
    };
    Ok(Generation {
        confidence: heuristic_confidence(&text),
        text,
        tokens_used,
    })
}

/// Build the configured provider.
///
/// The HTTP client timeout is the gateway's per-call timeout; the gateway
/// enforces it again around retries.
pub fn create_provider(
    config: &ProviderConfig,
    timeout: Duration,
) -> Result<Arc<dyn GenerationProvider>> {
    match config.kind.as_str() {
        "openai" => Ok(Arc::new(OpenAIChatProvider::new(config, timeout)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config, timeout)?)),
        other => bail!("providers.{}: unknown kind '{}'", config.id, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heuristic_confidence_caps() {
        assert!((heuristic_confidence("") - 0.3).abs() < 1e-12);
        assert!((heuristic_confidence(&"x".repeat(300)) - 0.6).abs() < 1e-12);
        assert_eq!(heuristic_confidence(&"x".repeat(5000)), 0.9);
    }

    #[test]
    fn test_parse_chat_response_with_logprobs() {
        let json = serde_json::json!({
            "choices": [{
                "message": { "role": "assistant", "content": "Aspirin." },
                "logprobs": { "content": [{ "logprob": 0.0 }, { "logprob": 0.0 }] }
            }],
            "usage": { "total_tokens": 42 }
        });
        let g = parse_chat_response("gpt", &json).unwrap();
        assert_eq!(g.text, "Aspirin.");
        assert!((g.confidence - 1.0).abs() < 1e-12);
        assert_eq!(g.tokens_used, Some(42));
    }

    #[test]
    fn test_parse_chat_response_without_logprobs() {
        let json = serde_json::json!({
            "choices": [{ "message": { "content": "ok" } }]
        });
        let g = parse_chat_response("gpt", &json).unwrap();
        assert_eq!(g.confidence, heuristic_confidence("ok"));
        assert_eq!(g.tokens_used, None);
    }

    #[test]
    fn test_parse_chat_response_malformed() {
        let err = parse_chat_response("gpt", &serde_json::json!({ "choices": [] })).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({
            "response": "Rest and fluids.",
            "prompt_eval_count": 10,
            "eval_count": 5
        });
        let g = parse_ollama_response("llama", &json).unwrap();
        assert_eq!(g.text, "Rest and fluids.");
        assert_eq!(g.tokens_used, Some(15));
        assert!(parse_ollama_response("llama", &serde_json::json!({})).is_err());
    }

    #[test]
    fn test_create_provider_missing_key() {
        let config = ProviderConfig {
            id: "gpt".into(),
            kind: "openai".into(),
            model: "gpt-4o-mini".into(),
            url: None,
            api_key_env: Some("FUSE_TEST_KEY_THAT_IS_NOT_SET".into()),
            weight: 1.0,
            temperature: 0.1,
            max_tokens: 100,
        };
        let err = create_provider(&config, Duration::from_secs(1)).err().unwrap();
        assert!(err.to_string().contains("FUSE_TEST_KEY_THAT_IS_NOT_SET"));
    }
}
