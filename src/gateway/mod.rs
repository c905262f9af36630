//! Provider gateway: uniform, isolated invocation of generation providers.
//!
//! Every provider call is wrapped in three layers:
//!
//! 1. **Circuit breaker** ([`breaker`]): a provider with too many recent
//!    failures is short-circuited with an immediate `ERROR` response and no
//!    network call.
//! 2. **Per-call timeout**: the whole logical call, retries included, is
//!    bounded; expiry yields a `TIMEOUT` response.
//! 3. **Retry**: rate limits and transport failures are retried with
//!    exponential backoff. Timeouts are never retried.
//!
//! [`ProviderGateway::invoke_all`] fans a prompt out to many providers as
//! separate tasks and waits until all resolve or the global fan-out
//! deadline passes. Calls still pending at the deadline are aborted and
//! reported as `TIMEOUT`. Aborted calls are cancellations, not failures,
//! and leave breaker statistics untouched.

pub mod breaker;
pub mod provider;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use fusion_harness_core::models::ProviderResponse;
use fusion_harness_core::ProviderError;

use crate::config::{GatewayConfig, ProviderConfig};
pub use breaker::{BreakerConfig, BreakerPermit, BreakerState, CircuitBreaker};
pub use provider::{create_provider, Generation, GenerationProvider};

/// Exponential backoff for transient provider errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base: Duration::from_millis(100),
            max: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GatewaySettings {
    pub call_timeout: Duration,
    pub fanout_deadline: Duration,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for GatewaySettings {
    fn from(c: &GatewayConfig) -> Self {
        Self {
            call_timeout: Duration::from_millis(c.call_timeout_ms),
            fanout_deadline: Duration::from_millis(c.fanout_deadline_ms),
            retry: RetryPolicy {
                max_retries: c.max_retries,
                base: Duration::from_millis(c.backoff_base_ms),
                max: Duration::from_millis(c.backoff_max_ms),
            },
            breaker: BreakerConfig {
                failure_threshold: c.failure_threshold,
                failure_window: Duration::from_millis(c.failure_window_ms),
                cooldown: Duration::from_millis(c.cooldown_ms),
            },
        }
    }
}

/// Breaker state of one provider, as reported by [`ProviderGateway::health`].
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub provider_id: String,
    pub state: BreakerState,
    pub degraded: bool,
    pub consecutive_failures: u32,
}

struct Registered {
    provider: Arc<dyn GenerationProvider>,
    breaker: Arc<CircuitBreaker>,
}

pub struct ProviderGateway {
    settings: GatewaySettings,
    providers: BTreeMap<String, Registered>,
}

impl ProviderGateway {
    pub fn new(settings: GatewaySettings) -> Self {
        Self {
            settings,
            providers: BTreeMap::new(),
        }
    }

    /// Build providers from `[[providers]]` config.
    pub fn from_config(gateway: &GatewayConfig, providers: &[ProviderConfig]) -> Result<Self> {
        let settings = GatewaySettings::from(gateway);
        let mut gw = Self::new(settings);
        for p in providers {
            gw.register(create_provider(p, settings.call_timeout)?);
        }
        Ok(gw)
    }

    /// Add a provider, replacing any earlier one with the same id.
    pub fn register(&mut self, provider: Arc<dyn GenerationProvider>) {
        let id = provider.id().to_string();
        let breaker = Arc::new(CircuitBreaker::new(id.clone(), self.settings.breaker));
        self.providers.insert(id, Registered { provider, breaker });
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn health(&self) -> Vec<ProviderHealth> {
        self.providers
            .iter()
            .map(|(id, r)| {
                let state = r.breaker.state();
                ProviderHealth {
                    provider_id: id.clone(),
                    state,
                    degraded: state.is_degraded(),
                    consecutive_failures: r.breaker.consecutive_failures(),
                }
            })
            .collect()
    }

    /// One logical call to one provider, bounded by `timeout`.
    pub async fn invoke(&self, provider_id: &str, prompt: &str, timeout: Duration) -> ProviderResponse {
        let Some(registered) = self.providers.get(provider_id) else {
            let err = ProviderError::UnknownProvider(provider_id.to_string());
            return ProviderResponse::error(provider_id, 0, err.to_string());
        };

        let Some(permit) = registered.breaker.try_acquire() else {
            let err = ProviderError::CircuitOpen {
                provider: provider_id.to_string(),
            };
            debug!(provider = provider_id, "short-circuited");
            return ProviderResponse::error(provider_id, 0, err.to_string());
        };

        let start = Instant::now();
        let outcome = tokio::time::timeout(
            timeout,
            self.generate_with_retry(registered.provider.as_ref(), prompt),
        )
        .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(generation)) => {
                permit.success();
                ProviderResponse::ok(provider_id, generation.text, generation.confidence, latency_ms)
                    .with_tokens(generation.tokens_used)
            }
            Ok(Err(err)) if err.is_timeout() => {
                permit.failure();
                ProviderResponse::timeout(provider_id, latency_ms)
            }
            Ok(Err(err)) => {
                permit.failure();
                warn!(provider = provider_id, error = %err, "provider call failed");
                ProviderResponse::error(provider_id, latency_ms, err.to_string())
            }
            Err(_) => {
                permit.failure();
                warn!(
                    provider = provider_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "provider call timed out"
                );
                ProviderResponse::timeout(provider_id, latency_ms)
            }
        }
    }

    async fn generate_with_retry(
        &self,
        provider: &dyn GenerationProvider,
        prompt: &str,
    ) -> Result<Generation, ProviderError> {
        let policy = self.settings.retry;
        let mut attempt = 0;
        loop {
            match provider.generate(prompt).await {
                Ok(g) => return Ok(g),
                Err(err) if err.is_transient() && attempt < policy.max_retries => {
                    attempt += 1;
                    let delay = policy.delay(attempt);
                    debug!(
                        provider = provider.id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying transient provider error"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Fan `prompt` out to `provider_ids` concurrently.
    ///
    /// Returns one response per distinct id, in input order. Dropping the
    /// returned future aborts every pending call.
    pub async fn invoke_all(self: &Arc<Self>, provider_ids: &[String], prompt: &str) -> Vec<ProviderResponse> {
        let mut ids: Vec<String> = Vec::with_capacity(provider_ids.len());
        let mut seen = BTreeSet::new();
        for id in provider_ids {
            if seen.insert(id.as_str()) {
                ids.push(id.clone());
            }
        }

        let prompt: Arc<str> = Arc::from(prompt);
        let timeout = self.settings.call_timeout;
        let start = Instant::now();
        let deadline = start + self.settings.fanout_deadline;

        let mut tasks = JoinSet::new();
        for id in &ids {
            let gw = Arc::clone(self);
            let id = id.clone();
            let prompt = Arc::clone(&prompt);
            tasks.spawn(async move {
                let response = gw.invoke(&id, &prompt, timeout).await;
                (id, response)
            });
        }

        let mut resolved: BTreeMap<String, ProviderResponse> = BTreeMap::new();
        let mut deadline_hit = false;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((id, response)))) => {
                    resolved.insert(id, response);
                }
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "provider task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    deadline_hit = true;
                    break;
                }
            }
        }
        tasks.abort_all();

        let elapsed_ms = start.elapsed().as_millis() as u64;
        if deadline_hit {
            let pending: Vec<&str> = ids
                .iter()
                .filter(|id| !resolved.contains_key(*id))
                .map(String::as_str)
                .collect();
            warn!(
                deadline_ms = self.settings.fanout_deadline.as_millis() as u64,
                pending = ?pending,
                "fan-out deadline elapsed"
            );
        }

        ids.into_iter()
            .map(|id| match resolved.remove(&id) {
                Some(r) => r,
                None if deadline_hit => ProviderResponse::timeout(id, elapsed_ms),
                None => ProviderResponse::error(id, elapsed_ms, "provider task failed"),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        id: String,
        fail_first: u32,
        error: ProviderError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl GenerationProvider for Flaky {
        fn id(&self) -> &str {
            &self.id
        }

        async fn generate(&self, _prompt: &str) -> Result<Generation, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(self.error.clone());
            }
            Ok(Generation {
                text: "ok".into(),
                confidence: 0.8,
                tokens_used: Some(3),
            })
        }
    }

    fn flaky(fail_first: u32, error: ProviderError) -> Arc<Flaky> {
        Arc::new(Flaky {
            id: "p".into(),
            fail_first,
            error,
            calls: AtomicU32::new(0),
        })
    }

    fn unavailable() -> ProviderError {
        ProviderError::Unavailable {
            provider: "p".into(),
            message: "503".into(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_invisibly() {
        let p = flaky(2, unavailable());
        let mut gw = ProviderGateway::new(GatewaySettings::default());
        gw.register(p.clone());
        let r = gw.invoke("p", "q", Duration::from_secs(5)).await;
        assert!(r.is_ok());
        assert_eq!(r.tokens_used, Some(3));
        assert_eq!(p.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_reports_error() {
        let p = flaky(10, unavailable());
        let mut gw = ProviderGateway::new(GatewaySettings::default());
        gw.register(p.clone());
        let r = gw.invoke("p", "q", Duration::from_secs(5)).await;
        assert_eq!(r.status, fusion_harness_core::models::ProviderStatus::Error);
        assert_eq!(p.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_are_not_retried() {
        let p = flaky(
            10,
            ProviderError::Rejected {
                provider: "p".into(),
                message: "400".into(),
            },
        );
        let mut gw = ProviderGateway::new(GatewaySettings::default());
        gw.register(p.clone());
        gw.invoke("p", "q", Duration::from_secs(5)).await;
        assert_eq!(p.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let gw = ProviderGateway::new(GatewaySettings::default());
        let r = gw.invoke("nope", "q", Duration::from_secs(1)).await;
        assert_eq!(r.error.as_deref(), Some("unknown provider: nope"));
    }

    #[test]
    fn test_settings_from_config() {
        let s = GatewaySettings::from(&GatewayConfig::default());
        assert_eq!(s.call_timeout, Duration::from_millis(2000));
        assert_eq!(s.fanout_deadline, Duration::from_millis(2500));
        assert_eq!(s.breaker.failure_threshold, 5);
        assert_eq!(s.retry.max_retries, 2);
    }
}
