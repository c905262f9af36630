//! Per-provider circuit breaker.
//!
//! ```text
//! CLOSED ──(F failures in window)──▶ OPEN ──(cooldown)──▶ HALF_OPEN
//!    ▲                                 ▲                      │
//!    └────────(probe succeeds)─────────┼──────────────────────┤
//!                                      └──(probe fails)───────┘
//! ```
//!
//! Every concurrent query touches the breaker, so its state lives in
//! atomics and transitions are compare-and-swap. A call goes through the
//! breaker only while holding a [`BreakerPermit`]; a permit dropped without
//! an outcome (the call was cancelled) leaves the failure count untouched
//! and frees the half-open probe slot.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    const CLOSED: u8 = 0;
    const OPEN: u8 = 1;
    const HALF_OPEN: u8 = 2;

    fn from_u8(v: u8) -> Self {
        match v {
            Self::OPEN => BreakerState::Open,
            Self::HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }

    /// Anything but `CLOSED` is reported as degraded.
    pub fn is_degraded(&self) -> bool {
        *self != BreakerState::Closed
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    epoch: Instant,
    state: AtomicU8,
    failures: AtomicU32,
    window_start_ms: AtomicU64,
    opened_at_ms: AtomicU64,
    probe_in_flight: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            epoch: Instant::now(),
            state: AtomicU8::new(BreakerState::CLOSED),
            failures: AtomicU32::new(0),
            window_start_ms: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn cooled_down(&self, now: u64) -> bool {
        now.saturating_sub(self.opened_at_ms.load(Ordering::Acquire))
            >= self.config.cooldown.as_millis() as u64
    }

    /// Current state. An open breaker whose cooldown has elapsed reads as
    /// `HALF_OPEN` even before the probe is issued.
    pub fn state(&self) -> BreakerState {
        let raw = BreakerState::from_u8(self.state.load(Ordering::Acquire));
        if raw == BreakerState::Open && self.cooled_down(self.now_ms()) {
            BreakerState::HalfOpen
        } else {
            raw
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Ask to place a call. `None` means short-circuit: no call may be made.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BreakerPermit> {
        loop {
            match self.state.load(Ordering::Acquire) {
                BreakerState::CLOSED => return Some(BreakerPermit::new(self, false)),
                BreakerState::OPEN => {
                    if !self.cooled_down(self.now_ms()) {
                        return None;
                    }
                    if self
                        .state
                        .compare_exchange(
                            BreakerState::OPEN,
                            BreakerState::HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        info!(provider = %self.provider, "breaker half-open, probing");
                    }
                }
                _ => {
                    return self
                        .probe_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .ok()
                        .map(|_| BreakerPermit::new(self, true));
                }
            }
        }
    }

    fn on_success(&self, probe: bool) {
        self.failures.store(0, Ordering::Release);
        if probe {
            self.state.store(BreakerState::CLOSED, Ordering::Release);
            self.probe_in_flight.store(false, Ordering::Release);
            info!(provider = %self.provider, "breaker closed after successful probe");
        }
    }

    fn on_failure(&self, probe: bool) {
        let now = self.now_ms();
        if probe {
            self.opened_at_ms.store(now, Ordering::Release);
            self.state.store(BreakerState::OPEN, Ordering::Release);
            self.probe_in_flight.store(false, Ordering::Release);
            warn!(provider = %self.provider, "probe failed, breaker reopened");
            return;
        }

        let window = self.config.failure_window.as_millis() as u64;
        let start = self.window_start_ms.load(Ordering::Acquire);
        if self.failures.load(Ordering::Acquire) == 0 || now.saturating_sub(start) > window {
            self.failures.store(0, Ordering::Release);
            self.window_start_ms.store(now, Ordering::Release);
        }
        let count = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if count >= self.config.failure_threshold
            && self.state.load(Ordering::Acquire) == BreakerState::CLOSED
        {
            self.opened_at_ms.store(now, Ordering::Release);
            if self
                .state
                .compare_exchange(
                    BreakerState::CLOSED,
                    BreakerState::OPEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                warn!(
                    provider = %self.provider,
                    failures = count,
                    cooldown_ms = self.config.cooldown.as_millis() as u64,
                    "breaker opened"
                );
            }
        }
    }

    fn on_cancel(&self, probe: bool) {
        if probe {
            self.probe_in_flight.store(false, Ordering::Release);
        }
    }
}

/// Leave to make one call. Resolve with [`success`](Self::success) or
/// [`failure`](Self::failure); dropping it unresolved counts as a cancel.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    resolved: bool,
}

impl BreakerPermit {
    fn new(breaker: &Arc<CircuitBreaker>, probe: bool) -> Self {
        Self {
            breaker: Arc::clone(breaker),
            probe,
            resolved: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.probe);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_cancel(self.probe);
        }
    }
}
