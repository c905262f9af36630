//! Feedback log and asynchronous weight learning.
//!
//! User feedback ("this provider's answer was good") is appended to a
//! [`FeedbackLog`] and never acted on inline. A [`WeightLearner`], driven
//! by a background job, consumes new events since its cursor and folds
//! them into the provider weights with an exponential moving average. The
//! resulting table is swapped into the fusion engine as a whole.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fusion::ProviderWeights;

/// One reward signal for one provider, in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub provider_id: String,
    pub reward: f64,
}

impl FeedbackEvent {
    pub fn new(session_id: impl Into<String>, provider_id: impl Into<String>, reward: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: session_id.into(),
            provider_id: provider_id.into(),
            reward: if reward.is_finite() {
                reward.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }
}

/// Append-only event log.
#[derive(Debug, Default)]
pub struct FeedbackLog {
    events: Mutex<Vec<FeedbackEvent>>,
}

impl FeedbackLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(events: Vec<FeedbackEvent>) -> Self {
        Self {
            events: Mutex::new(events),
        }
    }

    pub fn append(&self, event: FeedbackEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events at positions `cursor..`, plus the new end position.
    pub fn since(&self, cursor: usize) -> (Vec<FeedbackEvent>, usize) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let start = cursor.min(events.len());
        (events[start..].to_vec(), events.len())
    }
}

/// Folds feedback into provider weights.
#[derive(Debug, Clone)]
pub struct WeightLearner {
    learning_rate: f64,
    min_weight: f64,
    cursor: usize,
}

impl WeightLearner {
    pub fn new(learning_rate: f64, min_weight: f64) -> Self {
        Self {
            learning_rate: learning_rate.clamp(0.0, 1.0),
            min_weight: min_weight.max(0.0),
            cursor: 0,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Consume events appended since the last call. Returns the updated
    /// table, or `None` when there was nothing new.
    pub fn update(
        &mut self,
        log: &FeedbackLog,
        current: &ProviderWeights,
    ) -> Option<ProviderWeights> {
        let (events, end) = log.since(self.cursor);
        self.cursor = end;
        if events.is_empty() {
            return None;
        }

        let mut rewards: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for e in &events {
            let entry = rewards.entry(e.provider_id.as_str()).or_insert((0.0, 0));
            entry.0 += e.reward;
            entry.1 += 1;
        }

        let mut next = current.clone();
        for (provider, (sum, n)) in rewards {
            let mean = sum / n as f64;
            let old = current.get(provider);
            let updated = ((1.0 - self.learning_rate) * old + self.learning_rate * mean)
                .max(self.min_weight);
            debug!(provider, old, updated, events = n, "provider weight updated");
            next.set(provider, updated);
        }
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reward_clamped() {
        assert_eq!(FeedbackEvent::new("s", "p", 3.0).reward, 1.0);
        assert_eq!(FeedbackEvent::new("s", "p", f64::NAN).reward, 0.0);
    }

    #[test]
    fn test_learner_consumes_once() {
        let log = FeedbackLog::new();
        log.append(FeedbackEvent::new("s1", "A", 0.0));
        log.append(FeedbackEvent::new("s2", "A", 0.0));
        log.append(FeedbackEvent::new("s1", "B", 1.0));

        let mut learner = WeightLearner::new(0.5, 0.05);
        let w = learner.update(&log, &ProviderWeights::new()).unwrap();
        assert!((w.get("A") - 0.5).abs() < 1e-12);
        assert!((w.get("B") - 1.0).abs() < 1e-12);
        assert_eq!(learner.cursor(), 3);

        assert!(learner.update(&log, &w).is_none());
    }

    #[test]
    fn test_min_weight_floor() {
        let log = FeedbackLog::new();
        let mut learner = WeightLearner::new(1.0, 0.1);
        log.append(FeedbackEvent::new("s", "A", 0.0));
        let w = learner.update(&log, &ProviderWeights::new()).unwrap();
        assert_eq!(w.get("A"), 0.1);
    }

    #[test]
    fn test_untouched_providers_keep_weight() {
        let mut current = ProviderWeights::new();
        current.set("C", 0.4);
        let log = FeedbackLog::new();
        log.append(FeedbackEvent::new("s", "A", 1.0));
        let mut learner = WeightLearner::new(0.2, 0.0);
        let w = learner.update(&log, &current).unwrap();
        assert_eq!(w.get("C"), 0.4);
    }
}
