//! Token and cost accounting.
//!
//! Upstream usage events report cumulative totals. Some agent builds emit a
//! trailing event with every token count at zero; those must never wipe the
//! totals already recorded. Cost only ever moves up.

use std::collections::BTreeMap;

use loom_protocol::ModelUsage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl TokenCounts {
    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_read_tokens == 0
            && self.cache_write_tokens == 0
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageState {
    #[serde(flatten)]
    pub tokens: TokenCounts,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub model_usage: BTreeMap<String, ModelUsage>,
    #[serde(default)]
    pub duration_api_ms: Option<u64>,
}

/// One accounting event as received, after the merge guard was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageUpdate {
    pub tokens: TokenCounts,
    pub total_cost_usd: f64,
    pub model_usage: Option<BTreeMap<String, ModelUsage>>,
    pub duration_api_ms: Option<u64>,
}

impl UsageState {
    /// Merges an update; returns false when token counts were kept because the
    /// update was all-zero.
    pub fn merge(&mut self, update: &UsageUpdate) -> bool {
        let guarded = update.tokens.is_zero() && !self.tokens.is_zero();
        if guarded {
            tracing::debug!(
                existing_total = self.tokens.total(),
                "Ignoring all-zero token counts"
            );
        } else {
            self.tokens = update.tokens;
        }

        self.total_cost_usd = self.total_cost_usd.max(update.total_cost_usd);

        if let Some(models) = update.model_usage.as_ref() {
            for (model, usage) in models {
                let entry = self.model_usage.entry(model.clone()).or_default();
                let incoming_zero = usage.input_tokens == 0
                    && usage.output_tokens == 0
                    && usage.cache_read_tokens == 0
                    && usage.cache_write_tokens == 0;
                let cost = entry.cost_usd.max(usage.cost_usd);
                if !incoming_zero {
                    *entry = usage.clone();
                }
                entry.cost_usd = cost;
            }
        }

        if let Some(duration) = update.duration_api_ms {
            self.duration_api_ms = Some(self.duration_api_ms.unwrap_or(0).max(duration));
        }

        !guarded
    }
}

/// Snapshot of cumulative usage taken at one accounting event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnUsage {
    pub turn_index: u32,
    #[serde(flatten)]
    pub tokens: TokenCounts,
    pub total_cost_usd: f64,
    #[serde(default)]
    pub recorded_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(input: u64, output: u64, cost: f64) -> UsageUpdate {
        UsageUpdate {
            tokens: TokenCounts {
                input_tokens: input,
                output_tokens: output,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
            },
            total_cost_usd: cost,
            model_usage: None,
            duration_api_ms: None,
        }
    }

    #[test]
    fn zero_update_keeps_tokens_but_raises_cost() {
        let mut usage = UsageState::default();
        assert!(usage.merge(&update(100, 50, 0.10)));
        assert!(!usage.merge(&update(0, 0, 0.25)));

        assert_eq!(usage.tokens.input_tokens, 100);
        assert_eq!(usage.tokens.output_tokens, 50);
        assert!((usage.total_cost_usd - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn cost_never_decreases() {
        let mut usage = UsageState::default();
        usage.merge(&update(10, 10, 0.50));
        usage.merge(&update(20, 20, 0.20));
        assert_eq!(usage.tokens.input_tokens, 20);
        assert!((usage.total_cost_usd - 0.50).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_update_on_empty_state_is_accepted() {
        let mut usage = UsageState::default();
        assert!(usage.merge(&update(0, 0, 0.0)));
        assert!(usage.tokens.is_zero());
    }

    #[test]
    fn model_breakdown_merges_per_model() {
        let mut usage = UsageState::default();
        let mut models = BTreeMap::new();
        models.insert(
            "claude-sonnet".to_string(),
            ModelUsage {
                input_tokens: 5,
                output_tokens: 7,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
                cost_usd: 0.3,
            },
        );
        let mut first = update(5, 7, 0.3);
        first.model_usage = Some(models);
        usage.merge(&first);

        let mut zero_models = BTreeMap::new();
        zero_models.insert("claude-sonnet".to_string(), ModelUsage::default());
        let mut second = update(0, 0, 0.0);
        second.model_usage = Some(zero_models);
        second.duration_api_ms = Some(1200);
        usage.merge(&second);

        let sonnet = usage.model_usage.get("claude-sonnet").expect("model entry");
        assert_eq!(sonnet.output_tokens, 7);
        assert!((sonnet.cost_usd - 0.3).abs() < f64::EPSILON);
        assert_eq!(usage.duration_api_ms, Some(1200));
    }
}
