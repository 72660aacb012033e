//! Correlation ids, cost estimation, and per-episode statistics.

use crate::model::TokenUsage;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Generate a unique trace id for an episode.
pub fn generate_trace_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("ep-{ts:x}-{count:04x}")
}

/// Span id for one round of an episode.
pub fn generate_span_id(trace_id: &str, round: u32) -> String {
    format!("{trace_id}:r{round}")
}

// ── Pricing ────────────────────────────────────────────────────────

/// USD per 1M tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn estimate_cost(&self, usage: TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (usage.completion_tokens as f64 / 1_000_000.0) * self.output_per_million
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self::new(3.0, 15.0)
    }
}

/// Name fragments checked in order; the first match wins, so more specific
/// fragments come first.
const PRICING_TABLE: &[(&str, ModelPricing)] = &[
    ("opus", ModelPricing::new(15.0, 75.0)),
    ("sonnet", ModelPricing::new(3.0, 15.0)),
    ("haiku", ModelPricing::new(0.25, 1.25)),
    ("4o-mini", ModelPricing::new(0.15, 0.60)),
    ("gpt-4", ModelPricing::new(2.50, 10.0)),
    ("flash", ModelPricing::new(0.075, 0.30)),
    ("gemini", ModelPricing::new(1.25, 5.0)),
    ("deepseek", ModelPricing::new(0.27, 1.10)),
];

/// Approximate pricing for a model, matched on the segment after the last
/// `/` so org prefixes don't cause false matches. Good enough to flag a
/// runaway episode, not for billing.
pub fn pricing_for_model(model: &str) -> ModelPricing {
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();
    if name.starts_with("o1") || name.starts_with("o3") {
        return ModelPricing::new(15.0, 60.0);
    }
    PRICING_TABLE
        .iter()
        .find(|(fragment, _)| name.contains(fragment))
        .map(|(_, pricing)| *pricing)
        .unwrap_or_default()
}

/// Cumulative token usage and estimated cost.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CostTracker {
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub estimated_cost_usd: f64,
}

impl CostTracker {
    pub fn record(&mut self, usage: TokenUsage, pricing: &ModelPricing) {
        self.total_prompt_tokens += usage.prompt_tokens as u64;
        self.total_completion_tokens += usage.completion_tokens as u64;
        self.estimated_cost_usd += pricing.estimate_cost(usage);
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_prompt_tokens + self.total_completion_tokens
    }

    /// Fold another tracker into this one.
    pub fn absorb(&mut self, other: &CostTracker) {
        self.total_prompt_tokens += other.total_prompt_tokens;
        self.total_completion_tokens += other.total_completion_tokens;
        self.estimated_cost_usd += other.estimated_cost_usd;
    }
}

// ── Episode stats ──────────────────────────────────────────────────

/// What one episode cost. Returned alongside every result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EpisodeStats {
    pub trace_id: String,
    /// Rounds (fold) or windows (rerank) executed.
    pub rounds: u32,
    pub api_calls: u32,
    /// Times the batch cap was shrunk after a truncated response.
    pub overflow_retries: u32,
    /// Batch cap at the start and the end of the episode.
    pub initial_cap: usize,
    pub final_cap: usize,
    #[serde(flatten)]
    pub cost: CostTracker,
    /// Wall time spent waiting on provider calls.
    #[serde(serialize_with = "as_millis")]
    pub api_time: Duration,
    /// Wall time of the whole episode.
    #[serde(serialize_with = "as_millis")]
    pub exec_time: Duration,
}

impl EpisodeStats {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            ..Default::default()
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.cost.total_tokens()
    }

    /// Merge stats of another episode (used when reporting several groups).
    pub fn absorb(&mut self, other: &EpisodeStats) {
        self.rounds += other.rounds;
        self.api_calls += other.api_calls;
        self.overflow_retries += other.overflow_retries;
        self.cost.absorb(&other.cost);
        self.api_time += other.api_time;
        self.exec_time += other.exec_time;
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "{} round(s), {} call(s), {} overflow retr{}, tokens: {} prompt + {} completion, \
             est. cost: ${:.4}, api {:.1}s / total {:.1}s",
            self.rounds,
            self.api_calls,
            self.overflow_retries,
            if self.overflow_retries == 1 { "y" } else { "ies" },
            self.cost.total_prompt_tokens,
            self.cost.total_completion_tokens,
            self.cost.estimated_cost_usd,
            self.api_time.as_secs_f64(),
            self.exec_time.as_secs_f64(),
        )
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}
