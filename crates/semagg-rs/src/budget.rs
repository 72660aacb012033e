//! Batch planning: how many rows the next provider call may carry.
//!
//! Two policies share one [`BudgetPlanner`]:
//!
//! - [`BudgetPolicy::Cardinality`] caps a batch at the current
//!   [`BudgetState`] cap.
//! - [`BudgetPolicy::TokenBudget`] additionally packs rows greedily into the
//!   model's context window, after subtracting the fixed prompt overhead
//!   (template plus user query) and a one-time table header.
//!
//! [`BudgetState`] is the per-episode cap. It only ever shrinks: every
//! provider truncation multiplies it by 0.9 (floored), and the episode fails
//! once it reaches zero.

use crate::error::{EngineError, Result};
use crate::prompt::{PromptKind, PromptTemplate, TupleFormat};
use crate::row::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use tracing::{debug, warn};

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Batch size used when neither the engine config nor the model sets one.
pub const DEFAULT_BATCH_SIZE: usize = 2048;

// ── Tokenizer ──────────────────────────────────────────────────────

/// Estimates the size of a piece of prompt text in tokens.
pub trait Tokenizer: Send + Sync {
    fn estimate_size(&self, text: &str) -> usize;
}

/// Character-ratio estimator. Rounds up so that any non-empty text costs at
/// least one token.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioTokenizer {
    chars_per_token: f64,
}

impl CharRatioTokenizer {
    /// Use a calibrated chars-per-token ratio. Non-positive ratios fall back
    /// to [`DEFAULT_CHARS_PER_TOKEN`].
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }
}

impl Default for CharRatioTokenizer {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl Tokenizer for CharRatioTokenizer {
    fn estimate_size(&self, text: &str) -> usize {
        (text.chars().count() as f64 / self.chars_per_token).ceil() as usize
    }
}

// ── Policy ─────────────────────────────────────────────────────────

/// Batch sizing policy, applied uniformly to every call in an episode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BudgetPolicy {
    #[default]
    Cardinality,
    TokenBudget,
}

impl FromStr for BudgetPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "cardinality" => Ok(BudgetPolicy::Cardinality),
            "token-budget" | "tokens" => Ok(BudgetPolicy::TokenBudget),
            other => Err(format!(
                "unknown budget policy '{other}' (expected cardinality or token-budget)"
            )),
        }
    }
}

impl fmt::Display for BudgetPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetPolicy::Cardinality => write!(f, "cardinality"),
            BudgetPolicy::TokenBudget => write!(f, "token-budget"),
        }
    }
}

// ── Budget state ───────────────────────────────────────────────────

/// Per-episode batch cap. Owned by exactly one finalize call.
#[derive(Debug, Clone)]
pub struct BudgetState {
    cap: usize,
    initial: usize,
    retries: u32,
}

impl BudgetState {
    /// Start an episode with `cap` rows per batch. A zero cap is rejected
    /// before any call is issued.
    pub fn new(cap: usize) -> Result<Self> {
        if cap == 0 {
            return Err(EngineError::config("starting batch cap must be positive"));
        }
        Ok(Self {
            cap,
            initial: cap,
            retries: 0,
        })
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn initial_cap(&self) -> usize {
        self.initial
    }

    /// Number of overflow retries taken so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn has_shrunk(&self) -> bool {
        self.cap < self.initial
    }

    /// Shrink after a truncated batch of `attempted` rows:
    /// `cap = floor(min(cap, attempted) * 0.9)`.
    ///
    /// Returns the new cap, or [`EngineError::BudgetExhausted`] once it hits 0.
    pub fn shrink(&mut self, attempted: usize) -> Result<usize> {
        let base = self.cap.min(attempted);
        let next = base * 9 / 10;
        self.retries += 1;
        self.cap = next;
        if next == 0 {
            return Err(EngineError::BudgetExhausted {
                cap: 0,
                retries: self.retries,
                reason: format!("batch cap shrank to zero after a truncated {base}-row batch"),
            });
        }
        warn!(
            "Output truncated on a {base}-row batch; shrinking cap to {next} (retry {})",
            self.retries
        );
        Ok(next)
    }

    /// The error for a cap that is positive but too small to make progress.
    /// Blamed on configuration when the cap was never shrunk.
    pub fn stalled(&self, reason: impl Into<String>) -> EngineError {
        let reason = reason.into();
        if self.has_shrunk() {
            EngineError::BudgetExhausted {
                cap: self.cap,
                retries: self.retries,
                reason,
            }
        } else {
            EngineError::Configuration(format!("batch cap {} is too small: {reason}", self.cap))
        }
    }
}

/// Resolve the starting cap: engine override, then model setting, then
/// [`DEFAULT_BATCH_SIZE`], bounded by the row count.
pub fn starting_cap(configured: Option<usize>, model: Option<usize>, row_count: usize) -> usize {
    configured
        .or(model)
        .unwrap_or(DEFAULT_BATCH_SIZE)
        .min(row_count)
}

// ── Planner ────────────────────────────────────────────────────────

/// Plans batches for one kind of request within one episode.
pub struct BudgetPlanner<'a> {
    policy: BudgetPolicy,
    tokenizer: &'a dyn Tokenizer,
    template: &'a dyn PromptTemplate,
    format: TupleFormat,
    /// Tokens left for the table after the fixed prompt overhead.
    available: usize,
}

impl<'a> BudgetPlanner<'a> {
    /// Build a planner. Under the token policy the fixed overhead must leave
    /// room in the context window, otherwise this is a configuration error.
    pub fn new(
        policy: BudgetPolicy,
        kind: PromptKind,
        user_query: &str,
        context_window: usize,
        tokenizer: &'a dyn Tokenizer,
        template: &'a dyn PromptTemplate,
        format: TupleFormat,
    ) -> Result<Self> {
        let available = match policy {
            BudgetPolicy::Cardinality => usize::MAX,
            BudgetPolicy::TokenBudget => {
                let overhead = tokenizer.estimate_size(&template.template(kind))
                    + tokenizer.estimate_size(user_query);
                if overhead >= context_window {
                    return Err(EngineError::config(format!(
                        "{kind} prompt overhead of {overhead} tokens leaves no room in a \
                         {context_window}-token context window"
                    )));
                }
                debug!(
                    "Token budget for {kind}: window={context_window}, overhead={overhead}, available={}",
                    context_window - overhead
                );
                context_window - overhead
            }
        };
        Ok(Self {
            policy,
            tokenizer,
            template,
            format,
            available,
        })
    }

    pub fn policy(&self) -> BudgetPolicy {
        self.policy
    }

    /// Length of the next batch taken from the front of `rows`.
    ///
    /// Always at least 1 for a non-empty slice; a row that can't fit alone is
    /// a configuration error.
    pub fn next_batch_len(&self, rows: &[&Row], state: &BudgetState) -> Result<usize> {
        self.packed_len(rows, state.cap())
    }

    /// Like [`next_batch_len`](Self::next_batch_len) with an explicit row
    /// limit in place of the cap.
    pub fn packed_len(&self, rows: &[&Row], limit: usize) -> Result<usize> {
        let Some(first) = rows.first() else {
            return Ok(0);
        };
        let cap = limit.min(rows.len());
        if self.policy == BudgetPolicy::Cardinality {
            return Ok(cap);
        }

        let header = self
            .tokenizer
            .estimate_size(&self.template.render_header(first, self.format));
        let mut used = header;
        let mut taken = 0;
        for (index, row) in rows.iter().take(cap).enumerate() {
            let size = self
                .tokenizer
                .estimate_size(&self.template.render_row(index, row, self.format));
            if used + size > self.available {
                if taken == 0 {
                    return Err(EngineError::config(format!(
                        "a single row needs {} tokens but only {} are available after the prompt overhead",
                        header + size,
                        self.available
                    )));
                }
                break;
            }
            used += size;
            taken += 1;
        }
        Ok(taken)
    }

    /// Partition `rows` into consecutive batches covering every row exactly once.
    pub fn partition(&self, rows: &[&Row], state: &BudgetState) -> Result<Vec<Range<usize>>> {
        let mut batches = Vec::new();
        let mut start = 0;
        while start < rows.len() {
            let len = self.next_batch_len(&rows[start..], state)?;
            batches.push(start..start + len);
            start += len;
        }
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::DefaultTemplates;

    fn rows(n: usize) -> Vec<Row> {
        (0..n).map(|i| Row::default().with("id", i)).collect()
    }

    static TOKENIZER: CharRatioTokenizer = CharRatioTokenizer {
        chars_per_token: DEFAULT_CHARS_PER_TOKEN,
    };
    static TEMPLATES: DefaultTemplates = DefaultTemplates;

    fn cardinality() -> BudgetPlanner<'static> {
        BudgetPlanner::new(
            BudgetPolicy::Cardinality,
            PromptKind::Reduce,
            "summarize",
            0,
            &TOKENIZER,
            &TEMPLATES,
            TupleFormat::Xml,
        )
        .unwrap()
    }

    #[test]
    fn cardinality_partitions_exactly() {
        let planner = cardinality();
        for n in 1..=23 {
            for cap in 1..=9 {
                let rows = rows(n);
                let refs: Vec<&Row> = rows.iter().collect();
                let state = BudgetState::new(cap).unwrap();
                let batches = planner.partition(&refs, &state).unwrap();

                let mut covered = Vec::new();
                for b in &batches {
                    assert!(!b.is_empty());
                    assert!(b.len() <= cap, "n={n} cap={cap} batch={b:?}");
                    covered.extend(b.clone());
                }
                assert_eq!(covered, (0..n).collect::<Vec<_>>(), "n={n} cap={cap}");
            }
        }
    }

    #[test]
    fn zero_starting_cap_is_configuration_error() {
        assert!(matches!(
            BudgetState::new(0),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn shrink_sequence_from_ten() {
        let mut state = BudgetState::new(10).unwrap();
        let mut caps = vec![state.cap()];
        loop {
            let attempted = state.cap();
            match state.shrink(attempted) {
                Ok(cap) => caps.push(cap),
                Err(EngineError::BudgetExhausted { cap, retries, .. }) => {
                    assert_eq!(cap, 0);
                    assert_eq!(retries, 10);
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(caps, vec![10, 9, 8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn shrink_uses_attempted_batch_when_smaller() {
        let mut state = BudgetState::new(100).unwrap();
        assert_eq!(state.shrink(20).unwrap(), 18);
        assert!(state.has_shrunk());
    }

    #[test]
    fn stalled_blames_configuration_until_shrunk() {
        let mut state = BudgetState::new(5).unwrap();
        assert!(matches!(state.stalled("x"), EngineError::Configuration(_)));
        state.shrink(5).unwrap();
        assert!(matches!(state.stalled("x"), EngineError::BudgetExhausted { .. }));
    }

    #[test]
    fn starting_cap_resolution_order() {
        assert_eq!(starting_cap(Some(4), Some(8), 100), 4);
        assert_eq!(starting_cap(None, Some(8), 100), 8);
        assert_eq!(starting_cap(None, None, 100), 100);
        assert_eq!(starting_cap(None, None, 5000), DEFAULT_BATCH_SIZE);
        assert_eq!(starting_cap(Some(4), None, 2), 2);
    }

    #[test]
    fn token_budget_packs_until_window_is_full() {
        let tokenizer = CharRatioTokenizer::new(1.0);
        let template = DefaultTemplates;
        let query = "q";
        let kind = PromptKind::Reduce;
        let overhead = tokenizer.estimate_size(&template.template(kind)) + 1;

        let rows = rows(10);
        let refs: Vec<&Row> = rows.iter().collect();
        let header = tokenizer.estimate_size(&template.render_header(refs[0], TupleFormat::Xml));
        let row_cost = tokenizer.estimate_size(&template.render_row(0, refs[0], TupleFormat::Xml));

        // Room for the header and exactly three rows.
        let window = overhead + header + 3 * row_cost;
        let planner = BudgetPlanner::new(
            BudgetPolicy::TokenBudget,
            kind,
            query,
            window,
            &tokenizer,
            &template,
            TupleFormat::Xml,
        )
        .unwrap();
        let state = BudgetState::new(100).unwrap();
        assert_eq!(planner.next_batch_len(&refs, &state).unwrap(), 3);

        let batches = planner.partition(&refs, &state).unwrap();
        let total: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, 10);
        assert!(batches.iter().all(|b| b.len() <= 3));
    }

    #[test]
    fn token_budget_still_respects_cap() {
        let tokenizer = CharRatioTokenizer::default();
        let planner = BudgetPlanner::new(
            BudgetPolicy::TokenBudget,
            PromptKind::Rerank,
            "rank",
            1_000_000,
            &tokenizer,
            &DefaultTemplates,
            TupleFormat::Json,
        )
        .unwrap();
        let rows = rows(50);
        let refs: Vec<&Row> = rows.iter().collect();
        let state = BudgetState::new(7).unwrap();
        assert_eq!(planner.next_batch_len(&refs, &state).unwrap(), 7);
    }

    #[test]
    fn overhead_larger_than_window_is_rejected() {
        let tokenizer = CharRatioTokenizer::default();
        let result = BudgetPlanner::new(
            BudgetPolicy::TokenBudget,
            PromptKind::Reduce,
            "q",
            10,
            &tokenizer,
            &DefaultTemplates,
            TupleFormat::Xml,
        );
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn oversized_single_row_is_rejected() {
        let tokenizer = CharRatioTokenizer::new(1.0);
        let template = DefaultTemplates;
        let overhead = tokenizer.estimate_size(&template.template(PromptKind::Reduce)) + 1;
        let planner = BudgetPlanner::new(
            BudgetPolicy::TokenBudget,
            PromptKind::Reduce,
            "q",
            overhead + 20,
            &tokenizer,
            &template,
            TupleFormat::Xml,
        )
        .unwrap();
        let big = vec![Row::default().with("text", "x".repeat(500))];
        let refs: Vec<&Row> = big.iter().collect();
        let state = BudgetState::new(4).unwrap();
        assert!(matches!(
            planner.next_batch_len(&refs, &state),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn policy_parses_from_cli_spellings() {
        assert_eq!("token-budget".parse::<BudgetPolicy>().unwrap(), BudgetPolicy::TokenBudget);
        assert_eq!("token_budget".parse::<BudgetPolicy>().unwrap(), BudgetPolicy::TokenBudget);
        assert_eq!("Cardinality".parse::<BudgetPolicy>().unwrap(), BudgetPolicy::Cardinality);
        assert!("greedy".parse::<BudgetPolicy>().is_err());
    }

    #[test]
    fn char_ratio_rounds_up() {
        let t = CharRatioTokenizer::new(4.0);
        assert_eq!(t.estimate_size(""), 0);
        assert_eq!(t.estimate_size("a"), 1);
        assert_eq!(t.estimate_size("abcde"), 2);
    }
}
