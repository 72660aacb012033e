//! The tournament reduction engine.
//!
//! [`Engine`] runs one *episode* per aggregate group: it labels the rows,
//! plans batches against the model's budget, drives rounds (or rerank
//! windows) until one result remains, and returns it with the episode's
//! [`EpisodeStats`].
//!
//! # Example
//!
//! ```ignore
//! let engine = Engine::new(&model, EngineConfig::new().with_batch_size(16))
//!     .with_event_handler(&LoggingHandler);
//! let best = engine.select(rows, "most urgent ticket", Selection::First).await?;
//! println!("{:?} after {} call(s)", best.value, best.stats.api_calls);
//! ```

pub mod events;
mod executor;
mod rerank;
pub mod stats;
mod tournament;

pub use events::{
    CompositeEventHandler, EpisodeEvent, EventHandler, FnEventHandler, LoggingHandler,
    NoopHandler,
};
pub use executor::{CancelHandle, CancelSignal, cancel_pair};
pub use stats::{EpisodeStats, ModelPricing, pricing_for_model};

use crate::aggregate::{AggregateKind, AggregateOutput, AggregateState};
use crate::budget::{BudgetPlanner, BudgetState, CharRatioTokenizer, Tokenizer, starting_cap};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::Model;
use crate::prompt::{DefaultTemplates, PromptKind, PromptTemplate, Selection};
use crate::row::Row;
use executor::Episode;
use futures::StreamExt;
use serde_json::Value;
use std::time::Instant;
use tracing::{Instrument, info_span};

/// A finalized value together with what it cost.
#[derive(Debug, Clone)]
pub struct EpisodeResult<T> {
    pub value: T,
    pub stats: EpisodeStats,
}

impl<T> EpisodeResult<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> EpisodeResult<U> {
        EpisodeResult {
            value: f(self.value),
            stats: self.stats,
        }
    }
}

/// Runs semantic aggregate episodes against one model.
///
/// Collaborators are borrowed for the engine's lifetime. Bind handlers to a
/// local before passing them in:
///
/// ```ignore
/// let handler = CompositeEventHandler::new().with(LoggingHandler);
/// let engine = Engine::new(&model, config).with_event_handler(&handler);
/// ```
pub struct Engine<'a> {
    model: &'a dyn Model,
    config: EngineConfig,
    tokenizer: Option<&'a dyn Tokenizer>,
    default_tokenizer: CharRatioTokenizer,
    template: &'a dyn PromptTemplate,
    events: &'a dyn EventHandler,
    cancel: Option<CancelSignal>,
}

impl<'a> Engine<'a> {
    pub fn new(model: &'a dyn Model, config: EngineConfig) -> Self {
        let default_tokenizer = CharRatioTokenizer::new(config.chars_per_token);
        Self {
            model,
            config,
            tokenizer: None,
            default_tokenizer,
            template: &DefaultTemplates,
            events: &NoopHandler,
            cancel: None,
        }
    }

    /// Use a custom tokenizer instead of the character-ratio estimate.
    pub fn with_tokenizer(mut self, tokenizer: &'a dyn Tokenizer) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    pub fn with_template(mut self, template: &'a dyn PromptTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn with_event_handler(mut self, handler: &'a dyn EventHandler) -> Self {
        self.events = handler;
        self
    }

    /// Abandon in-flight rounds once `signal` fires.
    pub fn with_cancel_signal(mut self, signal: CancelSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Summarize `rows` into one value. `None` for an empty group.
    pub async fn reduce(
        &self,
        rows: Vec<Row>,
        user_query: &str,
    ) -> Result<EpisodeResult<Option<Value>>> {
        let kind = PromptKind::Reduce;
        if rows.is_empty() {
            return Ok(self.short_circuit(kind, 0, None));
        }
        let mut episode = self.episode(kind, user_query, rows.len())?;
        let span = info_span!("episode", trace_id = %episode.stats.trace_id, %kind);
        let value = tournament::reduce(&mut episode, rows)
            .instrument(span)
            .await?;
        Ok(EpisodeResult {
            value,
            stats: episode.finish(),
        })
    }

    /// Pick the most (`First`) or least (`Last`) relevant row. The result is
    /// always one of the input rows, unchanged.
    pub async fn select(
        &self,
        rows: Vec<Row>,
        user_query: &str,
        selection: Selection,
    ) -> Result<EpisodeResult<Option<Row>>> {
        let kind = PromptKind::Select(selection);
        if rows.len() <= 1 {
            let n = rows.len();
            return Ok(self.short_circuit(kind, n, rows.into_iter().next()));
        }
        let mut episode = self.episode(kind, user_query, rows.len())?;
        let span = info_span!("episode", trace_id = %episode.stats.trace_id, %kind);
        let value = tournament::select(&mut episode, rows)
            .instrument(span)
            .await?;
        Ok(EpisodeResult {
            value,
            stats: episode.finish(),
        })
    }

    /// Order `rows` by relevance, most relevant first. Rows that lose every
    /// window they appear in are not returned.
    pub async fn rerank(&self, rows: Vec<Row>, user_query: &str) -> Result<EpisodeResult<Vec<Row>>> {
        let kind = PromptKind::Rerank;
        if rows.len() <= 1 {
            let n = rows.len();
            return Ok(self.short_circuit(kind, n, rows));
        }
        let mut episode = self.episode(kind, user_query, rows.len())?;
        let span = info_span!("episode", trace_id = %episode.stats.trace_id, %kind);
        let value = rerank::rerank(&mut episode, rows).instrument(span).await?;
        Ok(EpisodeResult {
            value,
            stats: episode.finish(),
        })
    }

    /// Finalize one aggregate group.
    pub async fn finalize(
        &self,
        kind: AggregateKind,
        state: AggregateState,
        user_query: &str,
    ) -> Result<EpisodeResult<AggregateOutput>> {
        let rows = state.into_rows();
        let output = match kind {
            AggregateKind::Reduce => self
                .reduce(rows, user_query)
                .await?
                .map(|v| v.map_or(AggregateOutput::Null, AggregateOutput::Value)),
            AggregateKind::First => self
                .select(rows, user_query, Selection::First)
                .await?
                .map(|r| r.map_or(AggregateOutput::Null, AggregateOutput::Row)),
            AggregateKind::Last => self
                .select(rows, user_query, Selection::Last)
                .await?
                .map(|r| r.map_or(AggregateOutput::Null, AggregateOutput::Row)),
            AggregateKind::Rerank => self
                .rerank(rows, user_query)
                .await?
                .map(AggregateOutput::Rows),
        };
        Ok(output)
    }

    /// Finalize several groups, at most `max_groups_in_flight` at a time.
    /// Results come back in input order; a failing group does not affect the
    /// others.
    pub async fn finalize_groups<K>(
        &self,
        kind: AggregateKind,
        groups: Vec<(K, AggregateState)>,
        user_query: &str,
    ) -> Vec<(K, Result<EpisodeResult<AggregateOutput>>)> {
        let limit = self.config.max_groups_in_flight.max(1);
        futures::stream::iter(groups.into_iter().map(|(key, state)| async move {
            let result = self.finalize(kind, state, user_query).await;
            (key, result)
        }))
        .buffered(limit)
        .collect()
        .await
    }

    fn short_circuit<T>(&self, kind: PromptKind, rows: usize, value: T) -> EpisodeResult<T> {
        self.events
            .on_event(&EpisodeEvent::ShortCircuit { kind, rows });
        EpisodeResult {
            value,
            stats: EpisodeStats::new(stats::generate_trace_id()),
        }
    }

    /// Build the per-group context. Configuration problems surface here,
    /// before any provider call.
    fn episode<'e>(
        &'e self,
        kind: PromptKind,
        user_query: &'e str,
        row_count: usize,
    ) -> Result<Episode<'e>> {
        self.config.validate()?;
        let details = self.model.details();
        let tokenizer: &'e dyn Tokenizer = match self.tokenizer {
            Some(tokenizer) => tokenizer,
            None => &self.default_tokenizer,
        };
        let context_window = self.config.context_window.unwrap_or(details.context_window);
        let planner = BudgetPlanner::new(
            self.config.policy,
            kind,
            user_query,
            context_window,
            tokenizer,
            self.template,
            self.config.tuple_format,
        )?;
        let budget = BudgetState::new(starting_cap(
            self.config.batch_size,
            details.batch_size,
            row_count,
        ))?;

        let mut stats = EpisodeStats::new(stats::generate_trace_id());
        stats.initial_cap = budget.cap();
        stats.final_cap = budget.cap();
        self.events.on_event(&EpisodeEvent::EpisodeStarted {
            trace_id: &stats.trace_id,
            kind,
            rows: row_count,
            cap: budget.cap(),
        });

        Ok(Episode {
            model: self.model,
            template: self.template,
            planner,
            events: self.events,
            cancel: self.cancel.clone(),
            kind,
            user_query,
            format: self.config.tuple_format,
            max_in_flight: self.config.max_in_flight,
            budget,
            stats,
            pricing: pricing_for_model(&details.name),
            started: Instant::now(),
        })
    }
}
