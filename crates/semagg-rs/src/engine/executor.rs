//! Overflow-adaptive batch execution.
//!
//! An [`Episode`] is the per-group context object: it owns the
//! [`BudgetState`], the statistics, and references to the collaborators, and
//! is passed by `&mut` through the reducers. Nothing here is shared between
//! groups.
//!
//! Round contract: every batch of a round is submitted to one
//! [`RequestQueue`] and awaited together. Batches that come back truncated
//! shrink the cap once per wave (sized by the largest truncated batch) and
//! are re-planned from their own first row. The round's results are handed
//! back only after every batch has succeeded, so a failing or cancelled round
//! never leaks partial output.

use super::events::{EpisodeEvent, EventHandler};
use super::stats::{EpisodeStats, ModelPricing, generate_span_id};
use crate::budget::{BudgetPlanner, BudgetState};
use crate::error::{EngineError, Result};
use crate::model::{CompletionItems, Model, OutputType, RequestQueue, TokenUsage};
use crate::prompt::{PromptKind, PromptTemplate, TupleFormat};
use crate::row::{Row, RowArena, RowId};
use std::ops::Range;
use std::time::Instant;
use tokio::sync::watch;
use tracing::debug;

// ── Cancellation ───────────────────────────────────────────────────

/// Receiving side of a cancellation flag. Cheap to clone; every episode
/// holds its own clone.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag is set. If the handle is dropped without
    /// cancelling, this never resolves.
    pub async fn cancelled(&mut self) {
        let outcome = self.rx.wait_for(|cancelled| *cancelled).await.map(|_| ());
        if outcome.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sending side of a cancellation flag, held by the driving query.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Abandon every episode observing this handle. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Another signal observing this handle.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Create a connected cancellation handle and signal.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

// ── Episode ────────────────────────────────────────────────────────

/// A planned rerank window: the row ids sent to the provider, in prompt
/// order, how many of them are newly read rows, and how many of the ranked
/// rows carry over as the next frontier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WindowPlan {
    pub ids: Vec<RowId>,
    pub consumed: usize,
    pub keep: usize,
}

/// Per-invocation context for one aggregate group.
pub(crate) struct Episode<'e> {
    pub(super) model: &'e dyn Model,
    pub(super) template: &'e dyn PromptTemplate,
    pub(super) planner: BudgetPlanner<'e>,
    pub(super) events: &'e dyn EventHandler,
    pub(super) cancel: Option<CancelSignal>,
    pub(super) kind: PromptKind,
    pub(super) user_query: &'e str,
    pub(super) format: TupleFormat,
    pub(super) max_in_flight: usize,
    pub(super) budget: BudgetState,
    pub(super) stats: EpisodeStats,
    pub(super) pricing: ModelPricing,
    pub(super) started: Instant,
}

impl<'e> Episode<'e> {
    pub(crate) fn budget(&self) -> &BudgetState {
        &self.budget
    }

    pub(crate) fn round(&self) -> u32 {
        self.stats.rounds
    }

    pub(crate) fn emit(&self, event: &EpisodeEvent<'_>) {
        self.events.on_event(event);
    }

    /// Run one fold round over `rows`. Returns each batch's range (into
    /// `rows`) with its response, ordered by range start.
    pub(crate) async fn run_round(
        &mut self,
        rows: &[&Row],
        output_type: OutputType,
    ) -> Result<Vec<(Range<usize>, CompletionItems)>> {
        self.stats.rounds += 1;
        let round = self.stats.rounds;
        let mut pending = self.planner.partition(rows, &self.budget)?;
        self.emit(&EpisodeEvent::RoundStarted {
            round,
            rows: rows.len(),
            batches: pending.len(),
            cap: self.budget.cap(),
        });

        let mut done = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let batches = std::mem::take(&mut pending);
            let outcomes = self.dispatch(round, rows, &batches, output_type).await?;

            let mut truncated = Vec::new();
            for (range, outcome) in batches.into_iter().zip(outcomes) {
                match outcome {
                    Ok(items) => done.push((range, items)),
                    Err(EngineError::OutputTruncated) => truncated.push(range),
                    Err(e) => return Err(e),
                }
            }

            if let Some(largest) = truncated.iter().map(|r| r.len()).max() {
                self.overflow(round, largest)?;
                for span in truncated {
                    for sub in self.planner.partition(&rows[span.clone()], &self.budget)? {
                        pending.push(span.start + sub.start..span.start + sub.end);
                    }
                }
            }
        }

        done.sort_by_key(|(range, _)| range.start);
        self.emit(&EpisodeEvent::RoundFinished {
            round,
            inputs: rows.len(),
            outputs: done.len(),
        });
        Ok(done)
    }

    /// Run one rerank window. `plan` is called with the current planner and
    /// cap, and again after every shrink, so the window is rebuilt from the
    /// same unread offset.
    pub(crate) async fn run_window<P>(
        &mut self,
        arena: &RowArena,
        mut plan: P,
    ) -> Result<(WindowPlan, CompletionItems)>
    where
        P: FnMut(&BudgetPlanner<'e>, &BudgetState) -> Result<WindowPlan>,
    {
        self.stats.rounds += 1;
        let round = self.stats.rounds;
        loop {
            let window = plan(&self.planner, &self.budget)?;
            let rows = arena.resolve(&window.ids);
            self.emit(&EpisodeEvent::RoundStarted {
                round,
                rows: rows.len(),
                batches: 1,
                cap: self.budget.cap(),
            });

            let mut outcomes = self
                .dispatch(round, &rows, &[0..rows.len()], OutputType::Integer)
                .await?;
            match outcomes.pop() {
                Some(Ok(items)) => return Ok((window, items)),
                Some(Err(EngineError::OutputTruncated)) => self.overflow(round, rows.len())?,
                Some(Err(e)) => return Err(e),
                None => return Err(EngineError::protocol("window request produced no response")),
            }
        }
    }

    /// Submit one request per batch and wait for all of them, or for
    /// cancellation.
    async fn dispatch(
        &mut self,
        round: u32,
        rows: &[&Row],
        batches: &[Range<usize>],
        output_type: OutputType,
    ) -> Result<Vec<Result<CompletionItems>>> {
        if self.cancel.as_ref().is_some_and(CancelSignal::is_cancelled) {
            return Err(EngineError::Cancelled);
        }

        let span_id = generate_span_id(&self.stats.trace_id, round);
        let mut queue = RequestQueue::new(self.model, self.max_in_flight);
        for range in batches {
            let batch = &rows[range.clone()];
            let prompt = self
                .template
                .render(self.kind, batch, self.user_query, self.format);
            debug!(
                "[{span_id}] batch {range:?}: {} row(s), {} prompt chars",
                batch.len(),
                prompt.len()
            );
            queue.submit(prompt, self.expected_items(batch.len()), output_type);
        }
        self.stats.api_calls += batches.len() as u32;

        let started = Instant::now();
        let outcomes = match self.cancel.as_mut() {
            Some(cancel) => tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("[{span_id}] cancelled with {} request(s) in flight", batches.len());
                    return Err(EngineError::Cancelled);
                }
                outcomes = queue.collect_all() => outcomes,
            },
            None => queue.collect_all().await,
        };
        self.stats.api_time += started.elapsed();

        for usage in outcomes.iter().flatten().filter_map(|items| items.usage) {
            self.record_usage(usage);
        }
        Ok(outcomes)
    }

    fn expected_items(&self, batch_len: usize) -> usize {
        match self.kind {
            PromptKind::Rerank => batch_len,
            PromptKind::Reduce | PromptKind::Select(_) => 1,
        }
    }

    fn record_usage(&mut self, usage: TokenUsage) {
        self.stats.cost.record(usage, &self.pricing);
        self.emit(&EpisodeEvent::TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        });
    }

    /// Shrink after a truncated batch of `attempted` rows.
    fn overflow(&mut self, round: u32, attempted: usize) -> Result<()> {
        self.stats.overflow_retries += 1;
        let new_cap = self.budget.shrink(attempted)?;
        self.emit(&EpisodeEvent::Overflow {
            round,
            attempted,
            new_cap,
            retries: self.budget.retries(),
        });
        Ok(())
    }

    /// Close the episode and return its statistics.
    pub(crate) fn finish(mut self) -> EpisodeStats {
        self.stats.final_cap = self.budget.cap();
        self.stats.exec_time = self.started.elapsed();
        self.emit(&EpisodeEvent::EpisodeFinished { stats: &self.stats });
        self.stats
    }
}
