//! Episode events and handlers.
//!
//! The engine reports what it decided (batch plans, overflow shrinks, window
//! survivors) through [`EpisodeEvent`]s. Handlers are observers only; the
//! engine never waits on them.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use super::stats::EpisodeStats;
use crate::prompt::PromptKind;
use tracing::{debug, info, warn};

/// Events emitted during one episode.
#[derive(Debug)]
pub enum EpisodeEvent<'a> {
    /// An episode is starting for one aggregate group.
    EpisodeStarted {
        trace_id: &'a str,
        kind: PromptKind,
        rows: usize,
        cap: usize,
    },
    /// The group was answered without a provider call.
    ShortCircuit { kind: PromptKind, rows: usize },
    /// A round (or rerank window) is about to be dispatched.
    RoundStarted {
        round: u32,
        rows: usize,
        batches: usize,
        cap: usize,
    },
    /// A batch came back truncated and the cap shrank.
    Overflow {
        round: u32,
        attempted: usize,
        new_cap: usize,
        retries: u32,
    },
    /// Token usage reported for one provider call.
    TokenUsage {
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    /// A rerank window was ranked and its top half kept.
    WindowRanked {
        round: u32,
        window: usize,
        kept: usize,
        remaining: usize,
    },
    /// A round committed its outputs.
    RoundFinished {
        round: u32,
        inputs: usize,
        outputs: usize,
    },
    /// The episode completed successfully.
    EpisodeFinished { stats: &'a EpisodeStats },
}

/// Observer for episode events.
///
/// # Example
///
/// ```ignore
/// struct OverflowCounter(AtomicU32);
///
/// impl EventHandler for OverflowCounter {
///     fn on_event(&self, event: &EpisodeEvent<'_>) {
///         if let EpisodeEvent::Overflow { .. } = event {
///             self.0.fetch_add(1, Ordering::Relaxed);
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &EpisodeEvent<'_>) {
        let _ = event;
    }
}

/// Ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
pub struct FnEventHandler<F>(F)
where
    F: Fn(&EpisodeEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&EpisodeEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&EpisodeEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &EpisodeEvent<'_>) {
        (self.0)(event)
    }
}

/// Dispatches every event to each inner handler, in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with_if(show_progress, ProgressHandler::new());
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Add `handler` only when `condition` holds, keeping the builder chain.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    /// Add a handler from an `Option`. `None` is a no-op.
    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &EpisodeEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &EpisodeEvent<'_>) {
        match event {
            EpisodeEvent::EpisodeStarted {
                trace_id,
                kind,
                rows,
                cap,
            } => {
                info!("[{trace_id}] {kind} episode over {rows} row(s), starting cap {cap}");
            }
            EpisodeEvent::ShortCircuit { kind, rows } => {
                debug!("{kind} over {rows} row(s) answered without a provider call");
            }
            EpisodeEvent::RoundStarted {
                round,
                rows,
                batches,
                cap,
            } => {
                info!("[round {round}] {rows} row(s) in {batches} batch(es), cap {cap}");
            }
            EpisodeEvent::Overflow {
                round,
                attempted,
                new_cap,
                retries,
            } => {
                warn!(
                    "[round {round}] output truncated on a {attempted}-row batch; \
                     cap now {new_cap} (overflow retry {retries})"
                );
            }
            EpisodeEvent::TokenUsage {
                prompt_tokens,
                completion_tokens,
            } => {
                debug!("Tokens: prompt={prompt_tokens}, completion={completion_tokens}");
            }
            EpisodeEvent::WindowRanked {
                round,
                window,
                kept,
                remaining,
            } => {
                debug!(
                    "[window {round}] ranked {window} row(s), kept {kept}, {remaining} unread"
                );
            }
            EpisodeEvent::RoundFinished {
                round,
                inputs,
                outputs,
            } => {
                debug!("[round {round}] {inputs} row(s) -> {outputs}");
            }
            EpisodeEvent::EpisodeFinished { stats } => {
                info!("[{}] finished: {}", stats.trace_id, stats.summary());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn composite_dispatches_to_all_handlers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let (a, b) = (hits.clone(), hits.clone());
        let handler = CompositeEventHandler::new()
            .with(FnEventHandler::new(move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            }))
            .with_if(false, NoopHandler)
            .with_opt(Some(FnEventHandler::new(move |_| {
                b.fetch_add(10, Ordering::SeqCst);
            })))
            .with(LoggingHandler);

        handler.on_event(&EpisodeEvent::ShortCircuit {
            kind: PromptKind::Reduce,
            rows: 1,
        });
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn fn_handler_sees_event_fields() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let handler = FnEventHandler::new(move |event| {
            if let EpisodeEvent::Overflow { new_cap, .. } = event {
                s.store(*new_cap, Ordering::SeqCst);
            }
        });
        handler.on_event(&EpisodeEvent::Overflow {
            round: 1,
            attempted: 10,
            new_cap: 9,
            retries: 1,
        });
        assert_eq!(seen.load(Ordering::SeqCst), 9);
    }
}
