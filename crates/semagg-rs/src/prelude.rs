//! Convenience re-exports for common `semagg-rs` types.
//!
//! ```ignore
//! use semagg_rs::prelude::*;
//! ```
//!
//! Covers the engine, its collaborators, and the aggregate surface. Planner
//! internals and the raw OpenRouter wire types are left in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::row::{Row, RowFields};
pub use crate::{EngineError, OpenRouterClient, Result};

// ── Engine ──────────────────────────────────────────────────────────
pub use crate::config::{EngineConfig, SemaggConfig};
pub use crate::engine::{
    CancelHandle, CancelSignal, CompositeEventHandler, Engine, EpisodeEvent, EpisodeResult,
    EpisodeStats, EventHandler, FnEventHandler, LoggingHandler, NoopHandler, cancel_pair,
};

// ── Aggregates ──────────────────────────────────────────────────────
pub use crate::aggregate::{AggregateKind, AggregateOutput, AggregateState};

// ── Collaborators ───────────────────────────────────────────────────
pub use crate::budget::{BudgetPolicy, CharRatioTokenizer, Tokenizer};
pub use crate::model::openrouter::OpenRouterModel;
pub use crate::model::retry::RetryConfig;
pub use crate::model::{
    CompletionFuture, CompletionItems, CompletionRequest, Model, ModelDetails, OutputType,
};
pub use crate::prompt::{DefaultTemplates, PromptKind, PromptTemplate, Selection, TupleFormat};
