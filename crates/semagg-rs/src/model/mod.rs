//! The model collaborator: what the engine needs from an LLM provider.
//!
//! A [`Model`] answers one [`CompletionRequest`] with a [`CompletionItems`]
//! envelope (`{"items": [...]}`), or fails with a typed
//! [`EngineError`](crate::EngineError). The only failure the engine recovers
//! from is [`OutputTruncated`](crate::EngineError::OutputTruncated).
//!
//! [`RequestQueue`] layers the submit/collect contract on top: requests are
//! enqueued, then run concurrently and collected in submission order.

pub mod openrouter;
pub mod retry;

use crate::error::{EngineError, Result};
use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

/// Default model for provider calls.
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

/// Boxed future returned by [`Model::complete`].
pub type CompletionFuture<'a> = Pin<Box<dyn Future<Output = Result<CompletionItems>> + Send + 'a>>;

// ── Request / response types ───────────────────────────────────────

/// JSON type of each item in a response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    String,
    Integer,
    Object,
    Boolean,
}

/// One prompt for the provider.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Number of items the caller expects back.
    pub expected_items: usize,
    pub output_type: OutputType,
}

/// Token counts reported for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// The `{"items": [...]}` response envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionItems {
    pub items: Vec<Value>,
    #[serde(skip)]
    pub usage: Option<TokenUsage>,
}

impl CompletionItems {
    pub fn new(items: Vec<Value>) -> Self {
        Self { items, usage: None }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Static facts about a model that batch planning depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDetails {
    pub name: String,
    /// Context window in tokens.
    pub context_window: usize,
    /// Preferred rows per batch, if the model has one.
    pub batch_size: Option<usize>,
    /// Per-response output token limit.
    pub max_output_tokens: u32,
    pub temperature: f32,
}

impl Default for ModelDetails {
    fn default() -> Self {
        Self {
            name: DEFAULT_MODEL.to_string(),
            context_window: 128_000,
            batch_size: None,
            max_output_tokens: 4096,
            temperature: 0.0,
        }
    }
}

impl ModelDetails {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

// ── Model trait ────────────────────────────────────────────────────

/// An LLM provider the engine can call.
///
/// # Example
///
/// ```ignore
/// struct Echo(ModelDetails);
///
/// impl Model for Echo {
///     fn details(&self) -> &ModelDetails {
///         &self.0
///     }
///
///     fn complete(&self, request: CompletionRequest) -> CompletionFuture<'_> {
///         Box::pin(async move {
///             Ok(CompletionItems::new(vec![request.prompt.len().into()]))
///         })
///     }
/// }
/// ```
pub trait Model: Send + Sync {
    fn details(&self) -> &ModelDetails;

    /// Run one completion. A response cut off by the output token limit must
    /// fail with [`EngineError::OutputTruncated`].
    fn complete(&self, request: CompletionRequest) -> CompletionFuture<'_>;
}

// ── Request queue ──────────────────────────────────────────────────

/// Position of a submitted request in its queue's results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHandle(usize);

impl RequestHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Submit-then-collect batching of completion requests.
pub struct RequestQueue<'m> {
    model: &'m dyn Model,
    max_in_flight: usize,
    pending: Vec<CompletionRequest>,
}

impl<'m> RequestQueue<'m> {
    /// `max_in_flight` bounds concurrent requests (0 = unbounded).
    pub fn new(model: &'m dyn Model, max_in_flight: usize) -> Self {
        Self {
            model,
            max_in_flight,
            pending: Vec::new(),
        }
    }

    /// Enqueue a request. Nothing is sent until [`collect_all`](Self::collect_all).
    pub fn submit(
        &mut self,
        prompt: String,
        expected_items: usize,
        output_type: OutputType,
    ) -> RequestHandle {
        self.pending.push(CompletionRequest {
            prompt,
            expected_items,
            output_type,
        });
        RequestHandle(self.pending.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Run every queued request and return one outcome per request, in
    /// submission order. Drains the queue.
    pub async fn collect_all(&mut self) -> Vec<Result<CompletionItems>> {
        let requests = std::mem::take(&mut self.pending);
        let limit = match self.max_in_flight {
            0 => requests.len().max(1),
            n => n,
        };
        let model = self.model;
        futures::stream::iter(requests.into_iter().map(|r| model.complete(r)))
            .buffered(limit)
            .collect()
            .await
    }
}

// ── Envelope schemas ───────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
#[allow(dead_code)]
struct StringItems {
    items: Vec<String>,
}

#[derive(Deserialize, JsonSchema)]
#[allow(dead_code)]
struct IntegerItems {
    items: Vec<i64>,
}

#[derive(Deserialize, JsonSchema)]
#[allow(dead_code)]
struct ObjectItems {
    items: Vec<serde_json::Map<String, Value>>,
}

#[derive(Deserialize, JsonSchema)]
#[allow(dead_code)]
struct BooleanItems {
    items: Vec<bool>,
}

/// JSON Schema of the response envelope for `output_type`.
pub fn envelope_schema(output_type: OutputType) -> Value {
    match output_type {
        OutputType::String => crate::json_schema_for::<StringItems>(),
        OutputType::Integer => crate::json_schema_for::<IntegerItems>(),
        OutputType::Object => crate::json_schema_for::<ObjectItems>(),
        OutputType::Boolean => crate::json_schema_for::<BooleanItems>(),
    }
}

/// Parse provider text into an envelope, checking it against the schema.
pub fn parse_envelope(content: &str, output_type: OutputType) -> Result<CompletionItems> {
    let value: Value = serde_json::from_str(content.trim())
        .map_err(|e| EngineError::protocol(format!("response is not valid JSON: {e}")))?;

    let schema = envelope_schema(output_type);
    let validator = jsonschema::validator_for(&schema)
        .map_err(|e| EngineError::protocol(format!("invalid envelope schema: {e}")))?;
    let errors: Vec<String> = validator
        .iter_errors(&value)
        .map(|e| format!("{}: {e}", e.instance_path()))
        .collect();
    if !errors.is_empty() {
        return Err(EngineError::protocol(format!(
            "response does not match the items envelope: {}",
            errors.join("; ")
        )));
    }

    serde_json::from_value(value)
        .map_err(|e| EngineError::protocol(format!("malformed items envelope: {e}")))
}
