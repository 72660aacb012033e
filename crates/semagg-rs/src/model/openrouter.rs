//! [`Model`] adapter for the OpenRouter chat completions API.
//!
//! Each request is sent as one user message with a `json_schema` response
//! format for the `{"items": [...]}` envelope. Provider outcomes map onto the
//! engine's error taxonomy:
//!
//! | Provider outcome | Error |
//! |------------------|-------|
//! | `finish_reason = "length"` | [`EngineError::OutputTruncated`] |
//! | refusal text, `content_filter`, other non-`stop` finish | [`EngineError::ProviderRefusal`] |
//! | empty, non-JSON, or schema-invalid content | [`EngineError::ProviderProtocol`] |
//! | HTTP / network failure (after transport retries) | [`EngineError::Transport`] |

use super::retry::{RetryConfig, retry_transport};
use super::{
    CompletionFuture, CompletionItems, CompletionRequest, Model, ModelDetails, TokenUsage,
    envelope_schema, parse_envelope,
};
use crate::error::{EngineError, Result};
use crate::{ChatCompletion, ChatRequest, Message, OpenRouterClient, ResponseFormat, UsageInfo};
use tracing::debug;

/// OpenRouter-backed model.
pub struct OpenRouterModel {
    client: OpenRouterClient,
    details: ModelDetails,
    retry: RetryConfig,
    seed: Option<u64>,
}

impl OpenRouterModel {
    pub fn new(client: OpenRouterClient, details: ModelDetails) -> Self {
        Self {
            client,
            details,
            retry: RetryConfig::default(),
            seed: None,
        }
    }

    /// Retry transient transport failures with backoff.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Fixed sampling seed, for providers that honor one.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn build_request(&self, request: &CompletionRequest) -> ChatRequest {
        ChatRequest {
            model: Some(self.details.name.clone()),
            messages: vec![Message::user(request.prompt.as_str())],
            max_tokens: self.details.max_output_tokens,
            temperature: self.details.temperature,
            seed: self.seed,
            response_format: Some(ResponseFormat::json_schema(
                "items",
                envelope_schema(request.output_type),
            )),
        }
    }
}

impl Model for OpenRouterModel {
    fn details(&self) -> &ModelDetails {
        &self.details
    }

    fn complete(&self, request: CompletionRequest) -> CompletionFuture<'_> {
        Box::pin(async move {
            let body = self.build_request(&request);
            let completion = retry_transport(&self.retry, || self.client.chat(&body))
                .await
                .map_err(EngineError::Transport)?;
            interpret(completion, &request)
        })
    }
}

/// Map a chat completion onto the engine's outcome types.
pub(crate) fn interpret(
    completion: ChatCompletion,
    request: &CompletionRequest,
) -> Result<CompletionItems> {
    let finish = completion.finish_reason.as_deref();
    if finish == Some("length") {
        return Err(EngineError::OutputTruncated);
    }
    if let Some(refusal) = completion.refusal {
        return Err(EngineError::ProviderRefusal(refusal));
    }
    match finish {
        None | Some("stop") => {}
        Some("content_filter") => {
            return Err(EngineError::ProviderRefusal(
                "response blocked by the provider's content filter".into(),
            ));
        }
        Some(other) => {
            return Err(EngineError::ProviderRefusal(format!(
                "unexpected finish reason '{other}'"
            )));
        }
    }

    let content = completion
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| EngineError::protocol("response has no content"))?;
    let mut items = parse_envelope(&content, request.output_type)?;
    debug!(
        "Parsed {} item(s) (expected {})",
        items.items.len(),
        request.expected_items
    );
    items.usage = completion.usage.map(token_usage);
    Ok(items)
}

fn token_usage(usage: UsageInfo) -> TokenUsage {
    TokenUsage {
        prompt_tokens: usage.prompt_tokens.unwrap_or(0),
        completion_tokens: usage.completion_tokens.unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OutputType;
    use serde_json::Value;

    fn request(output_type: OutputType) -> CompletionRequest {
        CompletionRequest {
            prompt: "p".into(),
            expected_items: 1,
            output_type,
        }
    }

    fn completion(content: Option<&str>, finish: Option<&str>) -> ChatCompletion {
        ChatCompletion {
            content: content.map(String::from),
            finish_reason: finish.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn length_finish_is_truncation() {
        let out = interpret(
            completion(Some(r#"{"items": ["par"#), Some("length")),
            &request(OutputType::String),
        );
        assert!(matches!(out, Err(EngineError::OutputTruncated)));
    }

    #[test]
    fn refusal_text_is_refusal() {
        let mut c = completion(None, Some("stop"));
        c.refusal = Some("I can't help with that".into());
        let out = interpret(c, &request(OutputType::String));
        assert!(matches!(out, Err(EngineError::ProviderRefusal(msg)) if msg.contains("can't help")));
    }

    #[test]
    fn content_filter_and_unknown_finish_are_refusals() {
        for finish in ["content_filter", "tool_calls", "error"] {
            let out = interpret(
                completion(Some(r#"{"items": ["x"]}"#), Some(finish)),
                &request(OutputType::String),
            );
            assert!(matches!(out, Err(EngineError::ProviderRefusal(_))), "{finish}");
        }
    }

    #[test]
    fn empty_content_is_protocol_error() {
        let out = interpret(completion(Some("  "), Some("stop")), &request(OutputType::String));
        assert!(matches!(out, Err(EngineError::ProviderProtocol(_))));
    }

    #[test]
    fn valid_envelope_carries_usage() {
        let mut c = completion(Some(r#"{"items": [1]}"#), Some("stop"));
        c.usage = Some(UsageInfo {
            prompt_tokens: Some(120),
            completion_tokens: Some(3),
            total_tokens: Some(123),
        });
        let items = interpret(c, &request(OutputType::Integer)).unwrap();
        assert_eq!(items.items, vec![Value::from(1)]);
        assert_eq!(
            items.usage,
            Some(TokenUsage {
                prompt_tokens: 120,
                completion_tokens: 3
            })
        );
    }

    #[test]
    fn request_body_carries_schema_and_model_settings() {
        let client = OpenRouterClient::new("key").unwrap();
        let model = OpenRouterModel::new(
            client,
            ModelDetails::new("openai/gpt-4o-mini")
                .with_max_output_tokens(512)
                .with_temperature(0.2),
        )
        .with_seed(7);
        let body = model.build_request(&request(OutputType::Integer));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "openai/gpt-4o-mini");
        assert_eq!(json["max_tokens"], 512);
        assert_eq!(json["seed"], 7);
        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
        assert_eq!(json["response_format"]["type"], "json_schema");
        assert_eq!(
            json["response_format"]["json_schema"]["schema"]["properties"]["items"]["type"],
            "array"
        );
    }
}
