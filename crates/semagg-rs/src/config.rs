//! Configuration for the aggregate [`Engine`](crate::engine::Engine).
//!
//! Every field has a default, so a config file only needs to name what it
//! changes:
//!
//! ```json
//! {
//!   "engine": { "batch_size": 16, "policy": "token-budget", "tuple_format": "markdown" },
//!   "model": { "name": "openai/gpt-4o-mini", "context_window": 128000 },
//!   "retries": 3
//! }
//! ```
//!
//! CLI flags are layered on top of the file with the `with_*` builders.

use crate::budget::{BudgetPolicy, DEFAULT_CHARS_PER_TOKEN};
use crate::error::{EngineError, Result};
use crate::model::ModelDetails;
use crate::prompt::TupleFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of provider requests a round keeps in flight.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// Knobs for planning and executing aggregate episodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rows per batch. Overrides the model's batch size when set.
    pub batch_size: Option<usize>,
    /// Context window in tokens. Overrides the model's window when set.
    pub context_window: Option<usize>,
    pub policy: BudgetPolicy,
    pub tuple_format: TupleFormat,
    /// Concurrent requests per round (0 = unbounded).
    pub max_in_flight: usize,
    /// Groups finalized concurrently by `finalize_groups`.
    pub max_groups_in_flight: usize,
    /// Chars-per-token ratio for the default tokenizer.
    pub chars_per_token: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            context_window: None,
            policy: BudgetPolicy::default(),
            tuple_format: TupleFormat::default(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_groups_in_flight: 1,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = Some(tokens);
        self
    }

    pub fn with_policy(mut self, policy: BudgetPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_tuple_format(mut self, format: TupleFormat) -> Self {
        self.tuple_format = format;
        self
    }

    pub fn with_max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = limit;
        self
    }

    pub fn with_max_groups_in_flight(mut self, limit: usize) -> Self {
        self.max_groups_in_flight = limit;
        self
    }

    pub fn with_chars_per_token(mut self, ratio: f64) -> Self {
        self.chars_per_token = ratio;
        self
    }

    /// Reject values that can never produce a valid batch.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == Some(0) {
            return Err(EngineError::config("batch_size must be positive"));
        }
        if self.context_window == Some(0) {
            return Err(EngineError::config("context_window must be positive"));
        }
        if self.chars_per_token.is_nan() || self.chars_per_token <= 0.0 {
            return Err(EngineError::config(format!(
                "chars_per_token must be positive, got {}",
                self.chars_per_token
            )));
        }
        Ok(())
    }
}

/// On-disk configuration: engine knobs plus the model to call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SemaggConfig {
    pub engine: EngineConfig,
    pub model: ModelDetails,
    /// Transport-level retries for transient HTTP failures.
    pub retries: u32,
}

impl SemaggConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::config(format!("failed to read config '{}': {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            EngineError::config(format!("failed to parse config '{}': {e}", path.display()))
        })?;
        config.engine.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
        assert_eq!(config.policy, BudgetPolicy::Cardinality);
        assert_eq!(config.tuple_format, TupleFormat::Xml);
    }

    #[test]
    fn builders_set_fields() {
        let config = EngineConfig::new()
            .with_batch_size(4)
            .with_context_window(8000)
            .with_policy(BudgetPolicy::TokenBudget)
            .with_tuple_format(TupleFormat::Json)
            .with_max_in_flight(0);
        assert_eq!(config.batch_size, Some(4));
        assert_eq!(config.context_window, Some(8000));
        assert_eq!(config.policy, BudgetPolicy::TokenBudget);
        assert_eq!(config.tuple_format, TupleFormat::Json);
        assert_eq!(config.max_in_flight, 0);
    }

    #[test]
    fn zero_batch_size_rejected() {
        let err = EngineConfig::new().with_batch_size(0).validate().unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn non_positive_ratio_rejected() {
        assert!(EngineConfig::new().with_chars_per_token(0.0).validate().is_err());
        assert!(EngineConfig::new().with_chars_per_token(f64::NAN).validate().is_err());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"engine": {{"batch_size": 16, "policy": "token-budget"}}, "model": {{"name": "m"}}, "retries": 2}}"#
        )
        .unwrap();

        let config = SemaggConfig::load(file.path()).unwrap();
        assert_eq!(config.engine.batch_size, Some(16));
        assert_eq!(config.engine.policy, BudgetPolicy::TokenBudget);
        assert_eq!(config.engine.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
        assert_eq!(config.model.name, "m");
        assert_eq!(config.retries, 2);
    }

    #[test]
    fn invalid_file_is_configuration_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"engine": {{"batch_size": 0}}}}"#).unwrap();
        assert!(matches!(
            SemaggConfig::load(file.path()),
            Err(EngineError::Configuration(_))
        ));

        assert!(matches!(
            SemaggConfig::load("/nonexistent/semagg.json"),
            Err(EngineError::Configuration(_))
        ));
    }
}
