//! Error taxonomy for semantic aggregate episodes.
//!
//! Only [`EngineError::OutputTruncated`] is recovered inside the engine (by
//! shrinking the batch cap and retrying). Every other variant propagates out
//! of the group's finalize call and fails that group's result.

/// Errors raised while planning, executing, or interpreting provider calls.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid configuration detected before any provider call was issued.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The overflow shrink sequence reached zero, or the cap became too small
    /// for the episode to make progress.
    #[error("budget exhausted after {retries} overflow retries (cap {cap}): {reason}")]
    BudgetExhausted {
        cap: usize,
        retries: u32,
        reason: String,
    },

    /// The provider stopped generating because it hit its output length limit.
    #[error("provider output truncated at the max output token limit")]
    OutputTruncated,

    /// The provider answered, but the answer is malformed or violates the
    /// request contract (missing items, bad indices, schema mismatch).
    #[error("provider protocol error: {0}")]
    ProviderProtocol(String),

    /// The provider refused the request or finished with a non-success signal.
    #[error("provider refused the request: {0}")]
    ProviderRefusal(String),

    /// Connection or HTTP failure reported by the transport collaborator.
    #[error("transport error: {0}")]
    Transport(String),

    /// The driving query cancelled the episode; no partial round was committed.
    #[error("episode cancelled")]
    Cancelled,
}

impl EngineError {
    /// Whether the engine recovers from this error by shrinking and retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::OutputTruncated)
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        EngineError::ProviderProtocol(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }
}

/// Crate-wide result alias.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;
