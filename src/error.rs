//! Error taxonomy for the RLM engine.
//!
//! Two error families matter to callers:
//!
//! - **Control flow**: [`RlmError::BudgetExceeded`] and
//!   [`RlmError::RecursionDepthExceeded`] terminate the current program
//!   execution. They are never swallowed and never reduced to sentinel
//!   strings.
//! - **Catchable**: [`RlmError::InvalidStructuredOutput`] and
//!   [`RlmError::LowConfidence`] are raised by the structured-output layer
//!   and may be handled by user programs.
//!
//! Model invocation failures are *not* errors at this level — the invoker
//! reduces them to in-band sentinel strings (see [`crate::invoker`]).

use thiserror::Error;

/// Errors surfaced by the RLM core.
#[derive(Debug, Error)]
pub enum RlmError {
    /// The cumulative cost or call count reached its configured ceiling.
    #[error("BudgetExceeded: {0}")]
    BudgetExceeded(String),

    /// A model invocation was attempted at the maximum recursion depth.
    #[error("RecursionDepthExceeded: {0}")]
    RecursionDepthExceeded(String),

    /// `invoke_json` exhausted its retries without producing valid output.
    #[error("InvalidStructuredOutput: {reason}")]
    InvalidStructuredOutput {
        reason: String,
        /// The last raw model reply, kept so callers can inspect it.
        last_response: String,
    },

    /// `invoke_with_confidence` parsed a confidence below the threshold.
    #[error("LowConfidence: {confidence:.2} below threshold {threshold:.2}")]
    LowConfidence {
        confidence: f64,
        threshold: f64,
        reasoning: String,
    },

    /// Missing credential, invalid flag combination, or bad configuration.
    #[error("ConfigurationError: {0}")]
    Configuration(String),

    /// The mail source failed to produce records.
    #[error("MailSourceError: {0}")]
    MailSource(String),

    /// Persistence failure outside the silently-recovered cache/checkpoint
    /// corruption paths (e.g. the checkpoint directory is not writable).
    #[error("StorageError: {0}")]
    Storage(String),
}

impl RlmError {
    /// Stable classification name, used in session stats and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            RlmError::BudgetExceeded(_) => "BudgetExceeded",
            RlmError::RecursionDepthExceeded(_) => "RecursionDepthExceeded",
            RlmError::InvalidStructuredOutput { .. } => "InvalidStructuredOutput",
            RlmError::LowConfidence { .. } => "LowConfidence",
            RlmError::Configuration(_) => "ConfigurationError",
            RlmError::MailSource(_) => "MailSourceError",
            RlmError::Storage(_) => "StorageError",
        }
    }

    /// True for the two control-flow errors that abort a program execution.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RlmError::BudgetExceeded(_) | RlmError::RecursionDepthExceeded(_)
        )
    }
}
