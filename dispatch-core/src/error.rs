//! Error types for dispatch-core.

use thiserror::Error;

/// Result type alias using dispatch-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during dispatch, orchestration, and memory operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Token economy refused a check or deduction; balance would go negative.
    #[error("low battery: requested {requested_usd:.4} usd, balance {balance_usd:.4} usd")]
    LowBattery {
        requested_usd: f64,
        balance_usd: f64,
    },

    /// FOLLOWER mode requested but no trace met the confidence bar.
    #[error("no trace available for goal signature {signature}")]
    NoTrace { signature: String },

    /// Orchestrator could not parse a plan out of the planning call's response.
    #[error("failed to parse plan: {message}")]
    PlanParseFail { message: String },

    /// A single orchestration step failed.
    #[error("step {step} failed: {message}")]
    StepFail { step: u32, message: String },

    /// The run was cancelled before completion.
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    /// The cognitive backend (LLM client) returned an error.
    #[error("adapter error: {message}")]
    AdapterError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A trace file on disk could not be parsed.
    #[error("corrupt trace at {path}: {message}")]
    CorruptTrace { path: String, message: String },

    /// A hook vetoed a tool call or prompt.
    #[error("hook veto from {hook}: {reason}")]
    HookVeto { hook: String, reason: String },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Config parse/validation error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Agent name or spec failed validation.
    #[error("invalid agent spec: {0}")]
    InvalidAgentSpec(String),

    /// Internal invariant violation; should not happen in correct operation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn low_battery(requested_usd: f64, balance_usd: f64) -> Self {
        Self::LowBattery {
            requested_usd,
            balance_usd,
        }
    }

    pub fn no_trace(signature: impl Into<String>) -> Self {
        Self::NoTrace {
            signature: signature.into(),
        }
    }

    pub fn plan_parse_fail(message: impl Into<String>) -> Self {
        Self::PlanParseFail {
            message: message.into(),
        }
    }

    pub fn step_fail(step: u32, message: impl Into<String>) -> Self {
        Self::StepFail {
            step,
            message: message.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn adapter_error(message: impl Into<String>) -> Self {
        Self::AdapterError {
            message: message.into(),
            source: None,
        }
    }

    pub fn adapter_error_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::AdapterError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn corrupt_trace(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CorruptTrace {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn hook_veto(hook: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HookVeto {
            hook: hook.into(),
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn invalid_agent_spec(message: impl Into<String>) -> Self {
        Self::InvalidAgentSpec(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether this error is the budget-exhaustion kind, distinct from other
    /// failure modes because it must never be retried automatically.
    pub fn is_low_battery(&self) -> bool {
        matches!(self, Self::LowBattery { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_battery_message_includes_amounts() {
        let err = Error::low_battery(0.5, 0.1);
        assert!(err.to_string().contains("0.5000"));
        assert!(err.is_low_battery());
    }

    #[test]
    fn other_kinds_are_not_low_battery() {
        assert!(!Error::no_trace("abc123").is_low_battery());
        assert!(!Error::internal("oops").is_low_battery());
    }
}
