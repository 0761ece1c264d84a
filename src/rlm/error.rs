//! RLM error taxonomy

use super::trace::{TraceEntry, UsageSummary};

pub type Result<T> = std::result::Result<T, RlmError>;

#[derive(thiserror::Error, Debug)]
pub enum RlmError {
    #[error("sandbox execution timed out after {timeout_ms}ms")]
    SandboxTimeout { timeout_ms: u64 },

    #[error("sandbox runtime error: {0}")]
    SandboxRuntime(String),

    #[error("sandbox has been disposed")]
    SandboxDisposed,

    #[error("call cancelled: sandbox run aborted")]
    Cancelled,

    #[error("MaxIterationsExceeded: no final answer after {max_iterations} iterations")]
    MaxIterationsExceeded { max_iterations: usize },

    #[error("MaxDepthExceeded: sub-query at depth {depth} exceeds max depth {max_depth}")]
    MaxDepthExceeded { depth: usize, max_depth: usize },

    #[error("model response contained neither code nor a final answer")]
    ParseAmbiguity,

    #[error("variable '{0}' is not defined in the sandbox")]
    UndefinedVariable(String),

    #[error("model client error: {0:#}")]
    ModelClient(anyhow::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl RlmError {
    /// Errors folded back into the conversation instead of ending the run
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SandboxRuntime(_)
                | Self::SandboxTimeout { .. }
                | Self::ParseAmbiguity
                | Self::UndefinedVariable(_)
                | Self::MaxDepthExceeded { .. }
        )
    }
}

/// A failed invocation, carrying everything recorded before the failure
#[derive(thiserror::Error, Debug)]
#[error("{error}")]
pub struct ExecutionFailure {
    #[source]
    pub error: RlmError,
    pub trace: Vec<TraceEntry>,
    pub usage: UsageSummary,
    pub iterations: usize,
    pub elapsed_ms: u64,
}
