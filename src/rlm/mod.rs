//! Recursive Language Model (RLM) processing
//!
//! Handles large contexts that exceed model context windows by:
//! 1. Loading context into a sandboxed script environment as a variable
//! 2. Having the LLM write code to analyze it
//! 3. Supporting recursive sub-LM calls for semantic analysis
//!
//! Based on "Recursive Language Models" (Zhang et al. 2025)

pub mod chunker;
pub mod error;
pub mod executor;
pub mod parser;
pub mod prompt;
pub mod sandbox;
pub mod trace;

pub use chunker::ContentType;
pub use error::{ExecutionFailure, Result, RlmError};
pub use executor::{ExecuteOptions, Executor, StepCallback};
pub use parser::{ParsedOutput, TerminationKind, TerminationSignal, parse};
pub use sandbox::{
    FnHandler, ParallelQueryHandler, RecursiveQueryHandler, Sandbox, SandboxErrorKind,
    SandboxOptions, SandboxResult, SubQueryOutcome, SubQueryRequest, handler_fn,
};
pub use trace::{
    CostMeter, ExecutionResult, ExecutionStatus, TraceEntry, TraceKind, UsageSummary, count_kind,
};

pub use crate::config::RlmConfig;
