//! RLM control loop
//!
//! Drives the model through explore/execute turns until it produces a final
//! answer or a limit is hit. Sub-queries issued from sandboxed code re-enter
//! the loop one level deeper with their own sandbox, sharing the cost meter
//! and step callback of the root invocation.

use async_trait::async_trait;
use futures::future::{BoxFuture, join_all};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{ExecutionFailure, RlmError};
use super::parser::{self, TerminationKind, TerminationSignal};
use super::prompt::{self, ContextSummary};
use super::sandbox::{
    ParallelQueryHandler, RecursiveQueryHandler, Sandbox, SandboxOptions, SandboxResult,
    SubQueryOutcome, SubQueryRequest,
};
use super::trace::{
    CostMeter, ExecutionResult, ExecutionStatus, TraceEntry, TraceKind, UsageSummary,
};
use super::chunker;
use crate::config::RlmConfig;
use crate::provider::{CompletionRequest, Message, ModelClient, PricingLookup, collect_stream};

/// Called once for every trace entry, as it is recorded
pub type StepCallback = Arc<dyn Fn(&TraceEntry) + Send + Sync>;

/// Per-call limits
#[derive(Clone)]
pub struct ExecuteOptions {
    pub max_iterations: usize,
    pub max_depth: usize,
    pub cost_ceiling: Option<f64>,
    pub on_step: Option<StepCallback>,
    pub streaming: bool,
}

impl ExecuteOptions {
    pub fn from_config(config: &RlmConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            max_depth: config.max_depth,
            cost_ceiling: config.cost_ceiling,
            on_step: None,
            streaming: config.streaming,
        }
    }

    pub fn with_on_step(mut self, on_step: impl Fn(&TraceEntry) + Send + Sync + 'static) -> Self {
        self.on_step = Some(Arc::new(on_step));
        self
    }
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self::from_config(&RlmConfig::default())
    }
}

impl fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("max_iterations", &self.max_iterations)
            .field("max_depth", &self.max_depth)
            .field("cost_ceiling", &self.cost_ceiling)
            .field("on_step", &self.on_step.is_some())
            .field("streaming", &self.streaming)
            .finish()
    }
}

/// Entry point for recursive analysis
pub struct Executor {
    client: Arc<dyn ModelClient>,
    config: RlmConfig,
    pricing: Option<Arc<dyn PricingLookup>>,
}

impl Executor {
    pub fn new(client: Arc<dyn ModelClient>, config: RlmConfig) -> Self {
        Self {
            client,
            config,
            pricing: None,
        }
    }

    /// Price model calls so usage carries an estimated cost
    pub fn with_pricing(mut self, pricing: Arc<dyn PricingLookup>) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub fn config(&self) -> &RlmConfig {
        &self.config
    }

    /// Answer `query` over `context`
    ///
    /// Hitting the cost ceiling returns `Ok` with a partial status whose
    /// response is the narrative part of the last model reply. Every `Err`
    /// carries the trace recorded up to the failure.
    pub async fn execute(
        &self,
        query: &str,
        context: serde_json::Value,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult, ExecutionFailure> {
        info!(
            client = %self.client.name(),
            max_iterations = options.max_iterations,
            max_depth = options.max_depth,
            "Starting RLM execution"
        );
        let shared = Arc::new(Shared {
            client: Arc::clone(&self.client),
            config: self.config.clone(),
            pricing: self.pricing.clone(),
            meter: CostMeter::new(options.cost_ceiling),
            options,
        });
        run_invocation(shared, query.to_string(), context, 0, CancellationToken::new()).await
    }
}

/// State common to every depth of one root execution
struct Shared {
    client: Arc<dyn ModelClient>,
    config: RlmConfig,
    pricing: Option<Arc<dyn PricingLookup>>,
    meter: CostMeter,
    options: ExecuteOptions,
}

impl Shared {
    fn report(&self, entry: &TraceEntry) {
        if let Some(on_step) = &self.options.on_step {
            on_step(entry);
        }
    }

    fn model_for(&self, depth: usize) -> String {
        let model = if depth == 0 {
            self.config.root_model.as_deref()
        } else {
            self.config.subcall_model()
        };
        model.unwrap_or_default().to_string()
    }

    fn sandbox_options(&self) -> SandboxOptions {
        SandboxOptions {
            timeout_ms: self.config.sandbox_timeout_ms,
            memory_limit_mb: self.config.memory_limit_mb,
            max_output_chars: self.config.max_output_chars,
        }
    }
}

fn run_invocation(
    shared: Arc<Shared>,
    query: String,
    context: serde_json::Value,
    depth: usize,
    cancel: CancellationToken,
) -> BoxFuture<'static, Result<ExecutionResult, ExecutionFailure>> {
    Box::pin(async move {
        let context = Arc::new(context);
        let dispatcher = Arc::new(SubQueryDispatcher {
            shared: Arc::clone(&shared),
            depth,
            context: Arc::clone(&context),
            permits: Semaphore::new(shared.config.max_parallel.max(1)),
        });
        let mut sandbox = Sandbox::new(
            (*context).clone(),
            dispatcher.clone(),
            Some(dispatcher),
            shared.sandbox_options(),
        )
        .with_cancellation(cancel.clone());

        let mut invocation = Invocation::new(shared, depth, cancel);
        let outcome = invocation.drive(&mut sandbox, &query).await;
        sandbox.dispose();

        match outcome {
            Ok(finish) => Ok(invocation.into_result(finish)),
            Err(error) => {
                warn!(depth, error = %error, "RLM execution failed");
                invocation.record(TraceKind::Error, json!({ "error": error.to_string() }));
                Err(invocation.into_failure(error))
            }
        }
    })
}

struct Finish {
    response: String,
    status: ExecutionStatus,
}

/// One depth level of an execution
struct Invocation {
    shared: Arc<Shared>,
    depth: usize,
    /// Fires when the run that asked for this sub-query no longer needs it
    cancel: CancellationToken,
    run_id: Uuid,
    started: Instant,
    iterations: usize,
    messages: Vec<Message>,
    trace: Vec<TraceEntry>,
    usage: UsageSummary,
}

impl Invocation {
    fn new(shared: Arc<Shared>, depth: usize, cancel: CancellationToken) -> Self {
        Self {
            shared,
            depth,
            cancel,
            run_id: Uuid::new_v4(),
            started: Instant::now(),
            iterations: 0,
            messages: Vec::new(),
            trace: Vec::new(),
            usage: UsageSummary::default(),
        }
    }

    fn record(&mut self, kind: TraceKind, payload: serde_json::Value) {
        let entry = TraceEntry::new(kind, self.depth, payload);
        self.shared.report(&entry);
        self.trace.push(entry);
    }

    async fn drive(&mut self, sandbox: &mut Sandbox, query: &str) -> Result<Finish, RlmError> {
        let config = &self.shared.config;
        let max_iterations = self.shared.options.max_iterations;
        let max_output_chars = config.max_output_chars;
        let summary = ContextSummary::new(sandbox.context_text(), config.preview_lines);
        self.messages = vec![
            Message::system(prompt::system_prompt(
                &summary,
                self.depth,
                self.shared.options.max_depth,
            )),
            Message::user(prompt::query_prompt(query)),
        ];

        let model = self.shared.model_for(self.depth);
        let mut last_text = String::new();

        for iteration in 1..=max_iterations {
            if self.cancel.is_cancelled() {
                debug!(depth = self.depth, iteration, "Sub-query abandoned by its caller");
                return Err(RlmError::Cancelled);
            }
            self.iterations = iteration;

            let projected = self.projected_prompt_cost(&model);
            if self.shared.meter.would_exceed(projected) {
                let ceiling = self.shared.meter.ceiling().unwrap_or_default();
                warn!(
                    depth = self.depth,
                    iteration,
                    ceiling,
                    spent = self.shared.meter.spent(),
                    "Cost ceiling reached, returning partial result"
                );
                self.iterations = iteration - 1;
                return Ok(Finish {
                    response: last_text,
                    status: ExecutionStatus::Partial {
                        reason: format!("cost ceiling of ${:.4} reached", ceiling),
                    },
                });
            }

            info!(iteration, depth = self.depth, "RLM iteration");
            let text = self.call_model(&model, iteration).await?;
            self.messages.push(Message::assistant(text.clone()));
            let parsed = parser::parse(&text);
            last_text = parsed.thinking.clone().unwrap_or(text);

            // Plain-text termination is authoritative over any code
            if let Some(signal) = parsed.termination {
                match self.resolve(&signal, sandbox) {
                    Ok(answer) => return Ok(self.finish(answer, "text")),
                    Err(RlmError::UndefinedVariable(name)) => {
                        self.note_undefined(&name);
                        self.messages
                            .push(Message::user(prompt::undefined_variable(&name)));
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let Some(code) = parsed.code else {
                debug!(iteration, depth = self.depth, "No code or final answer, nudging");
                self.record(
                    TraceKind::Error,
                    json!({ "iteration": iteration, "error": RlmError::ParseAmbiguity.to_string() }),
                );
                self.messages.push(Message::user(prompt::NUDGE));
                continue;
            };

            let SandboxResult {
                output,
                error,
                error_kind,
                termination,
                sub_calls,
                elapsed_ms,
                ..
            } = sandbox.execute(&code).await?;

            if let Some(error) = &error {
                debug!(iteration, depth = self.depth, error = %error, "Sandbox run reported an error");
            }
            self.record(
                TraceKind::CodeExecution,
                json!({
                    "iteration": iteration,
                    "code": code,
                    "output": output,
                    "error": error,
                    "error_kind": error_kind,
                    "sub_calls": sub_calls.len(),
                    "elapsed_ms": elapsed_ms,
                }),
            );
            self.splice(sub_calls);

            let mut reply = prompt::render_execution(&output, error.as_deref(), max_output_chars);

            if let Some(signal) = termination {
                match self.resolve(&signal, sandbox) {
                    Ok(answer) => return Ok(self.finish(answer, "code")),
                    Err(RlmError::UndefinedVariable(name)) => {
                        self.note_undefined(&name);
                        reply.push_str("\n\n");
                        reply.push_str(&prompt::undefined_variable(&name));
                    }
                    Err(e) => return Err(e),
                }
            }

            self.messages.push(Message::user(reply));
        }

        warn!(depth = self.depth, max_iterations, "RLM iteration limit reached");
        Err(RlmError::MaxIterationsExceeded { max_iterations })
    }
}

impl Invocation {
    /// Estimated input cost of sending the current conversation
    fn projected_prompt_cost(&self, model: &str) -> f64 {
        let Some(pricing) = self.shared.pricing.as_ref().and_then(|p| p.pricing(model)) else {
            return 0.0;
        };
        let tokens: usize = self
            .messages
            .iter()
            .map(|m| chunker::estimate_tokens(&m.content))
            .sum();
        pricing.input_cost(tokens)
    }

    async fn call_model(&mut self, model: &str, iteration: usize) -> Result<String, RlmError> {
        let shared = Arc::clone(&self.shared);
        let config = &shared.config;
        let request = CompletionRequest {
            messages: self.messages.clone(),
            model: model.to_string(),
            temperature: Some(config.temperature),
            max_tokens: Some(config.max_tokens),
            stop: Vec::new(),
        };

        let started = Instant::now();
        let client = Arc::clone(&shared.client);
        let streaming = shared.options.streaming;
        let call = async move {
            if streaming {
                let stream = client.complete_stream(request).await?;
                collect_stream(stream).await
            } else {
                client.complete(request).await
            }
        };

        let timeout_secs = config.model_timeout_secs;
        let cancel = self.cancel.clone();
        let answered = tokio::select! {
            biased;

            answered = tokio::time::timeout(Duration::from_secs(timeout_secs), call) => answered,
            _ = cancel.cancelled() => return Err(RlmError::Cancelled),
        };
        let response = match answered {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(RlmError::ModelClient(e)),
            Err(_) => {
                return Err(RlmError::ModelClient(anyhow::anyhow!(
                    "model request timed out after {} seconds",
                    timeout_secs
                )));
            }
        };

        let cost = shared
            .pricing
            .as_ref()
            .and_then(|p| p.pricing(model))
            .map(|p| p.cost(&response.usage))
            .unwrap_or(0.0);
        self.usage.record(&response.usage, cost);
        shared.meter.add(cost);

        debug!(
            iteration,
            depth = self.depth,
            prompt_tokens = response.usage.prompt_tokens,
            completion_tokens = response.usage.completion_tokens,
            "Model response received"
        );

        let kind = if self.depth == 0 {
            TraceKind::ModelCall
        } else {
            TraceKind::SubModelCall
        };
        self.record(
            kind,
            json!({
                "iteration": iteration,
                "model": model,
                "prompt_tokens": response.usage.prompt_tokens,
                "completion_tokens": response.usage.completion_tokens,
                "cost": cost,
                "elapsed_ms": started.elapsed().as_millis() as u64,
                "response": response.content,
            }),
        );

        Ok(response.content)
    }

    /// Turn a termination signal into the answer text
    ///
    /// A name that is gone from the store after the run (a block-local, say)
    /// falls back to the value it held when `FINAL_VAR` ran.
    fn resolve(&self, signal: &TerminationSignal, sandbox: &Sandbox) -> Result<String, RlmError> {
        match signal.kind {
            TerminationKind::DirectValue => Ok(signal.payload.clone()),
            TerminationKind::VariableReference => sandbox
                .get_variable(&signal.payload)
                .map(|value| match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                })
                .or_else(|| signal.fallback.clone())
                .ok_or_else(|| RlmError::UndefinedVariable(signal.payload.clone())),
        }
    }

    fn finish(&mut self, answer: String, source: &str) -> Finish {
        info!(
            depth = self.depth,
            iterations = self.iterations,
            source,
            "RLM final answer"
        );
        self.record(
            TraceKind::FinalOutput,
            json!({ "iteration": self.iterations, "source": source, "answer": answer }),
        );
        Finish {
            response: answer,
            status: ExecutionStatus::Completed,
        }
    }

    fn note_undefined(&mut self, name: &str) {
        warn!(depth = self.depth, variable = name, "FINAL_VAR names an undefined variable");
        self.record(
            TraceKind::Error,
            json!({
                "iteration": self.iterations,
                "error": RlmError::UndefinedVariable(name.to_string()).to_string(),
            }),
        );
    }

    /// Splice child traces in after the code execution that issued them
    ///
    /// Children abandoned when the run ended keep whatever they recorded and
    /// get an extra entry at this depth saying they were cut short.
    fn splice(&mut self, sub_calls: Vec<SubQueryOutcome>) {
        for outcome in sub_calls {
            self.usage.absorb(&outcome.usage);
            self.trace.extend(outcome.trace);
            if matches!(outcome.answer, Err(RlmError::Cancelled)) {
                self.record(
                    TraceKind::Error,
                    json!({
                        "iteration": self.iterations,
                        "error": "sub-query abandoned before its answer was used",
                    }),
                );
            }
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn into_result(self, finish: Finish) -> ExecutionResult {
        ExecutionResult {
            run_id: self.run_id,
            response: finish.response,
            status: finish.status,
            elapsed_ms: self.elapsed_ms(),
            trace: self.trace,
            usage: self.usage,
            iterations: self.iterations,
        }
    }

    fn into_failure(self, error: RlmError) -> ExecutionFailure {
        ExecutionFailure {
            error,
            elapsed_ms: self.elapsed_ms(),
            trace: self.trace,
            usage: self.usage,
            iterations: self.iterations,
        }
    }
}

/// Services a sandbox's recursive queries by running child invocations
struct SubQueryDispatcher {
    shared: Arc<Shared>,
    /// Depth of the invocation owning the sandbox
    depth: usize,
    context: Arc<serde_json::Value>,
    permits: Semaphore,
}

#[async_trait]
impl RecursiveQueryHandler for SubQueryDispatcher {
    async fn query(&self, request: SubQueryRequest, cancel: CancellationToken) -> SubQueryOutcome {
        let child_depth = self.depth + 1;
        let max_depth = self.shared.options.max_depth;
        if child_depth > max_depth {
            warn!(depth = child_depth, max_depth, "Rejecting sub-query beyond max depth");
            let error = RlmError::MaxDepthExceeded {
                depth: child_depth,
                max_depth,
            };
            let entry = TraceEntry::new(
                TraceKind::Error,
                self.depth,
                json!({ "error": error.to_string(), "prompt": request.prompt }),
            );
            self.shared.report(&entry);
            return SubQueryOutcome {
                answer: Err(error),
                trace: vec![entry],
                usage: UsageSummary::default(),
            };
        }

        debug!(depth = child_depth, "Starting sub-query");
        let context = request
            .context
            .unwrap_or_else(|| (*self.context).clone());
        let child = run_invocation(
            Arc::clone(&self.shared),
            request.prompt,
            context,
            child_depth,
            cancel,
        );
        match child.await {
            Ok(result) => SubQueryOutcome {
                answer: Ok(result.response),
                trace: result.trace,
                usage: result.usage,
            },
            Err(failure) => SubQueryOutcome {
                answer: Err(failure.error),
                trace: failure.trace,
                usage: failure.usage,
            },
        }
    }
}

#[async_trait]
impl ParallelQueryHandler for SubQueryDispatcher {
    async fn query_all(
        &self,
        requests: Vec<SubQueryRequest>,
        cancel: CancellationToken,
    ) -> Vec<SubQueryOutcome> {
        debug!(depth = self.depth, count = requests.len(), "Fanning out sub-queries");
        join_all(requests.into_iter().map(|request| {
            let cancel = cancel.clone();
            async move {
                // Held for the whole child run; closed semaphores never happen here
                let _permit = self.permits.acquire().await.ok();
                self.query(request, cancel).await
            }
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_follow_config() {
        let config = RlmConfig {
            max_iterations: 3,
            max_depth: 2,
            cost_ceiling: Some(1.5),
            streaming: true,
            ..RlmConfig::default()
        };
        let options = ExecuteOptions::from_config(&config);
        assert_eq!(options.max_iterations, 3);
        assert_eq!(options.max_depth, 2);
        assert_eq!(options.cost_ceiling, Some(1.5));
        assert!(options.streaming);
        assert!(options.on_step.is_none());
        assert!(format!("{:?}", options).contains("on_step: false"));
    }

    #[test]
    fn subcall_model_falls_back_to_root() {
        let config = RlmConfig {
            root_model: Some("big".to_string()),
            ..RlmConfig::default()
        };
        assert_eq!(config.subcall_model(), Some("big"));
    }
}
