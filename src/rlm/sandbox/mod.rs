//! Script sandbox
//!
//! Runs model-written rhai code against a persistent variable store. The
//! input is bound to the constant `context`; scripts reach the outside world
//! only through the host API registered in [`host`], and recursive queries
//! go through the bridge in [`bridge`].

mod bridge;
mod host;
pub mod text;

pub use bridge::{CallKind, QueryTicket};
pub use host::MAX_SLEEP_MS;

use async_trait::async_trait;
use rhai::{AST, Dynamic, Engine, Scope};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{Result, RlmError};
use super::parser::TerminationSignal;
use super::trace::{TraceEntry, UsageSummary};
use bridge::{BridgeClient, Handlers, ServiceEnd};
use host::RunState;

/// Name of the input binding inside scripts
pub const CONTEXT_BINDING: &str = "context";

/// How long an aborted interpreter gets to hand back its variable store
const ABORT_GRACE: Duration = Duration::from_millis(250);

/// A recursive query issued from script code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubQueryRequest {
    pub prompt: String,
    /// Narrowed input for the sub-query; `None` reuses the caller's input
    pub context: Option<serde_json::Value>,
}

impl SubQueryRequest {
    pub fn new(prompt: impl Into<String>, context: Option<serde_json::Value>) -> Self {
        Self {
            prompt: prompt.into(),
            context,
        }
    }
}

/// Answer to one sub-query plus what it cost
#[derive(Debug)]
pub struct SubQueryOutcome {
    pub answer: std::result::Result<String, RlmError>,
    pub trace: Vec<TraceEntry>,
    pub usage: UsageSummary,
}

impl SubQueryOutcome {
    pub fn answered(answer: impl Into<String>) -> Self {
        Self {
            answer: Ok(answer.into()),
            trace: Vec::new(),
            usage: UsageSummary::default(),
        }
    }

    pub fn failed(error: RlmError) -> Self {
        Self {
            answer: Err(error),
            trace: Vec::new(),
            usage: UsageSummary::default(),
        }
    }
}

/// Services `llm_query` calls
///
/// `cancel` fires when the run that issued the call ends before the answer
/// is consumed. A handler that honours it should stop early and return what
/// it has spent so far; one that ignores it is aborted after a short grace.
#[async_trait]
pub trait RecursiveQueryHandler: Send + Sync {
    async fn query(&self, request: SubQueryRequest, cancel: CancellationToken) -> SubQueryOutcome;
}

/// Services `llm_query_batch` calls
///
/// Must return one outcome per request, in request order.
#[async_trait]
pub trait ParallelQueryHandler: Send + Sync {
    async fn query_all(
        &self,
        requests: Vec<SubQueryRequest>,
        cancel: CancellationToken,
    ) -> Vec<SubQueryOutcome>;
}

/// Closure-backed [`RecursiveQueryHandler`]
///
/// Closures never see the cancellation token, so abandoned calls are aborted.
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> Arc<FnHandler<F>>
where
    F: Fn(SubQueryRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SubQueryOutcome> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F, Fut> RecursiveQueryHandler for FnHandler<F>
where
    F: Fn(SubQueryRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SubQueryOutcome> + Send + 'static,
{
    async fn query(&self, request: SubQueryRequest, _cancel: CancellationToken) -> SubQueryOutcome {
        (self.0)(request).await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxOptions {
    pub timeout_ms: u64,
    /// Advisory only
    pub memory_limit_mb: usize,
    pub max_output_chars: usize,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            memory_limit_mb: 64,
            max_output_chars: 20_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxErrorKind {
    Timeout,
    Runtime,
    Cancelled,
}

/// Result of one `execute` call
#[derive(Debug, Default)]
pub struct SandboxResult {
    pub output: String,
    pub error: Option<String>,
    pub error_kind: Option<SandboxErrorKind>,
    /// Variable store after the run, `context` excluded
    pub variables: BTreeMap<String, serde_json::Value>,
    /// Set when code called `FINAL` or `FINAL_VAR`
    pub termination: Option<TerminationSignal>,
    /// Settled sub-queries, in issue order
    pub sub_calls: Vec<SubQueryOutcome>,
    pub elapsed_ms: u64,
}

impl SandboxResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// What the interpreter thread hands back
struct Interpreted {
    scope: Scope<'static>,
    functions: AST,
    error: Option<(SandboxErrorKind, String)>,
}

/// Isolated, stateful script runner
pub struct Sandbox {
    context: serde_json::Value,
    context_text: Arc<String>,
    handlers: Handlers,
    options: SandboxOptions,
    scope: Scope<'static>,
    functions: AST,
    cancel: CancellationToken,
    disposed: bool,
}

impl Sandbox {
    pub fn new(
        context: serde_json::Value,
        handler: Arc<dyn RecursiveQueryHandler>,
        parallel: Option<Arc<dyn ParallelQueryHandler>>,
        options: SandboxOptions,
    ) -> Self {
        let context_text = Arc::new(context_as_text(&context));
        let scope = fresh_scope(&context);
        Self {
            context,
            context_text,
            handlers: Handlers {
                single: handler,
                parallel,
            },
            options,
            scope,
            functions: AST::empty(),
            cancel: CancellationToken::new(),
            disposed: false,
        }
    }

    /// Stop runs early once `cancel` fires
    ///
    /// Sub-queries still in flight inherit the token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The input as scripts see it through the text helpers
    pub fn context_text(&self) -> &str {
        &self.context_text
    }

    /// Run code, servicing any recursive queries it issues
    ///
    /// Script failures and timeouts are reported in the result, not as `Err`.
    pub async fn execute(&mut self, code: &str) -> Result<SandboxResult> {
        if self.disposed {
            return Err(RlmError::SandboxDisposed);
        }

        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.options.timeout_ms);
        let (tx, rx) = mpsc::unbounded_channel();
        let client = BridgeClient::new(tx);
        let cancelled = client.cancel_flag();

        let run = Arc::new(RunState::new(
            client,
            deadline,
            Arc::clone(&self.context_text),
            self.options.max_output_chars,
        ));
        let engine = host::build_engine(&run, &self.options)
            .map_err(|e| RlmError::SandboxRuntime(format!("host API setup failed: {}", e)))?;

        let mut scope = std::mem::take(&mut self.scope);
        let functions = std::mem::replace(&mut self.functions, AST::empty());
        let code = code.to_string();
        let script_run = Arc::clone(&run);
        let interpreter = tokio::task::spawn_blocking(move || {
            let (functions, error) =
                run_script(&engine, &script_run, &mut scope, functions, &code);
            Interpreted {
                scope,
                functions,
                error,
            }
        });

        let serviced = bridge::service(
            rx,
            &self.handlers,
            interpreter,
            deadline,
            &cancelled,
            &self.cancel,
        )
        .await;

        let error = match serviced.end {
            ServiceEnd::Finished(Ok(done)) => {
                let error = self.restore(done);
                // A termination wrapped by a function call still means the clock ran out
                if error.is_some() && Instant::now() >= deadline {
                    Some(timeout_error(self.options.timeout_ms))
                } else {
                    error
                }
            }
            ServiceEnd::Finished(Err(e)) => {
                warn!(error = %e, "Sandbox interpreter task failed");
                self.rebuild_scope();
                let kind = if e.is_cancelled() {
                    SandboxErrorKind::Cancelled
                } else {
                    SandboxErrorKind::Runtime
                };
                Some((kind, format!("interpreter task failed: {}", e)))
            }
            ServiceEnd::TimedOut(handle) => {
                self.await_abort(handle).await;
                Some(timeout_error(self.options.timeout_ms))
            }
            ServiceEnd::Cancelled(handle) => {
                self.await_abort(handle).await;
                Some((SandboxErrorKind::Cancelled, RlmError::Cancelled.to_string()))
            }
        };

        let output = run.output.lock().take();
        let termination = run.termination.lock().take();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (error_kind, error) = match error {
            Some((kind, message)) => (Some(kind), Some(message)),
            None => (None, None),
        };

        debug!(
            elapsed_ms,
            output_len = output.len(),
            error_kind = ?error_kind,
            sub_calls = serviced.sub_calls.len(),
            "Sandbox execution finished"
        );

        Ok(SandboxResult {
            output,
            error,
            error_kind,
            variables: self.variables(),
            termination,
            sub_calls: serviced.sub_calls,
            elapsed_ms,
        })
    }

    /// Give an aborted interpreter a moment to hand its state back
    async fn await_abort(&mut self, handle: tokio::task::JoinHandle<Interpreted>) {
        match tokio::time::timeout(ABORT_GRACE, handle).await {
            Ok(Ok(done)) => {
                self.restore(done);
            }
            _ => {
                warn!(
                    grace_ms = ABORT_GRACE.as_millis() as u64,
                    "Sandbox interpreter did not stop after abort, variable store rebuilt"
                );
                self.rebuild_scope();
            }
        }
    }

    fn restore(&mut self, done: Interpreted) -> Option<(SandboxErrorKind, String)> {
        self.scope = done.scope;
        self.functions = done.functions;
        match done.error {
            Some((SandboxErrorKind::Timeout, _)) => Some(timeout_error(self.options.timeout_ms)),
            other => other,
        }
    }

    fn rebuild_scope(&mut self) {
        self.scope = fresh_scope(&self.context);
        self.functions = AST::empty();
    }

    /// Read a variable as JSON
    pub fn get_variable(&self, name: &str) -> Option<serde_json::Value> {
        if name == CONTEXT_BINDING {
            return Some(self.context.clone());
        }
        self.scope
            .get(name)
            .map(|value| host::dynamic_to_json(value).unwrap_or(serde_json::Value::Null))
    }

    /// Create or overwrite a variable
    pub fn set_variable(&mut self, name: &str, value: serde_json::Value) -> Result<()> {
        if self.disposed {
            return Err(RlmError::SandboxDisposed);
        }
        if name == CONTEXT_BINDING || self.scope.is_constant(name) == Some(true) {
            return Err(RlmError::SandboxRuntime(format!(
                "cannot assign to constant '{}'",
                name
            )));
        }
        let value: Dynamic = rhai::serde::to_dynamic(&value)
            .map_err(|e| RlmError::SandboxRuntime(e.to_string()))?;
        self.scope.set_or_push(name.to_string(), value);
        Ok(())
    }

    /// Snapshot of all variables except `context`
    pub fn variables(&self) -> BTreeMap<String, serde_json::Value> {
        self.scope
            .iter()
            .filter(|(name, _, _)| *name != CONTEXT_BINDING)
            .map(|(name, _, value)| {
                let json = host::dynamic_to_json(&value).unwrap_or(serde_json::Value::Null);
                (name.to_string(), json)
            })
            .collect()
    }

    /// Drop all variables and functions, keeping the input binding
    pub fn reset(&mut self) {
        self.rebuild_scope();
    }

    /// Release interpreter state; later calls fail with `SandboxDisposed`
    pub fn dispose(&mut self) {
        if !self.disposed {
            self.scope.clear();
            self.functions = AST::empty();
            self.disposed = true;
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn timeout_error(timeout_ms: u64) -> (SandboxErrorKind, String) {
    (
        SandboxErrorKind::Timeout,
        RlmError::SandboxTimeout { timeout_ms }.to_string(),
    )
}

/// Compile and run one snippet, carrying script functions forward
fn run_script(
    engine: &Engine,
    run: &RunState,
    scope: &mut Scope<'static>,
    functions: AST,
    code: &str,
) -> (AST, Option<(SandboxErrorKind, String)>) {
    let ast = match engine.compile(code) {
        Ok(ast) => ast,
        Err(e) => {
            return (
                functions,
                Some((SandboxErrorKind::Runtime, format!("Syntax error: {}", e))),
            );
        }
    };

    let merged = functions.merge(&ast);
    let carried = merged.clone_functions_only();

    match engine.eval_ast_with_scope::<Dynamic>(scope, &merged) {
        Ok(value) => {
            // Trailing expression is echoed like a REPL
            if !value.is_unit() {
                run.output.lock().push_line(&host::render_value(&value));
            }
            (carried, None)
        }
        Err(e) => {
            let kind = if matches!(*e, rhai::EvalAltResult::ErrorTerminated(..)) {
                SandboxErrorKind::Timeout
            } else {
                SandboxErrorKind::Runtime
            };
            (carried, Some((kind, e.to_string())))
        }
    }
}

fn fresh_scope(context: &serde_json::Value) -> Scope<'static> {
    let value = match context {
        serde_json::Value::String(s) => Dynamic::from(s.clone()),
        other => rhai::serde::to_dynamic(other)
            .unwrap_or_else(|_| Dynamic::from(context_as_text(other))),
    };
    let mut scope = Scope::new();
    scope.push_constant_dynamic(CONTEXT_BINDING, value);
    scope
}

fn context_as_text(context: &serde_json::Value) -> String {
    match context {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rlm::parser::TerminationKind;
    use crate::rlm::trace::TraceKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Handler that stops at cancellation and reports what it got through
    struct Cooperative;

    #[async_trait]
    impl RecursiveQueryHandler for Cooperative {
        async fn query(&self, request: SubQueryRequest, cancel: CancellationToken) -> SubQueryOutcome {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(10)) => {
                    SubQueryOutcome::answered(request.prompt)
                }
                _ = cancel.cancelled() => SubQueryOutcome {
                    answer: Err(RlmError::Cancelled),
                    trace: vec![TraceEntry::new(
                        TraceKind::SubModelCall,
                        1,
                        serde_json::json!({ "prompt": request.prompt }),
                    )],
                    usage: UsageSummary::default(),
                },
            }
        }
    }

    fn scripted_handler() -> Arc<dyn RecursiveQueryHandler> {
        handler_fn(|req: SubQueryRequest| async move {
            match req.prompt.as_str() {
                "bad" => SubQueryOutcome::failed(RlmError::MaxDepthExceeded {
                    depth: 2,
                    max_depth: 1,
                }),
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    SubQueryOutcome::answered("late")
                }
                p => {
                    if p.starts_with("slow") {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    SubQueryOutcome::answered(format!("answer-{}", p))
                }
            }
        })
    }

    fn sandbox_with(context: &str, options: SandboxOptions) -> Sandbox {
        Sandbox::new(
            serde_json::Value::String(context.to_string()),
            scripted_handler(),
            None,
            options,
        )
    }

    fn sandbox(context: &str) -> Sandbox {
        sandbox_with(context, SandboxOptions::default())
    }

    #[tokio::test]
    async fn variables_persist_between_runs() {
        let mut sb = sandbox("ignored");
        let first = sb.execute("let x = 40;").await.unwrap();
        assert!(first.is_ok());
        let second = sb.execute("let y = x + 2; print(y);").await.unwrap();
        assert_eq!(second.output, "42\n");
        assert_eq!(second.variables["y"], serde_json::json!(42));
        assert!(!second.variables.contains_key(CONTEXT_BINDING));
    }

    #[tokio::test]
    async fn script_functions_persist_between_runs() {
        let mut sb = sandbox("");
        sb.execute("fn double(v) { v * 2 }").await.unwrap();
        let result = sb.execute("print(double(21));").await.unwrap();
        assert_eq!(result.output, "42\n");
    }

    #[tokio::test]
    async fn final_records_without_halting() {
        let mut sb = sandbox("");
        let result = sb
            .execute(r#"FINAL("done"); print("after");"#)
            .await
            .unwrap();
        assert_eq!(result.termination, Some(TerminationSignal::direct("done")));
        assert_eq!(result.output, "after\n");
    }

    #[tokio::test]
    async fn final_var_records_a_name() {
        let mut sb = sandbox("");
        let result = sb
            .execute(r#"let result = "x"; FINAL_VAR("result");"#)
            .await
            .unwrap();
        let signal = result.termination.unwrap();
        assert_eq!(signal.kind, TerminationKind::VariableReference);
        assert_eq!(signal.payload, "result");
        assert_eq!(sb.get_variable("result"), Some(serde_json::json!("x")));
    }

    #[tokio::test]
    async fn final_var_bare_identifier_is_a_name() {
        let mut sb = sandbox("");
        let result = sb
            .execute(r#"let answer = "Paris"; FINAL_VAR(answer);"#)
            .await
            .unwrap();
        let signal = result.termination.unwrap();
        assert_eq!(signal.kind, TerminationKind::VariableReference);
        assert_eq!(signal.payload, "answer");
        assert_eq!(signal.fallback.as_deref(), Some("Paris"));
    }

    #[tokio::test]
    async fn final_var_keeps_value_of_block_local() {
        let mut sb = sandbox("");
        let result = sb
            .execute("if true { let inner = 5; FINAL_VAR(inner); }")
            .await
            .unwrap();
        assert!(result.is_ok(), "{:?}", result.error);
        let signal = result.termination.unwrap();
        assert_eq!(signal.payload, "inner");
        assert_eq!(signal.fallback.as_deref(), Some("5"));
        assert!(sb.get_variable("inner").is_none());
    }

    #[tokio::test]
    async fn runtime_error_keeps_prior_output() {
        let mut sb = sandbox("");
        let result = sb
            .execute(r#"print("before"); throw "boom"; print("never");"#)
            .await
            .unwrap();
        assert_eq!(result.output, "before\n");
        assert_eq!(result.error_kind, Some(SandboxErrorKind::Runtime));
        assert!(result.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn syntax_error_is_reported() {
        let mut sb = sandbox("");
        let result = sb.execute("let = ;").await.unwrap();
        assert!(result.error.unwrap().starts_with("Syntax error"));
    }

    #[tokio::test]
    async fn context_is_bound_and_constant() {
        let mut sb = sandbox("alpha\nbeta\ngamma");
        let result = sb
            .execute(r#"print(context_len()); print(head(1)[0]); print(grep("^g")[0]);"#)
            .await
            .unwrap();
        assert_eq!(result.output, "16\nalpha\n3: gamma\n");

        let result = sb.execute(r#"context = "x";"#).await.unwrap();
        assert!(result.error.is_some());
        assert!(sb.set_variable(CONTEXT_BINDING, serde_json::json!(1)).is_err());
    }

    #[tokio::test]
    async fn infinite_loop_times_out() {
        let mut sb = sandbox_with(
            "",
            SandboxOptions {
                timeout_ms: 50,
                ..SandboxOptions::default()
            },
        );
        let started = std::time::Instant::now();
        let result = sb.execute(r#"print("start"); loop { }"#).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.error_kind, Some(SandboxErrorKind::Timeout));
        assert!(result.error.unwrap().contains("timed out"));
        assert_eq!(result.output, "start\n");

        // The sandbox is still usable afterwards
        let next = sb.execute("print(1 + 1);").await.unwrap();
        assert_eq!(next.output, "2\n");
    }

    #[tokio::test]
    async fn timeout_cancels_call_in_flight() {
        let mut sb = sandbox_with(
            "",
            SandboxOptions {
                timeout_ms: 100,
                ..SandboxOptions::default()
            },
        );
        let started = std::time::Instant::now();
        let result = sb.execute(r#"let a = llm_query("hang"); print(a);"#).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.error_kind, Some(SandboxErrorKind::Timeout));
        assert!(result.output.is_empty());
        assert_eq!(result.sub_calls.len(), 1);
        assert!(matches!(result.sub_calls[0].answer, Err(RlmError::Cancelled)));
    }

    #[tokio::test]
    async fn unawaited_ticket_does_not_outlive_run() {
        let completed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completed);
        let handler = handler_fn(move |_req: SubQueryRequest| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                SubQueryOutcome::answered("late")
            }
        });
        let mut sb = Sandbox::new(
            serde_json::json!(""),
            handler,
            None,
            SandboxOptions::default(),
        );

        let result = sb
            .execute(r#"let t = llm_query_async("child"); print("done");"#)
            .await
            .unwrap();
        assert!(result.is_ok(), "{:?}", result.error);
        assert_eq!(result.output, "done\n");
        assert_eq!(result.sub_calls.len(), 1);
        assert!(matches!(result.sub_calls[0].answer, Err(RlmError::Cancelled)));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cooperative_handler_returns_partial_work() {
        let mut sb = Sandbox::new(
            serde_json::json!(""),
            Arc::new(Cooperative),
            None,
            SandboxOptions::default(),
        );
        let started = std::time::Instant::now();
        let result = sb
            .execute(r#"let t = llm_query_async("child"); 1"#)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(result.sub_calls.len(), 1);
        assert_eq!(result.sub_calls[0].trace.len(), 1);
        assert_eq!(result.sub_calls[0].trace[0].kind, TraceKind::SubModelCall);
    }

    #[tokio::test]
    async fn owner_cancellation_stops_run() {
        let cancel = CancellationToken::new();
        let mut sb = sandbox("").with_cancellation(cancel.clone());
        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let result = sb.execute("let n = 1; loop { n += 1; }").await.unwrap();
        trigger.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.error_kind, Some(SandboxErrorKind::Cancelled));
        assert!(result.error.unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn sequential_calls_see_earlier_results() {
        let mut sb = sandbox("");
        let result = sb
            .execute(r#"let a = llm_query("slow"); let b = llm_query("fast:" + a); print(b);"#)
            .await
            .unwrap();
        assert!(result.is_ok(), "{:?}", result.error);
        assert_eq!(result.output, "answer-fast:answer-slow\n");
        assert_eq!(result.sub_calls.len(), 2);
    }

    #[tokio::test]
    async fn tickets_overlap_and_resolve_independently() {
        let mut sb = sandbox("");
        let result = sb
            .execute(
                r#"
                let t1 = llm_query_async("slow-one");
                let t2 = llm_query_async("two");
                print(t2.wait());
                print(t1.wait());
                print(t1.wait());
                "#,
            )
            .await
            .unwrap();
        assert_eq!(
            result.output,
            "answer-two\nanswer-slow-one\nanswer-slow-one\n"
        );
    }

    #[tokio::test]
    async fn batch_preserves_request_order() {
        let mut sb = sandbox("");
        let result = sb
            .execute(
                r#"
                let answers = llm_query_batch(["slow-a", #{prompt: "b", context: "chunk"}, "bad"]);
                for a in answers { print(a); }
                "#,
            )
            .await
            .unwrap();
        let lines: Vec<&str> = result.output.lines().collect();
        assert_eq!(lines[0], "answer-slow-a");
        assert_eq!(lines[1], "answer-b");
        assert!(lines[2].starts_with("Error: MaxDepthExceeded"));
    }

    #[tokio::test]
    async fn rejected_single_call_is_catchable() {
        let mut sb = sandbox("");
        let result = sb
            .execute(r#"try { llm_query("bad"); } catch (e) { print("caught"); }"#)
            .await
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(result.output, "caught\n");
    }

    #[tokio::test]
    async fn sleep_is_bounded_by_deadline() {
        let mut sb = sandbox_with(
            "",
            SandboxOptions {
                timeout_ms: 100,
                ..SandboxOptions::default()
            },
        );
        let started = std::time::Instant::now();
        let result = sb.execute("sleep(60000);").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(result.error.is_some() || result.elapsed_ms <= 1_000);
    }

    #[tokio::test]
    async fn set_variable_and_reset() {
        let mut sb = sandbox("");
        sb.set_variable("n", serde_json::json!(5)).unwrap();
        let result = sb.execute("print(n * 2);").await.unwrap();
        assert_eq!(result.output, "10\n");

        sb.reset();
        assert!(sb.get_variable("n").is_none());
        assert_eq!(sb.get_variable(CONTEXT_BINDING), Some(serde_json::json!("")));
    }

    #[tokio::test]
    async fn disposed_sandbox_rejects_execution() {
        let mut sb = sandbox("");
        sb.dispose();
        assert!(sb.is_disposed());
        assert!(matches!(
            sb.execute("1").await,
            Err(RlmError::SandboxDisposed)
        ));
    }

    #[tokio::test]
    async fn trailing_expression_is_echoed() {
        let mut sb = sandbox("");
        let result = sb.execute("let x = 6; x * 7").await.unwrap();
        assert_eq!(result.output, "42\n");
    }
}
