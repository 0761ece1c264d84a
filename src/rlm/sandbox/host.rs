//! Host API exposed to sandboxed scripts
//!
//! A fresh [`Engine`] is built for every run so that the registered closures
//! capture that run's state only. A run abandoned after a timeout can never
//! write into the output or termination slot of a later run.

use parking_lot::Mutex;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Array, Dynamic, Engine, EvalAltResult, INT, Map, ParseError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::bridge::{BridgeClient, QueryTicket};
use super::text;
use super::{SandboxOptions, SubQueryRequest};
use crate::rlm::parser::TerminationSignal;

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// Upper bound for a single `sleep(ms)` call
pub const MAX_SLEEP_MS: u64 = 2_000;

/// Operations between deadline checks
const PROGRESS_CHECK_MASK: u64 = 0x3f;

/// Capped print buffer
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    text: String,
    chars: usize,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            limit,
            truncated: false,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        let needed = line.chars().count() + 1;
        if self.chars + needed <= self.limit {
            self.text.push_str(line);
            self.text.push('\n');
            self.chars += needed;
            return;
        }
        let room = self.limit.saturating_sub(self.chars);
        self.text.extend(line.chars().take(room));
        self.text.push_str("\n... [output truncated]\n");
        self.truncated = true;
    }

    pub fn take(&mut self) -> String {
        self.chars = 0;
        self.truncated = false;
        std::mem::take(&mut self.text)
    }
}

/// State owned by one `execute` call
pub(crate) struct RunState {
    pub bridge: BridgeClient,
    pub deadline: Instant,
    pub context: Arc<String>,
    pub output: Mutex<OutputBuffer>,
    pub termination: Mutex<Option<TerminationSignal>>,
}

impl RunState {
    pub fn new(
        bridge: BridgeClient,
        deadline: Instant,
        context: Arc<String>,
        max_output_chars: usize,
    ) -> Self {
        Self {
            bridge,
            deadline,
            context,
            output: Mutex::new(OutputBuffer::new(max_output_chars)),
            termination: Mutex::new(None),
        }
    }

    fn should_stop(&self) -> bool {
        self.bridge.is_cancelled() || Instant::now() >= self.deadline
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Build an engine with limits and the host API bound to `run`
pub(crate) fn build_engine(
    run: &Arc<RunState>,
    options: &SandboxOptions,
) -> Result<Engine, ParseError> {
    let mut engine = Engine::new();
    apply_limits(&mut engine, options);

    register_io(&mut engine, run);
    register_termination(&mut engine, run)?;
    register_text(&mut engine, run);
    register_queries(&mut engine, run);

    Ok(engine)
}

fn apply_limits(engine: &mut Engine, options: &SandboxOptions) {
    // No filesystem module loading and no dynamic code
    engine.set_module_resolver(DummyModuleResolver::new());
    engine.disable_symbol("eval");

    // Advisory memory ceiling, mapped onto container sizes; rhai reads 0 as unlimited
    let bytes = options.memory_limit_mb.max(1).saturating_mul(1024 * 1024);
    engine.set_max_string_size(bytes);
    engine.set_max_array_size(bytes / 64);
    engine.set_max_map_size(bytes / 64);

    engine.set_max_call_levels(64);
    engine.set_max_expr_depths(128, 64);
}

fn register_io(engine: &mut Engine, run: &Arc<RunState>) {
    let r = Arc::clone(run);
    engine.on_print(move |s| r.output.lock().push_line(s));

    let r = Arc::clone(run);
    engine.on_debug(move |s, _, _| r.output.lock().push_line(s));

    let r = Arc::clone(run);
    engine.on_progress(move |ops| {
        if ops & PROGRESS_CHECK_MASK == 0 && r.should_stop() {
            Some(Dynamic::from("terminated".to_string()))
        } else {
            None
        }
    });

    let r = Arc::clone(run);
    engine.register_fn("sleep", move |ms: INT| {
        let wanted = Duration::from_millis(clamp(ms).min(MAX_SLEEP_MS as usize) as u64);
        std::thread::sleep(wanted.min(r.remaining()));
    });
}

fn register_termination(engine: &mut Engine, run: &Arc<RunState>) -> Result<(), ParseError> {
    let r = Arc::clone(run);
    engine.register_fn("FINAL", move |value: Dynamic| {
        *r.termination.lock() = Some(TerminationSignal::direct(render_value(&value)));
    });

    // Syntax rather than a function so a bare identifier arrives as a name,
    // not as the value it holds
    let r = Arc::clone(run);
    engine.register_custom_syntax(
        ["FINAL_VAR", "(", "$expr$", ")"],
        false,
        move |context, inputs| {
            let signal = match inputs[0].get_variable_name() {
                Some(name) => {
                    let held = context.scope().get(name).map(render_value);
                    TerminationSignal::variable(name).with_fallback(held)
                }
                None => final_var_signal(&context.eval_expression_tree(&inputs[0])?),
            };
            *r.termination.lock() = Some(signal);
            Ok(Dynamic::UNIT)
        },
    )?;
    Ok(())
}

/// `FINAL_VAR` with an evaluated argument: a string names the variable,
/// anything else is the answer itself
fn final_var_signal(value: &Dynamic) -> TerminationSignal {
    if value.is_string() {
        TerminationSignal::variable(clean_name(&value.to_string()))
    } else {
        TerminationSignal::direct(render_value(value))
    }
}

fn register_text(engine: &mut Engine, run: &Arc<RunState>) {
    let ctx = Arc::clone(&run.context);
    engine.register_fn("head", move |n: INT| to_array(text::head(&ctx, clamp(n))));
    engine.register_fn("head", |t: &str, n: INT| to_array(text::head(t, clamp(n))));

    let ctx = Arc::clone(&run.context);
    engine.register_fn("tail", move |n: INT| to_array(text::tail(&ctx, clamp(n))));
    engine.register_fn("tail", |t: &str, n: INT| to_array(text::tail(t, clamp(n))));

    let ctx = Arc::clone(&run.context);
    engine.register_fn("lines", move || to_array(text::lines(&ctx)));
    engine.register_fn("lines", |t: &str| to_array(text::lines(t)));

    let ctx = Arc::clone(&run.context);
    engine.register_fn("grep", move |pattern: &str| to_array(text::grep(&ctx, pattern)));
    engine.register_fn("grep", |t: &str, pattern: &str| to_array(text::grep(t, pattern)));

    let ctx = Arc::clone(&run.context);
    engine.register_fn("count", move |pattern: &str| text::count(&ctx, pattern) as INT);
    engine.register_fn("count", |t: &str, pattern: &str| text::count(t, pattern) as INT);

    let ctx = Arc::clone(&run.context);
    engine.register_fn("slice", move |start: INT, end: INT| {
        text::slice(&ctx, clamp(start), clamp(end))
    });
    engine.register_fn("slice", |t: &str, start: INT, end: INT| {
        text::slice(t, clamp(start), clamp(end))
    });

    let ctx = Arc::clone(&run.context);
    engine.register_fn("window", move |size: INT, index: INT| {
        text::window(&ctx, clamp(size), clamp(index))
    });
    engine.register_fn("window", |t: &str, size: INT, index: INT| {
        text::window(t, clamp(size), clamp(index))
    });

    let ctx = Arc::clone(&run.context);
    engine.register_fn("chunks", move |n: INT| to_array(text::chunks(&ctx, clamp(n))));
    engine.register_fn("chunks", |t: &str, n: INT| to_array(text::chunks(t, clamp(n))));

    let ctx = Arc::clone(&run.context);
    engine.register_fn("context_len", move || text::char_len(&ctx) as INT);
}

fn register_queries(engine: &mut Engine, run: &Arc<RunState>) {
    let b = run.bridge.clone();
    engine.register_fn("llm_query", move |prompt: &str| -> ScriptResult<String> {
        b.query(SubQueryRequest::new(prompt, None))
            .map_err(Into::into)
    });

    let b = run.bridge.clone();
    engine.register_fn(
        "llm_query",
        move |prompt: &str, context: Dynamic| -> ScriptResult<String> {
            b.query(SubQueryRequest::new(prompt, dynamic_to_json(&context)))
                .map_err(Into::into)
        },
    );

    engine.register_type_with_name::<QueryTicket>("QueryTicket");
    engine.register_fn("wait", |ticket: &mut QueryTicket| -> ScriptResult<String> {
        ticket.wait().map_err(Into::into)
    });
    engine.register_fn("is_ready", |ticket: &mut QueryTicket| ticket.is_ready());

    let b = run.bridge.clone();
    engine.register_fn("llm_query_async", move |prompt: &str| {
        b.query_async(SubQueryRequest::new(prompt, None))
    });

    let b = run.bridge.clone();
    engine.register_fn("llm_query_async", move |prompt: &str, context: Dynamic| {
        b.query_async(SubQueryRequest::new(prompt, dynamic_to_json(&context)))
    });

    let b = run.bridge.clone();
    engine.register_fn("llm_query_batch", move |items: Array| -> ScriptResult<Array> {
        let requests = items
            .into_iter()
            .map(batch_request)
            .collect::<Result<Vec<_>, String>>()?;
        let answers = b.query_batch(requests)?;
        Ok(to_array(answers))
    });
}

fn batch_request(item: Dynamic) -> Result<SubQueryRequest, String> {
    if item.is_string() {
        return Ok(SubQueryRequest::new(item.to_string(), None));
    }
    let type_name = item.type_name();
    let Some(map) = item.try_cast::<Map>() else {
        return Err(format!(
            "llm_query_batch items must be strings or #{{prompt, context}} maps, got {}",
            type_name
        ));
    };
    let prompt = map
        .get("prompt")
        .filter(|p| p.is_string())
        .map(|p| p.to_string())
        .ok_or_else(|| "llm_query_batch map item needs a string `prompt`".to_string())?;
    let context = map.get("context").and_then(dynamic_to_json);
    Ok(SubQueryRequest::new(prompt, context))
}

fn clamp(n: INT) -> usize {
    usize::try_from(n).unwrap_or(0)
}

fn to_array(items: Vec<String>) -> Array {
    items.into_iter().map(Dynamic::from).collect()
}

fn clean_name(name: &str) -> String {
    name.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim()
        .to_string()
}

/// Script value to JSON, `None` for unit
pub(crate) fn dynamic_to_json(value: &Dynamic) -> Option<serde_json::Value> {
    if value.is_unit() {
        return None;
    }
    if value.is_string() {
        return Some(serde_json::Value::String(value.to_string()));
    }
    Some(
        rhai::serde::from_dynamic::<serde_json::Value>(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string())),
    )
}

/// Text form of a value passed to `FINAL`
pub(crate) fn render_value(value: &Dynamic) -> String {
    match dynamic_to_json(value) {
        None => String::new(),
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
    }
}
