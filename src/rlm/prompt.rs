//! Prompts for the REPL loop

use super::chunker::{self, ContentType};
use super::sandbox::MAX_SLEEP_MS;

/// Size and shape of an input, shown to the model up front
#[derive(Debug, Clone)]
pub struct ContextSummary {
    pub chars: usize,
    pub lines: usize,
    pub estimated_tokens: usize,
    pub content_type: ContentType,
    pub preview: String,
}

impl ContextSummary {
    pub fn new(text: &str, preview_lines: usize) -> Self {
        Self {
            chars: text.chars().count(),
            lines: text.lines().count(),
            estimated_tokens: chunker::estimate_tokens(text),
            content_type: chunker::detect_content_type(text),
            preview: text.lines().take(preview_lines).collect::<Vec<_>>().join("\n"),
        }
    }
}

/// System prompt for an invocation at `depth`
pub fn system_prompt(summary: &ContextSummary, depth: usize, max_depth: usize) -> String {
    let recursion = if depth < max_depth {
        "- llm_query(prompt) / llm_query(prompt, ctx): ask a sub-model; ctx narrows its input\n\
         - llm_query_async(prompt[, ctx]) returns a ticket; call ticket.wait() for the answer\n\
         - llm_query_batch([prompt, #{prompt: p, context: c}, ...]): answers in request order\n"
    } else {
        "- llm_query and its variants are unavailable at this depth; answer from the input\n"
    };

    format!(
        "You answer questions about an input that is too large to read at once. \
         Explore it by writing rhai code in ```repl fenced blocks. Each block runs \
         in a persistent sandbox and its printed output comes back to you.\n\n\
         The input is bound to the constant `context`.\n\n\
         Available functions:\n\
         - print(value): show a value in the next turn\n\
         - head(n), tail(n): first/last n lines as an array\n\
         - lines(): all lines; context_len(): length in characters\n\
         - grep(pattern): lines matching a regex, prefixed with their line number\n\
         - count(pattern): number of regex matches\n\
         - slice(start, end): characters start..end\n\
         - window(size, index): the index-th window of size characters\n\
         - chunks(n): split into n pieces by lines\n\
         - each helper also accepts an explicit text first, e.g. grep(text, pattern)\n\
         {recursion}\
         - sleep(ms): pause, at most {max_sleep} ms\n\n\
         When you know the answer, finish with FINAL(\"answer\") in plain text, or store \
         it in a variable and write FINAL_VAR(\"name\").\n\n\
         Input: {chars} chars, {lines} lines, about {tokens} tokens.\n\
         {hint}\n\n\
         Preview:\n{preview}",
        recursion = recursion,
        max_sleep = MAX_SLEEP_MS,
        chars = summary.chars,
        lines = summary.lines,
        tokens = summary.estimated_tokens,
        hint = chunker::processing_hint(summary.content_type),
        preview = summary.preview,
    )
}

/// First user turn
pub fn query_prompt(query: &str) -> String {
    format!("Analyze the input and answer: {}", query)
}

/// Sent when a response had neither code nor a final answer
pub const NUDGE: &str = "Your last message contained neither a ```repl code block nor a \
FINAL(...) / FINAL_VAR(...) call. Either run code to explore the input or give your final answer.";

/// Sent when `FINAL_VAR` named a variable that does not exist
pub fn undefined_variable(name: &str) -> String {
    format!(
        "Error: variable '{}' is not defined in the sandbox. Assign it in a ```repl block first, \
         or answer directly with FINAL(\"...\").",
        name
    )
}

/// Render a sandbox run as the next user turn
pub fn render_execution(output: &str, error: Option<&str>, max_chars: usize) -> String {
    let mut text = String::new();
    if !output.trim().is_empty() {
        text.push_str("Execution result:\n");
        text.push_str(output.trim_end());
    }
    if let Some(error) = error {
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str("Error: ");
        text.push_str(error);
    }
    if text.is_empty() {
        return "[No output]".to_string();
    }
    truncate(&text, max_chars)
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}\n... [truncated]", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_and_previews() {
        let text = "a\nb\nc\nd";
        let summary = ContextSummary::new(text, 2);
        assert_eq!(summary.chars, 7);
        assert_eq!(summary.lines, 4);
        assert_eq!(summary.preview, "a\nb");
    }

    #[test]
    fn leaf_prompt_disables_recursion() {
        let summary = ContextSummary::new("x", 1);
        assert!(system_prompt(&summary, 0, 1).contains("llm_query_batch"));
        assert!(system_prompt(&summary, 1, 1).contains("unavailable at this depth"));
    }

    #[test]
    fn render_sections() {
        assert_eq!(render_execution("", None, 100), "[No output]");
        assert_eq!(render_execution("4\n", None, 100), "Execution result:\n4");
        assert_eq!(
            render_execution("partial\n", Some("boom"), 100),
            "Execution result:\npartial\n\nError: boom"
        );
        assert_eq!(render_execution("", Some("boom"), 100), "Error: boom");
    }

    #[test]
    fn render_truncates() {
        let rendered = render_execution(&"x".repeat(50), None, 20);
        assert!(rendered.ends_with("[truncated]"));
        assert!(rendered.len() < 50);
    }
}
