//! Model output parser
//!
//! Splits a raw model response into narrative ("thinking"), executable code
//! taken from fenced blocks, and an optional termination call.
//!
//! Termination calls (`FINAL(...)` / `FINAL_VAR(...)`) are located with a
//! balanced-delimiter scan rather than a regex, so nested expressions such as
//! `FINAL(to_string(40 + 2))` and quoted parentheses are handled correctly.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Fence tags treated as executable script
const SCRIPT_TAGS: &[&str] = &["", "repl", "rhai", "script", "js", "javascript"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationKind {
    /// `FINAL(value)`: the payload is the answer
    DirectValue,
    /// `FINAL_VAR(name)`: the payload names a sandbox variable
    VariableReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationSignal {
    pub kind: TerminationKind,
    pub payload: String,
    /// Value the named variable held when code called `FINAL_VAR`, used
    /// when the name is no longer in scope after the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

impl TerminationSignal {
    pub fn direct(payload: impl Into<String>) -> Self {
        Self {
            kind: TerminationKind::DirectValue,
            payload: payload.into(),
            fallback: None,
        }
    }

    pub fn variable(name: impl Into<String>) -> Self {
        Self {
            kind: TerminationKind::VariableReference,
            payload: name.into(),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, value: Option<String>) -> Self {
        self.fallback = value;
        self
    }
}

/// Result of parsing one model response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOutput {
    pub thinking: Option<String>,
    pub code: Option<String>,
    /// Termination found in plain text (outside any fenced block)
    pub termination: Option<TerminationSignal>,
}

/// A balanced termination call located in text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationCall {
    pub kind: TerminationKind,
    /// Byte span of the full match, keyword included
    pub span: Range<usize>,
    /// Text between the outer parentheses
    pub inner: String,
    /// Full matched text, keyword included
    pub full: String,
}

impl TerminationCall {
    pub fn signal(&self) -> TerminationSignal {
        TerminationSignal {
            kind: self.kind,
            payload: strip_wrapping_quotes(&self.inner).to_string(),
            fallback: None,
        }
    }
}

#[derive(Debug)]
struct Fence {
    /// Opening fence line start
    start: usize,
    body: Range<usize>,
}

/// Parse a model response
pub fn parse(text: &str) -> ParsedOutput {
    let fences = find_fences(text);

    let thinking = fences
        .first()
        .map(|f| text[..f.start].trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    let mut code = if fences.is_empty() {
        None
    } else {
        let joined = fences
            .iter()
            .map(|f| text[f.body.clone()].trim_end())
            .filter(|body| !body.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        (!joined.is_empty()).then_some(joined)
    };

    let mut termination = None;
    for call in find_termination_calls(text) {
        let in_fence = fences
            .iter()
            .any(|f| call.span.start >= f.body.start && call.span.end <= f.body.end);
        if in_fence {
            // Produced by running the code instead
            continue;
        }
        if let Some(c) = code.as_mut() {
            strip_call(c, &call.full);
        }
        termination = Some(call.signal());
        break;
    }

    if code.as_deref().is_some_and(|c| c.trim().is_empty()) {
        code = None;
    }

    ParsedOutput {
        thinking,
        code,
        termination,
    }
}

fn find_fences(text: &str) -> Vec<Fence> {
    let mut fences = Vec::new();
    // (fence start, body start, executable)
    let mut open: Option<(usize, usize, bool)> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        let trimmed = line.trim_start();
        let Some(after) = trimmed.strip_prefix("```") else {
            continue;
        };

        match open.take() {
            None => {
                let tag = after
                    .trim_start_matches('`')
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .to_ascii_lowercase();
                open = Some((line_start, offset, SCRIPT_TAGS.contains(&tag.as_str())));
            }
            Some((start, body_start, executable)) => {
                if executable {
                    fences.push(Fence {
                        start,
                        body: body_start..line_start,
                    });
                }
            }
        }
    }

    // Unterminated trailing fence runs to the end of the text
    if let Some((start, body_start, true)) = open {
        fences.push(Fence {
            start,
            body: body_start..text.len(),
        });
    }

    fences
}

/// Locate every balanced `FINAL(...)` / `FINAL_VAR(...)` call, in text order
pub fn find_termination_calls(text: &str) -> Vec<TerminationCall> {
    let bytes = text.as_bytes();
    let mut calls = Vec::new();
    let mut from = 0;

    while let Some(rel) = text[from..].find("FINAL") {
        let start = from + rel;
        from = start + "FINAL".len();

        if start > 0 && is_ident_byte(bytes[start - 1]) {
            continue;
        }

        let rest = &text[from..];
        let (kind, open) = if rest.starts_with("_VAR(") {
            (TerminationKind::VariableReference, from + "_VAR".len())
        } else if rest.starts_with('(') {
            (TerminationKind::DirectValue, from)
        } else {
            continue;
        };

        let Some(close) = scan_balanced(text, open) else {
            continue;
        };

        calls.push(TerminationCall {
            kind,
            span: start..close + 1,
            inner: text[open + 1..close].to_string(),
            full: text[start..close + 1].to_string(),
        });
        from = close + 1;
    }

    calls
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Find the `)` closing the `(` at byte index `open`
fn scan_balanced(text: &str, open: usize) -> Option<usize> {
    let base = open + 1;
    let mut chars = text[base..].char_indices();
    let mut depth = 1usize;
    let mut prev = '(';

    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(base + i);
                }
            }
            '"' | '`' => skip_literal(&mut chars, c)?,
            // an apostrophe inside a word does not open a literal
            '\'' if !prev.is_alphanumeric() => skip_literal(&mut chars, c)?,
            _ => {}
        }
        prev = c;
    }

    None
}

fn skip_literal(chars: &mut std::str::CharIndices<'_>, quote: char) -> Option<()> {
    while let Some((_, c)) = chars.next() {
        if c == '\\' {
            chars.next();
        } else if c == quote {
            return Some(());
        }
    }
    None
}

/// Remove one layer of quotes when they wrap the whole value
fn strip_wrapping_quotes(inner: &str) -> &str {
    let s = inner.trim();
    let Some(q) = s.chars().next() else {
        return s;
    };
    if !matches!(q, '"' | '\'' | '`') || s.len() < 2 || !s.ends_with(q) {
        return s;
    }

    let last = s.len() - q.len_utf8();
    let mut chars = s.char_indices().skip(1);
    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            chars.next();
        } else if c == q {
            if i == last {
                return s[q.len_utf8()..last].trim();
            }
            return s;
        }
    }
    s
}

/// Remove a plain-text termination call from extracted code
fn strip_call(code: &mut String, full: &str) {
    let Some(pos) = code.find(full) else {
        return;
    };
    let mut end = pos + full.len();
    let rest = &code[end..];
    let after_ws = rest.trim_start_matches([' ', '\t']);
    if after_ws.starts_with(';') {
        end += rest.len() - after_ws.len() + 1;
    }
    code.replace_range(pos..end, "");
    let trimmed = code.trim_end().to_string();
    *code = trimmed;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_final_is_authoritative() {
        let parsed = parse(r#"The answer is clear. FINAL("X")"#);
        assert_eq!(parsed.termination, Some(TerminationSignal::direct("X")));
        assert!(parsed.code.is_none());
        assert!(parsed.thinking.is_none());
    }

    #[test]
    fn plain_final_is_removed_from_code() {
        let text = "```repl\nlet a = 1;\n```\nDone: FINAL(\"X\")";
        let parsed = parse(text);
        assert_eq!(parsed.termination, Some(TerminationSignal::direct("X")));
        let code = parsed.code.unwrap();
        assert!(!code.contains("FINAL"));
        assert_eq!(code, "let a = 1;");
    }

    #[test]
    fn nested_call_is_scanned_to_matching_paren() {
        let calls = find_termination_calls("FINAL(String(40+2))");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].inner, "String(40+2)");
        assert_eq!(calls[0].signal().payload, "String(40+2)");
    }

    #[test]
    fn escaped_quote_does_not_close_literal() {
        let text = r#"FINAL("He said \")\" ")"#;
        let calls = find_termination_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].full, text);
        assert_eq!(calls[0].inner, r#""He said \")\" ""#);
        assert_eq!(calls[0].signal().payload, r#"He said \")\""#);
    }

    #[test]
    fn final_inside_fence_is_deferred() {
        let text = "Compute it.\n```repl\nlet result = 6 * 7;\nFINAL_VAR(\"result\");\n```\n";
        let parsed = parse(text);
        assert!(parsed.termination.is_none());
        let code = parsed.code.unwrap();
        assert!(code.contains("FINAL_VAR(\"result\");"));
        assert_eq!(parsed.thinking.as_deref(), Some("Compute it."));
    }

    #[test]
    fn final_var_payload_is_a_name() {
        let parsed = parse("FINAL_VAR(summary)");
        assert_eq!(parsed.termination, Some(TerminationSignal::variable("summary")));
        let parsed = parse("FINAL_VAR('summary')");
        assert_eq!(parsed.termination, Some(TerminationSignal::variable("summary")));
    }

    #[test]
    fn unbalanced_call_degrades_to_no_signal() {
        let parsed = parse("FINAL(\"never closed");
        assert!(parsed.termination.is_none());
        let parsed = parse("FINAL((1 + 2)");
        assert!(parsed.termination.is_none());
    }

    #[test]
    fn keyword_must_be_a_whole_word() {
        assert!(find_termination_calls("NOT_FINAL(\"x\")").is_empty());
        assert!(find_termination_calls("myFINAL(\"x\")").is_empty());
    }

    #[test]
    fn partially_quoted_value_is_kept_verbatim() {
        let parsed = parse(r#"FINAL("a" + "b")"#);
        assert_eq!(parsed.termination.unwrap().payload, r#""a" + "b""#);
    }

    #[test]
    fn apostrophe_in_prose_does_not_open_literal() {
        let parsed = parse("FINAL(it's 4)");
        assert_eq!(parsed.termination, Some(TerminationSignal::direct("it's 4")));
    }

    #[test]
    fn multiple_script_blocks_are_concatenated() {
        let text = "first\n```rhai\nlet a = 1;\n```\nthen\n```\nprint(a);\n```\n```json\n{\"x\": 1}\n```";
        let parsed = parse(text);
        assert_eq!(parsed.code.as_deref(), Some("let a = 1;\n\nprint(a);"));
        assert_eq!(parsed.thinking.as_deref(), Some("first"));
    }

    #[test]
    fn unterminated_fence_runs_to_end() {
        let parsed = parse("```repl\nprint(head(3));");
        assert_eq!(parsed.code.as_deref(), Some("print(head(3));"));
    }

    #[test]
    fn no_fence_means_no_code() {
        let parsed = parse("I need to think about this more.");
        assert_eq!(parsed, ParsedOutput::default());
    }

    #[test]
    fn earliest_plain_text_call_wins() {
        let parsed = parse("FINAL_VAR(x) and later FINAL(\"y\")");
        assert_eq!(parsed.termination, Some(TerminationSignal::variable("x")));
    }
}
