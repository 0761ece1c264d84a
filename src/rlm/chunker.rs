//! Content profiling for the root prompt
//!
//! Cheap heuristics that tell the model what kind of input it is exploring
//! and roughly how large it is.

use serde::{Deserialize, Serialize};

/// Primary kind of an input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Code,
    Documents,
    Logs,
    Conversation,
    Mixed,
}

/// Lines sampled from each end of the input
const SAMPLE_EACH_END: usize = 100;

/// Estimate token count (roughly 4 chars per token)
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

#[derive(Debug, Default)]
struct Indicators {
    code: usize,
    logs: usize,
    conversation: usize,
    documents: usize,
}

impl Indicators {
    fn total(&self) -> usize {
        self.code + self.logs + self.conversation + self.documents
    }
}

/// Classify content by sampling its head and tail
pub fn detect_content_type(content: &str) -> ContentType {
    let lines: Vec<&str> = content.lines().collect();
    let each_end = SAMPLE_EACH_END.min(lines.len() / 2 + lines.len() % 2);

    let mut seen = Indicators::default();
    let head = lines.iter().take(each_end);
    let tail = lines.iter().skip(each_end).rev().take(each_end);
    for line in head.chain(tail) {
        let line = line.trim();
        seen.code += is_code_line(line) as usize;
        seen.logs += is_log_line(line) as usize;
        seen.conversation += is_conversation_line(line) as usize;
        seen.documents += is_document_line(line) as usize;
    }

    let total = seen.total();
    if total == 0 {
        return ContentType::Mixed;
    }

    // Conversation and logs win ties: their markers are the most specific
    let threshold = total * 3 / 10;
    if seen.conversation > threshold {
        ContentType::Conversation
    } else if seen.logs > threshold {
        ContentType::Logs
    } else if seen.code > threshold {
        ContentType::Code
    } else if seen.documents > threshold {
        ContentType::Documents
    } else {
        ContentType::Mixed
    }
}

fn is_code_line(line: &str) -> bool {
    const STARTS: &[&str] = &[
        "function", "class ", "def ", "const ", "let ", "var ", "import ", "export ", "async ",
        "fn ", "impl ", "struct ", "enum ", "pub ", "use ", "mod ", "trait ", "//", "/*",
    ];
    STARTS.iter().any(|p| line.starts_with(p))
        || matches!(line, "{" | "}" | "(" | ")" | ";" | "{}" | "};")
}

fn is_log_line(line: &str) -> bool {
    let bytes = line.as_bytes();
    // 2024-01-01...
    if bytes.len() >= 10 && bytes[..4].iter().all(u8::is_ascii_digit) && bytes[4] == b'-' {
        return true;
    }
    // [12:00:01] ...
    if bytes.len() > 5 && bytes[0] == b'[' && bytes[1].is_ascii_digit() {
        return true;
    }
    ["INFO", "DEBUG", "WARN", "ERROR", "FATAL", "TRACE"]
        .iter()
        .any(|level| line.starts_with(level) || line.contains(&format!(" {} ", level)))
}

fn is_conversation_line(line: &str) -> bool {
    const STARTS: &[&str] = &[
        "[User]:", "[Assistant]:", "[Human]:", "[AI]:", "User:", "Assistant:", "Human:", "AI:",
        "<user>", "<assistant>", "<system>",
    ];
    STARTS.iter().any(|p| line.starts_with(p))
}

fn is_document_line(line: &str) -> bool {
    if line.starts_with("# ") || line.starts_with("##") {
        return true;
    }
    if line.starts_with("> ") || (line.starts_with("- ") && line.len() > 3) {
        return true;
    }
    // long prose without code terminators
    line.len() > 80 && !line.ends_with(['{', ';', '(', ')', '='])
}

/// Exploration hint for the model
pub fn processing_hint(content_type: ContentType) -> &'static str {
    match content_type {
        ContentType::Code => {
            "The input looks like source code. Locate definitions with grep, \
             then read the relevant regions with slice or window."
        }
        ContentType::Logs => {
            "The input looks like log output. Grep for ERROR/WARN lines and \
             timestamps before reading surrounding regions."
        }
        ContentType::Conversation => {
            "The input looks like a conversation transcript. Find the original \
             request first, then follow decisions and their outcomes."
        }
        ContentType::Documents => {
            "The input looks like prose or documentation. Map the headings \
             first, then read the sections that matter."
        }
        ContentType::Mixed => {
            "The input has mixed content. Sample the head, tail and a few \
             windows to learn its structure before answering."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_code() {
        let content = r#"
fn main() {
    println!("Hello, world!");
}

impl Foo {
    pub fn new() -> Self {
        Self {}
    }
}
"#;
        assert_eq!(detect_content_type(content), ContentType::Code);
    }

    #[test]
    fn detects_conversation() {
        let content = "[User]: Can you help me with this?\n\n\
                       [Assistant]: Of course! What do you need?\n\n\
                       [User]: I want to implement a feature.\n";
        assert_eq!(detect_content_type(content), ContentType::Conversation);
    }

    #[test]
    fn detects_logs() {
        let content = (0..20)
            .map(|i| format!("2024-05-01T10:00:{:02}Z INFO worker started job {}", i, i))
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(detect_content_type(&content), ContentType::Logs);
    }

    #[test]
    fn empty_input_is_mixed() {
        assert_eq!(detect_content_type(""), ContentType::Mixed);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
