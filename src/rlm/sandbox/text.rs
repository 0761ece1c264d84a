//! Context text helpers exposed to scripts
//!
//! Plain functions over `&str` so they can be registered with the engine
//! both as context-implicit (`head(5)`) and explicit (`head(text, 5)`) forms.

use regex::Regex;

/// First `n` lines
pub fn head(text: &str, n: usize) -> Vec<String> {
    text.lines().take(n).map(str::to_string).collect()
}

/// Last `n` lines
pub fn tail(text: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|s| s.to_string()).collect()
}

pub fn lines(text: &str) -> Vec<String> {
    text.lines().map(str::to_string).collect()
}

/// Lines matching a pattern, prefixed with their 1-based line number
///
/// Invalid regexes fall back to a substring match.
pub fn grep(text: &str, pattern: &str) -> Vec<String> {
    let matcher: Box<dyn Fn(&str) -> bool> = match Regex::new(pattern) {
        Ok(re) => Box::new(move |line: &str| re.is_match(line)),
        Err(_) => {
            let needle = pattern.to_string();
            Box::new(move |line: &str| line.contains(needle.as_str()))
        }
    };

    text.lines()
        .enumerate()
        .filter(|(_, line)| matcher(line))
        .map(|(i, line)| format!("{}: {}", i + 1, line))
        .collect()
}

/// Count occurrences of a pattern
pub fn count(text: &str, pattern: &str) -> usize {
    match Regex::new(pattern) {
        Ok(re) => re.find_iter(text).count(),
        Err(_) if pattern.is_empty() => 0,
        Err(_) => text.matches(pattern).count(),
    }
}

/// Slice by character positions, clamped to the text
pub fn slice(text: &str, start: usize, end: usize) -> String {
    let end = end.max(start);
    text.chars().skip(start).take(end - start).collect()
}

/// The `index`-th window of `size` characters
pub fn window(text: &str, size: usize, index: usize) -> String {
    if size == 0 {
        return String::new();
    }
    let start = size.saturating_mul(index);
    slice(text, start, start.saturating_add(size))
}

/// Split into `n` chunks of roughly equal line counts
pub fn chunks(text: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    if n <= 1 || lines.is_empty() {
        return vec![text.to_string()];
    }

    let chunk_size = lines.len().div_ceil(n);
    lines.chunks(chunk_size).map(|c| c.join("\n")).collect()
}

/// Character length
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> String {
        (1..=n)
            .map(|i| format!("line {}", i))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn head_and_tail() {
        let text = numbered(100);
        let h = head(&text, 5);
        assert_eq!(h.len(), 5);
        assert_eq!(h[0], "line 1");

        let t = tail(&text, 5);
        assert_eq!(t.len(), 5);
        assert_eq!(t[4], "line 100");

        assert_eq!(tail(&text, 500).len(), 100);
    }

    #[test]
    fn grep_numbers_matches() {
        let text = "error: something failed\ninfo: all good\nerror: another failure";
        let matches = grep(text, "^error");
        assert_eq!(matches, vec!["1: error: something failed", "3: error: another failure"]);
    }

    #[test]
    fn grep_falls_back_to_substring() {
        let text = "call foo(\nother";
        assert_eq!(grep(text, "foo("), vec!["1: call foo("]);
        assert_eq!(count(text, "foo("), 1);
    }

    #[test]
    fn slice_is_char_safe() {
        let text = "héllo wörld";
        assert_eq!(slice(text, 0, 5), "héllo");
        assert_eq!(slice(text, 6, 100), "wörld");
        assert_eq!(slice(text, 8, 3), "");
    }

    #[test]
    fn windows_cover_text() {
        let text = "abcdefghij";
        assert_eq!(window(text, 4, 0), "abcd");
        assert_eq!(window(text, 4, 2), "ij");
        assert_eq!(window(text, 4, 9), "");
        assert_eq!(window(text, 0, 0), "");
    }

    #[test]
    fn chunks_split_by_lines() {
        let text = numbered(100);
        let parts = chunks(&text, 5);
        assert_eq!(parts.len(), 5);
        assert!(parts[0].starts_with("line 1\n"));
        assert_eq!(chunks(&text, 0), vec![text.clone()]);
    }
}
