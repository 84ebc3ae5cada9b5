//! Removal of image references from retrieved text.
//!
//! Judges render their prompt templates as markdown; an image embed or a bare
//! image path inside retrieved text makes some of them try to load the file.
//! The sanitizer strips those spans and tidies only the whitespace a removal
//! leaves behind. Everything else passes through byte for byte.

use crate::config::SanitizerConfig;
use crate::error::{EvalError, Result, SanitizationError};
use regex::Regex;

/// Characters that end a path token.
const TOKEN_DELIMITERS: &[char] = &[
    '(', ')', '[', ']', '<', '>', '"', '\'', '`', '{', '}', '|', ',', ';',
];

/// Punctuation that may directly follow a path token at the end of a clause.
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?'];

/// Characters before which a leftover space is redundant.
const CLOSERS: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']'];

#[derive(Debug, Clone)]
enum Rule {
    /// Every match is removed.
    Span(Regex),
    /// Matches are removed only when they form a whole token.
    Token(Regex),
}

/// Configured set of image-reference patterns.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    rules: Vec<Rule>,
    max_input_bytes: Option<usize>,
}

impl Sanitizer {
    /// Compile the configured patterns. Invalid user patterns are a configuration error.
    pub fn new(config: &SanitizerConfig) -> Result<Self> {
        let mut rules = Vec::new();

        if config.strip_markdown_images {
            // Alt text and targets may hold one level of nested brackets, as in `fig(1).png`.
            rules.push(Rule::Span(compile(
                r"!\[(?:[^\[\]\n]|\[[^\[\]\n]*\])*\]\((?:[^()\n]|\([^()\n]*\))*\)",
            )?));
            rules.push(Rule::Span(compile(
                r"!\[(?:[^\[\]\n]|\[[^\[\]\n]*\])*\]\[[^\[\]\n]*\]",
            )?));
        }

        if config.strip_html_images {
            rules.push(Rule::Span(compile(r"(?i)<img\b[^>]*>")?));
        }

        let extensions: Vec<String> = config
            .image_extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.'))
            .filter(|ext| !ext.is_empty())
            .map(regex::escape)
            .collect();

        if config.strip_bare_paths && !extensions.is_empty() {
            let pattern = format!(
                r#"(?i)[^\s()\[\]<>"'`{{}}|,;]+\.(?:{})"#,
                extensions.join("|")
            );
            rules.push(Rule::Token(compile(&pattern)?));
        }

        for pattern in &config.extra_patterns {
            rules.push(Rule::Span(compile(pattern)?));
        }

        Ok(Self {
            rules,
            max_input_bytes: config.max_input_bytes,
        })
    }

    /// Strip image references from `text`.
    ///
    /// Removal repeats until nothing matches, so the output is always a fixed
    /// point: sanitizing it again returns it unchanged.
    pub fn sanitize(&self, text: &str) -> std::result::Result<String, SanitizationError> {
        if let Some(limit) = self.max_input_bytes {
            if text.len() > limit {
                return Err(SanitizationError::InputTooLarge {
                    len: text.len(),
                    limit,
                });
            }
        }

        let mut current = text.to_string();
        loop {
            let next = self.pass(&current);
            if next == current {
                return Ok(current);
            }
            current = next;
        }
    }

    /// Whether any rule matches `text`.
    pub fn has_image_reference(&self, text: &str) -> bool {
        self.rules.iter().any(|rule| !spans(rule, text).is_empty())
    }

    fn pass(&self, text: &str) -> String {
        let mut current = text.to_string();
        for rule in &self.rules {
            let found = spans(rule, &current);
            if !found.is_empty() {
                current = remove_spans(&current, &found);
            }
        }
        current
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| EvalError::config(format!("Invalid sanitizer pattern '{}': {}", pattern, e)))
}

fn spans(rule: &Rule, text: &str) -> Vec<(usize, usize)> {
    match rule {
        Rule::Span(re) => re
            .find_iter(text)
            .filter(|m| !m.is_empty())
            .map(|m| (m.start(), m.end()))
            .collect(),
        Rule::Token(re) => re
            .find_iter(text)
            .filter(|m| starts_token(text, m.start()) && ends_token(text, m.end()))
            .map(|m| (m.start(), m.end()))
            .collect(),
    }
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || TOKEN_DELIMITERS.contains(&c)
}

fn starts_token(text: &str, start: usize) -> bool {
    text[..start].chars().next_back().is_none_or(is_delimiter)
}

fn ends_token(text: &str, end: usize) -> bool {
    let mut rest = text[end..].chars();
    match rest.next() {
        None => true,
        Some(c) if is_delimiter(c) => true,
        // `see chart.png.` ends a sentence, `chart.png.bak` is another file
        Some(c) if TRAILING_PUNCTUATION.contains(&c) => rest.next().is_none_or(is_delimiter),
        Some(_) => false,
    }
}

/// Whether a space right before `next` would be redundant: `next` is empty,
/// starts a new line, or is closing punctuation that ends a word.
fn closes_clause(next: &str) -> bool {
    let mut chars = next.chars();
    match chars.next() {
        None | Some('\n') | Some('\r') => true,
        Some(c) if CLOSERS.contains(&c) => chars.next().is_none_or(char::is_whitespace),
        Some(_) => false,
    }
}

/// Cut non-overlapping, ordered spans out of `text`.
fn remove_spans(text: &str, spans: &[(usize, usize)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    for &(start, end) in spans {
        out.push_str(&text[cursor..start]);
        cursor = end;

        let left_space = out.ends_with([' ', '\t']);
        let line_start = out.is_empty() || out.ends_with('\n');

        if left_space || line_start {
            let rest = &text[cursor..];
            cursor += rest.len() - rest.trim_start_matches([' ', '\t']).len();
        }

        let next = &text[cursor..];
        if left_space && closes_clause(next) {
            let kept = out.trim_end_matches([' ', '\t']).len();
            out.truncate(kept);
        }
    }

    out.push_str(&text[cursor..]);
    out
}
