//! Best-effort conversion of noisy model output into one JSON value.
//!
//! Strategies run in a fixed order and the first that parses wins, so the same
//! input always takes the same path:
//!
//! 1. strip fences and a leading bare `json` word, then parse the outermost
//!    container span;
//! 2. close unterminated quotes and append the missing closing markers;
//! 3. remove every fence marker in the text and parse what is left;
//! 4. drop a trailing separator before balancing, and flag the result as a
//!    partial reconstruction.

use serde_json::Value;
use snafu::Snafu;

/// Characters of the original text kept in an [`ExtractionFailure`].
pub const PREVIEW_CHARS: usize = 200;

const FENCE_WITH_TAG: &str = "```json";
const FENCE: &str = "```";
const BARE_TAG: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    Direct,
    Balanced,
    Cleaned,
    PartialRepair,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub value: Value,
    pub strategy: ExtractionStrategy,
}

impl Extracted {
    pub fn is_partial(&self) -> bool {
        self.strategy == ExtractionStrategy::PartialRepair
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(display("no parsing strategy produced structured output; preview: {preview:?}"))]
pub struct ExtractionFailure {
    pub preview: String,
}

impl ExtractionFailure {
    pub fn with_preview(text: &str) -> Self {
        Self {
            preview: text.chars().take(PREVIEW_CHARS).collect(),
        }
    }
}

pub fn extract(text: &str) -> Result<Extracted, ExtractionFailure> {
    let stripped = strip_wrappers(text);

    if let Some(value) = parse(container_span(stripped)) {
        return Ok(found(value, ExtractionStrategy::Direct));
    }

    let balanced = from_first_opener(stripped)
        .and_then(balance)
        .and_then(|candidate| parse(&candidate));
    if let Some(value) = balanced {
        return Ok(found(value, ExtractionStrategy::Balanced));
    }

    let cleaned = clean_markers(text);
    if let Some(value) = parse(&cleaned) {
        return Ok(found(value, ExtractionStrategy::Cleaned));
    }

    if let Some(value) = partial_repair(&cleaned) {
        tracing::debug!(chars = text.len(), "structured output recovered by partial repair");
        return Ok(found(value, ExtractionStrategy::PartialRepair));
    }

    Err(ExtractionFailure::with_preview(text))
}

/// Like [`extract`], but only accepts a JSON object.
pub fn extract_object(text: &str) -> Result<Extracted, ExtractionFailure> {
    let extracted = extract(text)?;
    if extracted.value.is_object() {
        Ok(extracted)
    } else {
        Err(ExtractionFailure::with_preview(text))
    }
}

/// Removes fence markers anywhere in the text and a leading bare `json` word.
pub fn clean_markers(text: &str) -> String {
    let without_fences = text.replace(FENCE_WITH_TAG, "").replace(FENCE, "");
    strip_bare_tag(without_fences.trim()).trim().to_string()
}

fn found(value: Value, strategy: ExtractionStrategy) -> Extracted {
    Extracted { value, strategy }
}

fn parse(candidate: &str) -> Option<Value> {
    serde_json::from_str(candidate).ok()
}

fn strip_wrappers(text: &str) -> &str {
    let mut rest = text.trim();
    if let Some(inner) = rest.strip_prefix(FENCE_WITH_TAG) {
        rest = inner;
    } else if let Some(inner) = rest.strip_prefix(FENCE) {
        rest = inner;
    }
    rest = strip_bare_tag(rest.trim_start());
    rest = rest.trim_end();
    if let Some(inner) = rest.strip_suffix(FENCE) {
        rest = inner;
    }
    rest.trim()
}

fn strip_bare_tag(text: &str) -> &str {
    match text.strip_prefix(BARE_TAG) {
        Some(rest)
            if rest
                .chars()
                .next()
                .is_none_or(|next| next.is_whitespace() || next == '{' || next == '[') =>
        {
            rest
        }
        _ => text,
    }
}

fn first_opener(text: &str) -> Option<(usize, char)> {
    text.char_indices().find(|(_, ch)| *ch == '{' || *ch == '[')
}

/// The outermost `{...}` or `[...]` span, or the whole text when there is none.
fn container_span(text: &str) -> &str {
    let Some((start, opener)) = first_opener(text) else {
        return text;
    };
    let closer = if opener == '{' { '}' } else { ']' };
    match text.rfind(closer) {
        Some(end) if end > start => &text[start..=end],
        _ => text,
    }
}

fn from_first_opener(text: &str) -> Option<&str> {
    first_opener(text).map(|(start, _)| &text[start..])
}

/// Closes odd quotes per line, then appends closers for every open container.
/// Returns `None` when the text is already balanced.
fn balance(text: &str) -> Option<String> {
    let quoted = close_odd_quotes(text);
    let closers = missing_closers(&quoted);
    if closers.is_empty() && quoted == text {
        return None;
    }
    Some(quoted + &closers)
}

fn close_odd_quotes(text: &str) -> String {
    text.split('\n')
        .map(|line| {
            if unescaped_quotes(line) % 2 == 1 {
                format!("{line}\"")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn unescaped_quotes(line: &str) -> usize {
    let mut count = 0;
    let mut escaped = false;
    for ch in line.chars() {
        match ch {
            '\\' if !escaped => escaped = true,
            '"' if !escaped => count += 1,
            _ => escaped = false,
        }
    }
    count
}

fn missing_closers(text: &str) -> String {
    let mut open = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if in_string {
            match ch {
                '\\' if !escaped => {
                    escaped = true;
                    continue;
                }
                '"' if !escaped => in_string = false,
                _ => {}
            }
            escaped = false;
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                if open.last() == Some(&ch) {
                    open.pop();
                }
            }
            _ => {}
        }
    }
    open.iter().rev().collect()
}

fn partial_repair(cleaned: &str) -> Option<Value> {
    let tail = from_first_opener(cleaned)?;
    if let Some(value) = parse(tail) {
        return Some(value);
    }
    let trimmed = tail.trim_end();
    let trimmed = trimmed.strip_suffix(',').unwrap_or(trimmed).trim_end();
    let repaired = balance(trimmed).unwrap_or_else(|| trimmed.to_string());
    parse(&repaired)
}
