//! Tolerant extraction of JSON from LLM output
//!
//! LLM JSON is frequently wrapped in prose, fenced, or mildly corrupted.
//! The repair order is fixed and pinned by tests; do not add heuristics
//! silently - they change behavior on adversarial inputs.
//!
//! Order: direct parse, fenced code block, outermost balanced bracket span,
//! control-character strip, escaped-newline normalization (raw control
//! bytes inside string spans become escape sequences, then the extraction
//! passes run once more), first-brace-to-last-brace fallback.

use serde_json::Value;

use crate::error::GatewayError;

/// How much of the raw output an error carries back
const ERROR_HEAD_CHARS: usize = 200;

/// Parse JSON out of free-form model output.
///
/// Idempotent on already-valid JSON: the direct parse short-circuits before
/// any repair runs.
pub fn parse_llm_json(text: &str) -> Result<Value, GatewayError> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    if let Some(block) = extract_fenced_block(trimmed) {
        let block = block.trim();
        if let Ok(value) = serde_json::from_str(block) {
            return Ok(value);
        }
        if let Ok(value) = serde_json::from_str(&strip_control_chars(block)) {
            return Ok(value);
        }
    }

    if let Some(span) = extract_outer_bracket(trimmed) {
        if let Ok(value) = serde_json::from_str(span) {
            return Ok(value);
        }
        if let Ok(value) = serde_json::from_str(&strip_control_chars(span)) {
            return Ok(value);
        }
    }

    let cleaned = strip_control_chars(trimmed);
    if let Ok(value) = serde_json::from_str(cleaned.trim()) {
        return Ok(value);
    }

    // Escaped-newline normalization: a literal line break inside a string
    // span is invalid JSON, so rewrite in-string control bytes to their
    // escape sequences and run the extraction passes once more
    let normalized = escape_string_controls(&cleaned);
    if let Some(block) = extract_fenced_block(&normalized)
        && let Ok(value) = serde_json::from_str(block.trim())
    {
        return Ok(value);
    }
    if let Some(span) = extract_outer_bracket(&normalized)
        && let Ok(value) = serde_json::from_str(span)
    {
        return Ok(value);
    }
    if let Ok(value) = serde_json::from_str(normalized.trim()) {
        return Ok(value);
    }

    // Last resort: widest brace span of the normalized text
    if let (Some(start), Some(end)) = (normalized.find('{'), normalized.rfind('}'))
        && start < end
        && let Ok(value) = serde_json::from_str(&normalized[start..=end])
    {
        return Ok(value);
    }

    Err(GatewayError::ProtocolMismatch {
        backend: "json-repair".to_string(),
        message: format!("unparseable model output: {}", head(trimmed, ERROR_HEAD_CHARS)),
    })
}

/// First N characters on a char boundary
pub fn head(text: &str, n: usize) -> String {
    text.chars().take(n).collect()
}

/// Contents of the first fenced code block, language tag stripped.
///
/// Fences pair sequentially; nested fences are not a thing LLMs emit in
/// practice, so the first block wins.
fn extract_fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    let close = after_open.find("```")?;
    let block = &after_open[..close];

    // Drop a language tag line such as "json" or "yaml"
    match block.find('\n') {
        Some(newline) if block[..newline].trim().chars().all(|c| c.is_alphanumeric()) => Some(&block[newline + 1..]),
        _ => Some(block),
    }
}

/// Outermost balanced `{...}` or `[...]` span, string- and escape-aware
fn extract_outer_bracket(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let bytes = text.as_bytes();
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            _ if in_string => {}
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Remove control characters that break strict parsers, keeping the
/// whitespace JSON itself allows between tokens.
fn strip_control_chars(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
        .collect()
}

/// Rewrite raw control bytes found inside string spans to their escape
/// sequences. Text outside string spans passes through untouched; the
/// quote/escape walk matches [`extract_outer_bracket`]'s.
fn escape_string_controls(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }
        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                in_string = false;
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}
