//! Model output repair
//!
//! Parses raw model text into JSON and repairs the wire shapes models get
//! wrong in practice: fenced output, single-key wrapper blocks, and invalid
//! callout tones. Normalization never invents values for malformed blocks;
//! anything it doesn't recognize passes through and fails validation.

use crate::error::FlowError;
use crate::schema::Level;
use serde_json::{Map, Value};

/// Extract a JSON value from raw model text.
///
/// If the text contains a fenced code block, its inner text is the JSON
/// candidate; otherwise the trimmed text is used verbatim. Exactly one
/// extraction attempt is made - there is no retry-with-repair.
pub fn parse(raw: &str) -> Result<Value, FlowError> {
    let candidate = extract_fenced(raw).unwrap_or_else(|| raw.trim());
    serde_json::from_str(candidate).map_err(|e| FlowError::Parse(e.to_string()))
}

fn extract_fenced(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let open = find_ascii_ci(trimmed.as_bytes(), b"```json", 0)?;
    let body_start = open + "```json".len();
    let close = find_ascii_ci(trimmed.as_bytes(), b"```", body_start)?;
    Some(trimmed[body_start..close].trim())
}

/// Byte-wise ASCII case-insensitive substring search starting at `from`.
/// Offsets are only valid for the haystack they were computed on; never
/// carry them over from a case-folded copy, whose byte lengths can differ.
fn find_ascii_ci(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    (from..=haystack.len() - needle.len())
        .find(|&i| haystack[i..i + needle.len()].eq_ignore_ascii_case(needle))
}

/// Repair known shape irregularities in a parsed response.
///
/// - blocks carrying a `type` discriminator pass through, except that a
///   callout's tone is coerced to a valid value (defaulting to `note`);
/// - a single-key wrapper object `{"paragraph": {...}}` is unwrapped into
///   `{"type": "paragraph", ...}`;
/// - missing top-level topic/level default to the canonical topic and the
///   requested level.
pub fn normalize(parsed: Value, canonical_topic: &str, level: Level) -> Value {
    let Value::Object(mut obj) = parsed else {
        return parsed;
    };

    if let Some(Value::Array(blocks)) = obj.remove("blocks") {
        let normalized = blocks.into_iter().map(normalize_block).collect();
        obj.insert("blocks".to_string(), Value::Array(normalized));
    }

    if !obj.get("topic").is_some_and(|v| !v.is_null()) {
        obj.insert("topic".to_string(), Value::String(canonical_topic.to_string()));
    }
    if !obj.get("level").is_some_and(|v| !v.is_null()) {
        obj.insert("level".to_string(), Value::String(level.as_str().to_string()));
    }

    Value::Object(obj)
}

fn normalize_block(block: Value) -> Value {
    let Value::Object(obj) = block else {
        return block;
    };

    if obj.contains_key("type") {
        return Value::Object(coerce_callout_tone(obj));
    }

    // Single-key wrapper: {"paragraph": {"text": "..."}}
    if obj.len() != 1 {
        return Value::Object(obj);
    }
    if let Some((key, value)) = obj.into_iter().next() {
        if let Value::Object(fields) = value {
            let mut unwrapped = Map::new();
            unwrapped.insert("type".to_string(), Value::String(key));
            unwrapped.extend(fields);
            return Value::Object(coerce_callout_tone(unwrapped));
        }
        let mut obj = Map::new();
        obj.insert(key, value);
        return Value::Object(obj);
    }
    Value::Object(Map::new())
}

fn coerce_callout_tone(mut obj: Map<String, Value>) -> Map<String, Value> {
    if obj.get("type").and_then(Value::as_str) != Some("callout") {
        return obj;
    }
    let valid = matches!(
        obj.get("tone").and_then(Value::as_str),
        Some("tip") | Some("note") | Some("warning")
    );
    if !valid {
        obj.insert("tone".to_string(), Value::String("note".to_string()));
    }
    obj
}
