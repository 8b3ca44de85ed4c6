//! Explanation content schema
//!
//! The model is asked for JSON matching this shape exactly; [`validate`]
//! is the gate that decides whether a response is persisted. Validation
//! fails closed: every violated constraint is collected and any violation
//! rejects the whole response.

use crate::error::FlowError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Target explanation depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Eli5,
    Eli10,
    Expert,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Eli5 => "eli5",
            Level::Eli10 => "eli10",
            Level::Expert => "expert",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eli5" => Ok(Level::Eli5),
            "eli10" => Ok(Level::Eli10),
            "expert" => Ok(Level::Expert),
            other => Err(format!(
                "unknown level '{}' (expected eli5, eli10, or expert)",
                other
            )),
        }
    }
}

/// Tone of a callout block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalloutTone {
    Tip,
    Note,
    Warning,
}

/// One typed content node. Order within `blocks` is significant and is
/// preserved from generation through storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Block {
    Heading {
        text: String,
    },
    Paragraph {
        text: String,
    },
    Analogy {
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        text: String,
    },
    Steps {
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        items: Vec<String>,
    },
    Intuition {
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        text: String,
    },
    Technical {
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        text: String,
    },
    Equation {
        latex: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        explanation: Option<String>,
    },
    Callout {
        tone: CalloutTone,
        text: String,
    },
    Check {
        questions: Vec<String>,
    },
}

impl Block {
    pub fn type_name(&self) -> &'static str {
        match self {
            Block::Heading { .. } => "heading",
            Block::Paragraph { .. } => "paragraph",
            Block::Analogy { .. } => "analogy",
            Block::Steps { .. } => "steps",
            Block::Intuition { .. } => "intuition",
            Block::Technical { .. } => "technical",
            Block::Equation { .. } => "equation",
            Block::Callout { .. } => "callout",
            Block::Check { .. } => "check",
        }
    }
}

/// Block types the renderer understands.
pub const SUPPORTED_BLOCK_TYPES: [&str; 9] = [
    "heading",
    "paragraph",
    "analogy",
    "steps",
    "intuition",
    "technical",
    "equation",
    "callout",
    "check",
];

/// The content envelope shared by explanations and variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplanationContent {
    pub topic: String,
    pub level: Level,
    pub title: String,
    pub summary: String,
    pub blocks: Vec<Block>,
    pub related_topics: Vec<String>,
}

const LEVELS: [&str; 3] = ["eli5", "eli10", "expert"];
const TONES: [&str; 3] = ["tip", "note", "warning"];

/// Validate a normalized JSON value against the full content schema.
///
/// Collects every violation rather than stopping at the first, so the
/// audit trace can show what the model got wrong.
pub fn validate(value: &Value) -> Result<ExplanationContent, FlowError> {
    let mut errors = Vec::new();

    let Some(obj) = value.as_object() else {
        return Err(FlowError::Validation(vec![
            "response must be a JSON object".to_string(),
        ]));
    };

    check_string(obj.get("topic"), "topic", 2, &mut errors);
    match obj.get("level").and_then(Value::as_str) {
        Some(level) if LEVELS.contains(&level) => {}
        Some(level) => errors.push(format!("level must be one of eli5|eli10|expert, got '{}'", level)),
        None => errors.push("level is required".to_string()),
    }
    check_string(obj.get("title"), "title", 4, &mut errors);
    check_string(obj.get("summary"), "summary", 20, &mut errors);

    match obj.get("blocks").and_then(Value::as_array) {
        Some(blocks) => {
            if blocks.len() < 3 {
                errors.push(format!("blocks must contain at least 3 items, got {}", blocks.len()));
            }
            for (index, block) in blocks.iter().enumerate() {
                validate_block(block, index, &mut errors);
            }
        }
        None => errors.push("blocks must be an array".to_string()),
    }

    match obj.get("relatedTopics").and_then(Value::as_array) {
        Some(topics) => {
            if !(2..=6).contains(&topics.len()) {
                errors.push(format!(
                    "relatedTopics must contain 2-6 items, got {}",
                    topics.len()
                ));
            }
            for (index, topic) in topics.iter().enumerate() {
                let field = format!("relatedTopics[{}]", index);
                check_string(Some(topic), &field, 2, &mut errors);
            }
        }
        None => errors.push("relatedTopics must be an array".to_string()),
    }

    if !errors.is_empty() {
        return Err(FlowError::Validation(errors));
    }

    serde_json::from_value(value.clone())
        .map_err(|e| FlowError::Validation(vec![format!("content did not deserialize: {}", e)]))
}

fn validate_block(block: &Value, index: usize, errors: &mut Vec<String>) {
    let label = |field: &str| format!("blocks[{}].{}", index, field);

    let Some(obj) = block.as_object() else {
        errors.push(format!("blocks[{}] must be an object", index));
        return;
    };

    let Some(block_type) = obj.get("type").and_then(Value::as_str) else {
        errors.push(format!("blocks[{}] is missing a type field", index));
        return;
    };

    match block_type {
        "heading" => check_string(obj.get("text"), &label("text"), 2, errors),
        "paragraph" => check_string(obj.get("text"), &label("text"), 10, errors),
        "analogy" | "intuition" | "technical" => {
            check_optional_string(obj.get("title"), &label("title"), 2, errors);
            check_string(obj.get("text"), &label("text"), 20, errors);
        }
        "steps" => {
            check_optional_string(obj.get("title"), &label("title"), 2, errors);
            check_string_array(obj.get("items"), &label("items"), 2, 5, errors);
        }
        "equation" => {
            check_string(obj.get("latex"), &label("latex"), 3, errors);
            check_optional_string(obj.get("explanation"), &label("explanation"), 5, errors);
        }
        "callout" => {
            match obj.get("tone").and_then(Value::as_str) {
                Some(tone) if TONES.contains(&tone) => {}
                _ => errors.push(format!("{} must be one of tip|note|warning", label("tone"))),
            }
            check_string(obj.get("text"), &label("text"), 10, errors);
        }
        "check" => check_string_array(obj.get("questions"), &label("questions"), 1, 5, errors),
        other => errors.push(format!("blocks[{}] has unrecognized type '{}'", index, other)),
    }
}

fn check_string(value: Option<&Value>, field: &str, min_chars: usize, errors: &mut Vec<String>) {
    match value.and_then(Value::as_str) {
        Some(s) if s.chars().count() >= min_chars => {}
        Some(_) => errors.push(format!("{} must be at least {} characters", field, min_chars)),
        None => errors.push(format!("{} must be a string", field)),
    }
}

fn check_optional_string(
    value: Option<&Value>,
    field: &str,
    min_chars: usize,
    errors: &mut Vec<String>,
) {
    match value {
        None | Some(Value::Null) => {}
        Some(v) => check_string(Some(v), field, min_chars, errors),
    }
}

fn check_string_array(
    value: Option<&Value>,
    field: &str,
    min_items: usize,
    min_item_chars: usize,
    errors: &mut Vec<String>,
) {
    match value.and_then(Value::as_array) {
        Some(items) => {
            if items.len() < min_items {
                errors.push(format!(
                    "{} must contain at least {} items, got {}",
                    field,
                    min_items,
                    items.len()
                ));
            }
            for (index, item) in items.iter().enumerate() {
                check_string(Some(item), &format!("{}[{}]", field, index), min_item_chars, errors);
            }
        }
        None => errors.push(format!("{} must be an array", field)),
    }
}
