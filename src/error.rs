//! Pipeline failure taxonomy
//!
//! Stages raise typed failures; the flow orchestrator is the single
//! recovery boundary that converts any of them into a failed run with a
//! generic caller-facing message. None of these propagate past it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    /// Missing credential. Fatal for the invocation, surfaced as a failed run.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The model call did not succeed or returned no content.
    #[error("model call failed: {0}")]
    Transport(String),

    /// The model output could not be parsed as JSON.
    #[error("failed to parse model response as JSON: {0}")]
    Parse(String),

    /// The normalized response violated the content schema.
    #[error("model response failed schema validation: {}", .0.join("; "))]
    Validation(Vec<String>),
}

impl FlowError {
    /// The violated constraints, when this is a validation failure.
    pub fn validation_errors(&self) -> Option<&[String]> {
        match self {
            FlowError::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}
