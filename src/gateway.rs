//! Model gateway
//!
//! One outbound call per generation: system/user messages to the OpenAI
//! chat-completions endpoint with a fixed token cap and JSON response mode.
//! No retry and no timeout - the caller re-invokes on failure.

use crate::config::Config;
use crate::error::FlowError;
use serde::{Deserialize, Serialize};
use tracing::debug;

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Fixed by policy: bounds generation cost and truncation risk.
pub const MAX_RESPONSE_TOKENS: u32 = 800;

const TEMPERATURE: f32 = 0.7;

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
}

/// The single call/response boundary to the generative model.
#[allow(async_fn_in_trait)]
pub trait ModelGateway {
    /// Identifier recorded in the audit trace.
    fn model_id(&self) -> &str;

    /// Send the prompt pair and return the raw text output.
    async fn call(&self, system_prompt: &str, user_prompt: &str) -> Result<String, FlowError>;
}

/// Gateway backed by the OpenAI chat-completions API.
pub struct OpenAiGateway {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl std::fmt::Debug for OpenAiGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiGateway")
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl OpenAiGateway {
    /// Build a gateway from config. Fails if no credential is configured.
    pub fn from_config(config: &Config) -> Result<Self, FlowError> {
        let api_key = config
            .get_api_key()
            .ok_or_else(|| FlowError::Configuration("Missing OPENAI_API_KEY".to_string()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model: config.model_id().to_string(),
        })
    }
}

impl ModelGateway for OpenAiGateway {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn call(&self, system_prompt: &str, user_prompt: &str) -> Result<String, FlowError> {
        let request = ChatRequest {
            model: self.model.clone(),
            temperature: TEMPERATURE,
            max_tokens: MAX_RESPONSE_TOKENS,
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
        };

        debug!(model = %self.model, "calling chat-completions endpoint");

        let response = self
            .client
            .post(OPENAI_URL)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| FlowError::Transport(format!("Request failed: {}", e)))?;

        let status = response.status();
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| FlowError::Transport(format!("Failed to parse response: {}", e)))?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|c| !c.is_empty());

        match content {
            Some(content) if status.is_success() => Ok(content),
            _ => {
                let message = parsed
                    .error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "Model response error".to_string());
                Err(FlowError::Transport(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_a_configuration_error() {
        // Only meaningful when the environment has no key set.
        if std::env::var("OPENAI_API_KEY").is_ok() {
            return;
        }
        let config = Config::default();
        let err = OpenAiGateway::from_config(&config).unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
    }

    #[test]
    fn debug_output_redacts_the_api_key() {
        let gateway = OpenAiGateway {
            client: reqwest::Client::new(),
            api_key: "sk-very-secret".to_string(),
            model: DEFAULT_MODEL.to_string(),
        };
        let rendered = format!("{:?}", gateway);
        assert!(!rendered.contains("sk-very-secret"));
        assert!(rendered.contains(DEFAULT_MODEL));
    }

    #[test]
    fn request_serializes_with_json_response_format() {
        let request = ChatRequest {
            model: DEFAULT_MODEL.to_string(),
            temperature: TEMPERATURE,
            max_tokens: MAX_RESPONSE_TOKENS,
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
            messages: vec![Message {
                role: "system".to_string(),
                content: "sys".to_string(),
            }],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["max_tokens"], 800);
    }

    #[test]
    fn upstream_error_message_is_extracted() {
        let body = r#"{"error": {"message": "Rate limit reached"}}"#;
        let parsed: ChatResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.choices.is_empty());
        assert_eq!(parsed.error.unwrap().message.unwrap(), "Rate limit reached");
    }
}
