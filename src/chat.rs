//! OpenAI-compatible chat completion wire types and the request validator.
//!
//! The framing layer parses JSON bodies into [`ModelRequest`] and renders
//! [`ModelResponse`] back out; everything in between works on these typed
//! shapes. Validation is pure (no I/O) and total: every rejection path is an
//! explicit [`Error::InvalidRequest`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Message content: either a plain string or an ordered sequence of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<ImageDetail>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageDetail {
    Auto,
    Low,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
            name: None,
            tool_call_id: None,
        }
    }

    pub fn has_image(&self) -> bool {
        match &self.content {
            MessageContent::Text(_) => false,
            MessageContent::Parts(parts) => parts
                .iter()
                .any(|p| matches!(p, ContentPart::ImageUrl { .. })),
        }
    }

    /// Text of the message with image parts dropped, used by semantic cache
    /// keying and adapters that need a flat prompt.
    pub fn text_content(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// Routing strategy requested by the caller (or a custom endpoint preset).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStrategy {
    #[default]
    Default,
    Fallback,
    LowestCost,
    Fastest,
    HighestQuality,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormatKind {
    Text,
    JsonObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: ResponseFormatKind,
}

/// A validated-shape chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub functions: Option<Vec<FunctionSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallbacks: Option<Vec<String>>,
}

impl ModelRequest {
    /// Minimal request with every optional knob unset.
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            max_tokens: None,
            stop: None,
            stream: false,
            functions: None,
            function_call: None,
            tools: None,
            tool_choice: None,
            response_format: None,
            route: None,
            fallbacks: None,
        }
    }

    pub fn strategy(&self) -> RouteStrategy {
        self.route.unwrap_or_default()
    }

    pub fn has_system_message(&self) -> bool {
        self.messages.iter().any(|m| m.role == Role::System)
    }

    pub fn has_image_parts(&self) -> bool {
        self.messages.iter().any(ChatMessage::has_image)
    }

    pub fn wants_functions(&self) -> bool {
        self.functions.as_ref().is_some_and(|f| !f.is_empty()) || self.function_call.is_some()
    }

    pub fn wants_tools(&self) -> bool {
        self.tools.as_ref().is_some_and(|t| !t.is_empty())
    }

    pub fn wants_json_mode(&self) -> bool {
        matches!(
            self.response_format,
            Some(ResponseFormat {
                kind: ResponseFormatKind::JsonObject
            })
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    FunctionCall,
    ToolCalls,
    ContentFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// OpenAI-shaped chat completion response.
///
/// `routed_through` is the gateway's only extension field: it echoes the
/// upstream model that actually served the request, which can differ from the
/// requested model under fallback or strategy routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub id: String,
    pub object: String,
    /// Unix seconds
    pub created: i64,
    /// The model that actually served the request
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
    pub routed_through: String,
}

impl ModelResponse {
    /// Build a single-choice assistant response for `model`.
    pub fn assistant(
        model: impl Into<String>,
        content: impl Into<String>,
        finish_reason: FinishReason,
        usage: Usage,
    ) -> Self {
        let model = model.into();
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            object: "chat.completion".to_string(),
            created: Utc::now().timestamp(),
            model: model.clone(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::text(Role::Assistant, content),
                finish_reason: Some(finish_reason),
            }],
            usage,
            routed_through: model,
        }
    }
}

/// One incremental chunk of a streamed response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Populated on the final chunk by adapters that report stream usage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

fn check_range(name: &str, value: Option<f64>, min: f64, max: f64) -> Result<()> {
    if let Some(v) = value {
        if !v.is_finite() || v < min || v > max {
            return Err(Error::invalid(format!(
                "{name} must be between {min} and {max}, got {v}"
            )));
        }
    }
    Ok(())
}

/// Validate a raw request.
///
/// Unknown model ids are accepted here: the router treats an unknown
/// requested model as an immediately-skipped candidate and falls through to
/// eligible models, failing with `NO_MODEL_AVAILABLE` only on exhaustion.
pub fn validate(req: &ModelRequest) -> Result<()> {
    if req.model.trim().is_empty() {
        return Err(Error::invalid("model must be a non-empty string"));
    }
    if req.messages.is_empty() {
        return Err(Error::invalid("messages must contain at least one entry"));
    }

    for (i, message) in req.messages.iter().enumerate() {
        match &message.content {
            MessageContent::Text(_) => {}
            MessageContent::Parts(parts) => {
                if parts.is_empty() {
                    return Err(Error::invalid(format!(
                        "messages[{i}].content must contain at least one part"
                    )));
                }
                for part in parts {
                    if let ContentPart::ImageUrl { image_url } = part {
                        if image_url.url.trim().is_empty() {
                            return Err(Error::invalid(format!(
                                "messages[{i}] contains an image part with an empty url"
                            )));
                        }
                    }
                }
            }
        }
        if message.role == Role::Tool && message.tool_call_id.is_none() {
            return Err(Error::invalid(format!(
                "messages[{i}] has role tool but no tool_call_id"
            )));
        }
    }

    check_range("temperature", req.temperature, 0.0, 2.0)?;
    check_range("top_p", req.top_p, 0.0, 1.0)?;
    check_range("frequency_penalty", req.frequency_penalty, -2.0, 2.0)?;
    check_range("presence_penalty", req.presence_penalty, -2.0, 2.0)?;

    if req.max_tokens == Some(0) {
        return Err(Error::invalid("max_tokens must be greater than zero"));
    }

    Ok(())
}
