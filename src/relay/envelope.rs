//! Typed views of the OpenAI wire protocol.
//!
//! Only the fields the pipeline reads are modeled; the buffered request body
//! is forwarded verbatim, so unknown fields survive without round-tripping
//! through these types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound body for chat completions, completions and embeddings.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct GeneralRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub prompt: Option<Value>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub functions: Option<Value>,
    #[serde(default)]
    pub function_call: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    /// Image parts of a multi-part message, in order.
    pub fn image_parts(&self) -> Vec<&ImageUrl> {
        match &self.content {
            Some(MessageContent::Parts(parts)) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::ImageUrl { image_url } => Some(image_url),
                    ContentPart::Text { .. } => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default)]
    pub detail: ImageDetail,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    Low,
    High,
    #[default]
    Auto,
}

/// Inbound body for image generation.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ImageRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub n: u32,
    #[serde(default)]
    pub quality: String,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Buffered upstream reply, as far as accounting needs to see it.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TextResponse {
    #[serde(default)]
    pub choices: Vec<TextChoice>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub error: Option<UpstreamError>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TextChoice {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub message: Option<ChoiceMessage>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// One parsed SSE frame of a streamed reply.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}

/// Error object of a non-2xx upstream reply.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpstreamError {
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub param: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}
