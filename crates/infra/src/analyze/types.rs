//! Wire types for the chat-completions style analysis API.

use serde::{Deserialize, Serialize};

/// One message in the conversation sent to the model.
#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Request payload for a completion call.
#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

#[derive(Debug, Deserialize)]
pub struct ResponseMessage {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
}

/// Response payload from a completion call.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    pub choices: Vec<Choice>,
}

/// The JSON document the model is instructed to produce.
#[derive(Debug, Deserialize)]
pub struct AssessmentDto {
    pub risk_score: i64,
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub reasoning: String,
}
