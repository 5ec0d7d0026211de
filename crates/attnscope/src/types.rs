use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Request body for `POST /chat/stream`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatStreamRequest {
    pub messages: Vec<ChatMessage>,
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_k: Option<usize>,
    pub seed: u64,
    pub trace_layer: usize,
}

/// Payload of a `token` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEvent {
    pub step: usize,
    pub token_id: u32,
    pub token_text: String,
    pub token_display: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopKCandidate {
    pub token_id: u32,
    pub token_text: String,
    pub token_display: String,
    pub prob: f32,
}

/// Payload of a `trace` event. `attn` is indexed `[head][context position]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub step: usize,
    pub entropy: f32,
    #[serde(default)]
    pub topk: Vec<TopKCandidate>,
    #[serde(default)]
    pub attn: Vec<Vec<f32>>,
}

/// Payload of the terminal `done` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneEvent {
    pub reply: String,
}

/// A token merged with the trace recorded for the same step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    pub token_id: u32,
    pub token_text: String,
    pub token_display: String,
    pub entropy: f32,
    pub topk: Vec<TopKCandidate>,
    pub attn: Vec<Vec<f32>>,
}

impl StepRecord {
    pub fn merge(token: TokenEvent, trace: TraceEvent) -> Self {
        debug_assert_eq!(token.step, trace.step);
        Self {
            step: token.step,
            token_id: token.token_id,
            token_text: token.token_text,
            token_display: token.token_display,
            entropy: trace.entropy,
            topk: trace.topk,
            attn: trace.attn,
        }
    }

    /// Attention row for one head, if the trace carried that head.
    pub fn attention_row(&self, head: usize) -> Option<&[f32]> {
        self.attn.get(head).map(Vec::as_slice)
    }

    pub fn head_count(&self) -> usize {
        self.attn.len()
    }
}

/// Request body for `POST /inspect/full_attn`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullAttentionRequest {
    pub messages: Vec<ChatMessage>,
    pub trace_layer: usize,
    pub head: usize,
}

/// Full `t x t` attention matrix for one layer and head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullAttentionResponse {
    pub layer: usize,
    pub head: usize,
    pub token_ids: Vec<u32>,
    pub tokens_display: Vec<String>,
    pub attn: Vec<Vec<f32>>,
}

/// Error body returned with non-2xx statuses.
///
/// The inference server sends `{error, code}`; request validation failures
/// come back as `{detail}` instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn message(&self) -> Option<String> {
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        match &self.detail {
            Some(serde_json::Value::String(detail)) => Some(detail.clone()),
            Some(detail) => Some(detail.to_string()),
            None => None,
        }
    }
}
