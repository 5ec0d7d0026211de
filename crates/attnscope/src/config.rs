use std::str::FromStr;
use std::time::Duration;

use crate::error::{InspectError, Result};
use crate::types::{ChatMessage, ChatStreamRequest, FullAttentionRequest};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

pub const ENV_API_BASE_URL: &str = "ATTNSCOPE_API_BASE_URL";
pub const ENV_MAX_NEW_TOKENS: &str = "ATTNSCOPE_MAX_NEW_TOKENS";
pub const ENV_TEMPERATURE: &str = "ATTNSCOPE_TEMPERATURE";
pub const ENV_TOP_K: &str = "ATTNSCOPE_TOP_K";
pub const ENV_SEED: &str = "ATTNSCOPE_SEED";
pub const ENV_TRACE_LAYER: &str = "ATTNSCOPE_TRACE_LAYER";
pub const ENV_SYSTEM_PROMPT: &str = "ATTNSCOPE_SYSTEM_PROMPT";
pub const ENV_TIMEOUT_SECS: &str = "ATTNSCOPE_TIMEOUT_SECS";

/// Sampling and connection settings for the inference server.
#[derive(Debug, Clone, PartialEq)]
pub struct InspectorConfig {
    pub api_base_url: String,
    pub max_new_tokens: usize,
    pub temperature: f32,
    /// `None` samples from the full distribution.
    pub top_k: Option<usize>,
    pub seed: u64,
    /// Layer whose attention is traced while streaming.
    pub trace_layer: usize,
    pub system_prompt: String,
    pub timeout: Duration,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            max_new_tokens: 256,
            temperature: 0.9,
            top_k: Some(50),
            seed: 42,
            trace_layer: 0,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

impl InspectorConfig {
    /// Same as [`Default::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any `ATTNSCOPE_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_API_BASE_URL) {
            config.api_base_url = url;
        }
        if let Some(value) = parse_var(&lookup, ENV_MAX_NEW_TOKENS)? {
            config.max_new_tokens = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_TEMPERATURE)? {
            config.temperature = value;
        }
        if let Some(raw) = lookup(ENV_TOP_K) {
            config.top_k = match raw.trim() {
                "" | "none" | "0" => None,
                value => Some(parse_value(ENV_TOP_K, value)?),
            };
        }
        if let Some(value) = parse_var(&lookup, ENV_SEED)? {
            config.seed = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_TRACE_LAYER)? {
            config.trace_layer = value;
        }
        if let Some(prompt) = lookup(ENV_SYSTEM_PROMPT) {
            config.system_prompt = prompt;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, ENV_TIMEOUT_SECS)? {
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    /// Server URL for all three endpoints.
    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    /// Upper bound on generated tokens per reply.
    pub fn max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    /// Sampling temperature sent with each chat request.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Top-k cutoff, `None` to disable it.
    pub fn top_k(mut self, top_k: Option<usize>) -> Self {
        self.top_k = top_k;
        self
    }

    /// Sampling seed sent with each chat request.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Layer traced while streaming and rendered in the heatmap.
    pub fn trace_layer(mut self, trace_layer: usize) -> Self {
        self.trace_layer = trace_layer;
        self
    }

    /// System message that opens every transcript.
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Connect and idle-read limit for the HTTP client.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `POST /chat/stream` body for this transcript.
    pub fn chat_request(&self, messages: Vec<ChatMessage>) -> ChatStreamRequest {
        ChatStreamRequest {
            messages,
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_k: self.top_k,
            seed: self.seed,
            trace_layer: self.trace_layer,
        }
    }

    /// `POST /inspect/full_attn` body for this transcript and head.
    pub fn full_attention_request(
        &self,
        messages: Vec<ChatMessage>,
        head: usize,
    ) -> FullAttentionRequest {
        FullAttentionRequest {
            messages,
            trace_layer: self.trace_layer,
            head,
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| parse_value(key, raw.trim()))
        .transpose()
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|err| InspectError::Config(format!("{key}={raw:?}: {err}")))
}
