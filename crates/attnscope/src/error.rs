use thiserror::Error;

/// Error code the server attaches to oversized prompts.
pub const CODE_PROMPT_TOO_LARGE: &str = "prompt_too_large";
/// Error code the server attaches to throttled requests.
pub const CODE_RATE_LIMITED: &str = "rate_limited";

#[derive(Error, Debug)]
pub enum InspectError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response. `message` is the server's `error` field, the raw body,
    /// or `HTTP <status>` when the body was empty.
    #[error("{message}")]
    Api {
        status: u16,
        message: String,
        code: Option<String>,
    },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid attention matrix: {0}")]
    InvalidMatrix(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, InspectError>;

/// Coarse bucket used to pick user-facing wording for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    PromptTooLarge,
    RateLimited,
    Generic,
}

impl ErrorCategory {
    fn from_code(code: &str) -> Option<Self> {
        match code {
            CODE_PROMPT_TOO_LARGE => Some(Self::PromptTooLarge),
            CODE_RATE_LIMITED => Some(Self::RateLimited),
            _ => None,
        }
    }

    fn from_message(message: &str) -> Self {
        if message.contains(CODE_PROMPT_TOO_LARGE) {
            Self::PromptTooLarge
        } else if message.contains(CODE_RATE_LIMITED) {
            Self::RateLimited
        } else {
            Self::Generic
        }
    }
}

/// The single user-visible notification for a failed generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfacedError {
    pub category: ErrorCategory,
    pub message: String,
}

impl std::fmt::Display for SurfacedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl InspectError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, InspectError::Cancelled)
    }

    /// Classify by structured code first, then by message content.
    pub fn category(&self) -> ErrorCategory {
        if let InspectError::Api {
            code: Some(code), ..
        } = self
            && let Some(category) = ErrorCategory::from_code(code)
        {
            return category;
        }
        ErrorCategory::from_message(&self.to_string())
    }

    /// Convert into the notification shown to the user. Cancellation is not an
    /// error and yields `None`.
    pub fn surface(&self) -> Option<SurfacedError> {
        if self.is_cancelled() {
            return None;
        }
        let category = self.category();
        let message = match category {
            ErrorCategory::PromptTooLarge => {
                "Prompt too large. Please reduce message length.".to_string()
            }
            ErrorCategory::RateLimited => {
                "Rate limited. Please wait before sending another message.".to_string()
            }
            ErrorCategory::Generic => self.to_string(),
        };
        Some(SurfacedError { category, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(message: &str, code: Option<&str>) -> InspectError {
        InspectError::Api {
            status: 400,
            message: message.to_string(),
            code: code.map(str::to_string),
        }
    }

    #[test]
    fn test_code_takes_precedence_over_message() {
        let err = api("Rate limit exceeded", Some("rate_limited"));
        assert_eq!(err.category(), ErrorCategory::RateLimited);

        let err = api("Prompt too large: 20000 bytes (max 16384)", Some("prompt_too_large"));
        assert_eq!(err.category(), ErrorCategory::PromptTooLarge);
    }

    #[test]
    fn test_message_content_classifies_unstructured_bodies() {
        let err = api("upstream said rate_limited", None);
        assert_eq!(err.category(), ErrorCategory::RateLimited);

        let err = InspectError::Stream("prompt_too_large".into());
        assert_eq!(err.category(), ErrorCategory::PromptTooLarge);
    }

    #[test]
    fn test_unknown_code_falls_back_to_raw_message() {
        let err = api("Model not ready yet, please retry", Some("model_loading"));
        let surfaced = err.surface().unwrap();
        assert_eq!(surfaced.category, ErrorCategory::Generic);
        assert_eq!(surfaced.message, "Model not ready yet, please retry");
    }

    #[test]
    fn test_user_messages() {
        let surfaced = api("rate_limited", Some("rate_limited")).surface().unwrap();
        assert_eq!(
            surfaced.message,
            "Rate limited. Please wait before sending another message."
        );
        let surfaced = api("too big", Some("prompt_too_large")).surface().unwrap();
        assert_eq!(
            surfaced.message,
            "Prompt too large. Please reduce message length."
        );
    }

    #[test]
    fn test_cancellation_is_never_surfaced() {
        assert!(InspectError::Cancelled.surface().is_none());
    }
}
