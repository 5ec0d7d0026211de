//! HTTP client for the traced inference server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::InspectorBackend;
use crate::config::{DEFAULT_API_BASE_URL, InspectorConfig};
use crate::error::{InspectError, Result};
use crate::sse::{EventStream, decode_event_stream};
use crate::types::{ChatStreamRequest, ErrorResponse, FullAttentionRequest, FullAttentionResponse};

#[derive(Debug, Clone)]
pub struct InspectClient {
    base_url: String,
    http_client: Client,
    /// Whole-request limit for the non-streaming endpoints.
    timeout: Duration,
}

impl InspectClient {
    /// Client for the default local server.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Builder with the default URL and timeout.
    pub fn builder() -> InspectClientBuilder {
        InspectClientBuilder::new()
    }

    /// Client for the configured server URL and timeout.
    pub fn from_config(config: &InspectorConfig) -> Result<Self> {
        Self::builder()
            .base_url(&config.api_base_url)
            .timeout(config.timeout)
            .build()
    }

    /// Server URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl InspectorBackend for InspectClient {
    async fn stream_chat(
        &self,
        request: &ChatStreamRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        let send = self
            .http_client
            .post(self.url("/chat/stream"))
            .header("Accept", "text/event-stream")
            .json(request)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InspectError::Cancelled),
            response = send => response?,
        };

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        debug!(messages = request.messages.len(), "chat stream opened");
        Ok(decode_event_stream(response.bytes_stream(), cancel))
    }

    async fn full_attention(
        &self,
        request: &FullAttentionRequest,
    ) -> Result<FullAttentionResponse> {
        let response = self
            .http_client
            .post(self.url("/inspect/full_attn"))
            .timeout(self.timeout)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn health(&self) -> bool {
        let check = self
            .http_client
            .get(self.url("/health"))
            .timeout(self.timeout)
            .send();
        match check.await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                warn!(error = %err, "health check failed");
                false
            }
        }
    }
}

/// Build an [`InspectError::Api`] from a non-2xx response.
async fn api_error(response: Response) -> InspectError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    let parsed = serde_json::from_str::<ErrorResponse>(&text).ok();
    let code = parsed.as_ref().and_then(|body| body.code.clone());
    let message = parsed
        .as_ref()
        .and_then(ErrorResponse::message)
        .or_else(|| (!text.trim().is_empty()).then(|| text.trim().to_string()))
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    debug!(status = status.as_u16(), ?code, %message, "server returned an error");
    InspectError::Api {
        status: status.as_u16(),
        message,
        code,
    }
}

pub struct InspectClientBuilder {
    base_url: Option<String>,
    timeout: Option<Duration>,
}

impl InspectClientBuilder {
    /// Builder with nothing set.
    pub fn new() -> Self {
        Self {
            base_url: None,
            timeout: None,
        }
    }

    /// Server URL. Defaults to the local development server.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Connect and idle-read limit. Chat streams may run longer than this as
    /// long as frames keep arriving.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the client. Fails only if the TLS backend cannot initialize.
    pub fn build(self) -> Result<InspectClient> {
        let base_url = self
            .base_url
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let timeout = self.timeout.unwrap_or(Duration::from_secs(300));

        let http_client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;

        Ok(InspectClient {
            base_url,
            http_client,
            timeout,
        })
    }
}

impl Default for InspectClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_trims_trailing_slash() {
        let client = InspectClient::builder()
            .base_url("http://localhost:8000/")
            .build()
            .unwrap();
        assert_eq!(client.base_url(), "http://localhost:8000");
        assert_eq!(client.url("/health"), "http://localhost:8000/health");
    }

    #[test]
    fn test_from_config() {
        let config = InspectorConfig::default().api_base_url("http://gpu:9000");
        let client = InspectClient::from_config(&config).unwrap();
        assert_eq!(client.base_url(), "http://gpu:9000");
    }
}
