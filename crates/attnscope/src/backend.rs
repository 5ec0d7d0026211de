use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::sse::EventStream;
use crate::types::{ChatStreamRequest, FullAttentionRequest, FullAttentionResponse};

/// The inference server as seen by an inspector session.
#[async_trait]
pub trait InspectorBackend: Send + Sync {
    /// Open a traced generation. The returned stream ends when `cancel` fires.
    async fn stream_chat(
        &self,
        request: &ChatStreamRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream>;

    /// Fetch the full attention matrix for one layer and head.
    async fn full_attention(&self, request: &FullAttentionRequest)
    -> Result<FullAttentionResponse>;

    /// Whether the server answers its health check.
    async fn health(&self) -> bool;
}
