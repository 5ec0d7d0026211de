//! Attention inspector client for a traced byte-level language model.
//!
//! Streams a chat generation over SSE, merges each sampled token with the
//! attention trace recorded for it, and lets the finished generation be
//! replayed step by step or fetched as a full attention heatmap.
//!
//! # Example
//!
//! ```no_run
//! use attnscope::{InspectClient, InspectorConfig, InspectorSession};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = InspectorConfig::from_env()?;
//!     let client = InspectClient::from_config(&config)?;
//!     let mut session = InspectorSession::from_config(&config);
//!
//!     let outcome = session
//!         .send(&client, &config, "hello", CancellationToken::new(), |_, _| {})
//!         .await;
//!     println!("{outcome:?}");
//!
//!     if let Some(view) = session.view() {
//!         println!("step {} attends to {:?}", view.pointer, view.track.attention.salient);
//!     }
//!     Ok(())
//! }
//! ```

pub mod alignment;
pub mod backend;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod heatmap;
pub mod history;
pub mod insight;
pub mod replay;
pub mod session;
pub mod sse;
pub mod types;

pub use alignment::{AlignedAttention, RenderMode, TokenCell, TokenTrack, align, build_track};
pub use backend::InspectorBackend;
pub use client::{InspectClient, InspectClientBuilder};
pub use config::InspectorConfig;
pub use correlator::{Correlated, Correlator, GenerationId};
pub use error::{ErrorCategory, InspectError, Result, SurfacedError};
pub use heatmap::{AxisLabel, Gradient, Heatmap};
pub use history::ChatHistory;
pub use insight::{CandidateView, GlowTier, StepInsight};
pub use replay::{PlaybackState, ReplayScheduler, TickToken};
pub use session::{GenerationOutcome, InspectorSession, StepView};
pub use sse::{EventStream, Frame, FrameDecoder, StreamEvent, decode_event_stream};
pub use types::{
    ChatMessage, ChatStreamRequest, DoneEvent, FullAttentionRequest, FullAttentionResponse, Role,
    StepRecord, TokenEvent, TopKCandidate, TraceEvent,
};
