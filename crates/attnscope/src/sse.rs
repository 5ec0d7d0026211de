//! Incremental decoder for server-sent events delivered over a POST body.
//!
//! `EventSource` cannot send a request body, so the stream is parsed by hand:
//! bytes are decoded as UTF-8 across chunk boundaries, line endings are
//! normalized, and blank-line separated frames are cut out of the buffer.
//! Each frame is then narrowed into a [`StreamEvent`].

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{InspectError, Result};
use crate::types::{DoneEvent, TokenEvent, TraceEvent};

/// Label used when a frame carries no `event:` line.
pub const DEFAULT_EVENT: &str = "message";

const FRAME_SEPARATOR: &str = "\n\n";

/// One decoded `(event, data)` unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

/// Splits an arbitrarily chunked byte stream into frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    utf8_tail: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.decode_utf8(chunk);
        if self.buffer.contains("\r\n") {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.find(FRAME_SEPARATOR) {
            if let Some(frame) = parse_frame(&self.buffer[..end]) {
                frames.push(frame);
            }
            self.buffer.drain(..end + FRAME_SEPARATOR.len());
        }
        frames
    }

    /// Stream closed: an unterminated tail is discarded, never replayed.
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() || !self.utf8_tail.is_empty() {
            debug!(
                discarded_bytes = self.buffer.len() + self.utf8_tail.len(),
                "discarding unterminated SSE frame"
            );
        }
        self.buffer.clear();
        self.utf8_tail.clear();
    }

    /// Bytes currently held back waiting for a frame separator.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.utf8_tail.len()
    }

    fn decode_utf8(&mut self, chunk: &[u8]) {
        let mut input = std::mem::take(&mut self.utf8_tail);
        input.extend_from_slice(chunk);

        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    return;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    self.buffer
                        .push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.utf8_tail = after.to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Parse one separator-delimited segment. Returns `None` when the segment has
/// no `data:` line at all; an empty `data:` line still produces a frame.
fn parse_frame(segment: &str) -> Option<Frame> {
    let mut event = DEFAULT_EVENT.to_string();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in segment.split('\n') {
        if let Some(label) = line.strip_prefix("event:") {
            event = label.trim().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.trim_end());
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(Frame {
        event,
        data: data_lines.join("\n"),
    })
}

/// Closed set of events the inference server emits.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(TokenEvent),
    Trace(TraceEvent),
    Done(DoneEvent),
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Token(_) => "token",
            StreamEvent::Trace(_) => "trace",
            StreamEvent::Done(_) => "done",
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed `{event}` payload: {source}")]
    MalformedPayload {
        event: String,
        source: serde_json::Error,
    },

    #[error("`{event}` payload has unexpected shape: {source}")]
    UnexpectedShape {
        event: String,
        source: serde_json::Error,
    },

    #[error("unknown event `{0}`")]
    UnknownEvent(String),
}

impl TryFrom<Frame> for StreamEvent {
    type Error = FrameError;

    fn try_from(frame: Frame) -> std::result::Result<Self, Self::Error> {
        let value: serde_json::Value =
            serde_json::from_str(&frame.data).map_err(|source| FrameError::MalformedPayload {
                event: frame.event.clone(),
                source,
            })?;

        let shape = |source| FrameError::UnexpectedShape {
            event: frame.event.clone(),
            source,
        };
        match frame.event.as_str() {
            "token" => serde_json::from_value(value)
                .map(StreamEvent::Token)
                .map_err(shape),
            "trace" => serde_json::from_value(value)
                .map(StreamEvent::Trace)
                .map_err(shape),
            "done" => serde_json::from_value(value)
                .map(StreamEvent::Done)
                .map_err(shape),
            _ => Err(FrameError::UnknownEvent(frame.event.clone())),
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

struct DecodeState<S> {
    body: Pin<Box<S>>,
    decoder: FrameDecoder,
    ready: VecDeque<Frame>,
    cancel: CancellationToken,
    finished: bool,
}

/// Turn a response body into a lazy stream of typed events.
///
/// Frames that fail to decode are logged and skipped. A transport error is
/// yielded once and ends the stream. Once `cancel` fires the stream ends
/// without yielding anything else.
pub fn decode_event_stream<S, E>(body: S, cancel: CancellationToken) -> EventStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: FrameDecoder::new(),
        ready: VecDeque::new(),
        cancel,
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if state.finished || state.cancel.is_cancelled() {
                return None;
            }

            if let Some(frame) = state.ready.pop_front() {
                match StreamEvent::try_from(frame) {
                    Ok(event) => return Some((Ok(event), state)),
                    Err(FrameError::UnknownEvent(event)) => {
                        debug!(%event, "ignoring unknown SSE event");
                    }
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable SSE frame");
                    }
                }
                continue;
            }

            let next = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => return None,
                next = state.body.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    let frames = state.decoder.push(&chunk);
                    state.ready.extend(frames);
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(InspectError::Stream(err.to_string())), state));
                }
                None => {
                    state.decoder.finish();
                    return None;
                }
            }
        }
    }))
}
