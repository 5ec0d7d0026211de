//! Reassembles interleaved `token` and `trace` events into ordered step records.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use tracing::{debug, info, warn};

use crate::history::ChatHistory;
use crate::sse::StreamEvent;
use crate::types::{ChatMessage, StepRecord, TokenEvent};

/// Identifies one generation. Events tagged with an older id are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenerationId(u64);

impl GenerationId {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Observable effect of applying one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Correlated {
    /// A token was appended to the partial completion.
    Token { step: usize, text: String },
    /// Step records at these indices became available.
    Steps(Range<usize>),
    /// The generation finished with this reply.
    Completed { reply: String },
}

/// Session state for the current generation.
#[derive(Debug, Default)]
pub struct Correlator {
    generation: GenerationId,
    steps: Vec<StepRecord>,
    pending_tokens: HashMap<usize, TokenEvent>,
    /// Merged records waiting for an earlier step to complete.
    merged_ahead: BTreeMap<usize, StepRecord>,
    partial: String,
    finished: bool,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation, discarding everything from the previous one.
    pub fn begin(&mut self) -> GenerationId {
        self.generation = GenerationId(self.generation.0 + 1);
        self.steps.clear();
        self.pending_tokens.clear();
        self.merged_ahead.clear();
        self.partial.clear();
        self.finished = false;
        info!(generation = self.generation.0, "generation started");
        self.generation
    }

    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    /// Gap-free prefix of merged steps, ordered by step.
    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// Text streamed so far for an unfinished generation.
    pub fn partial(&self) -> &str {
        &self.partial
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn apply(
        &mut self,
        generation: GenerationId,
        event: StreamEvent,
        history: &mut ChatHistory,
    ) -> Option<Correlated> {
        if generation != self.generation {
            debug!(
                stale = generation.0,
                current = self.generation.0,
                event = event.name(),
                "ignoring event from a previous generation"
            );
            return None;
        }
        if self.finished {
            debug!(event = event.name(), "ignoring event after generation finished");
            return None;
        }

        match event {
            StreamEvent::Token(token) => {
                self.partial.push_str(&token.token_text);
                let step = token.step;
                let text = token.token_text.clone();
                if step < self.steps.len() {
                    warn!(step, "token repeats an already merged step");
                } else if self.pending_tokens.insert(step, token).is_some() {
                    warn!(step, "duplicate token for pending step");
                }
                Some(Correlated::Token { step, text })
            }
            StreamEvent::Trace(trace) => {
                let Some(token) = self.pending_tokens.remove(&trace.step) else {
                    debug!(step = trace.step, "dropping trace with no matching token");
                    return None;
                };
                let record = StepRecord::merge(token, trace);
                self.merged_ahead.insert(record.step, record);

                let start = self.steps.len();
                while let Some(record) = self.merged_ahead.remove(&self.steps.len()) {
                    self.steps.push(record);
                }
                let end = self.steps.len();
                (end > start).then_some(Correlated::Steps(start..end))
            }
            StreamEvent::Done(done) => {
                history.push(ChatMessage::assistant(done.reply.clone()));
                self.partial.clear();
                self.finished = true;
                info!(
                    generation = self.generation.0,
                    steps = self.steps.len(),
                    "generation completed"
                );
                Some(Correlated::Completed { reply: done.reply })
            }
        }
    }

    /// Keep whatever was streamed before a cancellation or failure by moving
    /// it into the history as an assistant message.
    pub fn promote_partial(&mut self, history: &mut ChatHistory) -> Option<String> {
        self.finished = true;
        if self.partial.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.partial);
        history.push(ChatMessage::assistant(text.clone()));
        Some(text)
    }
}
