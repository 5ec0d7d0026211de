//! One inspector pane: chat transcript, live correlation and replay.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::alignment::{RenderMode, TokenTrack, build_track};
use crate::backend::InspectorBackend;
use crate::config::InspectorConfig;
use crate::correlator::{Correlated, Correlator};
use crate::error::{InspectError, Result, SurfacedError};
use crate::heatmap::Heatmap;
use crate::history::ChatHistory;
use crate::insight::StepInsight;
use crate::replay::{PlaybackState, ReplayScheduler};
use crate::types::{ChatMessage, StepRecord};

/// How a call to [`InspectorSession::send`] ended.
#[derive(Debug)]
pub enum GenerationOutcome {
    Completed {
        reply: String,
    },
    /// The user stopped the generation. Any streamed text was kept.
    Cancelled {
        partial: Option<String>,
    },
    Failed {
        error: InspectError,
    },
}

impl GenerationOutcome {
    /// User-facing notification, present only for failures.
    pub fn surfaced_error(&self) -> Option<SurfacedError> {
        match self {
            GenerationOutcome::Failed { error } => error.surface(),
            _ => None,
        }
    }
}

/// Everything shown for the step under the replay pointer.
#[derive(Debug, Clone)]
pub struct StepView<'a> {
    pub pointer: usize,
    pub record: &'a StepRecord,
    pub track: TokenTrack,
    pub insight: StepInsight,
}

impl<'a> StepView<'a> {
    /// View of `steps[pointer]`, or `None` when the pointer is past the end.
    pub fn build(
        steps: &'a [StepRecord],
        pointer: usize,
        head: usize,
        mode: RenderMode,
    ) -> Option<Self> {
        let record = steps.get(pointer)?;
        let track = build_track(steps, pointer, head, mode)?;
        Some(Self {
            pointer,
            record,
            track,
            insight: StepInsight::new(record),
        })
    }
}

#[derive(Debug)]
pub struct InspectorSession {
    history: ChatHistory,
    correlator: Correlator,
    replay: ReplayScheduler,
    head: usize,
    mode: RenderMode,
}

impl InspectorSession {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            history: ChatHistory::with_system_prompt(system_prompt),
            correlator: Correlator::new(),
            replay: ReplayScheduler::new(),
            head: 0,
            mode: RenderMode::default(),
        }
    }

    pub fn from_config(config: &InspectorConfig) -> Self {
        Self::new(config.system_prompt.clone())
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    pub fn steps(&self) -> &[StepRecord] {
        self.correlator.steps()
    }

    /// Text of the generation in progress.
    pub fn partial(&self) -> &str {
        self.correlator.partial()
    }

    pub fn playback(&self) -> PlaybackState {
        self.replay.state()
    }

    pub fn pointer(&self) -> Option<usize> {
        self.replay.pointer()
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn select_head(&mut self, head: usize) {
        self.head = head;
    }

    pub fn render_mode(&self) -> RenderMode {
        self.mode
    }

    pub fn set_render_mode(&mut self, mode: RenderMode) {
        self.mode = mode;
    }

    /// Heads carried by the traces of this generation.
    pub fn head_count(&self) -> usize {
        self.steps().first().map_or(0, StepRecord::head_count)
    }

    /// Send a user message and stream the traced reply.
    ///
    /// `observer` sees every correlated event as it is applied, together with
    /// the steps merged so far, so callers can render tokens and step records
    /// live. Cancelling `cancel` ends the generation at the next
    /// suspension point and keeps the partial reply in the history.
    pub async fn send<B, F>(
        &mut self,
        backend: &B,
        config: &InspectorConfig,
        content: impl Into<String>,
        cancel: CancellationToken,
        mut observer: F,
    ) -> GenerationOutcome
    where
        B: InspectorBackend + ?Sized,
        F: FnMut(&Correlated, &[StepRecord]),
    {
        self.history.push(ChatMessage::user(content));
        let generation = self.correlator.begin();
        self.replay.generation_started();

        let request = config.chat_request(self.history.messages().to_vec());
        let mut events = match backend.stream_chat(&request, cancel.clone()).await {
            Ok(events) => events,
            Err(err) => return self.abort(err, &cancel),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = events.next() => next,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(err)) => return self.abort(err, &cancel),
                None => break,
            };

            let Some(effect) = self
                .correlator
                .apply(generation, event, &mut self.history)
            else {
                continue;
            };
            if let Correlated::Steps(_) = effect {
                self.replay.steps_available(self.correlator.steps().len());
            }
            observer(&effect, self.correlator.steps());
            if let Correlated::Completed { reply } = effect {
                self.replay.generation_ended();
                return GenerationOutcome::Completed { reply };
            }
        }

        let err = if cancel.is_cancelled() {
            InspectError::Cancelled
        } else {
            InspectError::Stream("stream closed before the done event".to_string())
        };
        self.abort(err, &cancel)
    }

    /// End the current generation early, keeping merged steps and promoting
    /// the partial reply.
    fn abort(&mut self, error: InspectError, cancel: &CancellationToken) -> GenerationOutcome {
        let partial = self.correlator.promote_partial(&mut self.history);
        self.replay.generation_ended();

        if error.is_cancelled() || cancel.is_cancelled() {
            info!(
                steps = self.steps().len(),
                kept = partial.as_ref().map_or(0, String::len),
                "generation cancelled"
            );
            return GenerationOutcome::Cancelled { partial };
        }

        warn!(error = %error, category = ?error.category(), "generation failed");
        GenerationOutcome::Failed { error }
    }

    pub fn view(&self) -> Option<StepView<'_>> {
        let pointer = self.replay.pointer()?;
        StepView::build(self.correlator.steps(), pointer, self.head, self.mode)
    }

    /// Fetch the full attention matrix of the current transcript for the
    /// selected head and the configured layer.
    pub async fn full_matrix<B>(&self, backend: &B, config: &InspectorConfig) -> Result<Heatmap>
    where
        B: InspectorBackend + ?Sized,
    {
        let request = config.full_attention_request(self.history.messages().to_vec(), self.head);
        let matrix = backend.full_attention(&request).await?;
        Heatmap::from_matrix(&matrix)
    }

    pub fn scrub(&mut self, index: usize) {
        self.replay.scrub(index);
    }

    pub fn play(&mut self) {
        self.replay.play();
    }

    pub fn pause(&mut self) {
        self.replay.pause();
    }

    pub fn toggle_playback(&mut self) {
        self.replay.toggle();
    }

    /// Auto-play from the pointer until the last step or cancellation.
    pub async fn play_to_end<F>(&mut self, cancel: &CancellationToken, on_advance: F)
    where
        F: FnMut(usize),
    {
        self.replay.play_to_end(cancel, on_advance).await;
    }
}
