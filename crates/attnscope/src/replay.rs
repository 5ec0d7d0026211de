//! Replay pointer over the merged steps of one generation.
//!
//! The scheduler is a plain state machine. Auto-play is driven by tick tokens
//! handed out by [`ReplayScheduler::arm`]; every transition bumps an epoch so a
//! token armed before a scrub, pause or new generation cannot advance the
//! pointer afterwards.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Delay between auto-play advances.
pub const TICK_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// No steps to show.
    Idle,
    /// Generation in progress, pointer follows the newest step.
    Live,
    /// Pointer fixed.
    Paused,
    /// Pointer advances on each tick.
    Playing,
}

impl PlaybackState {
    /// Lowercase name for logs and status lines.
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Live => "live",
            Self::Paused => "paused",
            Self::Playing => "playing",
        }
    }
}

/// Permission for exactly one pending tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct TickToken {
    epoch: u64,
}

#[derive(Debug)]
pub struct ReplayScheduler {
    state: PlaybackState,
    pointer: usize,
    len: usize,
    epoch: u64,
}

impl Default for ReplayScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayScheduler {
    /// Idle scheduler with no steps.
    pub fn new() -> Self {
        Self {
            state: PlaybackState::Idle,
            pointer: 0,
            len: 0,
            epoch: 0,
        }
    }

    /// Current playback state.
    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Current step index, `None` while there are no steps.
    pub fn pointer(&self) -> Option<usize> {
        (self.len > 0).then_some(self.pointer)
    }

    /// Index of the newest step, `None` while there are no steps.
    pub fn last_index(&self) -> Option<usize> {
        self.len.checked_sub(1)
    }

    /// Number of steps available for replay.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no steps have been merged yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn transition(&mut self, state: PlaybackState) {
        if self.state != state {
            trace!(from = self.state.label(), to = state.label(), "replay transition");
        }
        self.state = state;
        self.epoch += 1;
    }

    /// Forget the previous steps and follow the new generation live.
    pub fn generation_started(&mut self) {
        self.len = 0;
        self.pointer = 0;
        self.transition(PlaybackState::Live);
    }

    /// The merged step sequence grew to `len` entries.
    pub fn steps_available(&mut self, len: usize) {
        self.len = len;
        match self.state {
            PlaybackState::Live => self.pointer = len.saturating_sub(1),
            _ => self.pointer = self.pointer.min(len.saturating_sub(1)),
        }
    }

    /// Completion or cancellation. The pointer stays where it is.
    pub fn generation_ended(&mut self) {
        if self.len == 0 {
            self.transition(PlaybackState::Idle);
        } else {
            self.transition(PlaybackState::Paused);
        }
    }

    /// Jump to `index`, clamped to the last step, and pause.
    pub fn scrub(&mut self, index: usize) {
        let Some(last) = self.last_index() else {
            return;
        };
        self.pointer = index.min(last);
        self.transition(PlaybackState::Paused);
    }

    /// Start auto-play. At the last step playback restarts from the first.
    pub fn play(&mut self) {
        if matches!(self.state, PlaybackState::Live | PlaybackState::Idle) {
            return;
        }
        let Some(last) = self.last_index() else {
            return;
        };
        if self.pointer >= last {
            self.pointer = 0;
        }
        if self.pointer >= last {
            self.transition(PlaybackState::Paused);
        } else {
            self.transition(PlaybackState::Playing);
        }
    }

    /// Stop auto-play. No effect while live or idle.
    pub fn pause(&mut self) {
        if matches!(self.state, PlaybackState::Live | PlaybackState::Idle) {
            return;
        }
        self.transition(PlaybackState::Paused);
    }

    /// Pause while playing, otherwise play.
    pub fn toggle(&mut self) {
        match self.state {
            PlaybackState::Playing => self.pause(),
            _ => self.play(),
        }
    }

    /// Hand out a token for the next tick, only while playing.
    pub fn arm(&self) -> Option<TickToken> {
        (self.state == PlaybackState::Playing).then_some(TickToken { epoch: self.epoch })
    }

    /// Advance one step. Returns `false` for a stale token.
    pub fn tick(&mut self, token: TickToken) -> bool {
        if token.epoch != self.epoch || self.state != PlaybackState::Playing {
            trace!(token = token.epoch, epoch = self.epoch, "ignoring stale tick");
            return false;
        }
        let Some(last) = self.last_index() else {
            return false;
        };
        self.pointer = (self.pointer + 1).min(last);
        if self.pointer == last {
            self.transition(PlaybackState::Paused);
        }
        true
    }

    /// Drive auto-play until the last step, a pause, or cancellation.
    /// `on_advance` sees the pointer after every successful tick.
    pub async fn play_to_end<F>(&mut self, cancel: &CancellationToken, mut on_advance: F)
    where
        F: FnMut(usize),
    {
        while let Some(token) = self.arm() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.pause();
                    return;
                }
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
            }
            if self.tick(token) {
                on_advance(self.pointer);
            }
        }
    }
}
