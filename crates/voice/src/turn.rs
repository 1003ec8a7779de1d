//! Silence-based turn-end detection.
//!
//! The detector consumes two event kinds, in this order per audio chunk:
//! raw audio via [`TurnDetector::process_audio`], then the VAD state via
//! [`TurnDetector::process_vad_state`]. Driving them the other way around
//! can miss the first chunk of an utterance; the session wrapper enforces
//! the order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::vad::VadState;

/// Invoked off-lock on a detached task with a copy of the accumulated audio
/// and the accumulated transcript.
pub type TurnCallback = Arc<dyn Fn(Vec<u8>, String) + Send + Sync>;

struct TurnInner {
    silence_start: Option<Instant>,
    in_silence: bool,
    user_speaking: bool,
    had_speech: bool,
    audio: Vec<u8>,
    transcript: String,
    last_state: VadState,
}

impl TurnInner {
    fn new() -> Self {
        Self {
            silence_start: None,
            in_silence: false,
            user_speaking: false,
            had_speech: false,
            audio: Vec::new(),
            transcript: String::new(),
            last_state: VadState::Quiet,
        }
    }

    fn reset_turn(&mut self) {
        self.silence_start = None;
        self.in_silence = false;
        self.user_speaking = false;
        self.had_speech = false;
        self.audio.clear();
        self.transcript.clear();
    }
}

/// Detects the end of a user turn: the user spoke at least once, the
/// detector is in silence, and the silence has lasted at least the
/// configured threshold, observed at a `Quiet` update.
pub struct TurnDetector {
    threshold: Duration,
    inner: Mutex<TurnInner>,
    callback: Mutex<Option<TurnCallback>>,
}

impl TurnDetector {
    pub fn new(silence_threshold: Duration) -> Self {
        Self {
            threshold: silence_threshold,
            inner: Mutex::new(TurnInner::new()),
            callback: Mutex::new(None),
        }
    }

    /// Register the turn-complete callback.
    pub fn on_turn_complete(&self, callback: TurnCallback) {
        *self.callback.lock() = Some(callback);
    }

    pub(crate) fn clear_callback(&self) {
        *self.callback.lock() = None;
    }

    /// Feed one audio chunk. Accumulated while the user is speaking or has
    /// spoken this turn.
    pub fn process_audio(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.user_speaking || inner.had_speech {
            inner.audio.extend_from_slice(bytes);
        }
    }

    /// Feed a VAD state update. Returns true when this update completed a
    /// turn; the callback (if registered) fires asynchronously with a copy
    /// of the buffer and transcript, and the turn state resets.
    pub fn process_vad_state(&self, state: VadState) -> bool {
        let mut inner = self.inner.lock();
        let mut completed = false;

        match state {
            VadState::Speaking => {
                inner.user_speaking = true;
                inner.had_speech = true;
                inner.in_silence = false;
                inner.silence_start = None;
            }
            VadState::Starting => {
                inner.in_silence = false;
            }
            VadState::Stopping => {
                if inner.last_state == VadState::Speaking {
                    inner.silence_start = Some(Instant::now());
                    inner.in_silence = true;
                }
            }
            VadState::Quiet => {
                if inner.had_speech && inner.in_silence {
                    let elapsed = inner
                        .silence_start
                        .map(|s| s.elapsed())
                        .unwrap_or(Duration::ZERO);
                    if elapsed >= self.threshold {
                        completed = true;
                        let audio = std::mem::take(&mut inner.audio);
                        let transcript = std::mem::take(&mut inner.transcript);
                        inner.reset_turn();
                        debug!(
                            audio_bytes = audio.len(),
                            transcript_len = transcript.len(),
                            "turn complete"
                        );
                        if let Some(callback) = self.callback.lock().clone() {
                            tokio::spawn(async move {
                                callback(audio, transcript);
                            });
                        }
                    }
                }
            }
        }

        inner.last_state = state;
        completed
    }

    /// Replace the in-progress transcript (supplied by an external STT).
    pub fn set_transcript(&self, transcript: impl Into<String>) {
        self.inner.lock().transcript = transcript.into();
    }

    /// Defensive copy of the audio accumulated this turn.
    pub fn accumulated_audio(&self) -> Vec<u8> {
        self.inner.lock().audio.clone()
    }

    /// Whether the user is currently speaking, from the detector's view.
    pub fn is_user_speaking(&self) -> bool {
        self.inner.lock().user_speaking
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.reset_turn();
        inner.last_state = VadState::Quiet;
    }
}
