//! The voice session wrapper: threads real-time audio through VAD, turn
//! detection, and interruption handling before forwarding it to a backend
//! streaming-input session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tandem::provider::{MediaChunk, ProviderStream, StreamingInputSession};
use tandem::EngineError;

use crate::error::VoiceError;
use crate::interrupt::{InterruptStrategy, InterruptionHandler};
use crate::turn::TurnDetector;
use crate::vad::{VadAnalyzer, VadParams, VadState};

/// A completed user turn, delivered on the turn-detected channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnDetected {
    /// Copy of the audio accumulated over the turn.
    pub audio: Vec<u8>,
    /// The transcript accumulated over the turn.
    pub transcript: String,
}

/// Wrapper session tuning.
#[derive(Debug, Clone)]
pub struct VoiceSessionConfig {
    pub vad: VadParams,
    /// Silence duration that ends a turn; `None` disables turn detection.
    pub turn_silence_threshold: Option<Duration>,
    /// Barge-in policy; `None` disables interruption handling.
    pub interruption: Option<InterruptStrategy>,
}

impl Default for VoiceSessionConfig {
    fn default() -> Self {
        Self {
            vad: VadParams::default(),
            turn_silence_threshold: Some(Duration::from_millis(700)),
            interruption: Some(InterruptStrategy::Immediate),
        }
    }
}

/// Composes a VAD, an optional turn detector, and an optional interruption
/// handler on top of a provider streaming-input session.
///
/// Every chunk passes through, in order: the VAD, the interruption handler,
/// the turn detector (audio first, then the new state), and finally the
/// underlying session. Turn and interruption outcomes surface on the two
/// signal channels, non-blocking with drop-if-pending semantics.
pub struct VoiceSession {
    vad: VadAnalyzer,
    turn: Option<TurnDetector>,
    interrupts: Option<InterruptionHandler>,
    inner: Box<dyn StreamingInputSession>,
    turn_rx: Mutex<Option<mpsc::Receiver<TurnDetected>>>,
    interrupt_rx: Mutex<Option<mpsc::Receiver<()>>>,
    closed: AtomicBool,
}

impl VoiceSession {
    pub fn new(
        config: VoiceSessionConfig,
        inner: Box<dyn StreamingInputSession>,
    ) -> Result<Self, VoiceError> {
        let vad = VadAnalyzer::new(config.vad)?;

        let (turn, turn_rx) = match config.turn_silence_threshold {
            Some(threshold) => {
                let detector = TurnDetector::new(threshold);
                let (tx, rx) = mpsc::channel(1);
                detector.on_turn_complete(Arc::new(move |audio, transcript| {
                    if tx.try_send(TurnDetected { audio, transcript }).is_err() {
                        debug!("turn signal already pending; dropped");
                    }
                }));
                (Some(detector), Some(rx))
            }
            None => (None, None),
        };

        let (interrupts, interrupt_rx) = match config.interruption {
            Some(strategy) => {
                let handler = InterruptionHandler::new(strategy);
                let (tx, rx) = mpsc::channel(1);
                handler.on_interrupt(Arc::new(move || {
                    if tx.try_send(()).is_err() {
                        debug!("interruption signal already pending; dropped");
                    }
                }));
                (Some(handler), Some(rx))
            }
            None => (None, None),
        };

        Ok(Self {
            vad,
            turn,
            interrupts,
            inner,
            turn_rx: Mutex::new(turn_rx),
            interrupt_rx: Mutex::new(interrupt_rx),
            closed: AtomicBool::new(false),
        })
    }

    /// Submit one audio chunk. Analysis, interruption, and turn detection
    /// run before the chunk is forwarded downstream; the first failure
    /// aborts the sequence.
    pub async fn send_chunk(
        &self,
        cancel: &CancellationToken,
        chunk: &MediaChunk,
    ) -> Result<(), VoiceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::SessionClosed);
        }

        self.vad.analyze(cancel, &chunk.data)?;
        let state = self.vad.state();

        if let Some(handler) = &self.interrupts {
            handler.process_vad_state(state);
        }
        if let Some(detector) = &self.turn {
            detector.process_audio(&chunk.data);
            detector.process_vad_state(state);
        }

        self.inner.send_chunk(cancel, chunk).await?;
        Ok(())
    }

    /// Submit text to the underlying session.
    pub async fn send_text(
        &self,
        cancel: &CancellationToken,
        text: &str,
    ) -> Result<(), VoiceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::SessionClosed);
        }
        self.inner.send_text(cancel, text).await?;
        Ok(())
    }

    /// Take the turn-detected channel. Yields `Some` on the first call only;
    /// `None` when turn detection is disabled.
    pub fn turn_signals(&self) -> Option<mpsc::Receiver<TurnDetected>> {
        self.turn_rx.lock().take()
    }

    /// Take the interruption channel. Yields `Some` on the first call only;
    /// `None` when interruption handling is disabled.
    pub fn interruption_signals(&self) -> Option<mpsc::Receiver<()>> {
        self.interrupt_rx.lock().take()
    }

    /// Take the underlying session's response channel.
    pub fn responses(&self) -> Option<ProviderStream> {
        self.inner.response()
    }

    /// Resolves when the underlying session has finished emitting.
    pub async fn done(&self) {
        self.inner.done().await;
    }

    /// The underlying session's terminal error, if any.
    pub fn error(&self) -> Option<EngineError> {
        self.inner.error()
    }

    /// The interruption handler, for callers that track bot speech and
    /// sentence boundaries.
    pub fn interruption_handler(&self) -> Option<&InterruptionHandler> {
        self.interrupts.as_ref()
    }

    pub fn vad_state(&self) -> VadState {
        self.vad.state()
    }

    /// The turn detector's view when one is attached, otherwise derived
    /// from the VAD state.
    pub fn is_user_speaking(&self) -> bool {
        match &self.turn {
            Some(detector) => detector.is_user_speaking(),
            None => matches!(self.vad.state(), VadState::Speaking | VadState::Starting),
        }
    }

    /// Reset the VAD, turn detector, and interruption handler.
    pub fn reset(&self) {
        self.vad.reset();
        if let Some(detector) = &self.turn {
            detector.reset();
        }
        if let Some(handler) = &self.interrupts {
            handler.reset();
        }
    }

    /// Idempotent close: closes both signal channels and the underlying
    /// session.
    pub async fn close(&self) -> Result<(), VoiceError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Clearing the callbacks drops the channel senders.
        if let Some(detector) = &self.turn {
            detector.clear_callback();
        }
        if let Some(handler) = &self.interrupts {
            handler.clear_callback();
        }
        self.inner.close().await?;
        Ok(())
    }
}
