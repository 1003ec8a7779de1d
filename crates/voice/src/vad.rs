//! Voice-activity detection over raw 16-bit little-endian PCM.
//!
//! The analyzer computes RMS energy per buffer, smooths it exponentially,
//! rescales it to a voice probability, and drives a four-state machine.
//! State transitions are emitted on a bounded channel; when the channel is
//! full the event is dropped, so listeners that need lossless delivery must
//! drain continuously (or re-query [`VadAnalyzer::state`]).

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::VoiceError;

/// Exponential smoothing factor for the RMS estimate.
const SMOOTHING_ALPHA: f32 = 0.3;

/// RMS level mapped to probability 1.0.
const MAX_EXPECTED_RMS: f32 = 0.5;

/// Capacity of the event channel; events beyond it are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Voice-activity state.
///
/// Quiet can only reach Speaking via Starting, and Speaking can only reach
/// Quiet via Stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadState {
    /// No voice detected.
    Quiet,
    /// Voice detected, waiting out the start window.
    Starting,
    /// Voice confirmed.
    Speaking,
    /// Voice lost, waiting out the stop window.
    Stopping,
}

/// Analyzer tuning. All fields are validated on construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VadParams {
    /// Probability threshold for counting a buffer as voice (0..1).
    pub confidence: f32,
    /// Seconds of above-threshold audio required to confirm speech
    /// (Quiet → Speaking via Starting).
    pub start_secs: f32,
    /// Seconds of below-threshold audio required to confirm silence
    /// (Speaking → Quiet via Stopping).
    pub stop_secs: f32,
    /// RMS floor below which the probability is zero (0..1).
    pub min_volume: f32,
    /// Input sample rate in Hz.
    pub sample_rate: u32,
}

impl Default for VadParams {
    fn default() -> Self {
        Self {
            confidence: 0.5,
            start_secs: 0.25,
            stop_secs: 0.7,
            min_volume: 0.01,
            sample_rate: 16_000,
        }
    }
}

impl VadParams {
    pub fn validate(&self) -> Result<(), VoiceError> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(VoiceError::Validation {
                field: "confidence",
                message: format!("must be within 0..1, got {}", self.confidence),
            });
        }
        if self.start_secs < 0.0 || !self.start_secs.is_finite() {
            return Err(VoiceError::Validation {
                field: "start_secs",
                message: format!("must be non-negative, got {}", self.start_secs),
            });
        }
        if self.stop_secs < 0.0 || !self.stop_secs.is_finite() {
            return Err(VoiceError::Validation {
                field: "stop_secs",
                message: format!("must be non-negative, got {}", self.stop_secs),
            });
        }
        if !(0.0..=1.0).contains(&self.min_volume) {
            return Err(VoiceError::Validation {
                field: "min_volume",
                message: format!("must be within 0..1, got {}", self.min_volume),
            });
        }
        if self.sample_rate == 0 {
            return Err(VoiceError::Validation {
                field: "sample_rate",
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// A state transition.
#[derive(Debug, Clone)]
pub struct VadEvent {
    pub state: VadState,
    pub previous: VadState,
    pub timestamp: OffsetDateTime,
    /// How long the previous state was held.
    pub held: Duration,
    /// The probability that drove the transition.
    pub confidence: f32,
}

struct VadInner {
    state: VadState,
    smoothed_rms: f32,
    entered_at: Instant,
}

/// RMS-based voice-activity analyzer.
///
/// State is serialised under a single read/write lock so transitions are
/// totally ordered per analyzer.
pub struct VadAnalyzer {
    params: VadParams,
    inner: RwLock<VadInner>,
    events_tx: mpsc::Sender<VadEvent>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<VadEvent>>,
}

impl VadAnalyzer {
    pub fn new(params: VadParams) -> Result<Self, VoiceError> {
        params.validate()?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            params,
            inner: RwLock::new(VadInner {
                state: VadState::Quiet,
                smoothed_rms: 0.0,
                entered_at: Instant::now(),
            }),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        })
    }

    pub fn params(&self) -> &VadParams {
        &self.params
    }

    pub fn state(&self) -> VadState {
        self.inner.read().state
    }

    /// Analyze one buffer of 16-bit little-endian PCM and return the voice
    /// probability in [0, 1]. Empty input short-circuits to 0 without
    /// touching the smoothing or the state machine.
    pub fn analyze(&self, cancel: &CancellationToken, bytes: &[u8]) -> Result<f32, VoiceError> {
        if cancel.is_cancelled() {
            return Err(VoiceError::Cancelled);
        }
        if bytes.is_empty() {
            return Ok(0.0);
        }

        let rms = pcm16_rms(bytes);

        let mut inner = self.inner.write();
        inner.smoothed_rms = SMOOTHING_ALPHA * rms + (1.0 - SMOOTHING_ALPHA) * inner.smoothed_rms;

        let probability = if inner.smoothed_rms <= self.params.min_volume {
            0.0
        } else {
            ((inner.smoothed_rms - self.params.min_volume)
                / (MAX_EXPECTED_RMS - self.params.min_volume))
                .clamp(0.0, 1.0)
        };

        self.advance(&mut inner, probability);
        Ok(probability)
    }

    fn advance(&self, inner: &mut VadInner, probability: f32) {
        let above = probability >= self.params.confidence;
        let held = inner.entered_at.elapsed();
        let next = next_state(
            inner.state,
            above,
            held,
            Duration::from_secs_f32(self.params.start_secs),
            Duration::from_secs_f32(self.params.stop_secs),
        );
        if next == inner.state {
            return;
        }

        let event = VadEvent {
            state: next,
            previous: inner.state,
            timestamp: OffsetDateTime::now_utc(),
            held,
            confidence: probability,
        };
        debug!(from = ?inner.state, to = ?next, probability, "vad transition");
        inner.state = next;
        inner.entered_at = Instant::now();

        if self.events_tx.try_send(event).is_err() {
            debug!("vad event channel full; transition dropped");
        }
    }

    /// Receive the next transition event.
    pub async fn recv_event(&self) -> Option<VadEvent> {
        self.events_rx.lock().await.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv_event(&self) -> Option<VadEvent> {
        self.events_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Restore Quiet, zero the smoothed RMS, restart the state clock, and
    /// drain any queued events.
    pub fn reset(&self) {
        {
            let mut inner = self.inner.write();
            inner.state = VadState::Quiet;
            inner.smoothed_rms = 0.0;
            inner.entered_at = Instant::now();
        }
        if let Ok(mut rx) = self.events_rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
    }
}

/// The transition table. Pure so it can be exercised exhaustively.
fn next_state(
    current: VadState,
    above: bool,
    held: Duration,
    start: Duration,
    stop: Duration,
) -> VadState {
    match current {
        VadState::Quiet if above => VadState::Starting,
        VadState::Starting if !above => VadState::Quiet,
        VadState::Starting if above && held >= start => VadState::Speaking,
        VadState::Speaking if !above => VadState::Stopping,
        VadState::Stopping if above => VadState::Speaking,
        VadState::Stopping if !above && held >= stop => VadState::Quiet,
        other => other,
    }
}

/// RMS of a 16-bit little-endian PCM buffer, normalised to [0, 1].
/// A trailing odd byte is ignored.
fn pcm16_rms(bytes: &[u8]) -> f32 {
    let mut sum_squares = 0.0f64;
    let mut count = 0usize;
    for pair in bytes.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        let normalised = f64::from(sample) / 32768.0;
        sum_squares += normalised * normalised;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    (sum_squares / count as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_pcm(amplitude: f32, samples: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(samples * 2);
        for i in 0..samples {
            let phase = i as f32 * 0.2;
            let value = (phase.sin() * amplitude * 32767.0) as i16;
            out.extend_from_slice(&value.to_le_bytes());
        }
        out
    }

    fn silence(samples: usize) -> Vec<u8> {
        vec![0u8; samples * 2]
    }

    #[test]
    fn rejects_out_of_range_params() {
        let bad = VadParams {
            confidence: 1.5,
            ..Default::default()
        };
        match bad.validate().unwrap_err() {
            VoiceError::Validation { field, .. } => assert_eq!(field, "confidence"),
            other => panic!("unexpected error: {other}"),
        }

        let bad = VadParams {
            sample_rate: 0,
            ..Default::default()
        };
        match bad.validate().unwrap_err() {
            VoiceError::Validation { field, .. } => assert_eq!(field, "sample_rate"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_input_short_circuits_to_zero() {
        let vad = VadAnalyzer::new(VadParams::default()).unwrap();
        let p = vad.analyze(&CancellationToken::new(), &[]).unwrap();
        assert_eq!(p, 0.0);
        assert_eq!(vad.state(), VadState::Quiet);
    }

    #[test]
    fn rms_of_full_scale_square_is_one() {
        let mut bytes = Vec::new();
        for _ in 0..64 {
            bytes.extend_from_slice(&i16::MAX.to_le_bytes());
        }
        assert!((pcm16_rms(&bytes) - 1.0).abs() < 1e-3);
        assert_eq!(pcm16_rms(&silence(64)), 0.0);
    }

    #[test]
    fn transition_table_has_no_skips() {
        let start = Duration::from_millis(100);
        let stop = Duration::from_millis(100);
        let short = Duration::from_millis(10);
        let long = Duration::from_millis(200);

        use VadState::*;
        // Quiet only leaves toward Starting.
        assert_eq!(next_state(Quiet, true, short, start, stop), Starting);
        assert_eq!(next_state(Quiet, false, long, start, stop), Quiet);
        // Starting falls back to Quiet or confirms after the window.
        assert_eq!(next_state(Starting, false, short, start, stop), Quiet);
        assert_eq!(next_state(Starting, true, short, start, stop), Starting);
        assert_eq!(next_state(Starting, true, long, start, stop), Speaking);
        // Speaking only leaves toward Stopping.
        assert_eq!(next_state(Speaking, false, short, start, stop), Stopping);
        assert_eq!(next_state(Speaking, true, long, start, stop), Speaking);
        // Stopping resumes or confirms quiet after the window.
        assert_eq!(next_state(Stopping, true, short, start, stop), Speaking);
        assert_eq!(next_state(Stopping, false, short, start, stop), Stopping);
        assert_eq!(next_state(Stopping, false, long, start, stop), Quiet);
    }

    #[tokio::test]
    async fn sustained_voice_then_silence_walks_the_machine() {
        let vad = VadAnalyzer::new(VadParams {
            start_secs: 0.001,
            stop_secs: 0.001,
            ..Default::default()
        })
        .unwrap();
        let cancel = CancellationToken::new();
        let voiced = sine_pcm(0.5, 100);

        for _ in 0..50 {
            vad.analyze(&cancel, &voiced).unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(
            matches!(vad.state(), VadState::Starting | VadState::Speaking),
            "state after voiced burst: {:?}",
            vad.state()
        );

        let quiet = silence(100);
        for _ in 0..50 {
            vad.analyze(&cancel, &quiet).unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(
            matches!(vad.state(), VadState::Stopping | VadState::Quiet),
            "state after silence: {:?}",
            vad.state()
        );
    }

    #[tokio::test]
    async fn transitions_emit_events_and_reset_drains_them() {
        let vad = VadAnalyzer::new(VadParams {
            start_secs: 0.0,
            ..Default::default()
        })
        .unwrap();
        let cancel = CancellationToken::new();
        let voiced = sine_pcm(0.5, 100);

        for _ in 0..10 {
            vad.analyze(&cancel, &voiced).unwrap();
        }
        let event = vad.try_recv_event().expect("transition event expected");
        assert_eq!(event.previous, VadState::Quiet);
        assert_eq!(event.state, VadState::Starting);

        vad.reset();
        assert_eq!(vad.state(), VadState::Quiet);
        assert!(vad.try_recv_event().is_none());
    }

    #[test]
    fn cancelled_analyze_fails() {
        let vad = VadAnalyzer::new(VadParams::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            vad.analyze(&cancel, &[0, 0]),
            Err(VoiceError::Cancelled)
        ));
    }
}
