//! Voice session core: real-time audio classification and turn-taking on
//! top of a provider's streaming-input session.
//!
//! The pieces compose bottom-up: a [`vad::VadAnalyzer`] classifies PCM
//! audio into a four-state voice-activity machine, a [`turn::TurnDetector`]
//! turns silence after speech into turn boundaries, an
//! [`interrupt::InterruptionHandler`] decides what a user barge-in means
//! while the bot is speaking, and a [`session::VoiceSession`] threads every
//! audio chunk through all three before forwarding it downstream.

pub mod error;
pub mod interrupt;
pub mod resample;
pub mod session;
pub mod turn;
pub mod vad;

pub use error::VoiceError;
pub use interrupt::{InterruptStrategy, InterruptionHandler};
pub use resample::{resample, STT_SAMPLE_RATE, TTS_SAMPLE_RATE};
pub use session::{TurnDetected, VoiceSession, VoiceSessionConfig};
pub use turn::TurnDetector;
pub use vad::{VadAnalyzer, VadEvent, VadParams, VadState};
