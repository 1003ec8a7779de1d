//! User-interrupts-bot policy during streaming output.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::vad::VadState;

/// What a user barge-in means while the bot is speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptStrategy {
    /// Barge-ins are ignored.
    Ignore,
    /// Act as soon as the user speaks.
    #[default]
    Immediate,
    /// Wait for the next sentence boundary (or bot stop) before acting.
    Deferred,
}

/// Invoked off-lock on a detached task when an interruption takes effect.
pub type InterruptCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct InterruptInner {
    bot_speaking: bool,
    /// One-shot latch for the current turn.
    interrupted: bool,
    deferred_pending: bool,
    last_vad_state: Option<VadState>,
}

/// Decides whether user speech during bot output should interrupt it.
///
/// `process_vad_state`/`process_audio` return true only when the bot is
/// speaking, the strategy is not [`InterruptStrategy::Ignore`], the VAD
/// indicates Speaking, and the turn has not already been interrupted.
pub struct InterruptionHandler {
    strategy: InterruptStrategy,
    inner: Mutex<InterruptInner>,
    callback: Mutex<Option<InterruptCallback>>,
}

impl InterruptionHandler {
    pub fn new(strategy: InterruptStrategy) -> Self {
        Self {
            strategy,
            inner: Mutex::new(InterruptInner::default()),
            callback: Mutex::new(None),
        }
    }

    pub fn strategy(&self) -> InterruptStrategy {
        self.strategy
    }

    /// Register the interruption callback.
    pub fn on_interrupt(&self, callback: InterruptCallback) {
        *self.callback.lock() = Some(callback);
    }

    pub(crate) fn clear_callback(&self) {
        *self.callback.lock() = None;
    }

    /// Mark whether the bot is currently emitting audio. Clearing it while
    /// a deferred interrupt is pending fires the callback.
    pub fn set_bot_speaking(&self, speaking: bool) {
        let fire = {
            let mut inner = self.inner.lock();
            inner.bot_speaking = speaking;
            if !speaking && inner.deferred_pending {
                inner.deferred_pending = false;
                inner.interrupted = true;
                true
            } else {
                false
            }
        };
        if fire {
            debug!("deferred interruption fires on bot stop");
            self.fire();
        }
    }

    pub fn is_bot_speaking(&self) -> bool {
        self.inner.lock().bot_speaking
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.lock().interrupted
    }

    /// Feed a VAD state update. Returns true when the caller should act on
    /// an interrupt now.
    pub fn process_vad_state(&self, state: VadState) -> bool {
        let mut inner = self.inner.lock();
        inner.last_vad_state = Some(state);
        self.evaluate(&mut inner, state)
    }

    /// Feed an audio chunk, evaluated against the last observed VAD state.
    pub fn process_audio(&self, _bytes: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        match inner.last_vad_state {
            Some(state) => self.evaluate(&mut inner, state),
            None => false,
        }
    }

    fn evaluate(&self, inner: &mut InterruptInner, state: VadState) -> bool {
        let should_act = inner.bot_speaking
            && self.strategy != InterruptStrategy::Ignore
            && state == VadState::Speaking
            && !inner.interrupted;
        if !should_act {
            return false;
        }

        match self.strategy {
            InterruptStrategy::Immediate => {
                inner.interrupted = true;
                debug!("immediate interruption");
                self.fire();
                true
            }
            InterruptStrategy::Deferred => {
                if !inner.deferred_pending {
                    debug!("interruption deferred to the next sentence boundary");
                    inner.deferred_pending = true;
                }
                false
            }
            InterruptStrategy::Ignore => false,
        }
    }

    /// A sentence boundary passed in the bot's output; a pending deferred
    /// interrupt fires now.
    pub fn notify_sentence_boundary(&self) {
        let fire = {
            let mut inner = self.inner.lock();
            if inner.deferred_pending {
                inner.deferred_pending = false;
                inner.interrupted = true;
                true
            } else {
                false
            }
        };
        if fire {
            debug!("deferred interruption fires on sentence boundary");
            self.fire();
        }
    }

    /// Clear the per-turn latches.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.bot_speaking = false;
        inner.interrupted = false;
        inner.deferred_pending = false;
    }

    fn fire(&self) {
        if let Some(callback) = self.callback.lock().clone() {
            tokio::spawn(async move {
                callback();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting(handler: &InterruptionHandler) -> Arc<AtomicUsize> {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        handler.on_interrupt(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        fired
    }

    #[tokio::test]
    async fn immediate_latches_once_per_turn() {
        let handler = InterruptionHandler::new(InterruptStrategy::Immediate);
        let fired = counting(&handler);

        handler.set_bot_speaking(true);
        assert!(handler.process_vad_state(VadState::Speaking));
        // Already latched; further speech does not act again.
        assert!(!handler.process_vad_state(VadState::Speaking));
        assert!(!handler.process_audio(&[0, 0]));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(handler.is_interrupted());
    }

    #[tokio::test]
    async fn ignores_when_bot_is_silent_or_strategy_is_ignore() {
        let handler = InterruptionHandler::new(InterruptStrategy::Immediate);
        assert!(!handler.process_vad_state(VadState::Speaking));

        let handler = InterruptionHandler::new(InterruptStrategy::Ignore);
        handler.set_bot_speaking(true);
        assert!(!handler.process_vad_state(VadState::Speaking));
        assert!(!handler.is_interrupted());
    }

    #[tokio::test]
    async fn non_speaking_states_do_not_act() {
        let handler = InterruptionHandler::new(InterruptStrategy::Immediate);
        handler.set_bot_speaking(true);
        assert!(!handler.process_vad_state(VadState::Starting));
        assert!(!handler.process_vad_state(VadState::Stopping));
        assert!(!handler.process_vad_state(VadState::Quiet));
    }

    #[tokio::test]
    async fn deferred_fires_on_bot_stop() {
        let handler = InterruptionHandler::new(InterruptStrategy::Deferred);
        let fired = counting(&handler);

        handler.set_bot_speaking(true);
        assert!(!handler.process_vad_state(VadState::Speaking));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "not fired while deferred");

        handler.set_bot_speaking(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deferred_fires_on_sentence_boundary_at_most_once() {
        let handler = InterruptionHandler::new(InterruptStrategy::Deferred);
        let fired = counting(&handler);

        handler.set_bot_speaking(true);
        assert!(!handler.process_vad_state(VadState::Speaking));
        handler.notify_sentence_boundary();
        // Bot stop afterwards must not fire a second time.
        handler.set_bot_speaking(false);
        handler.notify_sentence_boundary();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_rearms_the_latch() {
        let handler = InterruptionHandler::new(InterruptStrategy::Immediate);
        let fired = counting(&handler);

        handler.set_bot_speaking(true);
        assert!(handler.process_vad_state(VadState::Speaking));
        handler.reset();
        handler.set_bot_speaking(true);
        assert!(handler.process_vad_state(VadState::Speaking));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
