//! Voice session wrapper behavior over an in-process loopback backend.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tandem::provider::loopback::LoopbackSession;
use tandem::provider::MediaChunk;
use tandem_voice::{
    InterruptStrategy, VadParams, VadState, VoiceError, VoiceSession, VoiceSessionConfig,
};

fn voiced_chunk(samples: usize) -> MediaChunk {
    let mut data = Vec::with_capacity(samples * 2);
    for i in 0..samples {
        let value = ((i as f32 * 0.2).sin() * 0.6 * 32767.0) as i16;
        data.extend_from_slice(&value.to_le_bytes());
    }
    MediaChunk::pcm16(data, 16_000)
}

fn silence_chunk(samples: usize) -> MediaChunk {
    MediaChunk::pcm16(vec![0u8; samples * 2], 16_000)
}

fn fast_vad() -> VadParams {
    VadParams {
        start_secs: 0.0,
        stop_secs: 0.0,
        ..Default::default()
    }
}

async fn speak(session: &VoiceSession, cancel: &CancellationToken) {
    for _ in 0..8 {
        session.send_chunk(cancel, &voiced_chunk(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(session.vad_state(), VadState::Speaking);
}

#[tokio::test]
async fn chunks_are_forwarded_downstream() {
    let backend = std::sync::Arc::new(LoopbackSession::new());
    let config = VoiceSessionConfig {
        vad: fast_vad(),
        ..Default::default()
    };
    let session = VoiceSession::new(config, Box::new(std::sync::Arc::clone(&backend))).unwrap();
    let cancel = CancellationToken::new();

    let chunk = silence_chunk(50);
    session.send_chunk(&cancel, &chunk).await.unwrap();
    assert_eq!(backend.received_media(), chunk.data);

    let mut responses = session.responses().unwrap();
    session.send_text(&cancel, "ping").await.unwrap();
    let echoed = responses.recv().await.unwrap().unwrap();
    assert!(matches!(
        echoed,
        tandem::provider::ProviderChunk::Text(text) if text == "ping"
    ));
}

#[tokio::test]
async fn turn_signal_fires_after_silence_threshold() {
    let config = VoiceSessionConfig {
        vad: fast_vad(),
        turn_silence_threshold: Some(Duration::from_millis(30)),
        interruption: None,
    };
    let session = VoiceSession::new(config, Box::new(LoopbackSession::new())).unwrap();
    let cancel = CancellationToken::new();
    let mut turns = session.turn_signals().unwrap();

    speak(&session, &cancel).await;
    assert!(session.is_user_speaking());

    for _ in 0..4 {
        session.send_chunk(&cancel, &silence_chunk(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    tokio::time::sleep(Duration::from_millis(40)).await;
    for _ in 0..2 {
        session.send_chunk(&cancel, &silence_chunk(100)).await.unwrap();
    }

    let turn = tokio::time::timeout(Duration::from_millis(200), turns.recv())
        .await
        .expect("turn signal expected")
        .unwrap();
    assert!(!turn.audio.is_empty(), "turn carries the accumulated audio");
}

#[tokio::test]
async fn interruption_signal_fires_while_bot_speaks() {
    let config = VoiceSessionConfig {
        vad: fast_vad(),
        turn_silence_threshold: None,
        interruption: Some(InterruptStrategy::Immediate),
    };
    let session = VoiceSession::new(config, Box::new(LoopbackSession::new())).unwrap();
    let cancel = CancellationToken::new();
    let mut interruptions = session.interruption_signals().unwrap();

    session.interruption_handler().unwrap().set_bot_speaking(true);
    speak(&session, &cancel).await;

    tokio::time::timeout(Duration::from_millis(200), interruptions.recv())
        .await
        .expect("interruption signal expected")
        .unwrap();
    assert!(session.interruption_handler().unwrap().is_interrupted());
}

#[tokio::test]
async fn without_turn_detector_speaking_is_derived_from_vad() {
    let config = VoiceSessionConfig {
        vad: fast_vad(),
        turn_silence_threshold: None,
        interruption: None,
    };
    let session = VoiceSession::new(config, Box::new(LoopbackSession::new())).unwrap();
    let cancel = CancellationToken::new();

    assert!(!session.is_user_speaking());
    speak(&session, &cancel).await;
    assert!(session.is_user_speaking());
}

#[tokio::test]
async fn close_is_idempotent_and_rejects_further_work() {
    let session =
        VoiceSession::new(VoiceSessionConfig::default(), Box::new(LoopbackSession::new())).unwrap();
    let cancel = CancellationToken::new();
    let mut turns = session.turn_signals().unwrap();

    session.close().await.unwrap();
    session.close().await.unwrap();

    let err = session
        .send_chunk(&cancel, &silence_chunk(10))
        .await
        .unwrap_err();
    assert!(matches!(err, VoiceError::SessionClosed));
    let err = session.send_text(&cancel, "late").await.unwrap_err();
    assert!(matches!(err, VoiceError::SessionClosed));

    // The signal channel closed with the session.
    assert!(turns.recv().await.is_none());
}

#[tokio::test]
async fn reset_restores_all_components() {
    let config = VoiceSessionConfig {
        vad: fast_vad(),
        turn_silence_threshold: Some(Duration::from_millis(10)),
        interruption: Some(InterruptStrategy::Immediate),
    };
    let session = VoiceSession::new(config, Box::new(LoopbackSession::new())).unwrap();
    let cancel = CancellationToken::new();

    session.interruption_handler().unwrap().set_bot_speaking(true);
    speak(&session, &cancel).await;

    session.reset();
    assert_eq!(session.vad_state(), VadState::Quiet);
    assert!(!session.is_user_speaking());
    assert!(!session.interruption_handler().unwrap().is_interrupted());
}
