//! In-process loopback implementation of the streaming-input session
//! contract, for tests and local development.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::provider::{MediaChunk, ProviderChunk, ProviderStream, StreamingInputSession};

const RESPONSE_CHANNEL_CAPACITY: usize = 64;

/// A streaming-input session that accumulates submitted media and echoes
/// text submissions back on its response channel.
pub struct LoopbackSession {
    response_tx: Mutex<Option<mpsc::Sender<Result<ProviderChunk, EngineError>>>>,
    response_rx: Mutex<Option<ProviderStream>>,
    received: Mutex<Vec<u8>>,
    closed: AtomicBool,
    finished: CancellationToken,
    error: Mutex<Option<EngineError>>,
}

impl LoopbackSession {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        Self {
            response_tx: Mutex::new(Some(tx)),
            response_rx: Mutex::new(Some(rx)),
            received: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            finished: CancellationToken::new(),
            error: Mutex::new(None),
        }
    }

    /// All media bytes submitted so far.
    pub fn received_media(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EngineError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

impl Default for LoopbackSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamingInputSession for LoopbackSession {
    async fn send_chunk(
        &self,
        cancel: &CancellationToken,
        chunk: &MediaChunk,
    ) -> Result<(), EngineError> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        self.received.lock().unwrap().extend_from_slice(&chunk.data);
        Ok(())
    }

    async fn send_text(&self, cancel: &CancellationToken, text: &str) -> Result<(), EngineError> {
        self.ensure_open()?;
        let tx = self
            .response_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(EngineError::SessionClosed)?;
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            sent = tx.send(Ok(ProviderChunk::Text(text.to_string()))) => {
                sent.map_err(|_| EngineError::SessionClosed)
            }
        }
    }

    fn response(&self) -> Option<ProviderStream> {
        self.response_rx.lock().unwrap().take()
    }

    async fn done(&self) {
        self.finished.cancelled().await;
    }

    fn error(&self) -> Option<EngineError> {
        self.error.lock().unwrap().clone()
    }

    async fn close(&self) -> Result<(), EngineError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Dropping the sender closes the response channel.
            self.response_tx.lock().unwrap().take();
            self.finished.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_text_and_accumulates_media() {
        let session = LoopbackSession::new();
        let cancel = CancellationToken::new();
        let mut responses = session.response().expect("first take yields the channel");
        assert!(session.response().is_none());

        session
            .send_chunk(&cancel, &MediaChunk::pcm16(vec![1, 2, 3, 4], 16_000))
            .await
            .unwrap();
        session.send_text(&cancel, "hello").await.unwrap();

        match responses.recv().await.unwrap().unwrap() {
            ProviderChunk::Text(text) => assert_eq!(text, "hello"),
            other => panic!("unexpected chunk: {other:?}"),
        }
        assert_eq!(session.received_media(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_sends() {
        let session = LoopbackSession::new();
        let cancel = CancellationToken::new();

        session.close().await.unwrap();
        session.close().await.unwrap();

        let err = session
            .send_chunk(&cancel, &MediaChunk::pcm16(vec![0, 0], 16_000))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::SessionClosed);

        // done() resolves after close.
        session.done().await;
    }
}
