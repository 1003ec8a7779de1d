//! Shared outbound HTTP execution for wire-building provider adapters.
//!
//! Adapters assemble `http::Request<Vec<u8>>` values and parse
//! `http::Response<Vec<u8>>` values; this module owns the single
//! `reqwest` client that moves bytes between the two.

use futures::{Stream, StreamExt};
use once_cell::sync::Lazy;
use reqwest::Client;

use crate::error::EngineError;

/// A single, global client, built once.
static CLIENT: Lazy<Client> = Lazy::new(Client::new);

/// Execute a buffered request/response exchange.
///
/// Non-OK statuses are returned as responses, not errors: the adapter's
/// parser decides how to surface the body.
pub async fn call_outbound(
    req: http::Request<Vec<u8>>,
) -> Result<http::Response<Vec<u8>>, EngineError> {
    let client = &*CLIENT;

    let method = req
        .method()
        .as_str()
        .parse::<reqwest::Method>()
        .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;

    let mut rb = client.request(method, req.uri().to_string());
    for (name, value) in req.headers().iter() {
        let val_str = value
            .to_str()
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        rb = rb.header(name.as_str(), val_str);
    }

    let resp = rb.body(req.into_body()).send().await?;

    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.bytes().await?.to_vec();

    let mut builder = http::Response::builder().status(status.as_u16());
    for (name, value) in headers.iter() {
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    Ok(builder.body(bytes)?)
}

/// Execute a request and return the raw response byte stream.
///
/// Unlike [`call_outbound`], a non-OK status is an error here: the body is
/// drained and surfaced as [`EngineError::HttpStatus`] since there is no
/// stream to scan.
pub async fn open_stream(
    req: http::Request<Vec<u8>>,
) -> Result<impl Stream<Item = Result<Vec<u8>, EngineError>> + Send + Unpin, EngineError> {
    let client = &*CLIENT;

    let method = req
        .method()
        .as_str()
        .parse::<reqwest::Method>()
        .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;

    let mut rb = client.request(method, req.uri().to_string());
    for (name, value) in req.headers().iter() {
        if let Ok(val_str) = value.to_str() {
            rb = rb.header(name.as_str(), val_str);
        }
    }

    let resp = rb.body(req.into_body()).send().await?;
    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(EngineError::HttpStatus { status, body });
    }

    Ok(resp
        .bytes_stream()
        .map(|item| item.map(|bytes| bytes.to_vec()).map_err(EngineError::from))
        .boxed())
}

/// Reassembles SSE lines from arbitrarily-split byte chunks.
///
/// Transport chunking does not respect frame boundaries; the scanner feeds
/// bytes in and takes back only complete lines (without the trailing
/// newline or carriage return).
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buf: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and drain every complete line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // '\n'
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_lines_across_chunk_boundaries() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(b"data: {\"a\"").is_empty());
        let lines = buf.push(b": 1}\n\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"a\": 1}", "", "data: [DONE]"]);
    }

    #[test]
    fn strips_carriage_returns() {
        let mut buf = SseLineBuffer::new();
        let lines = buf.push(b"data: x\r\n");
        assert_eq!(lines, vec!["data: x"]);
    }

    #[test]
    fn holds_incomplete_tail() {
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(b"data: partial").is_empty());
        assert_eq!(buf.push(b"\n"), vec!["data: partial"]);
    }
}
