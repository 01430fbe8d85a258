//! Channel transport
//!
//! The transport seam separates the reconnect/dispatch machinery from the
//! wire protocol. Production uses the pipeline service's event-stream
//! endpoint; tests substitute scripted transports.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;

use super::Envelope;

/// Opens connections to the status feed
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ChannelConnection>>;
}

/// One live connection delivering envelopes in server send order
#[async_trait]
pub trait ChannelConnection: Send {
    /// Next envelope; `None` means the server closed the stream
    async fn next_envelope(&mut self) -> Option<Result<Envelope>>;
}

/// Server-sent event stream over HTTP
pub struct EventStreamTransport {
    client: reqwest::Client,
    url: String,
}

impl EventStreamTransport {
    pub fn new(url: String) -> Self {
        // No overall request timeout: the stream is long-lived
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, url }
    }
}

#[async_trait]
impl ChannelTransport for EventStreamTransport {
    async fn connect(&self) -> Result<Box<dyn ChannelConnection>> {
        let resp = self
            .client
            .get(&self.url)
            .header("Accept", "text/event-stream")
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Channel(format!(
                "event stream refused: {}",
                resp.status()
            )));
        }

        tracing::debug!(url = %self.url, "Event stream open");

        Ok(Box::new(EventStreamConnection {
            stream: Box::pin(resp.bytes_stream()),
            buffer: Vec::new(),
        }))
    }
}

struct EventStreamConnection {
    stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: Vec<u8>,
}

#[async_trait]
impl ChannelConnection for EventStreamConnection {
    async fn next_envelope(&mut self) -> Option<Result<Envelope>> {
        loop {
            while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                if let Some(envelope) = parse_event_line(line.trim()) {
                    return Some(Ok(envelope));
                }
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Some(Err(Error::Channel(e.to_string()))),
                None => return None,
            }
        }
    }
}

/// Parse one event-stream line; non-data lines and malformed payloads are
/// skipped (forward-compatible)
fn parse_event_line(line: &str) -> Option<Envelope> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }

    match serde_json::from_str::<Envelope>(payload) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            tracing::warn!(error = %e, "Malformed envelope skipped");
            None
        }
    }
}
