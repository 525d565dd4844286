//! Server-sent-events transport for mutation events.
//!
//! The daemon exposes a long-lived `text/event-stream` endpoint that
//! pushes one JSON mutation event per SSE `data:` frame. This module
//! handles one connection at a time; the watcher owns reconnects.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::ACCEPT;

use crate::error::{BeadsError, Result};
use crate::types::MutationEvent;

/// Factory for SSE connections to the daemon's events endpoint.
#[derive(Debug, Clone)]
pub struct SseStream {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl SseStream {
    /// Create a stream factory for the given events URL.
    ///
    /// The underlying client has a connect timeout but no request
    /// timeout; disconnects are detected by read errors.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client cannot be created (should never
    /// happen with default TLS).
    #[must_use]
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to create HTTP client");

        Self {
            http,
            url: url.into(),
            token,
        }
    }

    /// Open one connection to the events endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or the
    /// daemon answers with a non-success status.
    pub async fn connect(&self) -> Result<SseConnection> {
        let mut req = self.http.get(&self.url).header(ACCEPT, "text/event-stream");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let response = req.send().await?.error_for_status()?;
        tracing::debug!(url = %self.url, "connected to event stream");

        Ok(SseConnection {
            inner: response.bytes_stream().boxed(),
            buf: Vec::new(),
            data: String::new(),
        })
    }
}

/// One live SSE connection, yielding decoded mutation events.
pub struct SseConnection {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    buf: Vec<u8>,
    data: String,
}

impl SseConnection {
    /// Read the next mutation event off the stream.
    ///
    /// Returns `Ok(None)` on a clean end of stream. Undecodable frames
    /// are dropped with a warning; SSE fields other than `data:` are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying stream fails mid-read.
    pub async fn next_event(&mut self) -> Result<Option<MutationEvent>> {
        loop {
            while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                if let Some(event) = self.take_line(&line) {
                    return Ok(Some(event));
                }
            }

            match self.inner.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    return Err(BeadsError::Stream(format!("event stream read failed: {e}")));
                }
                None => return Ok(None),
            }
        }
    }

    /// Consume one line; returns a decoded event when the line
    /// terminates a frame with accumulated data.
    fn take_line(&mut self, raw: &[u8]) -> Option<MutationEvent> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            let payload = std::mem::take(&mut self.data);
            match serde_json::from_str(&payload) {
                Ok(event) => return Some(event),
                Err(e) => {
                    tracing::warn!(error = %e, "dropping undecodable event frame");
                    return None;
                }
            }
        }

        if let Some(rest) = line.strip_prefix("data:") {
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn serve_body(body: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events"))
            .and(header("accept", "text/event-stream"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/event-stream"),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn decodes_data_frames() {
        let body = concat!(
            "data: {\"kind\":\"create\",\"id\":\"gastown-polecat-furiosa\",\"type\":\"agent\"}\n",
            "\n",
            "data: {\"kind\":\"delete\",\"id\":\"hq-mayor\"}\n",
            "\n",
        );
        let server = serve_body(body).await;

        let stream = SseStream::new(format!("{}/events", server.uri()), None);
        let mut conn = stream.connect().await.unwrap();

        let first = conn.next_event().await.unwrap().unwrap();
        assert_eq!(first.kind, "create");
        assert_eq!(first.id, "gastown-polecat-furiosa");

        let second = conn.next_event().await.unwrap().unwrap();
        assert_eq!(second.kind, "delete");
        assert_eq!(second.id, "hq-mayor");

        assert!(conn.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reassembles_multi_line_data() {
        let body = concat!(
            "event: mutation\n",
            "data: {\"kind\":\"status\",\n",
            "data: \"id\":\"gastown-crew-nux\",\"new_status\":\"closed\"}\n",
            "\n",
        );
        let server = serve_body(body).await;

        let stream = SseStream::new(format!("{}/events", server.uri()), None);
        let mut conn = stream.connect().await.unwrap();

        let event = conn.next_event().await.unwrap().unwrap();
        assert_eq!(event.kind, "status");
        assert_eq!(event.new_status.as_deref(), Some("closed"));
    }

    #[tokio::test]
    async fn skips_comments_and_garbage_frames() {
        let body = concat!(
            ": keepalive\n",
            "\n",
            "data: not json at all\n",
            "\n",
            "data: {\"kind\":\"update\",\"id\":\"gastown-crew-nux\"}\n",
            "\n",
        );
        let server = serve_body(body).await;

        let stream = SseStream::new(format!("{}/events", server.uri()), None);
        let mut conn = stream.connect().await.unwrap();

        let event = conn.next_event().await.unwrap().unwrap();
        assert_eq!(event.kind, "update");
        assert!(conn.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_success_connect_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let stream = SseStream::new(format!("{}/events", server.uri()), None);
        assert!(stream.connect().await.is_err());
    }
}
