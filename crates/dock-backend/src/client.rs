//! HTTP client for the portfolio agent service.

use std::time::Duration;

use dock_protocol::{AskRequest, AskResponse};
use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::ndjson::parse_ndjson_stream;
use crate::transport::{cancellable, EventStream, FallbackTransport, StreamTransport};

pub const DEFAULT_STREAM_PATH: &str = "/api/v1/agent/chat/stream";
pub const DEFAULT_ASK_PATH: &str = "/ask";

/// Longest error body kept from a failed response.
const MAX_ERROR_BODY: usize = 512;

/// Where and how to reach the agent service.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    pub stream_path: String,
    pub ask_path: String,
    pub connect_timeout: Duration,
    /// Ceiling for the fallback request. Streams are bounded by the
    /// controller's idle timeout instead.
    pub request_timeout: Duration,
}

impl ClientOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            ask_path: DEFAULT_ASK_PATH.to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Agent API client.
pub struct AgentClient {
    http: Client,
    stream_url: String,
    ask_url: String,
    request_timeout: Duration,
}

/// Build an HTTP client with connection limits. No total timeout: answers
/// may stream for longer than any fixed ceiling.
fn build_http_client(options: &ClientOptions) -> Result<Client, TransportError> {
    Ok(Client::builder()
        .connect_timeout(options.connect_timeout)
        .pool_max_idle_per_host(2)
        .build()?)
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

impl AgentClient {
    pub fn new(options: ClientOptions) -> Result<Self, TransportError> {
        Ok(Self {
            http: build_http_client(&options)?,
            stream_url: join_url(&options.base_url, &options.stream_path),
            ask_url: join_url(&options.base_url, &options.ask_path),
            request_timeout: options.request_timeout,
        })
    }

    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    pub fn ask_url(&self) -> &str {
        &self.ask_url
    }

    /// Open the answer stream. Resolves once the response headers are in.
    pub async fn open_stream(
        &self,
        request: &AskRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, TransportError> {
        let send = self
            .http
            .post(&self.stream_url)
            .header("accept", "application/x-ndjson")
            .json(request)
            .send();
        let open = async {
            let response = send.await?;
            check_response(response).await
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            response = open => response?,
        };

        tracing::debug!(url = %self.stream_url, status = %response.status(), "agent stream opened");

        let events = parse_ndjson_stream(response.bytes_stream())
            .map(|item| item.map_err(TransportError::Body));
        Ok(cancellable(events, cancel))
    }

    /// Send the question to the non-streaming endpoint.
    pub async fn ask_once(&self, request: &AskRequest) -> Result<AskResponse, TransportError> {
        let response = self
            .http
            .post(&self.ask_url)
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?;
        let response = check_response(response).await?;

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

impl StreamTransport for AgentClient {
    fn open<'a>(
        &'a self,
        request: &'a AskRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<EventStream, TransportError>> {
        Box::pin(self.open_stream(request, cancel))
    }
}

impl FallbackTransport for AgentClient {
    fn ask<'a>(
        &'a self,
        request: &'a AskRequest,
    ) -> BoxFuture<'a, Result<AskResponse, TransportError>> {
        Box::pin(self.ask_once(request))
    }
}

/// Reject non-2xx responses and responses that cannot carry a body.
async fn check_response(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if !status.is_success() {
        return Err(TransportError::Status {
            status: status.as_u16(),
            body: read_error_body(response).await,
        });
    }
    if status == StatusCode::NO_CONTENT {
        return Err(TransportError::MissingBody);
    }
    Ok(response)
}

/// Read at most `MAX_ERROR_BODY` bytes of a failed response.
async fn read_error_body(mut response: Response) -> String {
    let mut body = Vec::new();
    while body.len() < MAX_ERROR_BODY {
        match response.chunk().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "error body unreadable");
                break;
            }
        }
    }
    error_body_text(&body)
}

/// Decode the first `MAX_ERROR_BODY` bytes, dropping a character cut in half.
fn error_body_text(bytes: &[u8]) -> String {
    let mut bytes = &bytes[..bytes.len().min(MAX_ERROR_BODY)];
    if let Err(e) = std::str::from_utf8(bytes) {
        if e.error_len().is_none() {
            bytes = &bytes[..e.valid_up_to()];
        }
    }
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: impl Into<reqwest::Body>) -> Response {
        Response::from(
            http::Response::builder()
                .status(status)
                .body(body.into())
                .unwrap(),
        )
    }

    #[test]
    fn join_url_handles_slashes() {
        assert_eq!(join_url("http://a/", "/ask"), "http://a/ask");
        assert_eq!(join_url("http://a", "ask"), "http://a/ask");
        assert_eq!(
            join_url("http://a/agent/", "/api/v1/agent/chat/stream"),
            "http://a/agent/api/v1/agent/chat/stream"
        );
    }

    #[test]
    fn new_client_builds_urls() {
        let client = AgentClient::new(ClientOptions::new("http://localhost:8000/")).unwrap();
        assert_eq!(
            client.stream_url(),
            "http://localhost:8000/api/v1/agent/chat/stream"
        );
        assert_eq!(client.ask_url(), "http://localhost:8000/ask");
    }

    #[tokio::test]
    async fn check_response_accepts_success() {
        let ok = check_response(response(200, "{}")).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn check_response_rejects_error_status() {
        let err = check_response(response(503, "overloaded")).await.unwrap_err();
        match err {
            TransportError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn check_response_rejects_no_content() {
        let err = check_response(response(204, "")).await.unwrap_err();
        assert!(matches!(err, TransportError::MissingBody));
    }

    #[tokio::test]
    async fn check_response_keeps_only_head_of_long_body() {
        let err = check_response(response(500, "x".repeat(5_000))).await.unwrap_err();
        match err {
            TransportError::Status { body, .. } => assert_eq!(body.len(), MAX_ERROR_BODY),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn error_body_respects_char_boundaries() {
        let body = "я".repeat(400); // 800 bytes
        assert_eq!(error_body_text(body.as_bytes()).chars().count(), 256);

        // One leading byte puts the cut in the middle of a letter.
        let body = format!("a{}", "я".repeat(400));
        let text = error_body_text(body.as_bytes());
        assert_eq!(text.len(), 511);
        assert!(!text.contains('\u{fffd}'));
    }

    #[test]
    fn error_body_keeps_short_bodies() {
        assert_eq!(error_body_text(b"short"), "short");
    }
}
