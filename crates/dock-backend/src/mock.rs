//! Mock agent service for testing.
//!
//! Renders a scripted exchange as NDJSON bytes and feeds them through the
//! same decoder and cancellation wrapper as the HTTP client, so tests at every
//! layer exercise the real wire handling without a network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::stream;
use bytes::Bytes;
use dock_protocol::{AskRequest, AskResponse, StreamEvent};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::ndjson::parse_ndjson_stream;
use crate::transport::{cancellable, EventStream, FallbackTransport, StreamTransport};

/// Scripted stream content.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Emit any event line.
    Event(StreamEvent),
    /// Emit a raw line verbatim (e.g. malformed JSON).
    Raw { line: String },
    /// Delay before the next line (for timing tests).
    Delay { ms: u64 },
    /// Stop sending without closing the connection.
    Hang,
    /// Break the body with a transport error.
    Fail { reason: String },
}

impl MockResponse {
    pub fn start(message_id: &str) -> Self {
        Self::Event(StreamEvent::start(message_id))
    }

    pub fn text(content: &str) -> Self {
        Self::Event(StreamEvent::delta(content))
    }

    pub fn end(message_id: &str) -> Self {
        Self::Event(StreamEvent::end(message_id))
    }

    pub fn error(message: &str) -> Self {
        Self::Event(StreamEvent::error(message))
    }
}

/// Configuration for the mock service.
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Lines of the streamed answer.
    pub responses: Vec<MockResponse>,
    /// Split the wire bytes into chunks of this many bytes.
    pub chunk_size: Option<usize>,
    /// Delay before each chunk (ms).
    pub chunk_delay_ms: Option<u64>,
    /// Fail to open the stream with this reason.
    pub open_failure: Option<String>,
    /// Outcome of the fallback request.
    pub fallback: Result<AskResponse, String>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            responses: Vec::new(),
            chunk_size: None,
            chunk_delay_ms: None,
            open_failure: None,
            fallback: Err("fallback not configured".to_string()),
        }
    }
}

impl MockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(mut self, responses: Vec<MockResponse>) -> Self {
        self.responses = responses;
        self
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = Some(bytes.max(1));
        self
    }

    pub fn with_chunk_delay(mut self, ms: u64) -> Self {
        self.chunk_delay_ms = Some(ms);
        self
    }

    pub fn with_open_failure(mut self, reason: &str) -> Self {
        self.open_failure = Some(reason.to_string());
        self
    }

    pub fn with_fallback_answer(mut self, answer: &str) -> Self {
        self.fallback = Ok(AskResponse::new(answer));
        self
    }

    pub fn with_fallback_failure(mut self, reason: &str) -> Self {
        self.fallback = Err(reason.to_string());
        self
    }
}

enum Segment {
    Bytes(Vec<u8>),
    Pause(u64),
    Hang,
    Fail(String),
}

/// Group the script into wire segments, merging adjacent lines.
fn render_segments(responses: &[MockResponse]) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = Vec::new();

    for response in responses {
        match response {
            MockResponse::Event(event) => {
                // StreamEvent serialization is infallible: plain strings and numbers only.
                let line = serde_json::to_string(event).unwrap_or_default();
                current.extend_from_slice(line.as_bytes());
                current.push(b'\n');
            }
            MockResponse::Raw { line } => {
                current.extend_from_slice(line.as_bytes());
                current.push(b'\n');
            }
            MockResponse::Delay { ms } => {
                if !current.is_empty() {
                    segments.push(Segment::Bytes(std::mem::take(&mut current)));
                }
                segments.push(Segment::Pause(*ms));
            }
            MockResponse::Hang => {
                if !current.is_empty() {
                    segments.push(Segment::Bytes(std::mem::take(&mut current)));
                }
                segments.push(Segment::Hang);
                return segments;
            }
            MockResponse::Fail { reason } => {
                if !current.is_empty() {
                    segments.push(Segment::Bytes(std::mem::take(&mut current)));
                }
                segments.push(Segment::Fail(reason.clone()));
                return segments;
            }
        }
    }
    if !current.is_empty() {
        segments.push(Segment::Bytes(current));
    }
    segments
}

/// Raw response body of the scripted stream.
pub fn mock_body(config: &MockConfig) -> impl Stream<Item = Result<Bytes, TransportError>> {
    let segments = render_segments(&config.responses);
    let chunk_size = config.chunk_size;
    let chunk_delay = config.chunk_delay_ms.map(Duration::from_millis);

    stream! {
        for segment in segments {
            match segment {
                Segment::Bytes(bytes) => {
                    let size = chunk_size.unwrap_or(bytes.len()).max(1);
                    for chunk in bytes.chunks(size) {
                        if let Some(delay) = chunk_delay {
                            sleep(delay).await;
                        }
                        yield Ok(Bytes::copy_from_slice(chunk));
                    }
                }
                Segment::Pause(ms) => {
                    sleep(Duration::from_millis(ms)).await;
                }
                Segment::Hang => {
                    futures::future::pending::<()>().await;
                }
                Segment::Fail(reason) => {
                    yield Err(TransportError::Unreachable(reason));
                    break;
                }
            }
        }
    }
}

/// Decoded, cancellable event stream of the scripted answer.
pub fn mock_stream(config: &MockConfig, cancel: CancellationToken) -> EventStream {
    let body = Box::pin(mock_body(config));
    cancellable(parse_ndjson_stream(body), cancel)
}

/// Counts a stream as live until it is dropped.
struct LiveStream(Arc<AtomicUsize>);

impl LiveStream {
    fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(live))
    }
}

impl Drop for LiveStream {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-process agent service implementing both transports.
pub struct MockTransport {
    config: MockConfig,
    opens: AtomicUsize,
    asks: AtomicUsize,
    live: Arc<AtomicUsize>,
    requests: Mutex<Vec<AskRequest>>,
}

impl MockTransport {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            opens: AtomicUsize::new(0),
            asks: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of stream opens attempted.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of fallback requests made.
    pub fn ask_count(&self) -> usize {
        self.asks.load(Ordering::SeqCst)
    }

    /// Opened streams not yet dropped by their reader.
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Every request received, streamed or not, in arrival order.
    pub fn requests(&self) -> Vec<AskRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn record(&self, request: &AskRequest) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
    }
}

impl StreamTransport for MockTransport {
    fn open<'a>(
        &'a self,
        request: &'a AskRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<EventStream, TransportError>> {
        Box::pin(async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.record(request);

            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            if let Some(reason) = &self.config.open_failure {
                return Err(TransportError::Unreachable(reason.clone()));
            }
            let live = LiveStream::new(&self.live);
            let events: EventStream = Box::pin(
                mock_stream(&self.config, cancel).map(move |item| {
                    let _held = &live;
                    item
                }),
            );
            Ok(events)
        })
    }
}

impl FallbackTransport for MockTransport {
    fn ask<'a>(
        &'a self,
        request: &'a AskRequest,
    ) -> BoxFuture<'a, Result<AskResponse, TransportError>> {
        Box::pin(async move {
            self.asks.fetch_add(1, Ordering::SeqCst);
            self.record(request);

            self.config
                .fallback
                .clone()
                .map_err(TransportError::Unreachable)
        })
    }
}

/// Built-in scripts for common scenarios.
pub mod fixtures {
    use super::*;

    /// A complete answer: start, one delta per chunk, end.
    pub fn streaming_answer(message_id: &str, chunks: &[&str]) -> MockConfig {
        let mut responses = vec![MockResponse::start(message_id)];
        responses.extend(chunks.iter().map(|chunk| MockResponse::text(chunk)));
        responses.push(MockResponse::end(message_id));
        MockConfig::new().with_responses(responses)
    }

    /// Some text, then an error reported by the server.
    pub fn error_mid_stream(text_before: &str, error: &str) -> MockConfig {
        MockConfig::new().with_responses(vec![
            MockResponse::start("srv-err"),
            MockResponse::text(text_before),
            MockResponse::error(error),
        ])
    }

    /// Some text, then silence with the connection left open.
    pub fn stalls_after(text: &str) -> MockConfig {
        MockConfig::new().with_responses(vec![
            MockResponse::start("srv-stall"),
            MockResponse::text(text),
            MockResponse::Hang,
        ])
    }

    /// The stream cannot be opened; the fallback answers.
    pub fn unreachable_stream(answer: &str) -> MockConfig {
        MockConfig::new()
            .with_open_failure("connection refused")
            .with_fallback_answer(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn events_of(config: &MockConfig) -> Vec<StreamEvent> {
        mock_stream(config, CancellationToken::new())
            .map(|item| item.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn mock_stream_emits_events() {
        let config = fixtures::streaming_answer("m1", &["Hello", " world"]);
        let events = events_of(&config).await;

        assert_eq!(
            events,
            vec![
                StreamEvent::start("m1"),
                StreamEvent::delta("Hello"),
                StreamEvent::delta(" world"),
                StreamEvent::end("m1"),
            ]
        );
    }

    #[tokio::test]
    async fn tiny_chunks_decode_the_same() {
        let config =
            fixtures::streaming_answer("m1", &["RAG ", "применялся в..."]).with_chunk_size(3);
        let events = events_of(&config).await;
        assert_eq!(events[1], StreamEvent::delta("RAG "));
        assert_eq!(events[2], StreamEvent::delta("применялся в..."));
    }

    #[tokio::test]
    async fn raw_malformed_line_is_skipped() {
        let config = MockConfig::new().with_responses(vec![
            MockResponse::text("a"),
            MockResponse::Raw {
                line: "{oops".to_string(),
            },
            MockResponse::text("b"),
        ]);
        let events = events_of(&config).await;
        assert_eq!(events, vec![StreamEvent::delta("a"), StreamEvent::delta("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn hang_is_cancellable() {
        let cancel = CancellationToken::new();
        let mut events = mock_stream(&fixtures::stalls_after("partial"), cancel.clone());

        assert_eq!(events.next().await.unwrap().unwrap(), StreamEvent::start("srv-stall"));
        assert_eq!(events.next().await.unwrap().unwrap(), StreamEvent::delta("partial"));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });
        assert!(events.next().await.unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn fail_breaks_the_body_after_earlier_lines() {
        let config = MockConfig::new().with_responses(vec![
            MockResponse::text("a"),
            MockResponse::Fail {
                reason: "reset".to_string(),
            },
            MockResponse::text("never"),
        ]);
        let mut events = mock_stream(&config, CancellationToken::new());

        assert_eq!(events.next().await.unwrap().unwrap(), StreamEvent::delta("a"));
        let err = events.next().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "agent unreachable: reset");
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_streams_are_no_longer_live() {
        let transport = MockTransport::new(fixtures::stalls_after("partial"));
        let request = AskRequest::new("q", "s");

        let events = transport.open(&request, CancellationToken::new()).await.unwrap();
        assert_eq!(transport.live_streams(), 1);
        drop(events);
        assert_eq!(transport.live_streams(), 0);
    }

    #[tokio::test]
    async fn open_failure_and_fallback() {
        let transport = MockTransport::new(fixtures::unreachable_stream("X"));
        let request = AskRequest::new("q", "s");

        let err = match transport.open(&request, CancellationToken::new()).await {
            Ok(_) => panic!("expected open failure"),
            Err(err) => err,
        };
        assert!(!err.is_cancelled());

        let answer = transport.ask(&request).await.unwrap();
        assert_eq!(answer.answer, "X");
        assert_eq!(transport.open_count(), 1);
        assert_eq!(transport.ask_count(), 1);
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn fallback_failure() {
        let transport = MockTransport::new(MockConfig::new().with_fallback_failure("down"));
        let err = transport.ask(&AskRequest::new("q", "s")).await.unwrap_err();
        assert_eq!(err.to_string(), "agent unreachable: down");
    }
}
