//! Async driver of a [`Conversation`].
//!
//! One actor task owns the conversation. Callers talk to it through a
//! [`DockHandle`]; transport tasks report back over a channel tagged with
//! their exchange number, and the pacer timer only exists while there is
//! text to reveal. Every state change is published as a [`DockSnapshot`].

use std::sync::Arc;
use std::time::Duration;

use dock_backend::{EventStream, FallbackTransport, StreamTransport, TransportError};
use dock_protocol::{AskRequest, AskResponse, Message, Role, StreamEvent};
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::conversation::{Conversation, OpenFailure, Phase};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DockOptions {
    /// Longest silence tolerated from the stream.
    pub idle_timeout: Duration,
}

impl Default for DockOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// What the UI renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DockSnapshot {
    pub transcript: Vec<Message>,
    pub phase: Phase,
    pub loading: bool,
    pub streaming_started: bool,
    pub active_tool: Option<String>,
}

impl DockSnapshot {
    fn of(conversation: &Conversation) -> Self {
        Self {
            transcript: conversation.transcript().to_vec(),
            phase: conversation.phase(),
            loading: conversation.is_loading(),
            streaming_started: conversation.streaming_started(),
            active_tool: conversation.active_tool().map(str::to_string),
        }
    }

    /// The latest agent reply, if any.
    pub fn last_reply(&self) -> Option<&Message> {
        self.transcript
            .iter()
            .rev()
            .find(|m| m.role == Role::Agent)
    }
}

enum Command {
    Submit {
        question: String,
        reply: oneshot::Sender<bool>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Reports of the transport tasks.
enum Update {
    Event {
        exchange: u64,
        event: StreamEvent,
    },
    Closed {
        exchange: u64,
    },
    OpenFailed {
        exchange: u64,
        error: TransportError,
    },
    StreamFailed {
        exchange: u64,
        error: TransportError,
    },
    Answered {
        exchange: u64,
        response: AskResponse,
    },
    FallbackFailed {
        exchange: u64,
        error: TransportError,
    },
}

enum Wake {
    Command(Command),
    Update(Update),
    Tick(Instant),
}

/// Cloneable access to a running dock.
#[derive(Clone)]
pub struct DockHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<DockSnapshot>,
}

impl DockHandle {
    /// Submit a question. `false` if it was blank, an exchange is in
    /// flight, or the dock is gone.
    pub async fn submit(&self, question: impl Into<String>) -> bool {
        let (reply, answer) = oneshot::channel();
        let command = Command::Submit {
            question: question.into(),
            reply,
        };
        if self.commands.send(command).await.is_err() {
            return false;
        }
        answer.await.unwrap_or(false)
    }

    /// Stop the exchange in flight. `false` if there was none.
    pub async fn stop(&self) -> bool {
        let (reply, answer) = oneshot::channel();
        if self.commands.send(Command::Stop { reply }).await.is_err() {
            return false;
        }
        answer.await.unwrap_or(false)
    }

    /// Stop whatever is in flight and end the actor.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    pub fn subscribe(&self) -> watch::Receiver<DockSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> DockSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Wait until no exchange is in flight.
    pub async fn wait_idle(&self) -> DockSnapshot {
        let mut snapshots = self.snapshots.clone();
        let idle = snapshots
            .wait_for(|snapshot| !snapshot.loading)
            .await
            .map(|snapshot| snapshot.clone());
        idle.unwrap_or_else(|_| self.snapshot())
    }
}

pub struct AgentDock {
    conversation: Conversation,
    stream: Arc<dyn StreamTransport>,
    fallback: Arc<dyn FallbackTransport>,
    options: DockOptions,
    commands: mpsc::Receiver<Command>,
    updates_tx: mpsc::UnboundedSender<Update>,
    updates: mpsc::UnboundedReceiver<Update>,
    snapshots: watch::Sender<DockSnapshot>,
    pacer: Option<Interval>,
}

impl AgentDock {
    /// Start the actor on the current runtime.
    pub fn spawn(
        conversation: Conversation,
        stream: Arc<dyn StreamTransport>,
        fallback: Arc<dyn FallbackTransport>,
        options: DockOptions,
    ) -> DockHandle {
        let (commands_tx, commands) = mpsc::channel(16);
        let (updates_tx, updates) = mpsc::unbounded_channel();
        let (snapshots, snapshots_rx) = watch::channel(DockSnapshot::of(&conversation));

        let dock = Self {
            conversation,
            stream,
            fallback,
            options,
            commands,
            updates_tx,
            updates,
            snapshots,
            pacer: None,
        };
        tokio::spawn(dock.run());

        DockHandle {
            commands: commands_tx,
            snapshots: snapshots_rx,
        }
    }

    async fn run(mut self) {
        tracing::debug!(session = %self.conversation.session(), "dock started");

        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => break,
                },
                Some(update) = self.updates.recv() => Wake::Update(update),
                now = next_tick(&mut self.pacer) => Wake::Tick(now),
            };

            let mut reply = None;
            match wake {
                Wake::Command(Command::Submit { question, reply: tx }) => {
                    reply = Some((tx, self.submit(&question)));
                }
                Wake::Command(Command::Stop { reply: tx }) => {
                    reply = Some((tx, self.conversation.stop()));
                }
                Wake::Command(Command::Shutdown) => {
                    self.conversation.stop();
                    self.publish();
                    break;
                }
                Wake::Update(update) => self.apply(update),
                Wake::Tick(now) => {
                    self.conversation.tick(now);
                }
            }

            self.sync_pacer();
            self.publish();

            // Answer after publishing so callers observe the new state.
            if let Some((tx, accepted)) = reply {
                let _ = tx.send(accepted);
            }
        }

        tracing::debug!(session = %self.conversation.session(), "dock stopped");
    }

    fn submit(&mut self, question: &str) -> bool {
        let Some(submission) = self.conversation.submit(question) else {
            return false;
        };

        tokio::spawn(run_stream(
            submission.exchange,
            submission.request,
            submission.cancel,
            Arc::clone(&self.stream),
            self.options.idle_timeout,
            self.updates_tx.clone(),
        ));
        true
    }

    fn apply(&mut self, update: Update) {
        match update {
            Update::Event { exchange, event } => {
                self.conversation.apply_event(exchange, event, Instant::now());
            }
            Update::Closed { exchange } => self.conversation.stream_closed(exchange),
            Update::OpenFailed { exchange, error } => {
                if let OpenFailure::Fallback { request, cancel } =
                    self.conversation.open_failed(exchange, &error)
                {
                    tokio::spawn(run_fallback(
                        exchange,
                        request,
                        cancel,
                        Arc::clone(&self.fallback),
                        self.updates_tx.clone(),
                    ));
                }
            }
            Update::StreamFailed { exchange, error } => {
                self.conversation.stream_failed(exchange, &error);
            }
            Update::Answered { exchange, response } => {
                self.conversation.fallback_succeeded(exchange, response);
            }
            Update::FallbackFailed { exchange, error } => {
                self.conversation.fallback_failed(exchange, &error);
            }
        }
    }

    /// Keep a timer only while the pacer has work.
    fn sync_pacer(&mut self) {
        match (&self.pacer, self.conversation.is_pacing()) {
            (None, true) => {
                let period = self.conversation_tick();
                let mut timer = interval_at(Instant::now() + period, period);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.pacer = Some(timer);
            }
            (Some(_), false) => self.pacer = None,
            _ => {}
        }
    }

    fn conversation_tick(&self) -> Duration {
        self.conversation
            .pacer_config()
            .tick
            .max(Duration::from_millis(1))
    }

    fn publish(&self) {
        let next = DockSnapshot::of(&self.conversation);
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn next_tick(timer: &mut Option<Interval>) -> Instant {
    match timer {
        Some(timer) => timer.tick().await,
        None => futures::future::pending().await,
    }
}

/// Open the stream and forward its events until it ends.
///
/// Failures before the first delta are reported as open failures so the
/// conversation can still fall back. Nothing is read past an `end` event.
async fn run_stream(
    exchange: u64,
    request: AskRequest,
    cancel: CancellationToken,
    transport: Arc<dyn StreamTransport>,
    idle: Duration,
    updates: mpsc::UnboundedSender<Update>,
) {
    let opened = timeout(idle, transport.open(&request, cancel.clone())).await;
    let mut events: EventStream = match opened {
        Ok(Ok(events)) => events,
        Ok(Err(error)) => {
            let _ = updates.send(Update::OpenFailed { exchange, error });
            return;
        }
        Err(_) => {
            let error = TransportError::IdleTimeout(idle);
            let _ = updates.send(Update::OpenFailed { exchange, error });
            return;
        }
    };

    let mut saw_delta = false;
    loop {
        let error = match timeout(idle, events.next()).await {
            Ok(Some(Ok(event))) => {
                saw_delta |= matches!(event, StreamEvent::Delta { .. });
                let ended = matches!(event, StreamEvent::End { .. });
                if updates.send(Update::Event { exchange, event }).is_err() || ended {
                    return;
                }
                continue;
            }
            Ok(None) => {
                let _ = updates.send(Update::Closed { exchange });
                return;
            }
            Ok(Some(Err(error))) => error,
            Err(_) => TransportError::IdleTimeout(idle),
        };

        if error.is_cancelled() {
            tracing::debug!(exchange, "agent stream cancelled");
            return;
        }
        let update = if saw_delta {
            Update::StreamFailed { exchange, error }
        } else {
            Update::OpenFailed { exchange, error }
        };
        let _ = updates.send(update);
        return;
    }
}

async fn run_fallback(
    exchange: u64,
    request: AskRequest,
    cancel: CancellationToken,
    transport: Arc<dyn FallbackTransport>,
    updates: mpsc::UnboundedSender<Update>,
) {
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = transport.ask(&request) => result,
    };

    let update = match result {
        Ok(response) => Update::Answered { exchange, response },
        Err(error) => Update::FallbackFailed { exchange, error },
    };
    let _ = updates.send(update);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Notices;
    use crate::pacer::PacerConfig;
    use crate::session::SessionId;
    use dock_backend::mock::fixtures;
    use dock_backend::{MockConfig, MockResponse, MockTransport};
    use dock_protocol::MessageStatus;

    fn spawn(config: MockConfig) -> (DockHandle, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new(config));
        let conversation = Conversation::new(
            SessionId::from("sess-dock"),
            PacerConfig::default(),
            Notices::default(),
        );
        let handle = AgentDock::spawn(
            conversation,
            transport.clone(),
            transport.clone(),
            DockOptions::default(),
        );
        (handle, transport)
    }

    fn reply(snapshot: &DockSnapshot) -> &Message {
        snapshot.last_reply().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn streams_answer_to_completion() {
        let (dock, transport) = spawn(fixtures::streaming_answer(
            "m1",
            &["RAG ", "применялся в..."],
        ));

        assert!(dock.submit("Где применялся RAG?").await);
        let snapshot = dock.wait_idle().await;

        assert_eq!(snapshot.transcript.len(), 2);
        assert_eq!(snapshot.transcript[0].content, "Где применялся RAG?");
        let answer = reply(&snapshot);
        assert_eq!(answer.id, "m1");
        assert_eq!(answer.content, "RAG применялся в...");
        assert_eq!(answer.status, Some(MessageStatus::Done));
        assert_eq!(snapshot.phase, Phase::Idle);
        assert_eq!(transport.open_count(), 1);
        assert_eq!(transport.ask_count(), 0);
        assert_eq!(transport.requests()[0].session_id, "sess-dock");
    }

    #[tokio::test(start_paused = true)]
    async fn content_is_revealed_gradually() {
        let (dock, _) = spawn(fixtures::streaming_answer("m1", &["0123456789012345678901234"]));
        let mut updates = dock.subscribe();
        assert!(dock.submit("q").await);

        let mut lengths = Vec::new();
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            let reply = reply(&snapshot);
            lengths.push(reply.content.chars().count());
            if !snapshot.loading {
                break;
            }
        }

        assert!(lengths.windows(2).all(|w| w[0] <= w[1]));
        assert!(lengths.windows(2).all(|w| w[1] - w[0] <= 12));
        assert_eq!(lengths.last(), Some(&25));
    }

    #[tokio::test(start_paused = true)]
    async fn submit_while_loading_is_refused() {
        let (dock, transport) = spawn(fixtures::stalls_after("partial"));
        assert!(dock.submit("first").await);
        assert!(!dock.submit("second").await);
        assert!(!dock.submit("   ").await);

        dock.stop().await;
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_when_stream_unreachable() {
        let (dock, transport) = spawn(fixtures::unreachable_stream("X"));
        assert!(dock.submit("q").await);
        let snapshot = dock.wait_idle().await;

        assert_eq!(reply(&snapshot).content, "X");
        assert_eq!(reply(&snapshot).status, Some(MessageStatus::Done));
        assert_eq!(transport.ask_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_failure_shows_unreachable_notice() {
        let (dock, _) = spawn(
            MockConfig::new()
                .with_open_failure("connection refused")
                .with_fallback_failure("connection refused"),
        );
        assert!(dock.submit("q").await);
        let snapshot = dock.wait_idle().await;

        assert_eq!(
            reply(&snapshot).content,
            "Could not reach the agent. Please try again later."
        );
        assert_eq!(reply(&snapshot).status, Some(MessageStatus::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_before_first_delta_falls_back() {
        let (dock, transport) = spawn(
            MockConfig::new()
                .with_responses(vec![MockResponse::start("srv-1"), MockResponse::Hang])
                .with_fallback_answer("late answer"),
        );
        assert!(dock.submit("q").await);
        let snapshot = dock.wait_idle().await;

        assert_eq!(reply(&snapshot).content, "late answer");
        assert_eq!(reply(&snapshot).status, Some(MessageStatus::Done));
        assert_eq!(transport.ask_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_after_delta_is_an_error() {
        let (dock, transport) = spawn(fixtures::stalls_after("partial"));
        assert!(dock.submit("q").await);
        let snapshot = dock.wait_idle().await;

        assert_eq!(reply(&snapshot).content, "partial");
        assert_eq!(reply(&snapshot).status, Some(MessageStatus::Error));
        assert_eq!(transport.ask_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_stream_keeps_revealed_text() {
        let (dock, transport) = spawn(fixtures::stalls_after("partial answer"));
        let mut updates = dock.subscribe();
        assert!(dock.submit("q").await);

        updates
            .wait_for(|s| s.last_reply().is_some_and(|m| !m.content.is_empty()))
            .await
            .unwrap();
        assert!(dock.stop().await);

        let snapshot = dock.snapshot();
        let stopped = reply(&snapshot);
        assert!(!snapshot.loading);
        assert_eq!(stopped.status, Some(MessageStatus::Stopped));
        assert!(!stopped.content.is_empty());
        assert!("partial answer".starts_with(&stopped.content));

        // Nothing changes afterwards, and a second stop is a no-op.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(dock.snapshot(), snapshot);
        assert!(!dock.stop().await);
        assert_eq!(transport.ask_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_open_shows_notice() {
        let (dock, transport) = spawn(
            MockConfig::new()
                .with_responses(vec![MockResponse::Hang])
                .with_fallback_answer("never"),
        );
        assert!(dock.submit("q").await);
        assert!(dock.stop().await);

        let snapshot = dock.snapshot();
        assert_eq!(reply(&snapshot).content, "Response stopped.");
        assert_eq!(reply(&snapshot).status, Some(MessageStatus::Stopped));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.ask_count(), 0);
        assert_eq!(dock.snapshot(), snapshot);
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_keeps_revealed_text() {
        let (dock, _) = spawn(MockConfig::new().with_responses(vec![
            MockResponse::start("srv-err"),
            MockResponse::text("half"),
            MockResponse::Delay { ms: 1_000 },
            MockResponse::error("model overloaded"),
        ]));
        assert!(dock.submit("q").await);
        let snapshot = dock.wait_idle().await;

        assert_eq!(reply(&snapshot).id, "srv-err");
        assert_eq!(reply(&snapshot).content, "half");
        assert_eq!(reply(&snapshot).status, Some(MessageStatus::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_end_keeps_complete_answer() {
        let (dock, transport) = spawn(MockConfig::new().with_responses(vec![
            MockResponse::start("m1"),
            MockResponse::text("complete answer text"),
            MockResponse::end("m1"),
            MockResponse::Fail {
                reason: "connection reset".to_string(),
            },
        ]));
        assert!(dock.submit("q").await);
        let snapshot = dock.wait_idle().await;

        assert_eq!(reply(&snapshot).content, "complete answer text");
        assert_eq!(reply(&snapshot).status, Some(MessageStatus::Done));
        assert_eq!(transport.live_streams(), 0);
        assert_eq!(transport.ask_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn error_event_releases_the_stream() {
        let (dock, transport) = spawn(MockConfig::new().with_responses(vec![
            MockResponse::text("x"),
            MockResponse::error("boom"),
            MockResponse::Hang,
        ]));
        assert!(dock.submit("q").await);
        let snapshot = dock.wait_idle().await;
        assert_eq!(reply(&snapshot).status, Some(MessageStatus::Error));

        // Well within the idle timeout, the stream must already be gone.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_lines_are_skipped() {
        let (dock, _) = spawn(
            MockConfig::new()
                .with_responses(vec![
                    MockResponse::start("m1"),
                    MockResponse::text("Hello"),
                    MockResponse::Raw {
                        line: "{not json".to_string(),
                    },
                    MockResponse::Raw {
                        line: r#"{"type":"heartbeat"}"#.to_string(),
                    },
                    MockResponse::text(", мир"),
                    MockResponse::end("m1"),
                ])
                .with_chunk_size(3),
        );
        assert!(dock.submit("q").await);
        let snapshot = dock.wait_idle().await;

        assert_eq!(reply(&snapshot).content, "Hello, мир");
        assert_eq!(reply(&snapshot).status, Some(MessageStatus::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn second_exchange_after_first_completes() {
        let (dock, transport) = spawn(fixtures::streaming_answer("m1", &["one"]));
        assert!(dock.submit("first").await);
        dock.wait_idle().await;

        // The mock reuses its script, so the server id collides.
        assert!(dock.submit("second").await);
        let snapshot = dock.wait_idle().await;

        assert_eq!(snapshot.transcript.len(), 4);
        assert_eq!(snapshot.transcript[1].id, "m1");
        assert_eq!(snapshot.transcript[3].id, "local-2-a");
        assert_eq!(snapshot.transcript[3].content, "one");
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_in_flight_exchange() {
        let (dock, _) = spawn(fixtures::stalls_after("partial"));
        let mut updates = dock.subscribe();
        assert!(dock.submit("q").await);
        dock.shutdown().await;

        updates.wait_for(|s| !s.loading).await.ok();
        assert!(!dock.submit("again").await);
    }
}
