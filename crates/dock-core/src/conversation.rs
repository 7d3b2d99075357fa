//! Conversation state machine.
//!
//! [`Conversation`] owns the transcript and the in-flight exchange. Every
//! mutation of the transcript goes through one of its transition methods;
//! the async driver in [`crate::dock`] only feeds it events.
//!
//! Per exchange: `Idle -> Sent -> Streaming -> Draining -> Terminal`, where
//! the agent message ends `done`, `error` or `stopped`.

use dock_backend::TransportError;
use dock_protocol::{AskRequest, AskResponse, Message, MessageStatus, StreamEvent, Usage};
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::pacer::{CharacterPacer, PacerConfig};
use crate::session::{epoch_millis, SessionId};

/// User-visible texts for replies that carry no agent output.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Notices {
    pub stopped: String,
    pub unreachable: String,
    pub empty_answer: String,
    /// `{message}` is replaced by the server's error text.
    pub stream_error: String,
}

impl Default for Notices {
    fn default() -> Self {
        Self {
            stopped: "Response stopped.".to_string(),
            unreachable: "Could not reach the agent. Please try again later.".to_string(),
            empty_answer: "Done.".to_string(),
            stream_error: "The agent reported an error: {message}".to_string(),
        }
    }
}

impl Notices {
    fn stream_error(&self, message: &str) -> String {
        self.stream_error.replace("{message}", message)
    }
}

/// Where the current exchange stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    /// Question sent, nothing received yet.
    Sent,
    /// Deltas are arriving.
    Streaming,
    /// The stream ended; the pacer is still revealing text.
    Draining,
}

/// A freshly accepted question, to be sent by the driver.
#[derive(Debug, Clone)]
pub struct Submission {
    pub exchange: u64,
    pub request: AskRequest,
    pub cancel: CancellationToken,
}

/// What the driver must do after the stream failed to open.
#[derive(Debug)]
pub enum OpenFailure {
    /// Retry through the single-shot endpoint.
    Fallback {
        request: AskRequest,
        cancel: CancellationToken,
    },
    /// The exchange ended with an error.
    Failed,
    /// Stale exchange or cancellation; nothing to do.
    Ignored,
}

struct PendingExchange {
    exchange: u64,
    request: AskRequest,
    /// Position of the agent reply in the transcript.
    index: usize,
    /// The reply still carries its local id.
    provisional: bool,
    cancel: CancellationToken,
    pacer: CharacterPacer,
    phase: Phase,
    started: bool,
    active_tool: Option<String>,
}

pub struct Conversation {
    session: SessionId,
    system_prompt: Option<String>,
    pacer_config: PacerConfig,
    notices: Notices,
    transcript: Vec<Message>,
    pending: Option<PendingExchange>,
    next_exchange: u64,
}

impl Conversation {
    pub fn new(session: SessionId, pacer_config: PacerConfig, notices: Notices) -> Self {
        Self {
            session,
            system_prompt: None,
            pacer_config,
            notices,
            transcript: Vec::new(),
            pending: None,
            next_exchange: 0,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn pacer_config(&self) -> &PacerConfig {
        &self.pacer_config
    }

    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn phase(&self) -> Phase {
        self.pending.as_ref().map_or(Phase::Idle, |p| p.phase)
    }

    /// An exchange is in flight; input stays locked.
    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    /// At least one delta has arrived for the current exchange.
    pub fn streaming_started(&self) -> bool {
        self.pending.as_ref().is_some_and(|p| p.started)
    }

    pub fn active_tool(&self) -> Option<&str> {
        self.pending.as_ref().and_then(|p| p.active_tool.as_deref())
    }

    /// The pacer has text to reveal and needs ticks.
    pub fn is_pacing(&self) -> bool {
        self.pending.as_ref().is_some_and(|p| p.pacer.is_running())
    }

    pub fn current_exchange(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.exchange)
    }

    /// Accept a question. `None` if it is blank or an exchange is in flight.
    pub fn submit(&mut self, question: &str) -> Option<Submission> {
        let question = question.trim();
        if question.is_empty() || self.pending.is_some() {
            return None;
        }

        self.next_exchange += 1;
        let exchange = self.next_exchange;
        let now = epoch_millis();

        self.transcript
            .push(Message::user(format!("local-{exchange}-u"), question, now));
        self.transcript
            .push(Message::agent_placeholder(format!("local-{exchange}-a"), now));

        let request = AskRequest::new(question, self.session.as_str())
            .with_system_prompt(self.system_prompt.clone());
        let cancel = CancellationToken::new();

        self.pending = Some(PendingExchange {
            exchange,
            request: request.clone(),
            index: self.transcript.len() - 1,
            provisional: true,
            cancel: cancel.clone(),
            pacer: CharacterPacer::new(self.pacer_config),
            phase: Phase::Sent,
            started: false,
            active_tool: None,
        });

        tracing::info!(exchange, session = %self.session, "question submitted");

        Some(Submission {
            exchange,
            request,
            cancel,
        })
    }

    /// Apply one stream event of `exchange`.
    pub fn apply_event(&mut self, exchange: u64, event: StreamEvent, now: Instant) {
        if !self.is_current(exchange) {
            tracing::debug!(exchange, "dropping event of finished exchange");
            return;
        }

        match event {
            StreamEvent::Start {
                message_id,
                created_at,
            } => {
                tracing::debug!(exchange, %message_id, ?created_at, "stream started");
                self.rename_reply(&message_id);
            }
            StreamEvent::Delta { content } => self.push_delta(&content, now),
            StreamEvent::ToolStart { tool } => {
                if let Some(pending) = self.pending.as_mut() {
                    let tool = tool.unwrap_or_else(|| "tool".to_string());
                    tracing::debug!(exchange, %tool, "agent running tool");
                    pending.active_tool = Some(tool);
                }
            }
            StreamEvent::ToolEnd => {
                if let Some(pending) = self.pending.as_mut() {
                    pending.active_tool = None;
                }
            }
            StreamEvent::End { message_id, usage } => {
                if self.pending.as_ref().is_some_and(|p| p.provisional) {
                    self.rename_reply(&message_id);
                }
                log_usage(exchange, usage.as_ref());
                self.begin_draining();
            }
            StreamEvent::Error { message } => {
                tracing::warn!(exchange, error = %message, "agent reported an error");
                let notice = self.notices.stream_error(&message);
                self.finish(MessageStatus::Error, Some(notice));
            }
        }
    }

    /// The stream of `exchange` ended without an `end` event.
    pub fn stream_closed(&mut self, exchange: u64) {
        if !self.is_current(exchange) {
            return;
        }
        if self.phase() != Phase::Draining {
            tracing::debug!(exchange, "stream closed without end event");
            self.begin_draining();
        }
    }

    /// The stream of `exchange` could not be opened.
    pub fn open_failed(&mut self, exchange: u64, error: &TransportError) -> OpenFailure {
        if !self.is_current(exchange) || error.is_cancelled() {
            return OpenFailure::Ignored;
        }
        if self.phase() == Phase::Draining {
            tracing::debug!(exchange, %error, "failure after end of stream ignored");
            return OpenFailure::Ignored;
        }

        let revealed = self.reply().is_some_and(|m| !m.content.is_empty());
        if revealed || self.streaming_started() {
            self.stream_failed(exchange, error);
            return OpenFailure::Failed;
        }

        let Some(pending) = self.pending.as_mut() else {
            return OpenFailure::Ignored;
        };
        tracing::info!(exchange, %error, "stream unavailable, falling back");
        pending.phase = Phase::Sent;
        OpenFailure::Fallback {
            request: pending.request.clone(),
            cancel: pending.cancel.clone(),
        }
    }

    /// The stream of `exchange` broke after it was opened.
    pub fn stream_failed(&mut self, exchange: u64, error: &TransportError) {
        if !self.is_current(exchange) || error.is_cancelled() {
            return;
        }
        // The answer is complete; let the pacer finish revealing it.
        if self.phase() == Phase::Draining {
            tracing::debug!(exchange, %error, "failure after end of stream ignored");
            return;
        }
        tracing::warn!(exchange, %error, "agent stream failed");
        let notice = self.notices.stream_error(&error.to_string());
        self.finish(MessageStatus::Error, Some(notice));
    }

    /// The fallback request answered.
    pub fn fallback_succeeded(&mut self, exchange: u64, response: AskResponse) {
        if !self.is_current(exchange) {
            return;
        }
        tracing::info!(exchange, sources = response.sources.len(), "fallback answered");
        let answer = if response.answer.is_empty() {
            self.notices.empty_answer.clone()
        } else {
            response.answer
        };
        self.finish(MessageStatus::Done, Some(answer));
    }

    /// The fallback request failed too.
    pub fn fallback_failed(&mut self, exchange: u64, error: &TransportError) {
        if !self.is_current(exchange) || error.is_cancelled() {
            return;
        }
        tracing::error!(exchange, %error, "fallback request failed");
        let notice = self.notices.unreachable.clone();
        self.finish(MessageStatus::Error, Some(notice));
    }

    /// Stop the exchange in flight. Returns `false` when there is none.
    pub fn stop(&mut self) -> bool {
        let Some(pending) = self.pending.as_ref() else {
            return false;
        };
        let exchange = pending.exchange;

        let notice = self.notices.stopped.clone();
        self.finish(MessageStatus::Stopped, Some(notice));
        tracing::info!(exchange, "exchange stopped by user");
        true
    }

    /// Reveal the text due at `now`. Returns `true` if the transcript changed.
    pub fn tick(&mut self, now: Instant) -> bool {
        let Some(pending) = self.pending.as_mut() else {
            return false;
        };

        let mut changed = false;
        if let Some(release) = pending.pacer.tick(now) {
            let reply = &mut self.transcript[pending.index];
            debug_assert_eq!(release.target, reply.id);
            reply.content.push_str(&release.text);
            changed = true;
        }

        let drained = pending.phase == Phase::Draining && pending.pacer.is_drained();
        if drained {
            self.finish(MessageStatus::Done, None);
            changed = true;
        }
        changed
    }

    fn is_current(&self, exchange: u64) -> bool {
        self.current_exchange() == Some(exchange)
    }

    fn reply(&self) -> Option<&Message> {
        self.pending.as_ref().map(|p| &self.transcript[p.index])
    }

    fn push_delta(&mut self, content: &str, now: Instant) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if pending.phase == Phase::Draining {
            tracing::warn!(exchange = pending.exchange, "delta after end event ignored");
            return;
        }
        if content.is_empty() {
            return;
        }

        pending.started = true;
        pending.phase = Phase::Streaming;
        let target = &self.transcript[pending.index].id;
        pending.pacer.enqueue(target, content, now);
    }

    /// Substitute the server id for the reply's id in place.
    fn rename_reply(&mut self, message_id: &str) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if message_id.is_empty() || self.transcript[pending.index].id == message_id {
            pending.provisional = false;
            return;
        }
        if self.transcript.iter().any(|m| m.id == message_id) {
            tracing::warn!(%message_id, "server message id already in transcript, keeping local id");
            return;
        }

        let reply = &mut self.transcript[pending.index];
        tracing::debug!(from = %reply.id, to = %message_id, "adopting server message id");
        reply.id = message_id.to_string();
        pending.pacer.retarget(message_id);
        pending.provisional = false;
    }

    fn begin_draining(&mut self) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        pending.phase = Phase::Draining;
        pending.active_tool = None;
        if pending.pacer.is_drained() {
            self.finish(MessageStatus::Done, None);
        }
    }

    /// Move the reply to a terminal status and tear the exchange down,
    /// cancelling whatever transport work is still attached to it.
    ///
    /// `notice` becomes the content only if nothing was revealed.
    fn finish(&mut self, status: MessageStatus, notice: Option<String>) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        pending.cancel.cancel();
        let discarded = pending.pacer.flush_and_stop();

        let reply = &mut self.transcript[pending.index];
        if reply.content.is_empty() {
            if let Some(notice) = notice {
                reply.content = notice;
            }
        }
        reply.status = Some(status);

        tracing::debug!(
            exchange = pending.exchange,
            message_id = %reply.id,
            ?status,
            discarded,
            "exchange finished"
        );
    }
}

fn log_usage(exchange: u64, usage: Option<&Usage>) {
    if let Some(usage) = usage {
        tracing::info!(
            exchange,
            prompt_tokens = ?usage.prompt_tokens,
            completion_tokens = ?usage.completion_tokens,
            total_tokens = ?usage.total_tokens,
            "agent answer complete"
        );
    } else {
        tracing::info!(exchange, "agent answer complete");
    }
}
