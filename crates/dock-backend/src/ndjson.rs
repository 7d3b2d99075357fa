//! Newline-delimited JSON stream parser.
//!
//! Turns the agent's response body into [`StreamEvent`]s. Lines are buffered
//! as raw bytes and decoded only once their terminating `\n` has arrived, so
//! UTF-8 sequences split across network chunks are reassembled before
//! decoding. Lines that fail to decode are logged and skipped.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use dock_protocol::StreamEvent;
use futures::Stream;

/// Incremental line decoder.
#[derive(Debug, Default)]
pub struct LineDecoder {
    /// Bytes of the line currently being received.
    line_buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the body. Returns the events of every line completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.line_buf.extend_from_slice(&rest[..pos]);
            let line = std::mem::take(&mut self.line_buf);
            if let Some(event) = decode_line(&line) {
                events.push(event);
            }
            rest = &rest[pos + 1..];
        }
        self.line_buf.extend_from_slice(rest);

        events
    }

    /// The body ended. Decodes a trailing line that had no final newline.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        let line = std::mem::take(&mut self.line_buf);
        decode_line(&line)
    }

    /// Number of bytes waiting for their line terminator.
    pub fn buffered(&self) -> usize {
        self.line_buf.len()
    }
}

fn decode_line(raw: &[u8]) -> Option<StreamEvent> {
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line.trim(),
        Err(e) => {
            tracing::warn!(error = %e, len = raw.len(), "skipping stream line with invalid UTF-8");
            return None;
        }
    };

    if line.is_empty() {
        return None;
    }

    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(error = %e, line, "failed to parse stream line");
            None
        }
    }
}

/// Stream wrapper that parses NDJSON events from a byte stream.
pub struct NdjsonStream<S> {
    inner: S,
    decoder: LineDecoder,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

impl<S> NdjsonStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: LineDecoder::new(),
            pending: VecDeque::new(),
            finished: false,
        }
    }
}

impl<S, E> Stream for NdjsonStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<StreamEvent, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        if let Some(event) = this.pending.pop_front() {
            return Poll::Ready(Some(Ok(event)));
        }
        if this.finished {
            return Poll::Ready(None);
        }

        loop {
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.pending.extend(this.decoder.feed(&bytes));
                    if let Some(event) = this.pending.pop_front() {
                        return Poll::Ready(Some(Ok(event)));
                    }
                    // No complete line yet, keep reading.
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(this.decoder.finish().map(Ok));
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
            }
        }
    }
}

/// Create an NDJSON event stream from a byte stream.
pub fn parse_ndjson_stream<S, E>(stream: S) -> NdjsonStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    NdjsonStream::new(stream)
}
