//! Transport seams used by the conversation controller.

use std::pin::Pin;

use async_stream::stream;
use dock_protocol::{AskRequest, AskResponse, StreamEvent};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// Events of one opened agent stream.
///
/// A cancelled stream ends with `Err(TransportError::Cancelled)`.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, TransportError>> + Send>>;

/// Opens the incremental answer stream for a question.
pub trait StreamTransport: Send + Sync {
    /// Resolves once the response headers are in. Errors are hard open
    /// failures, except `TransportError::Cancelled`.
    fn open<'a>(
        &'a self,
        request: &'a AskRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<EventStream, TransportError>>;
}

/// Single-shot request used when the stream cannot be opened.
pub trait FallbackTransport: Send + Sync {
    fn ask<'a>(&'a self, request: &'a AskRequest)
        -> BoxFuture<'a, Result<AskResponse, TransportError>>;
}

/// End `events` with `Err(Cancelled)` as soon as `cancel` fires.
///
/// The inner stream is dropped right after, which closes its connection.
pub fn cancellable<S>(events: S, cancel: CancellationToken) -> EventStream
where
    S: Stream<Item = Result<StreamEvent, TransportError>> + Send + 'static,
{
    Box::pin(stream! {
        let mut events = Box::pin(events);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = events.next() => Some(item),
            };

            match next {
                None => {
                    yield Err(TransportError::Cancelled);
                    break;
                }
                Some(Some(item)) => yield item,
                Some(None) => break,
            }
        }
    })
}
