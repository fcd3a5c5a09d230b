//! Server-sent events adapter over the bridge.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use futures_util::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::events::bridge::{BridgeError, ChannelSink, EventBridge};
use crate::jobs::types::RunId;

/// Per-subscriber channel depth. A client this far behind is detached.
pub const SUBSCRIBER_BUFFER: usize = 1024;

/// Detaches the client when the HTTP stream is dropped.
struct DetachOnDrop {
    bridge: Arc<EventBridge>,
    client_id: String,
}

impl Drop for DetachOnDrop {
    fn drop(&mut self) {
        self.bridge.detach(&self.client_id);
    }
}

pub struct EventStream<S> {
    inner: S,
    _guard: DetachOnDrop,
}

impl<S> Stream for EventStream<S>
where
    S: Stream<Item = Result<Event, Infallible>> + Unpin,
{
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

pub type SseStream = Sse<KeepAliveStream<EventStream<Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>>>>;

/// Subscribe to one run (history first) or to every run.
pub fn subscribe(bridge: Arc<EventBridge>, run: Option<RunId>, keep_alive: Duration) -> Result<SseStream, BridgeError> {
    let (sink, rx) = ChannelSink::new(SUBSCRIBER_BUFFER);
    let sink = Arc::new(sink);
    let client_id = match run {
        Some(run) => bridge.attach_with_replay(None, run, sink)?,
        None => bridge.attach(None, None, sink),
    };

    let events = ReceiverStream::new(rx).filter_map(|envelope| match serde_json::to_string(&envelope) {
        Ok(json) => Some(Ok(Event::default().data(json))),
        Err(e) => {
            tracing::warn!(error = %e, event_type = %envelope.event_type, "Failed to serialize event");
            None
        }
    });

    let stream = EventStream {
        inner: Box::pin(events) as Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>,
        _guard: DetachOnDrop { bridge, client_id },
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(keep_alive)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::envelope::EventEnvelope;
    use crate::jobs::types::JobId;

    #[tokio::test]
    async fn dropping_the_stream_detaches() {
        let bridge = Arc::new(EventBridge::new(10));
        let run = RunId::new();
        bridge.emit(EventEnvelope::new("job.queued").for_run(JobId::new(), run));

        let sse = subscribe(bridge.clone(), Some(run), Duration::from_secs(15)).unwrap();
        assert_eq!(bridge.client_count(), 1);
        drop(sse);
        assert_eq!(bridge.client_count(), 0);
    }
}
