//! SSE (Server-Sent Events) stream of cache notifications.
//!
//! Each [`CacheEvent`] becomes one SSE event named after its kind, with the
//! JSON-encoded event as data. A subscriber that falls behind gets a single
//! `lagged` event carrying the number of dropped notifications.

use axum::response::sse::Event;
use futures::stream::{self, Stream};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::cache::CacheEvent;

/// Convert a notification receiver into an SSE stream.
///
/// The stream ends after the `stopped` event.
pub fn events_to_sse_stream(
    rx: broadcast::Receiver<CacheEvent>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    stream::unfold((BroadcastStream::new(rx), false), |(mut events, done)| async move {
        if done {
            return None;
        }
        let (event, stopped) = match events.next().await? {
            Ok(event) => (event_to_sse(&event), matches!(event, CacheEvent::Stopped)),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "SSE subscriber lagged");
                (Event::default().event("lagged").data(skipped.to_string()), false)
            }
        };
        Some((Ok(event), (events, stopped)))
    })
}

fn event_to_sse(event: &CacheEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_default();
    Event::default().event(event.kind()).data(data)
}
