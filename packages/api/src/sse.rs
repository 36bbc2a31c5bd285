// ABOUTME: Server-Sent Events helpers shared by the streaming handlers

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;

use codexd_core::RunEventEnvelope;

/// Wrap a stream in an SSE response with a 15 s `: ping` keep-alive comment.
pub fn create_sse_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// SSE frame for one envelope: the envelope type is the event name, the whole
/// envelope (including `createdAt` for client-side dedup) is the data.
pub fn envelope_event(envelope: &RunEventEnvelope) -> Result<Event, axum::Error> {
    Event::default()
        .event(&envelope.event_type)
        .json_data(envelope)
}

/// SSE frame for an arbitrary JSON-serializable payload.
pub fn json_event<T: serde::Serialize>(name: &str, data: &T) -> Result<Event, axum::Error> {
    Event::default().event(name).json_data(data)
}
