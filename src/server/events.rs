//! Line-delimited event streaming between blocking workers and a response
//! body.
//!
//! Each event is rendered as `event: NAME\ndata: JSON\n\n`. The sender side
//! is synchronous so it can be driven from inside an inference callback; the
//! receiver side is an axum `Body`. A send onto a closed channel reports
//! failure, which callers use to detect client disconnects.

use axum::body::{Body, Bytes};
use serde::Serialize;
use tokio::sync::mpsc;

pub(super) const EVENT_CONTENT_TYPE: &str = "text/event-stream; charset=utf-8";

/// One wire event, with its `data` payload already serialised to JSON.
#[derive(Debug, Clone)]
pub(super) struct Event {
    name: &'static str,
    data: String,
}

impl Event {
    pub(super) fn new(name: &'static str, payload: &impl Serialize) -> Self {
        let data = serde_json::to_string(payload)
            .unwrap_or_else(|err| format!("\"unserialisable event: {err}\""));
        Self { name, data }
    }

    pub(super) fn render(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name, self.data)
    }
}

/// Synchronous handle feeding events into a streaming response.
#[derive(Clone)]
pub(super) struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// Send one event; `false` means the client went away.
    pub(super) fn send(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// A paired sender and chunked response body.
pub(super) fn channel() -> (EventSender, Body) {
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((
            Ok::<_, std::convert::Infallible>(Bytes::from(event.render())),
            rx,
        ))
    });
    (EventSender { tx }, Body::from_stream(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_render_name_and_json_data() {
        let event = Event::new("progress", &serde_json::json!({"completed": 5}));
        assert_eq!(event.render(), "event: progress\ndata: {\"completed\":5}\n\n");

        // String payloads stay a single JSON-encoded line even when the
        // rendered block itself spans lines.
        let event = Event::new("segment", &"1\n00:00:00,000 --> 00:00:01,000\nhi\n\n");
        assert!(event.render().starts_with("event: segment\ndata: \"1\\n"));
    }

    #[tokio::test]
    async fn channel_streams_rendered_events() -> anyhow::Result<()> {
        use http_body_util::BodyExt;

        let (tx, body) = channel();
        assert!(tx.send(Event::new("ok", &serde_json::json!({"done": true}))));
        drop(tx);

        let collected = body.collect().await?.to_bytes();
        let text = std::str::from_utf8(&collected)?;
        assert_eq!(text, "event: ok\ndata: {\"done\":true}\n\n");
        Ok(())
    }

    #[test]
    fn send_reports_disconnects() {
        let (tx, body) = channel();
        drop(body);
        assert!(!tx.send(Event::new("ok", &serde_json::json!(null))));
    }
}
