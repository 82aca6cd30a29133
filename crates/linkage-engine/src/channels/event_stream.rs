use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{ChannelHealthBoard, ChannelKind};
use crate::backoff::{Backoff, BackoffPolicy};
use crate::dispatcher::{Dispatcher, UpdateSource};
use crate::metrics;

const KIND: ChannelKind = ChannelKind::EventStream;

/// One frame of the authority's status event stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Status(StatusFrame),
    Heartbeat,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusFrame {
    pub account_id: String,
    pub status: String,
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Parses an SSE message. Untyped payloads are accepted when the SSE event name says
/// `status`.
pub fn parse_frame(event: &str, data: &str) -> Result<StreamFrame, serde_json::Error> {
    if data.trim().is_empty() || event == "heartbeat" {
        return Ok(StreamFrame::Heartbeat);
    }
    match serde_json::from_str::<StreamFrame>(data) {
        Ok(frame) => Ok(frame),
        Err(err) if event == "status" => serde_json::from_str::<StatusFrame>(data)
            .map(StreamFrame::Status)
            .map_err(|_| err),
        Err(err) => Err(err),
    }
}

enum SessionEnd {
    Shutdown,
    Failed(String),
}

/// Holds one long-lived SSE connection and reconnects with exponential backoff.
pub struct EventStreamAdapter {
    url: String,
    token: Option<String>,
    http: Client,
    policy: BackoffPolicy,
    dispatcher: Arc<Dispatcher>,
    health: Arc<ChannelHealthBoard>,
}

impl EventStreamAdapter {
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        policy: BackoffPolicy,
        dispatcher: Arc<Dispatcher>,
        health: Arc<ChannelHealthBoard>,
    ) -> Self {
        Self {
            url: url.into(),
            token,
            http: Client::new(),
            policy,
            dispatcher,
            health,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        let mut backoff = Backoff::new(self.policy);
        while !shutdown.is_cancelled() {
            self.health.mark_connecting(KIND);
            let reason = match self.session(&shutdown, &mut backoff).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed(reason) => reason,
            };
            let delay = backoff.next_delay();
            metrics::CHANNEL_RECONNECTS
                .with_label_values(&[KIND.as_str()])
                .inc();
            warn!(
                target: "linkage.event_stream",
                url = %self.url,
                error = %reason,
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "event stream disconnected; reconnecting"
            );
            self.health.mark_backoff(KIND, delay, reason);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.health.mark_closed(KIND, None);
        info!(target: "linkage.event_stream", "event stream adapter stopped");
    }

    async fn session(&self, shutdown: &CancellationToken, backoff: &mut Backoff) -> SessionEnd {
        let mut request = self.http.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let mut source = match EventSource::new(request) {
            Ok(source) => source,
            Err(err) => return SessionEnd::Failed(err.to_string()),
        };

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                next = source.next() => Some(next),
            };
            let Some(next) = next else {
                source.close();
                return SessionEnd::Shutdown;
            };
            match next {
                Some(Ok(Event::Open)) => {
                    backoff.reset();
                    self.health.mark_live(KIND);
                    info!(target: "linkage.event_stream", url = %self.url, "event stream connected");
                }
                Some(Ok(Event::Message(message))) => {
                    self.handle_message(&message.event, &message.data).await;
                }
                Some(Err(err)) => {
                    source.close();
                    return SessionEnd::Failed(err.to_string());
                }
                None => return SessionEnd::Failed("stream ended".into()),
            }
        }
    }

    async fn handle_message(&self, event: &str, data: &str) {
        match parse_frame(event, data) {
            Ok(StreamFrame::Status(frame)) => {
                let outcome = self
                    .dispatcher
                    .on_channel_update(
                        UpdateSource::EventStream,
                        &frame.account_id,
                        &frame.status,
                        frame.disabled,
                    )
                    .await;
                debug!(
                    target: "linkage.event_stream",
                    account_id = %frame.account_id,
                    status = %frame.status,
                    updated_at = frame.updated_at.as_deref().unwrap_or(""),
                    outcome = ?outcome,
                    "status frame dispatched"
                );
            }
            Ok(StreamFrame::Heartbeat) => trace!(target: "linkage.event_stream", "heartbeat"),
            Ok(StreamFrame::Other) => {
                debug!(target: "linkage.event_stream", event, "ignoring frame of unknown type")
            }
            Err(err) => {
                metrics::CHANNEL_UPDATES
                    .with_label_values(&[UpdateSource::EventStream.as_str(), "malformed"])
                    .inc();
                warn!(
                    target: "linkage.event_stream",
                    error = %err,
                    "dropping malformed event stream frame"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typed_status_frames() {
        let frame = parse_frame(
            "message",
            r#"{"type":"status","accountId":"123-456-7890","status":"ACTIVE","disabled":false,"updatedAt":"2024-05-01T00:00:00Z"}"#,
        )
        .unwrap();
        let StreamFrame::Status(status) = frame else {
            panic!("expected status frame");
        };
        assert_eq!(status.account_id, "123-456-7890");
        assert_eq!(status.disabled, Some(false));
    }

    #[test]
    fn heartbeats_and_unknown_types_are_benign() {
        assert_eq!(parse_frame("message", r#"{"type":"heartbeat"}"#).unwrap(), StreamFrame::Heartbeat);
        assert_eq!(parse_frame("heartbeat", "").unwrap(), StreamFrame::Heartbeat);
        assert_eq!(
            parse_frame("message", r#"{"type":"catalog_changed","count":3}"#).unwrap(),
            StreamFrame::Other
        );
    }

    #[test]
    fn untyped_payload_needs_a_status_event_name() {
        let data = r#"{"accountId":"42","status":"PENDING"}"#;
        assert!(matches!(parse_frame("status", data), Ok(StreamFrame::Status(_))));
        assert!(parse_frame("message", data).is_err());
        assert!(parse_frame("message", "not json").is_err());
    }
}
