use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChannelHealthBoard, ChannelKind};
use crate::dispatcher::{Dispatcher, UpdateSource};
use crate::identity::CanonicalAccountId;

const KIND: ChannelKind = ChannelKind::PushSocket;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    pub account_id: String,
    pub status: String,
    #[serde(default)]
    pub disabled: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeHello {
    #[serde(rename = "type")]
    kind: &'static str,
    account_ids: Vec<CanonicalAccountId>,
}

/// Best-effort websocket feed. Connects once; a failed or closed socket is logged and left
/// closed while the other channels carry on.
pub struct PushSocketAdapter {
    url: String,
    dispatcher: Arc<Dispatcher>,
    health: Arc<ChannelHealthBoard>,
}

impl PushSocketAdapter {
    pub fn new(
        url: impl Into<String>,
        dispatcher: Arc<Dispatcher>,
        health: Arc<ChannelHealthBoard>,
    ) -> Self {
        Self {
            url: url.into(),
            dispatcher,
            health,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(self, shutdown: CancellationToken) {
        self.health.mark_connecting(KIND);
        let connected = tokio::select! {
            _ = shutdown.cancelled() => None,
            result = connect_async(self.url.as_str()) => Some(result),
        };
        let socket = match connected {
            None => {
                self.health.mark_closed(KIND, None);
                return;
            }
            Some(Ok((socket, _))) => socket,
            Some(Err(err)) => {
                warn!(
                    target: "linkage.push_socket",
                    url = %self.url,
                    error = %err,
                    "push socket unavailable; continuing without it"
                );
                self.health.mark_closed(KIND, Some(err.to_string()));
                return;
            }
        };
        self.health.mark_live(KIND);
        info!(target: "linkage.push_socket", url = %self.url, "push socket connected");

        let (mut sink, mut stream) = socket.split();
        let hello = SubscribeHello {
            kind: "subscribe",
            account_ids: self.dispatcher.registry().ids(),
        };
        match serde_json::to_string(&hello) {
            Ok(text) => {
                if let Err(err) = sink.send(Message::Text(text.into())).await {
                    warn!(target: "linkage.push_socket", error = %err, "failed to send subscribe hello");
                }
            }
            Err(err) => {
                warn!(target: "linkage.push_socket", error = %err, "failed to encode subscribe hello");
            }
        }

        let mut last_error = None;
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                next = stream.next() => Some(next),
            };
            let Some(next) = next else {
                let _ = sink.send(Message::Close(None)).await;
                break;
            };
            match next {
                Some(Ok(Message::Text(text))) => self.handle_payload(text.as_str()).await,
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.handle_payload(text).await,
                    Err(_) => debug!(target: "linkage.push_socket", "ignoring non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    info!(target: "linkage.push_socket", frame = ?frame, "push socket closed by peer");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(target: "linkage.push_socket", error = %err, "push socket read failed");
                    last_error = Some(err.to_string());
                    break;
                }
                None => break,
            }
        }
        self.health.mark_closed(KIND, last_error);
    }

    async fn handle_payload(&self, text: &str) {
        let payload: PushPayload = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(target: "linkage.push_socket", error = %err, "ignoring unrecognized push frame");
                return;
            }
        };
        self.dispatcher
            .on_channel_update(
                UpdateSource::PushSocket,
                &payload.account_id,
                &payload.status,
                payload.disabled,
            )
            .await;
    }
}
