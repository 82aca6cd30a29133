//! Channel adapters: independent transports that feed the dispatcher.

pub mod batch;
pub mod event_stream;
pub mod push_socket;

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

pub use batch::{BatchOutcome, BatchReconciler};
pub use event_stream::EventStreamAdapter;
pub use push_socket::PushSocketAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    EventStream,
    PushSocket,
    Batch,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::EventStream => "event_stream",
            ChannelKind::PushSocket => "push_socket",
            ChannelKind::Batch => "batch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Idle,
    Connecting,
    Live,
    Backoff,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelHealth {
    pub channel: ChannelKind,
    pub state: ChannelState,
    pub connect_attempts: u32,
    pub reconnect_attempts: u32,
    pub next_retry_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl ChannelHealth {
    fn new(channel: ChannelKind) -> Self {
        Self {
            channel,
            state: ChannelState::Idle,
            connect_attempts: 0,
            reconnect_attempts: 0,
            next_retry_ms: None,
            last_error: None,
        }
    }
}

/// Connection lifecycle per channel, shared by the adapters and read by engine snapshots.
#[derive(Debug, Default)]
pub struct ChannelHealthBoard {
    channels: RwLock<HashMap<ChannelKind, ChannelHealth>>,
}

impl ChannelHealthBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_connecting(&self, kind: ChannelKind) {
        self.update(kind, |health| {
            health.state = ChannelState::Connecting;
            health.connect_attempts = health.connect_attempts.saturating_add(1);
            health.next_retry_ms = None;
        });
    }

    pub fn mark_live(&self, kind: ChannelKind) {
        self.update(kind, |health| {
            health.state = ChannelState::Live;
            health.reconnect_attempts = 0;
            health.next_retry_ms = None;
            health.last_error = None;
        });
    }

    pub fn mark_backoff(&self, kind: ChannelKind, delay: Duration, error: impl Into<String>) {
        let error = error.into();
        self.update(kind, move |health| {
            health.state = ChannelState::Backoff;
            health.reconnect_attempts = health.reconnect_attempts.saturating_add(1);
            health.next_retry_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
            health.last_error = Some(error);
        });
    }

    pub fn mark_closed(&self, kind: ChannelKind, error: Option<String>) {
        self.update(kind, move |health| {
            health.state = ChannelState::Closed;
            health.next_retry_ms = None;
            if error.is_some() {
                health.last_error = error;
            }
        });
    }

    /// Used by request/response channels between runs.
    pub fn mark_idle(&self, kind: ChannelKind, error: Option<String>) {
        self.update(kind, move |health| {
            health.state = ChannelState::Idle;
            health.next_retry_ms = None;
            health.last_error = error;
        });
    }

    pub fn get(&self, kind: ChannelKind) -> Option<ChannelHealth> {
        self.channels.read().get(&kind).cloned()
    }

    pub fn snapshot(&self) -> Vec<ChannelHealth> {
        let mut channels: Vec<_> = self.channels.read().values().cloned().collect();
        channels.sort_by_key(|health| health.channel.as_str());
        channels
    }

    fn update(&self, kind: ChannelKind, apply: impl FnOnce(&mut ChannelHealth)) {
        let mut channels = self.channels.write();
        let health = channels
            .entry(kind)
            .or_insert_with(|| ChannelHealth::new(kind));
        apply(health);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_then_live_resets_reconnect_counters() {
        let board = ChannelHealthBoard::new();
        board.mark_connecting(ChannelKind::EventStream);
        board.mark_backoff(ChannelKind::EventStream, Duration::from_millis(500), "reset by peer");
        board.mark_connecting(ChannelKind::EventStream);
        board.mark_backoff(ChannelKind::EventStream, Duration::from_secs(1), "reset by peer");

        let health = board.get(ChannelKind::EventStream).unwrap();
        assert_eq!(health.state, ChannelState::Backoff);
        assert_eq!(health.connect_attempts, 2);
        assert_eq!(health.reconnect_attempts, 2);
        assert_eq!(health.next_retry_ms, Some(1_000));

        board.mark_connecting(ChannelKind::EventStream);
        board.mark_live(ChannelKind::EventStream);
        let health = board.get(ChannelKind::EventStream).unwrap();
        assert_eq!(health.state, ChannelState::Live);
        assert_eq!(health.reconnect_attempts, 0);
        assert!(health.last_error.is_none());
    }

    #[test]
    fn closed_keeps_the_last_error() {
        let board = ChannelHealthBoard::new();
        board.mark_backoff(ChannelKind::PushSocket, Duration::from_millis(10), "refused");
        board.mark_closed(ChannelKind::PushSocket, None);
        let health = board.get(ChannelKind::PushSocket).unwrap();
        assert_eq!(health.state, ChannelState::Closed);
        assert_eq!(health.last_error.as_deref(), Some("refused"));
        assert_eq!(board.snapshot().len(), 1);
    }
}
