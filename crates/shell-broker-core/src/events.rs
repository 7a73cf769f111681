//! Outbound events for one transport channel.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{BrokerError, ErrorKind, SessionState};

/// Caller-visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Point-in-time view of a session, attached to status replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub cols: u16,
    pub rows: u16,
    /// Whole seconds since the last input or output flush.
    pub idle_secs: u64,
}

/// Event emitted towards the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Status {
        state: StatusState,
        message: String,
        snapshot: Option<SessionSnapshot>,
    },
    Output(Bytes),
    Error {
        kind: ErrorKind,
        message: String,
    },
    Pong,
}

/// Sending half of a transport channel.
///
/// Cloned into every producer for that channel; sends never block.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<BrokerEvent>,
}

impl EventSink {
    /// Create a sink and the receiver the transport drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the transport side is gone.
    pub fn send(&self, event: BrokerEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn status(&self, state: StatusState, message: impl Into<String>) -> bool {
        self.send(BrokerEvent::Status {
            state,
            message: message.into(),
            snapshot: None,
        })
    }

    pub fn output(&self, data: Bytes) -> bool {
        self.send(BrokerEvent::Output(data))
    }

    pub fn error(&self, kind: ErrorKind, message: impl Into<String>) -> bool {
        self.send(BrokerEvent::Error {
            kind,
            message: message.into(),
        })
    }

    /// Emit the `error` event for a rejected operation.
    pub fn report(&self, err: &BrokerError) -> bool {
        self.error(err.kind(), err.user_message())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.status(StatusState::Connecting, "Connecting to u@h:22...");
        sink.output(Bytes::from_static(b"hello"));
        sink.report(&BrokerError::NotConnected);

        assert!(matches!(
            rx.recv().await,
            Some(BrokerEvent::Status { state: StatusState::Connecting, .. })
        ));
        assert_eq!(
            rx.recv().await,
            Some(BrokerEvent::Output(Bytes::from_static(b"hello")))
        );
        assert_eq!(
            rx.recv().await,
            Some(BrokerEvent::Error {
                kind: ErrorKind::Connection,
                message: "No active SSH connection".into(),
            })
        );
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.output(Bytes::from_static(b"x")));
    }
}
