//! Event gateway: maps one transport channel's inbound messages onto the
//! broker.

use std::sync::Arc;

use shell_broker_core::{
    BrokerError, BrokerEvent, Caller, ConnectParams, ErrorKind, EventSink, Geometry, SessionId,
};
use shell_broker_session::{Broker, PendingConnect};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{ClientMessage, ProtocolError};

/// Per-channel message handler.
///
/// Messages are handled in arrival order. A `connect` registers its session
/// before `handle` returns; only the handshake runs as a child task, so a
/// later `disconnect` or channel close always finds the session and cancels
/// it.
pub struct Gateway {
    broker: Arc<Broker>,
    session_id: SessionId,
    caller: Option<Caller>,
    events: EventSink,
    connect_task: Option<JoinHandle<()>>,
}

impl Gateway {
    /// `caller` is `None` when the auth gate rejected the channel.
    #[must_use]
    pub fn new(broker: Arc<Broker>, caller: Option<Caller>, events: EventSink) -> Self {
        Self {
            broker,
            session_id: SessionId::new_v4(),
            caller,
            events,
            connect_task: None,
        }
    }

    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Decode and handle one text frame.
    pub async fn handle_text(&mut self, text: &str) {
        match ClientMessage::parse(text) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => self.reject_frame(&e),
        }
    }

    /// Handle a binary frame carrying a UTF-8 JSON message.
    pub async fn handle_binary(&mut self, data: &[u8]) {
        match std::str::from_utf8(data) {
            Ok(text) => self.handle_text(text).await,
            Err(e) => self.reject_frame(&ProtocolError::from(e)),
        }
    }

    pub async fn handle(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Connect {
                host,
                port,
                username,
                credential,
                auth_method,
                cols,
                rows,
            } => {
                let Some(caller) = self.caller.as_ref() else {
                    warn!(session_id = %self.session_id, "Unauthenticated connect attempt");
                    self.events.report(&BrokerError::Unauthenticated);
                    return;
                };
                let params = ConnectParams::validate(&host, port, &username, credential, auth_method)
                    .and_then(|params| match (cols, rows) {
                        (Some(cols), Some(rows)) => {
                            Ok(params.with_geometry(Geometry::new(cols, rows)?))
                        }
                        _ => Ok(params),
                    });
                let pending = params.and_then(|params| {
                    self.broker
                        .begin_connect(self.session_id, caller, params, &self.events)
                });
                match pending {
                    Ok(pending) => self.spawn_handshake(pending),
                    Err(e) => self.report(&e),
                }
            }
            ClientMessage::Input { data } => match ClientMessage::decode_input(&data) {
                Ok(bytes) => {
                    if let Err(e) = self.broker.send_input(self.session_id, &bytes).await {
                        self.report(&e);
                    }
                }
                Err(e) => self.reject_frame(&e),
            },
            ClientMessage::Resize { cols, rows } => {
                if let Err(e) = self.broker.resize(self.session_id, cols, rows).await {
                    self.report(&e);
                }
            }
            ClientMessage::Disconnect => {
                self.broker.disconnect(self.session_id, &self.events).await;
            }
            ClientMessage::GetStatus => {
                self.events.send(self.broker.status(self.session_id));
            }
            ClientMessage::Ping => {
                self.events.send(BrokerEvent::Pong);
            }
        }
    }

    /// The transport channel closed: end its session without reporting.
    ///
    /// Waits for an in-flight handshake to let go of its connection.
    pub async fn close(&mut self) {
        self.broker.release(self.session_id).await;
        self.settle().await;
        debug!(session_id = %self.session_id, "Gateway closed");
    }

    /// Wait for an in-flight connect to finish.
    pub async fn settle(&mut self) {
        if let Some(task) = self.connect_task.take() {
            let _ = task.await;
        }
    }

    fn spawn_handshake(&mut self, pending: PendingConnect) {
        let broker = Arc::clone(&self.broker);
        let events = self.events.clone();
        let id = self.session_id;
        let task = tokio::spawn(async move {
            if let Err(e) = broker.finish_connect(pending).await {
                if !e.already_reported() {
                    events.report(&e);
                }
            }
        });
        if let Some(previous) = self.connect_task.replace(task) {
            if !previous.is_finished() {
                debug!(session_id = %id, "Connect issued while a previous one is in flight");
            }
        }
    }

    /// Send the one `error` event for a failed request, unless the session
    /// teardown already did.
    fn report(&self, err: &BrokerError) {
        debug!(session_id = %self.session_id, error = %err, "Rejected request");
        if !err.already_reported() {
            self.events.report(err);
        }
    }

    fn reject_frame(&self, err: &ProtocolError) {
        warn!(session_id = %self.session_id, error = %err, "Invalid client message");
        self.events.error(ErrorKind::Validation, err.to_string());
    }
}
