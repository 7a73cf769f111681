//! Broker: the operations a transport channel can request.

use std::sync::Arc;

use shell_broker_core::{
    AuditRecord, AuditSink, BrokerConfig, BrokerError, BrokerEvent, Caller, ConnectOutcome,
    ConnectParams, Credential, EventSink, Geometry, RemoteShell, SessionId, StatusState,
    config::{AuditConfig, SessionConfig},
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    registry::{Registry, RegistryPolicy},
    relay::{OutputRelay, TRANSPORT_CLOSED_MESSAGE},
    session::{Ending, EstablishError, Session, status_event},
    sweeper::IdleSweeper,
};

/// Message sent when the caller ends the session.
pub const DISCONNECT_MESSAGE: &str = "SSH connection closed";

/// A session registered by `Broker::begin_connect` whose handshake has not
/// run yet.
#[must_use = "the session stays `Connecting` until `finish_connect` runs"]
pub struct PendingConnect {
    session: Arc<Session>,
    owner_id: String,
    credential: Credential,
}

/// Owns the registry and wires sessions to the remote shell backend and
/// the audit trail.
pub struct Broker {
    registry: Arc<Registry>,
    shell: Arc<dyn RemoteShell>,
    audit: Arc<dyn AuditSink>,
    session_config: SessionConfig,
    audit_policy: AuditConfig,
}

impl Broker {
    #[must_use]
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        audit: Arc<dyn AuditSink>,
        config: &BrokerConfig,
    ) -> Self {
        let policy = RegistryPolicy {
            max_sessions: config.session.max_sessions,
            single_session_per_owner: config.session.single_session_per_owner,
        };
        Self {
            registry: Arc::new(Registry::new(policy)),
            shell,
            audit,
            session_config: config.session.clone(),
            audit_policy: config.audit.clone(),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.registry.get(id)
    }

    /// Open a remote shell for `id` and start relaying its output to
    /// `events`.
    ///
    /// Emits `status{connecting}` then `status{connected}`. A handshake
    /// failure is reported on `events` before this returns.
    ///
    /// # Errors
    /// Admission errors (`AlreadyActive`, `OwnerBusy`, `CapacityReached`)
    /// that the caller reports, or `Terminated`/`Cancelled` that are
    /// already reported.
    pub async fn connect(
        &self,
        id: SessionId,
        caller: &Caller,
        params: ConnectParams,
        events: &EventSink,
    ) -> Result<(), BrokerError> {
        let pending = self.begin_connect(id, caller, params, events)?;
        self.finish_connect(pending).await
    }

    /// Register a `Connecting` session for `id` and announce it.
    ///
    /// From here on a `disconnect` or `release` for `id` finds the session,
    /// even before the handshake has started.
    ///
    /// # Errors
    /// `AlreadyActive`, `OwnerBusy` or `CapacityReached`.
    pub fn begin_connect(
        &self,
        id: SessionId,
        caller: &Caller,
        params: ConnectParams,
        events: &EventSink,
    ) -> Result<PendingConnect, BrokerError> {
        let geometry = params
            .geometry
            .unwrap_or_else(|| self.session_config.default_geometry());
        let target = params.target;
        let session = self.registry.create(
            id,
            &caller.owner_id,
            target.clone(),
            geometry,
            events.clone(),
        )?;

        session.announce(StatusState::Connecting, format!("Connecting to {target}..."));
        info!(session_id = %id, owner = %caller.owner_id, host = %target.host, username = %target.username, "Connecting");
        Ok(PendingConnect {
            session,
            owner_id: caller.owner_id.clone(),
            credential: params.credential,
        })
    }

    /// Run the handshake of a registered session and start its relay.
    ///
    /// # Errors
    /// `Terminated` if the handshake failed, `Cancelled` if the session was
    /// disconnected meanwhile. Both are already reported.
    pub async fn finish_connect(&self, pending: PendingConnect) -> Result<(), BrokerError> {
        let PendingConnect {
            session,
            owner_id,
            credential,
        } = pending;
        let id = session.id();
        let target = session.target().clone();

        let result = session
            .establish(
                self.shell.as_ref(),
                &credential,
                self.session_config.connect_timeout(),
            )
            .await;

        let (outcome, result) = match result {
            Ok(channel) => {
                info!(session_id = %id, remote = %target, "Session connected");
                OutputRelay::spawn(Arc::clone(&self.registry), Arc::clone(&session), channel);
                (ConnectOutcome::Connected, Ok(()))
            }
            Err(EstablishError::Handshake(e)) => {
                warn!(session_id = %id, remote = %target, error = %e, "Connect failed");
                let outcome = ConnectOutcome::Failed {
                    kind: e.kind(),
                    reason: e.to_string(),
                };
                (outcome, Err(BrokerError::Terminated(e)))
            }
            Err(EstablishError::Cancelled) => {
                debug!(session_id = %id, "Connect cancelled by disconnect");
                let err = BrokerError::Cancelled;
                let outcome = ConnectOutcome::Failed {
                    kind: err.kind(),
                    reason: err.to_string(),
                };
                (outcome, Err(err))
            }
        };
        self.audit
            .record(AuditRecord::connect_attempt(id, &owner_id, &target, outcome));
        self.registry.discard(&session);
        result
    }

    /// Forward raw input to the session's shell.
    ///
    /// # Errors
    /// `NotConnected`, or `Terminated` if the write broke the session.
    pub async fn send_input(&self, id: SessionId, data: &[u8]) -> Result<(), BrokerError> {
        let session = self.registry.get(id).ok_or(BrokerError::NotConnected)?;
        let result = session.send_input(data).await;
        match &result {
            Ok(()) => {
                self.audit.record(AuditRecord::input(
                    id,
                    session.owner_id(),
                    data,
                    &self.audit_policy,
                ));
            }
            Err(BrokerError::Terminated(e)) => {
                warn!(session_id = %id, error = %e, "Shell write failed");
                self.registry
                    .teardown(&session, Ending::Failed(e.clone()))
                    .await;
            }
            Err(_) => {}
        }
        result
    }

    /// # Errors
    /// `InvalidGeometry`, `NotConnected` or `ResizeFailed`.
    pub async fn resize(&self, id: SessionId, cols: u16, rows: u16) -> Result<(), BrokerError> {
        let session = self.registry.get(id);
        let Some(session) = session else {
            Geometry::new(cols, rows)?;
            return Err(BrokerError::NotConnected);
        };
        session.resize(cols, rows).await?;
        debug!(session_id = %id, cols, rows, "Resized terminal");
        Ok(())
    }

    /// End the session for `id`, if any. Returns true if this call ended it.
    ///
    /// With no live session the caller still gets a `disconnected` status.
    pub async fn disconnect(&self, id: SessionId, events: &EventSink) -> bool {
        let ended = match self.registry.get(id) {
            Some(session) => {
                self.registry
                    .teardown(&session, Ending::Disconnected(DISCONNECT_MESSAGE.to_string()))
                    .await
            }
            None => false,
        };
        if !ended {
            events.status(StatusState::Disconnected, DISCONNECT_MESSAGE);
        }
        ended
    }

    /// Tear down the session silently when its transport channel closed.
    pub async fn release(&self, id: SessionId) {
        if let Some(session) = self.registry.get(id) {
            if self
                .registry
                .teardown(&session, Ending::Disconnected(TRANSPORT_CLOSED_MESSAGE.to_string()))
                .await
            {
                debug!(session_id = %id, "Released session of closed transport");
            }
        }
    }

    /// `status` reply for `get_status`.
    #[must_use]
    pub fn status(&self, id: SessionId) -> BrokerEvent {
        status_event(self.registry.get(id).as_deref())
    }

    /// Start the idle sweeper with the configured timing.
    #[must_use]
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        IdleSweeper::new(
            Arc::clone(&self.registry),
            self.session_config.idle_timeout(),
            self.session_config.sweep_interval(),
        )
        .spawn()
    }

    /// Close every session. Used on server shutdown.
    pub async fn shutdown(&self) {
        let sessions = self.registry.sessions();
        info!(count = sessions.len(), "Closing all sessions");
        for session in sessions {
            self.registry
                .teardown(&session, Ending::Disconnected("Server shutting down".to_string()))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use shell_broker_core::{
        AuthMethod, Credential, ErrorKind, SessionState, ShellError,
        testing::{MockBehavior, MockShell},
    };
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::audit::MemoryAudit;

    struct Fixture {
        shell: MockShell,
        audit: Arc<MemoryAudit>,
        broker: Broker,
    }

    fn fixture(config: &BrokerConfig) -> Fixture {
        let shell = MockShell::new();
        let audit = Arc::new(MemoryAudit::new());
        let broker = Broker::new(
            Arc::new(shell.clone()),
            Arc::clone(&audit) as Arc<dyn AuditSink>,
            config,
        );
        Fixture {
            shell,
            audit,
            broker,
        }
    }

    fn params() -> ConnectParams {
        assert_ok!(ConnectParams::validate(
            "example.com",
            Some(22),
            "alice",
            Credential::new("secret"),
            AuthMethod::Password,
        ))
    }

    async fn next_status(rx: &mut mpsc::UnboundedReceiver<BrokerEvent>) -> StatusState {
        loop {
            match rx.recv().await {
                Some(BrokerEvent::Status { state, .. }) => return state,
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_connect_emits_connecting_then_connected() {
        let f = fixture(&BrokerConfig::default());
        let (events, mut rx) = EventSink::channel();
        let id = SessionId::new_v4();

        assert_ok!(
            f.broker
                .connect(id, &Caller::new("alice"), params(), &events)
                .await
        );
        assert_eq!(next_status(&mut rx).await, StatusState::Connecting);
        assert_eq!(next_status(&mut rx).await, StatusState::Connected);
        assert_eq!(
            f.broker.session(id).map(|s| s.state()),
            Some(SessionState::Connected)
        );

        let records = f.audit.for_session(id);
        assert!(matches!(
            records.as_slice(),
            [AuditRecord::ConnectAttempt {
                outcome: ConnectOutcome::Connected,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_frees_identifier() {
        let f = fixture(&BrokerConfig::default());
        f.shell.set_behavior(MockBehavior::Refuse);
        let (events, mut rx) = EventSink::channel();
        let id = SessionId::new_v4();

        let err = f
            .broker
            .connect(id, &Caller::anonymous(), params(), &events)
            .await
            .unwrap_err();
        assert!(err.already_reported());
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(f.broker.session(id).is_none());

        assert_eq!(next_status(&mut rx).await, StatusState::Connecting);
        assert!(matches!(
            rx.recv().await,
            Some(BrokerEvent::Error { kind: ErrorKind::Connection, .. })
        ));
        assert_eq!(next_status(&mut rx).await, StatusState::Error);

        f.shell.set_behavior(MockBehavior::Accept);
        assert_ok!(
            f.broker
                .connect(id, &Caller::anonymous(), params(), &events)
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_uses_configured_bound() {
        let mut config = BrokerConfig::default();
        config.session.connect_timeout_secs = 1;
        let f = fixture(&config);
        f.shell.set_behavior(MockBehavior::Hang);
        let (events, _rx) = EventSink::channel();
        let id = SessionId::new_v4();

        let err = f
            .broker
            .connect(id, &Caller::anonymous(), params(), &events)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Terminated(ShellError::Timeout(d)) if d == Duration::from_secs(1)
        ));
        assert!(f.broker.session(id).is_none());
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let f = fixture(&BrokerConfig::default());
        let (events, _rx) = EventSink::channel();
        let id = SessionId::new_v4();
        assert_ok!(
            f.broker
                .connect(id, &Caller::anonymous(), params(), &events)
                .await
        );

        let err = f
            .broker
            .connect(id, &Caller::anonymous(), params(), &events)
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::AlreadyActive(id));
        assert!(!err.already_reported());
        assert_eq!(
            f.broker.session(id).map(|s| s.state()),
            Some(SessionState::Connected)
        );
        assert_eq!(f.shell.opened(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_before_handshake_cancels_connect() {
        let f = fixture(&BrokerConfig::default());
        let (events, mut rx) = EventSink::channel();
        let id = SessionId::new_v4();

        let pending = assert_ok!(f.broker.begin_connect(
            id,
            &Caller::anonymous(),
            params(),
            &events
        ));
        assert!(f.broker.disconnect(id, &events).await);
        assert_eq!(
            f.broker.finish_connect(pending).await,
            Err(BrokerError::Cancelled)
        );

        assert_eq!(next_status(&mut rx).await, StatusState::Connecting);
        assert_eq!(next_status(&mut rx).await, StatusState::Disconnected);
        assert!(rx.try_recv().is_err());
        assert_eq!(f.shell.opened(), 0);
        assert!(f.broker.session(id).is_none());
    }

    #[tokio::test]
    async fn test_identifier_reserved_while_handshake_unwinds() {
        let f = fixture(&BrokerConfig::default());
        f.shell.set_behavior(MockBehavior::Hang);
        let broker = Arc::new(f.broker);
        let (events, _rx) = EventSink::channel();
        let id = SessionId::new_v4();

        let pending = assert_ok!(broker.begin_connect(
            id,
            &Caller::anonymous(),
            params(),
            &events
        ));
        let handshake = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move { broker.finish_connect(pending).await }
        });
        tokio::task::yield_now().await;

        assert!(broker.disconnect(id, &events).await);
        assert_eq!(
            broker.session(id).map(|s| s.state()),
            Some(SessionState::Closing)
        );
        assert_eq!(
            broker
                .connect(id, &Caller::anonymous(), params(), &events)
                .await,
            Err(BrokerError::AlreadyActive(id))
        );

        assert_eq!(assert_ok!(handshake.await), Err(BrokerError::Cancelled));
        assert!(broker.session(id).is_none());
        f.shell.set_behavior(MockBehavior::Accept);
        assert_ok!(
            broker
                .connect(id, &Caller::anonymous(), params(), &events)
                .await
        );
    }

    #[tokio::test]
    async fn test_input_is_audited() {
        let mut config = BrokerConfig::default();
        config.audit.record_input_content = true;
        let f = fixture(&config);
        let (events, mut rx) = EventSink::channel();
        let id = SessionId::new_v4();
        assert_ok!(
            f.broker
                .connect(id, &Caller::new("alice"), params(), &events)
                .await
        );

        assert_ok!(f.broker.send_input(id, b"rm -rf /tmp/x\n").await);
        let input = f
            .audit
            .for_session(id)
            .into_iter()
            .find(|r| matches!(r, AuditRecord::Input { .. }));
        let Some(AuditRecord::Input {
            bytes,
            content,
            dangerous,
            ..
        }) = input
        else {
            panic!("missing input record");
        };
        assert_eq!(bytes, 14);
        assert_eq!(content.as_deref(), Some("rm -rf /tmp/x\n"));
        assert!(dangerous);

        let _ = next_status(&mut rx).await;
        let _ = next_status(&mut rx).await;
        assert_eq!(
            rx.recv().await,
            Some(BrokerEvent::Output(Bytes::from_static(b"rm -rf /tmp/x\n")))
        );
    }

    #[tokio::test]
    async fn test_input_without_session() {
        let f = fixture(&BrokerConfig::default());
        assert_eq!(
            f.broker.send_input(SessionId::new_v4(), b"ls\n").await,
            Err(BrokerError::NotConnected)
        );
        assert!(f.audit.records().is_empty());
    }

    #[tokio::test]
    async fn test_resize_validates_before_lookup() {
        let f = fixture(&BrokerConfig::default());
        let id = SessionId::new_v4();
        assert_eq!(
            f.broker.resize(id, 0, 24).await,
            Err(BrokerError::InvalidGeometry { cols: 0, rows: 24 })
        );
        assert_eq!(
            f.broker.resize(id, 80, 24).await,
            Err(BrokerError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let f = fixture(&BrokerConfig::default());
        let (events, mut rx) = EventSink::channel();
        let id = SessionId::new_v4();
        assert_ok!(
            f.broker
                .connect(id, &Caller::anonymous(), params(), &events)
                .await
        );
        let _ = next_status(&mut rx).await;
        let _ = next_status(&mut rx).await;

        assert!(f.broker.disconnect(id, &events).await);
        assert_eq!(next_status(&mut rx).await, StatusState::Disconnected);
        assert!(f.broker.session(id).is_none());
        assert_eq!(f.shell.connections_closed(), 1);

        assert!(!f.broker.disconnect(id, &events).await);
        assert_eq!(next_status(&mut rx).await, StatusState::Disconnected);
        assert_err!(f.broker.send_input(id, b"ls\n").await);
    }

    #[tokio::test]
    async fn test_release_closes_silently() {
        let f = fixture(&BrokerConfig::default());
        let (events, rx) = EventSink::channel();
        let id = SessionId::new_v4();
        assert_ok!(
            f.broker
                .connect(id, &Caller::anonymous(), params(), &events)
                .await
        );
        drop(rx);

        f.broker.release(id).await;
        assert!(f.broker.session(id).is_none());
        assert_eq!(f.shell.connections_closed(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let f = fixture(&BrokerConfig::default());
        let (events, _rx) = EventSink::channel();
        for _ in 0..3 {
            assert_ok!(
                f.broker
                    .connect(SessionId::new_v4(), &Caller::anonymous(), params(), &events)
                    .await
            );
        }

        f.broker.shutdown().await;
        assert!(f.broker.registry().is_empty());
        assert_eq!(f.shell.connections_closed(), 3);
    }

    #[tokio::test]
    async fn test_configured_geometry_is_default() {
        let mut config = BrokerConfig::default();
        config.session.default_cols = 132;
        config.session.default_rows = 43;
        let f = fixture(&config);
        let (events, _rx) = EventSink::channel();
        let id = SessionId::new_v4();

        assert_ok!(
            f.broker
                .connect(id, &Caller::anonymous(), params(), &events)
                .await
        );
        assert_eq!(
            f.shell.last_channel().map(|c| c.geometry()),
            Some(Geometry { cols: 132, rows: 43 })
        );

        let id = SessionId::new_v4();
        assert_ok!(
            f.broker
                .connect(
                    id,
                    &Caller::anonymous(),
                    params().with_geometry(assert_ok!(Geometry::new(100, 30))),
                    &events
                )
                .await
        );
        assert_eq!(
            f.broker.session(id).map(|s| s.geometry()),
            Some(Geometry { cols: 100, rows: 30 })
        );
    }
}
