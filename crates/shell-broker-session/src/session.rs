//! One bridged remote shell and its lifecycle.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use shell_broker_core::{
    BrokerError, BrokerEvent, ConnectTarget, Credential, EventSink, FailureCause, Geometry,
    RemoteShell, SessionId, SessionSnapshot, SessionState, ShellChannel, ShellConnection,
    ShellError, StatusState,
};
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, info};

/// How a session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ending {
    /// Clean close: explicit disconnect, idle timeout, remote shell exit.
    Disconnected(String),
    /// Unrecoverable error.
    Failed(ShellError),
}

impl Ending {
    const fn final_state(&self) -> SessionState {
        match self {
            Self::Disconnected(_) => SessionState::Closed,
            Self::Failed(_) => SessionState::Failed,
        }
    }
}

/// Why `establish` did not produce a connected session.
#[derive(Debug)]
pub(crate) enum EstablishError {
    /// Handshake, auth, timeout or shell open failed.
    Handshake(ShellError),
    /// A disconnect arrived while connecting; whatever the handshake had
    /// opened is released.
    Cancelled,
}

struct Inner {
    state: SessionState,
    geometry: Geometry,
    last_activity: Instant,
    failure: Option<FailureCause>,
    /// Final state of a session disconnected during its handshake. Applied
    /// once the handshake has let go of the connection.
    pending_end: Option<SessionState>,
}

struct Link {
    connection: Box<dyn ShellConnection>,
    channel: Arc<dyn ShellChannel>,
}

/// A remote shell in progress for one caller.
///
/// Lock order is `outbound` then `inner`. Neither is held across an await.
pub struct Session {
    id: SessionId,
    owner_id: String,
    target: ConnectTarget,
    /// Per-session output lock. Every event for this session is sent under it.
    outbound: Mutex<EventSink>,
    inner: Mutex<Inner>,
    link: Mutex<Option<Link>>,
    released: AtomicBool,
    /// Wakes an in-flight handshake when the session is disconnected.
    cancel: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    /// A new session in `Connecting`.
    #[must_use]
    pub fn new(
        id: SessionId,
        owner_id: impl Into<String>,
        target: ConnectTarget,
        geometry: Geometry,
        events: EventSink,
    ) -> Self {
        Self {
            id,
            owner_id: owner_id.into(),
            target,
            outbound: Mutex::new(events),
            inner: Mutex::new(Inner {
                state: SessionState::Connecting,
                geometry,
                last_activity: Instant::now(),
                failure: None,
                pending_end: None,
            }),
            link: Mutex::new(None),
            released: AtomicBool::new(false),
            cancel: Notify::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    #[must_use]
    pub const fn target(&self) -> &ConnectTarget {
        &self.target
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        lock(&self.inner).geometry
    }

    #[must_use]
    pub fn last_activity(&self) -> Instant {
        lock(&self.inner).last_activity
    }

    /// Cause recorded when a handshake failure ended the session.
    #[must_use]
    pub fn failure(&self) -> Option<FailureCause> {
        lock(&self.inner).failure
    }

    /// Connected and idle for strictly longer than `threshold` at `now`.
    #[must_use]
    pub fn is_idle(&self, now: Instant, threshold: Duration) -> bool {
        let inner = lock(&self.inner);
        inner.state == SessionState::Connected
            && now.saturating_duration_since(inner.last_activity) > threshold
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = lock(&self.inner);
        SessionSnapshot {
            state: inner.state,
            host: self.target.host.clone(),
            port: self.target.port,
            username: self.target.username.clone(),
            cols: inner.geometry.cols,
            rows: inner.geometry.rows,
            idle_secs: inner.last_activity.elapsed().as_secs(),
        }
    }

    /// Send a status event for this session, ordered with its output.
    pub fn announce(&self, state: StatusState, message: impl Into<String>) {
        lock(&self.outbound).status(state, message);
    }

    /// Drive `Connecting` to `Connected`.
    ///
    /// On success the `connected` status has been emitted and the returned
    /// channel is ready for the output relay. A handshake failure ends the
    /// session in `Failed` with its `error` and `status` events. A disconnect
    /// during the handshake abandons it and completes the session's end.
    pub(crate) async fn establish(
        &self,
        shell: &dyn RemoteShell,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Arc<dyn ShellChannel>, EstablishError> {
        if self.state() != SessionState::Connecting {
            self.finish_cancelled();
            return Err(EstablishError::Cancelled);
        }

        let geometry = self.geometry();
        let attempt = async {
            let connection = shell.open(&self.target, credential).await?;
            match connection.open_shell(geometry).await {
                Ok(channel) => Ok::<_, ShellError>((connection, channel)),
                Err(e) => {
                    connection.close().await;
                    Err(e)
                }
            }
        };

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, attempt) => {
                result.unwrap_or_else(|_| Err(ShellError::Timeout(timeout)))
            }
            () = self.cancel.notified() => {
                debug!(session_id = %self.id, "Handshake abandoned after disconnect");
                self.finish_cancelled();
                return Err(EstablishError::Cancelled);
            }
        };
        let (connection, channel) = match outcome {
            Ok(pair) => pair,
            Err(e) => return Err(self.handshake_failed(e)),
        };

        {
            let sink = lock(&self.outbound);
            let mut inner = lock(&self.inner);
            if inner.state == SessionState::Connecting {
                *lock(&self.link) = Some(Link {
                    connection,
                    channel: Arc::clone(&channel),
                });
                inner.state = SessionState::Connected;
                inner.last_activity = Instant::now();
                sink.status(StatusState::Connected, format!("Connected to {}", self.target));
                return Ok(channel);
            }
        }

        debug!(session_id = %self.id, "Connect finished after disconnect, closing");
        channel.close().await;
        connection.close().await;
        self.finish_cancelled();
        Err(EstablishError::Cancelled)
    }

    fn handshake_failed(&self, error: ShellError) -> EstablishError {
        let sink = lock(&self.outbound);
        let mut inner = lock(&self.inner);
        self.released.store(true, Ordering::SeqCst);
        if inner.state != SessionState::Connecting {
            if let Some(state) = inner.pending_end.take() {
                inner.state = state;
            }
            return EstablishError::Cancelled;
        }
        inner.state = SessionState::Failed;
        self.emit_ending(&sink, &mut inner, Ending::Failed(error.clone()));
        EstablishError::Handshake(error)
    }

    /// Complete the end of a session disconnected during its handshake.
    fn finish_cancelled(&self) {
        let mut inner = lock(&self.inner);
        self.released.store(true, Ordering::SeqCst);
        if let Some(state) = inner.pending_end.take() {
            inner.state = state;
        }
    }

    /// Write raw bytes to the shell.
    ///
    /// A write failure ends the session: the error is `Terminated` and the
    /// caller runs the teardown.
    ///
    /// # Errors
    /// `NotConnected` unless the session is `Connected`.
    pub async fn send_input(&self, data: &[u8]) -> Result<(), BrokerError> {
        let channel = self.connected_channel()?;
        self.touch();
        channel.write(data).await.map_err(BrokerError::Terminated)
    }

    /// Resize the remote pty. Stored geometry changes only on success.
    ///
    /// # Errors
    /// `InvalidGeometry`, `NotConnected`, or `ResizeFailed` (session survives).
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), BrokerError> {
        let geometry = Geometry::new(cols, rows)?;
        let channel = self.connected_channel()?;
        channel
            .resize(geometry)
            .await
            .map_err(BrokerError::ResizeFailed)?;
        lock(&self.inner).geometry = geometry;
        Ok(())
    }

    /// Forward one output chunk. Returns false once the session left
    /// `Connected` or the transport is gone.
    pub(crate) fn emit_output(&self, data: Bytes) -> bool {
        let sink = lock(&self.outbound);
        let mut inner = lock(&self.inner);
        if inner.state != SessionState::Connected {
            return false;
        }
        if !sink.output(data) {
            return false;
        }
        inner.last_activity = Instant::now();
        true
    }

    /// End the session. Idempotent.
    ///
    /// Returns true for the one call that performed the transition; that
    /// call emitted the final events. A session still in its handshake
    /// stays `Closing` until the handshake has released what it opened.
    pub async fn disconnect(&self, ending: Ending) -> bool {
        {
            let sink = lock(&self.outbound);
            let mut inner = lock(&self.inner);
            match inner.state {
                SessionState::Connecting => {
                    inner.state = SessionState::Closing;
                    inner.pending_end = Some(ending.final_state());
                    self.emit_ending(&sink, &mut inner, ending);
                    self.cancel.notify_one();
                    return true;
                }
                SessionState::Connected => inner.state = SessionState::Closing,
                SessionState::Closing | SessionState::Closed | SessionState::Failed => {
                    return false;
                }
            }
        }

        self.release().await;

        let sink = lock(&self.outbound);
        let mut inner = lock(&self.inner);
        inner.state = ending.final_state();
        self.emit_ending(&sink, &mut inner, ending);
        true
    }

    fn emit_ending(&self, sink: &EventSink, inner: &mut Inner, ending: Ending) {
        match ending {
            Ending::Disconnected(message) => {
                sink.status(StatusState::Disconnected, message);
            }
            Ending::Failed(error) => {
                inner.failure = error.cause();
                let message = error.user_message();
                sink.error(error.kind(), message.clone());
                sink.status(StatusState::Error, message);
            }
        }
        info!(session_id = %self.id, state = ?inner.state, remote = %self.target, "Session ended");
    }

    /// Close channel and connection exactly once.
    async fn release(&self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let link = lock(&self.link).take();
        if let Some(link) = link {
            link.channel.close().await;
            link.connection.close().await;
            debug!(session_id = %self.id, "Released remote connection");
        }
    }

    fn connected_channel(&self) -> Result<Arc<dyn ShellChannel>, BrokerError> {
        if self.state() != SessionState::Connected {
            return Err(BrokerError::NotConnected);
        }
        lock(&self.link)
            .as_ref()
            .map(|link| Arc::clone(&link.channel))
            .ok_or(BrokerError::NotConnected)
    }

    fn touch(&self) {
        lock(&self.inner).last_activity = Instant::now();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Build the status reply for a `get_status` request.
#[must_use]
pub fn status_event(session: Option<&Session>) -> BrokerEvent {
    match session {
        Some(session) => {
            let snapshot = session.snapshot();
            let (state, message) = match snapshot.state {
                SessionState::Connecting => (
                    StatusState::Connecting,
                    format!("Connecting to {}...", session.target()),
                ),
                SessionState::Connected => (
                    StatusState::Connected,
                    format!("Connected to {}", session.target()),
                ),
                SessionState::Closing | SessionState::Closed => {
                    (StatusState::Disconnected, "Connection closing".to_string())
                }
                SessionState::Failed => (StatusState::Error, "Connection failed".to_string()),
            };
            BrokerEvent::Status {
                state,
                message,
                snapshot: Some(snapshot),
            }
        }
        None => BrokerEvent::Status {
            state: StatusState::Disconnected,
            message: "No active connection".to_string(),
            snapshot: None,
        },
    }
}
