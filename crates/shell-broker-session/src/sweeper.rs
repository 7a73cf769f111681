//! Periodic teardown of idle sessions.

use std::{sync::Arc, time::Duration};

use shell_broker_core::SessionId;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{registry::Registry, session::Ending};

/// Tears down connected sessions idle for longer than a threshold.
pub struct IdleSweeper {
    registry: Arc<Registry>,
    threshold: Duration,
    interval: Duration,
}

impl IdleSweeper {
    #[must_use]
    pub const fn new(registry: Arc<Registry>, threshold: Duration, interval: Duration) -> Self {
        Self {
            registry,
            threshold,
            interval,
        }
    }

    /// Message sent to a caller whose session timed out.
    #[must_use]
    pub fn timeout_message(&self) -> String {
        format!(
            "Session closed after {} minutes of inactivity",
            self.threshold.as_secs() / 60
        )
    }

    /// Tear down every session idle at `now`. Returns the ids this sweep
    /// ended.
    pub async fn sweep(&self, now: Instant) -> Vec<SessionId> {
        let idle: Vec<_> = self
            .registry
            .sessions()
            .into_iter()
            .filter(|s| s.is_idle(now, self.threshold))
            .collect();

        let mut ended = Vec::new();
        for session in idle {
            if self
                .registry
                .teardown(&session, Ending::Disconnected(self.timeout_message()))
                .await
            {
                info!(session_id = %session.id(), owner = session.owner_id(), "Closed idle session");
                ended.push(session.id());
            }
        }
        if !ended.is_empty() {
            debug!(count = ended.len(), "Idle sweep finished");
        }
        ended
    }

    /// Run `sweep` every `interval` until the task is aborted.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep(Instant::now()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use shell_broker_core::{
        BrokerEvent, ConnectTarget, Credential, EventSink, Geometry, SessionState, StatusState,
        testing::MockShell,
    };
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    use super::*;
    use crate::session::Session;

    const THRESHOLD: Duration = Duration::from_secs(1800);

    async fn connected(
        registry: &Registry,
        shell: &MockShell,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (sink, mut rx) = EventSink::channel();
        let target = ConnectTarget {
            host: "h".into(),
            port: 22,
            username: "u".into(),
        };
        let session = assert_ok!(registry.create(
            SessionId::new_v4(),
            "alice",
            target,
            Geometry::default(),
            sink
        ));
        assert_ok!(
            session
                .establish(shell, &Credential::new("p"), Duration::from_secs(5))
                .await
        );
        let _connected = rx.recv().await;
        (session, rx)
    }

    fn sweeper(registry: &Arc<Registry>) -> IdleSweeper {
        IdleSweeper::new(Arc::clone(registry), THRESHOLD, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_sweep_respects_exclusive_threshold() {
        let shell = MockShell::new();
        let registry = Arc::new(Registry::default());
        let (session, mut rx) = connected(&registry, &shell).await;
        let last = session.last_activity();

        assert!(sweeper(&registry).sweep(last + THRESHOLD).await.is_empty());
        assert_eq!(session.state(), SessionState::Connected);

        let ended = sweeper(&registry)
            .sweep(last + THRESHOLD + Duration::from_secs(1))
            .await;
        assert_eq!(ended, vec![session.id()]);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.get(session.id()).is_none());
        assert_eq!(shell.connections_closed(), 1);
        assert_eq!(
            rx.recv().await,
            Some(BrokerEvent::Status {
                state: StatusState::Disconnected,
                message: "Session closed after 30 minutes of inactivity".into(),
                snapshot: None,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_activity_keeps_session() {
        let shell = MockShell::new();
        let registry = Arc::new(Registry::default());
        let (stale, _rx1) = connected(&registry, &shell).await;
        let (fresh, _rx2) = connected(&registry, &shell).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_ok!(fresh.send_input(b"x").await);

        let ended = sweeper(&registry)
            .sweep(fresh.last_activity() + THRESHOLD)
            .await;
        assert_eq!(ended, vec![stale.id()]);
        assert_eq!(fresh.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_connecting_sessions_are_skipped() {
        let registry = Arc::new(Registry::default());
        let (sink, _rx) = EventSink::channel();
        let target = ConnectTarget {
            host: "h".into(),
            port: 22,
            username: "u".into(),
        };
        let session = assert_ok!(registry.create(
            SessionId::new_v4(),
            "alice",
            target,
            Geometry::default(),
            sink
        ));

        let later = Instant::now() + THRESHOLD * 4;
        assert!(sweeper(&registry).sweep(later).await.is_empty());
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeper_runs_on_interval() {
        let shell = MockShell::new();
        let registry = Arc::new(Registry::default());
        let (session, _rx) = connected(&registry, &shell).await;

        let handle = IdleSweeper::new(
            Arc::clone(&registry),
            Duration::from_millis(30),
            Duration::from_millis(10),
        )
        .spawn();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(session.state(), SessionState::Connected);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.is_empty());
        handle.abort();
    }
}
