//! Registry of live sessions keyed by session identifier.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shell_broker_core::{
    BrokerError, ConnectTarget, EventSink, Geometry, SessionId, SessionState,
};
use thiserror::Error;
use tracing::{debug, error};

use crate::session::{Ending, Session};

/// Registry misuse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Session {0} is still {1:?}; disconnect it before removal")]
    StillLive(SessionId, SessionState),
}

/// Admission limits applied by `create`.
#[derive(Debug, Clone, Copy)]
pub struct RegistryPolicy {
    pub max_sessions: usize,
    pub single_session_per_owner: bool,
}

impl Default for RegistryPolicy {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            single_session_per_owner: false,
        }
    }
}

/// Concurrency-safe map of sessions.
///
/// The map lock is held only for the map operation itself, never across
/// network I/O.
pub struct Registry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    policy: RegistryPolicy,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryPolicy::default())
    }
}

impl Registry {
    #[must_use]
    pub fn new(policy: RegistryPolicy) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            policy,
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a `Connecting` placeholder for `id`.
    ///
    /// # Errors
    /// `AlreadyActive` if `id` has a session that is not yet released,
    /// `OwnerBusy` or `CapacityReached` per policy.
    pub fn create(
        &self,
        id: SessionId,
        owner_id: &str,
        target: ConnectTarget,
        geometry: Geometry,
        events: EventSink,
    ) -> Result<Arc<Session>, BrokerError> {
        let mut sessions = self.map();

        if let Some(existing) = sessions.get(&id) {
            if !existing.state().is_terminal() {
                return Err(BrokerError::AlreadyActive(id));
            }
        }

        let live: Vec<&Arc<Session>> = sessions
            .values()
            .filter(|s| !s.state().is_terminal())
            .collect();
        if live.len() >= self.policy.max_sessions {
            return Err(BrokerError::CapacityReached(self.policy.max_sessions));
        }
        if self.policy.single_session_per_owner && live.iter().any(|s| s.owner_id() == owner_id)
        {
            return Err(BrokerError::OwnerBusy(owner_id.to_string()));
        }

        let session = Arc::new(Session::new(id, owner_id, target, geometry, events));
        sessions.insert(id, Arc::clone(&session));
        debug!(session_id = %id, owner = owner_id, "Registered session");
        Ok(session)
    }

    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.map().get(&id).cloned()
    }

    /// Remove a released session.
    ///
    /// # Errors
    /// `StillLive` if the session has not reached `Closed` or `Failed`.
    ///
    /// # Panics
    /// In debug builds, removing a live session is a bug and panics.
    pub fn remove(&self, id: SessionId) -> Result<Option<Arc<Session>>, RegistryError> {
        let mut sessions = self.map();
        let Some(session) = sessions.get(&id) else {
            return Ok(None);
        };
        let state = session.state();
        if !state.is_terminal() {
            error!(session_id = %id, ?state, "Refusing to remove live session");
            debug_assert!(false, "removing live session {id} in state {state:?}");
            return Err(RegistryError::StillLive(id, state));
        }
        Ok(sessions.remove(&id))
    }

    /// End `session` and drop it from the registry.
    ///
    /// Shared by explicit disconnects, relay failures and the idle sweeper.
    /// Returns true for the caller that performed the teardown. A session
    /// caught in its handshake stays registered as `Closing`; the connect
    /// path discards it once the handshake has let go.
    pub async fn teardown(&self, session: &Arc<Session>, ending: Ending) -> bool {
        if !session.disconnect(ending).await {
            return false;
        }
        self.discard(session);
        true
    }

    /// Drop `session` if it is released and still the entry for its id.
    pub(crate) fn discard(&self, session: &Arc<Session>) {
        if !session.state().is_terminal() {
            return;
        }
        let mut sessions = self.map();
        if sessions
            .get(&session.id())
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(&session.id());
            debug!(session_id = %session.id(), "Unregistered session");
        }
    }

    /// Snapshot of all registered sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.map().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use shell_broker_core::{Credential, testing::MockShell};
    use tokio_test::assert_ok;

    use super::*;

    fn target() -> ConnectTarget {
        ConnectTarget {
            host: "h".into(),
            port: 22,
            username: "u".into(),
        }
    }

    fn create(registry: &Registry, id: SessionId, owner: &str) -> Result<Arc<Session>, BrokerError> {
        let (sink, _rx) = EventSink::channel();
        registry.create(id, owner, target(), Geometry::default(), sink)
    }

    #[test]
    fn test_create_rejects_duplicate_identifier() {
        let registry = Registry::default();
        let id = SessionId::new_v4();
        let first = assert_ok!(create(&registry, id, "alice"));
        assert_eq!(
            create(&registry, id, "alice").unwrap_err(),
            BrokerError::AlreadyActive(id)
        );
        assert!(Arc::ptr_eq(&registry.get(id).unwrap(), &first));
        assert_eq!(first.state(), SessionState::Connecting);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_create_admits_one() {
        let registry = Arc::new(Registry::default());
        let id = SessionId::new_v4();

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { create(&registry, id, &format!("owner-{i}")).is_ok() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(registry.len(), 1);
    }

    async fn connected(registry: &Registry, shell: &MockShell, id: SessionId) -> Arc<Session> {
        let session = assert_ok!(create(registry, id, "alice"));
        assert_ok!(
            session
                .establish(shell, &Credential::new("p"), Duration::from_secs(5))
                .await
        );
        session
    }

    #[tokio::test]
    async fn test_identifier_is_free_after_teardown() {
        let shell = MockShell::new();
        let registry = Registry::default();
        let id = SessionId::new_v4();
        let session = connected(&registry, &shell, id).await;

        assert!(
            registry
                .teardown(&session, Ending::Disconnected("bye".into()))
                .await
        );
        assert!(registry.get(id).is_none());
        let second = assert_ok!(create(&registry, id, "alice"));
        assert!(!Arc::ptr_eq(&session, &second));
    }

    #[tokio::test]
    async fn test_identifier_held_until_handshake_lets_go() {
        let shell = MockShell::new();
        let registry = Registry::default();
        let id = SessionId::new_v4();
        let session = assert_ok!(create(&registry, id, "alice"));

        assert!(
            registry
                .teardown(&session, Ending::Disconnected("bye".into()))
                .await
        );
        assert_eq!(session.state(), SessionState::Closing);
        assert!(registry.get(id).is_some());
        assert_eq!(
            create(&registry, id, "alice").unwrap_err(),
            BrokerError::AlreadyActive(id)
        );

        assert!(
            session
                .establish(&shell, &Credential::new("p"), Duration::from_secs(5))
                .await
                .is_err()
        );
        registry.discard(&session);
        assert!(registry.get(id).is_none());
        assert_ok!(create(&registry, id, "alice"));
    }

    #[tokio::test]
    async fn test_remove_terminal_session() {
        let shell = MockShell::new();
        let registry = Registry::default();
        let id = SessionId::new_v4();
        let session = connected(&registry, &shell, id).await;
        session.disconnect(Ending::Disconnected("bye".into())).await;

        let removed = assert_ok!(registry.remove(id));
        assert!(removed.is_some());
        assert_eq!(assert_ok!(registry.remove(id)).map(|s| s.id()), None);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "removing live session")]
    fn test_remove_live_session_fails_loudly() {
        let registry = Registry::default();
        let id = SessionId::new_v4();
        let _session = create(&registry, id, "alice");
        let _ = registry.remove(id);
    }

    #[test]
    fn test_capacity_limit() {
        let registry = Registry::new(RegistryPolicy {
            max_sessions: 2,
            single_session_per_owner: false,
        });
        assert_ok!(create(&registry, SessionId::new_v4(), "a"));
        assert_ok!(create(&registry, SessionId::new_v4(), "b"));
        assert_eq!(
            create(&registry, SessionId::new_v4(), "c").unwrap_err(),
            BrokerError::CapacityReached(2)
        );
    }

    #[test]
    fn test_single_session_per_owner() {
        let registry = Registry::new(RegistryPolicy {
            max_sessions: 10,
            single_session_per_owner: true,
        });
        assert_ok!(create(&registry, SessionId::new_v4(), "alice"));
        assert_eq!(
            create(&registry, SessionId::new_v4(), "alice").unwrap_err(),
            BrokerError::OwnerBusy("alice".into())
        );
        assert_ok!(create(&registry, SessionId::new_v4(), "bob"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_teardown_releases_once() {
        let shell = MockShell::new();
        let registry = Arc::new(Registry::default());
        let id = SessionId::new_v4();
        let session = assert_ok!(create(&registry, id, "alice"));
        assert_ok!(
            session
                .establish(&shell, &Credential::new("p"), Duration::from_secs(5))
                .await
        );

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    registry
                        .teardown(&session, Ending::Disconnected("bye".into()))
                        .await
                })
            })
            .collect();
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(shell.connections_closed(), 1);
        assert!(registry.get(id).is_none());
        assert_ok!(create(&registry, id, "alice"));
    }
}
