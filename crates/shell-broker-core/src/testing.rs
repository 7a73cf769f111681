//! Scripted remote shell backend for tests (feature: testing).

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    ConnectTarget, Credential, Geometry, RemoteShell, ShellChannel, ShellConnection, ShellError,
};

/// How the mock answers `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Connect and open shells normally.
    Accept,
    /// Refuse the TCP connection.
    Refuse,
    /// Reject the credential.
    RejectAuth,
    /// Never answer; the caller's timeout has to fire.
    Hang,
    /// Authenticate but refuse the shell channel.
    FailShell,
}

enum MockRead {
    Data(Bytes),
    Eof,
    Fail(String),
}

struct Inner {
    behavior: Mutex<MockBehavior>,
    echo: AtomicBool,
    fail_resize: AtomicBool,
    fail_write: AtomicBool,
    opened: AtomicUsize,
    connections_closed: AtomicUsize,
    channels_closed: AtomicUsize,
    channels: Mutex<Vec<Arc<MockChannel>>>,
}

/// In-memory `RemoteShell` with counters and injectable failures.
#[derive(Clone)]
pub struct MockShell {
    inner: Arc<Inner>,
}

impl Default for MockShell {
    fn default() -> Self {
        Self::new()
    }
}

impl MockShell {
    /// Accepting mock that echoes every write back as output.
    #[must_use]
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::Accept)
    }

    #[must_use]
    pub fn with_behavior(behavior: MockBehavior) -> Self {
        Self {
            inner: Arc::new(Inner {
                behavior: Mutex::new(behavior),
                echo: AtomicBool::new(true),
                fail_resize: AtomicBool::new(false),
                fail_write: AtomicBool::new(false),
                opened: AtomicUsize::new(0),
                connections_closed: AtomicUsize::new(0),
                channels_closed: AtomicUsize::new(0),
                channels: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self
            .inner
            .behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = behavior;
    }

    pub fn set_echo(&self, echo: bool) {
        self.inner.echo.store(echo, Ordering::SeqCst);
    }

    pub fn set_fail_resize(&self, fail: bool) {
        self.inner.fail_resize.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail as if the remote end had dropped.
    pub fn set_fail_write(&self, fail: bool) {
        self.inner.fail_write.store(fail, Ordering::SeqCst);
    }

    /// Successful `open` calls.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn connections_closed(&self) -> usize {
        self.inner.connections_closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn channels_closed(&self) -> usize {
        self.inner.channels_closed.load(Ordering::SeqCst)
    }

    /// Most recently opened shell channel.
    #[must_use]
    pub fn last_channel(&self) -> Option<Arc<MockChannel>> {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    fn behavior(&self) -> MockBehavior {
        *self
            .inner
            .behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RemoteShell for MockShell {
    async fn open(
        &self,
        target: &ConnectTarget,
        _credential: &Credential,
    ) -> Result<Box<dyn ShellConnection>, ShellError> {
        match self.behavior() {
            MockBehavior::Refuse => Err(ShellError::HostUnreachable(format!(
                "{}:{}: connection refused",
                target.host, target.port
            ))),
            MockBehavior::RejectAuth => Err(ShellError::AuthRejected),
            MockBehavior::Hang => std::future::pending().await,
            MockBehavior::Accept | MockBehavior::FailShell => {
                self.inner.opened.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(MockConnection {
                    shell: self.clone(),
                }))
            }
        }
    }
}

struct MockConnection {
    shell: MockShell,
}

#[async_trait]
impl ShellConnection for MockConnection {
    async fn open_shell(&self, geometry: Geometry) -> Result<Arc<dyn ShellChannel>, ShellError> {
        if self.shell.behavior() == MockBehavior::FailShell {
            return Err(ShellError::ChannelOpenFailed("pty request denied".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(MockChannel {
            shell: self.shell.clone(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            written: Mutex::new(Vec::new()),
            geometry: Mutex::new(geometry),
            closed: AtomicBool::new(false),
        });
        self.shell
            .inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn close(&self) {
        self.shell
            .inner
            .connections_closed
            .fetch_add(1, Ordering::SeqCst);
    }
}

/// Shell channel of a `MockShell`.
pub struct MockChannel {
    shell: MockShell,
    tx: mpsc::UnboundedSender<MockRead>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockRead>>,
    written: Mutex<Vec<u8>>,
    geometry: Mutex<Geometry>,
    closed: AtomicBool,
}

impl MockChannel {
    /// Queue output for the reader.
    pub fn push_output(&self, data: impl Into<Bytes>) {
        let _ = self.tx.send(MockRead::Data(data.into()));
    }

    /// Simulate the remote shell exiting.
    pub fn end_of_stream(&self) {
        let _ = self.tx.send(MockRead::Eof);
    }

    /// Make the next read fail.
    pub fn fail_read(&self, reason: impl Into<String>) {
        let _ = self.tx.send(MockRead::Fail(reason.into()));
    }

    /// Everything written so far.
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Last geometry accepted by the remote pty.
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        *self.geometry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShellChannel for MockChannel {
    async fn read(&self) -> Result<Option<Bytes>, ShellError> {
        if self.is_closed() {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(MockRead::Data(data)) => Ok(Some(data)),
            Some(MockRead::Eof) | None => Ok(None),
            Some(MockRead::Fail(reason)) => Err(ShellError::Io(reason)),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), ShellError> {
        if self.is_closed() {
            return Err(ShellError::ChannelClosed);
        }
        if self.shell.inner.fail_write.load(Ordering::SeqCst) {
            return Err(ShellError::Io("broken pipe".into()));
        }
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        if self.shell.inner.echo.load(Ordering::SeqCst) {
            self.push_output(Bytes::copy_from_slice(data));
        }
        Ok(())
    }

    async fn resize(&self, geometry: Geometry) -> Result<(), ShellError> {
        if self.is_closed() {
            return Err(ShellError::ChannelClosed);
        }
        if self.shell.inner.fail_resize.load(Ordering::SeqCst) {
            return Err(ShellError::Io("window change rejected".into()));
        }
        *self.geometry.lock().unwrap_or_else(PoisonError::into_inner) = geometry;
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shell
                .inner
                .channels_closed
                .fetch_add(1, Ordering::SeqCst);
            let _ = self.tx.send(MockRead::Eof);
        }
    }
}
