//! Simulated remote shell.
//!
//! Greets with a banner and a prompt, echoes typed input, answers a line
//! ending with a fresh prompt and exits on `exit`.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use bytes::Bytes;
use shell_broker_core::{
    ConnectTarget, Credential, Geometry, RemoteShell, ShellChannel, ShellConnection, ShellError,
};
use tokio::sync::mpsc;
use tracing::debug;

const BACKSPACE: u8 = 0x7f;

/// In-process `RemoteShell` that needs no network.
#[derive(Debug, Clone, Default)]
pub struct SimulatedShell {
    password: Option<String>,
}

impl SimulatedShell {
    /// Accept any credential.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept `password`.
    #[must_use]
    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
        }
    }
}

#[async_trait]
impl RemoteShell for SimulatedShell {
    async fn open(
        &self,
        target: &ConnectTarget,
        credential: &Credential,
    ) -> Result<Box<dyn ShellConnection>, ShellError> {
        if let Some(expected) = &self.password {
            if credential.expose_secret() != expected {
                return Err(ShellError::AuthRejected);
            }
        }
        debug!(remote = %target, "Simulated connection opened");
        Ok(Box::new(SimulatedConnection {
            target: target.clone(),
        }))
    }
}

struct SimulatedConnection {
    target: ConnectTarget,
}

#[async_trait]
impl ShellConnection for SimulatedConnection {
    async fn open_shell(&self, geometry: Geometry) -> Result<Arc<dyn ShellChannel>, ShellError> {
        debug!(cols = geometry.cols, rows = geometry.rows, "Simulated shell opened");
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = SimulatedChannel {
            prompt: format!("{}@{}:~$ ", self.target.username, self.target.host),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            line: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        channel.send(Bytes::from(format!("\r\nConnected to {}\r\n", self.target)));
        channel.send(Bytes::from(channel.prompt.clone()));
        Ok(Arc::new(channel))
    }

    async fn close(&self) {
        debug!(remote = %self.target, "Simulated connection closed");
    }
}

/// Output queue entry; `None` marks end-of-stream.
type Chunk = Option<Bytes>;

struct SimulatedChannel {
    prompt: String,
    tx: mpsc::UnboundedSender<Chunk>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Chunk>>,
    line: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl SimulatedChannel {
    fn send(&self, data: Bytes) {
        let _ = self.tx.send(Some(data));
    }

    /// Run typed bytes through the line discipline. Returns the echo and
    /// whether the shell exited.
    fn interpret(&self, data: &[u8]) -> (Vec<u8>, bool) {
        let mut line = self.line.lock().unwrap_or_else(PoisonError::into_inner);
        let mut echo = Vec::with_capacity(data.len());
        for &byte in data {
            match byte {
                b'\r' | b'\n' => {
                    echo.extend_from_slice(b"\r\n");
                    let command = String::from_utf8_lossy(&line).trim().to_string();
                    line.clear();
                    if command == "exit" {
                        echo.extend_from_slice(b"logout\r\n");
                        return (echo, true);
                    }
                    echo.extend_from_slice(self.prompt.as_bytes());
                }
                BACKSPACE => {
                    if line.pop().is_some() {
                        echo.extend_from_slice(b"\x08 \x08");
                    }
                }
                _ => {
                    line.push(byte);
                    echo.push(byte);
                }
            }
        }
        (echo, false)
    }
}

#[async_trait]
impl ShellChannel for SimulatedChannel {
    async fn read(&self) -> Result<Option<Bytes>, ShellError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.rx.lock().await.recv().await.flatten())
    }

    async fn write(&self, data: &[u8]) -> Result<(), ShellError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShellError::ChannelClosed);
        }
        let (echo, exited) = self.interpret(data);
        if !echo.is_empty() {
            self.send(Bytes::from(echo));
        }
        if exited {
            let _ = self.tx.send(None);
        }
        Ok(())
    }

    async fn resize(&self, geometry: Geometry) -> Result<(), ShellError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShellError::ChannelClosed);
        }
        debug!(cols = geometry.cols, rows = geometry.rows, "Simulated window change");
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(None);
        }
    }
}
