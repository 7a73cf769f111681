//! SSH backend built on russh.
//!
//! Each shell channel is owned by a driver task. Writes and window changes
//! are sent to it as commands; output comes back over a queue whose end
//! marks end-of-stream. A transport that drops before the remote shell
//! signalled its end is reported as a read error.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use russh::{ChannelMsg, Disconnect, client};
use shell_broker_core::{
    ConnectTarget, Credential, Geometry, RemoteShell, ShellChannel, ShellConnection, ShellError,
};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, warn};

/// SSH client handler.
struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // TODO: verify against a known_hosts file once the broker config carries one.
        warn!("Host key verification not implemented, accepting key");
        Ok(true)
    }
}

/// Password-authenticated SSH client.
#[derive(Debug, Clone)]
pub struct RusshShell {
    term: String,
    keepalive_interval: Duration,
}

impl RusshShell {
    /// `term` is requested for every pty.
    #[must_use]
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl RemoteShell for RusshShell {
    async fn open(
        &self,
        target: &ConnectTarget,
        credential: &Credential,
    ) -> Result<Box<dyn ShellConnection>, ShellError> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(self.keepalive_interval),
            keepalive_max: 3,
            ..Default::default()
        });

        let mut handle = client::connect(
            config,
            (target.host.as_str(), target.port),
            ClientHandler,
        )
        .await
        .map_err(|e| ShellError::HostUnreachable(format!("{target}: {e}")))?;
        debug!(remote = %target, "SSH transport established");

        let authenticated = handle
            .authenticate_password(target.username.as_str(), credential.expose_secret())
            .await
            .map_err(|e| ShellError::HostUnreachable(format!("{target}: {e}")))?;
        if !authenticated {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
            return Err(ShellError::AuthRejected);
        }

        info!(remote = %target, "SSH authentication successful");
        Ok(Box::new(RusshConnection {
            handle: Mutex::new(handle),
            term: self.term.clone(),
        }))
    }
}

struct RusshConnection {
    handle: Mutex<client::Handle<ClientHandler>>,
    term: String,
}

#[async_trait]
impl ShellConnection for RusshConnection {
    async fn open_shell(&self, geometry: Geometry) -> Result<Arc<dyn ShellChannel>, ShellError> {
        let channel = self
            .handle
            .lock()
            .await
            .channel_open_session()
            .await
            .map_err(|e| ShellError::ChannelOpenFailed(e.to_string()))?;

        channel
            .request_pty(
                false,
                &self.term,
                u32::from(geometry.cols),
                u32::from(geometry.rows),
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| ShellError::ChannelOpenFailed(format!("pty request failed: {e}")))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| ShellError::ChannelOpenFailed(format!("shell request failed: {e}")))?;

        Ok(Arc::new(RusshChannel::spawn(channel)))
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .lock()
            .await
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(error = %e, "SSH disconnect failed");
        }
    }
}

enum Command {
    Data(Bytes, oneshot::Sender<Result<(), ShellError>>),
    Resize(Geometry, oneshot::Sender<Result<(), ShellError>>),
    Close,
}

struct RusshChannel {
    commands: mpsc::UnboundedSender<Command>,
    output: Mutex<mpsc::UnboundedReceiver<Result<Bytes, ShellError>>>,
}

impl RusshChannel {
    fn spawn(channel: russh::Channel<client::Msg>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (output_tx, output) = mpsc::unbounded_channel();
        tokio::spawn(drive(channel, command_rx, output_tx));
        Self {
            commands,
            output: Mutex::new(output),
        }
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<(), ShellError>>) -> Command,
    ) -> Result<(), ShellError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| ShellError::ChannelClosed)?;
        rx.await.map_err(|_| ShellError::ChannelClosed)?
    }
}

#[async_trait]
impl ShellChannel for RusshChannel {
    async fn read(&self) -> Result<Option<Bytes>, ShellError> {
        self.output.lock().await.recv().await.transpose()
    }

    async fn write(&self, data: &[u8]) -> Result<(), ShellError> {
        let data = Bytes::copy_from_slice(data);
        self.request(|reply| Command::Data(data, reply)).await
    }

    async fn resize(&self, geometry: Geometry) -> Result<(), ShellError> {
        self.request(|reply| Command::Resize(geometry, reply)).await
    }

    async fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// What the driver does with one `channel.wait()` result.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Output(Bytes),
    Exited,
    End,
    Lost,
    Ignore,
}

fn step(msg: Option<ChannelMsg>, exited: bool) -> Step {
    match msg {
        Some(ChannelMsg::Data { data } | ChannelMsg::ExtendedData { data, .. }) => {
            Step::Output(Bytes::copy_from_slice(&data))
        }
        Some(ChannelMsg::ExitStatus { exit_status }) => {
            debug!(exit_status, "Remote shell exited");
            Step::Exited
        }
        Some(ChannelMsg::Eof | ChannelMsg::Close) => Step::End,
        None if exited => Step::End,
        None => Step::Lost,
        Some(_) => Step::Ignore,
    }
}

/// Own the channel until it closes. Dropping `output` ends the stream.
async fn drive(
    mut channel: russh::Channel<client::Msg>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    output: mpsc::UnboundedSender<Result<Bytes, ShellError>>,
) {
    let mut exited = false;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Data(data, reply)) => {
                    let result = channel
                        .data(&data[..])
                        .await
                        .map_err(|e| ShellError::Io(e.to_string()));
                    let _ = reply.send(result);
                }
                Some(Command::Resize(geometry, reply)) => {
                    let result = channel
                        .window_change(u32::from(geometry.cols), u32::from(geometry.rows), 0, 0)
                        .await
                        .map_err(|e| ShellError::Io(e.to_string()));
                    let _ = reply.send(result);
                }
                Some(Command::Close) | None => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    break;
                }
            },
            msg = channel.wait() => match step(msg, exited) {
                Step::Output(data) => {
                    if output.send(Ok(data)).is_err() {
                        break;
                    }
                }
                Step::Exited => exited = true,
                Step::End => break,
                Step::Lost => {
                    warn!("SSH transport closed before the remote shell ended");
                    let _ = output.send(Err(ShellError::Io(
                        "SSH connection lost".to_string(),
                    )));
                    break;
                }
                Step::Ignore => {}
            },
        }
    }
    debug!("SSH channel driver stopped");
}
