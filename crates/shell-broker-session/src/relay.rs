//! Output relay: one task per connected session copying shell output to
//! the caller.

use std::sync::Arc;

use shell_broker_core::ShellChannel;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    registry::Registry,
    session::{Ending, Session},
};

/// Message sent when the remote shell closes its end of the stream.
pub const REMOTE_EXIT_MESSAGE: &str = "Remote shell exited";

/// Ending recorded when the caller's transport channel went away.
pub const TRANSPORT_CLOSED_MESSAGE: &str = "Transport closed";

/// Spawns and runs relay tasks.
pub struct OutputRelay;

impl OutputRelay {
    /// Start relaying `channel` output for `session`.
    ///
    /// The task ends on end-of-stream, on a read error, or once output can
    /// no longer be delivered. Each of these tears the session down; a
    /// session already ending elsewhere is left to that teardown.
    pub fn spawn(
        registry: Arc<Registry>,
        session: Arc<Session>,
        channel: Arc<dyn ShellChannel>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { Self::run(&registry, &session, channel.as_ref()).await })
    }

    async fn run(registry: &Registry, session: &Arc<Session>, channel: &dyn ShellChannel) {
        let ending = loop {
            match channel.read().await {
                Ok(Some(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    if !session.emit_output(chunk) {
                        debug!(session_id = %session.id(), "Relay stopping, output undeliverable");
                        break Ending::Disconnected(TRANSPORT_CLOSED_MESSAGE.to_string());
                    }
                }
                Ok(None) => {
                    debug!(session_id = %session.id(), "Remote shell reached end of stream");
                    break Ending::Disconnected(REMOTE_EXIT_MESSAGE.to_string());
                }
                Err(e) => {
                    warn!(session_id = %session.id(), error = %e, "Shell read failed");
                    break Ending::Failed(e);
                }
            }
        };
        registry.teardown(session, ending).await;
    }
}
