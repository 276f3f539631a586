//! Remote command bridge
//!
//! Remote command handlers report completed commands through a
//! [`RemoteCommandSender`]. A pump thread owned by the dispatcher hands any
//! response script to the runtime. Nothing flows back into the track
//! lifecycle.

use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;

use super::runtime::TagRuntime;

/// A remote command finished and may have a script for the page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommandExecuted {
    pub command_id: String,
    pub response_script: Option<String>,
}

/// Cloneable handle for reporting executed remote commands
#[derive(Clone)]
pub struct RemoteCommandSender {
    sender: SyncSender<RemoteCommandExecuted>,
}

impl RemoteCommandSender {
    /// Queue a notification without blocking. Returns false if the bridge is
    /// full or gone; the notification is discarded.
    pub fn notify(&self, executed: RemoteCommandExecuted) -> bool {
        match self.sender.try_send(executed) {
            Ok(()) => true,
            Err(TrySendError::Full(executed)) => {
                tracing::warn!(
                    command = %executed.command_id,
                    "Remote command bridge full, discarding response"
                );
                false
            }
            Err(TrySendError::Disconnected(executed)) => {
                tracing::debug!(
                    command = %executed.command_id,
                    "Remote command bridge closed"
                );
                false
            }
        }
    }
}

/// Start the pump. It exits when every sender has been dropped.
pub(super) fn spawn_bridge(runtime: Arc<dyn TagRuntime>, capacity: usize) -> RemoteCommandSender {
    let (sender, receiver) = mpsc::sync_channel::<RemoteCommandExecuted>(capacity.max(1));

    let spawned = thread::Builder::new()
        .name("trackwire-remote-commands".to_string())
        .spawn(move || {
            while let Ok(executed) = receiver.recv() {
                if let Some(script) = executed.response_script.as_deref() {
                    tracing::trace!(command = %executed.command_id, "Evaluating remote command response");
                    runtime.evaluate_script(script);
                }
            }
        });

    if let Err(e) = spawned {
        // Receiver dropped with the closure; notify() reports Disconnected
        tracing::error!(error = %e, "Failed to spawn remote command bridge");
    }

    RemoteCommandSender { sender }
}
