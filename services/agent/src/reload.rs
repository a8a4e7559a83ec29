//! Proxy reload through an external command.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use upsync_reconcile::{ReloadCommand, ReloadError, ReloadTrigger};

/// Runs the reload command and waits for it to exit.
///
/// The child is killed if the reload future is dropped, which is how the
/// reconciler's timeout stops a hung command.
#[derive(Debug, Clone, Default)]
pub struct CommandReload;

impl CommandReload {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ReloadTrigger for CommandReload {
    async fn reload(&self, command: &ReloadCommand) -> Result<(), ReloadError> {
        let output = Command::new(command.program())
            .args(command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ReloadError::Spawn {
                command: command.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(ReloadError::Exited {
                command: command.to_string(),
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        debug!(
            command = %command,
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            "Reload command succeeded"
        );
        Ok(())
    }
}
