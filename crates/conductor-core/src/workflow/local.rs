//! CommandWorker: a local worker backed by a shell command.
//!
//! The rendered prompt is written to the child's stdin; whatever it prints on
//! stdout is the step output. A non-zero exit is a permanent worker error.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::dispatcher::{ContextPacket, LocalWorker, TransportError, TransportErrorKind};

pub struct CommandWorker {
    command: String,
}

impl CommandWorker {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl LocalWorker for CommandWorker {
    async fn handle(&self, packet: &ContextPacket) -> Result<String, TransportError> {
        tracing::info!(
            "[CommandWorker] Running '{}' for step {}",
            self.command,
            packet.step.id
        );

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("CONDUCTOR_WORKFLOW_ID", &packet.workflow_id)
            .env("CONDUCTOR_STEP_ID", packet.step.id.to_string())
            .env("CONDUCTOR_WORKER", &packet.step.worker)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TransportError::permanent(
                    TransportErrorKind::NoHandler,
                    format!("Failed to spawn '{}': {}", self.command, e),
                )
            })?;

        // stdin is fed while stdout is drained, so a command echoing a large
        // prompt cannot fill both pipes.
        let stdin = child.stdin.take();
        let prompt = packet.render_prompt();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A command that ignores stdin may close it early.
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    tracing::debug!("[CommandWorker] stdin closed early: {}", e);
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());

        let output = output.map_err(|e| {
            TransportError::transient(
                TransportErrorKind::Connection,
                format!("Failed to wait for '{}': {}", self.command, e),
            )
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransportError::permanent(
                TransportErrorKind::WorkerError,
                format!(
                    "'{}' exited with {}: {}",
                    self.command,
                    output.status,
                    stderr.trim()
                ),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }
}
