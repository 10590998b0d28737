//! Stdio upstream: a child process exchanging newline-delimited JSON-RPC
//! over its stdin and stdout.

use crate::config::UpstreamConfig;
use crate::transport::{UpstreamEvent, UpstreamEvents, UpstreamTransport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tether_core::{JsonRpcMessage, TetherError, TetherResult};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Upstream worker running as a child process.
pub struct StdioUpstream {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    closed: AtomicBool,
    name: String,
}

impl StdioUpstream {
    /// Spawn the worker. `extra_env` is layered over the config's `env`.
    pub fn spawn(
        config: &UpstreamConfig,
        extra_env: &HashMap<String, String>,
    ) -> TetherResult<(Self, UpstreamEvents)> {
        config.validate()?;

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, val) in config.env.iter().chain(extra_env.iter()) {
            cmd.env(key, val);
        }

        let mut child = cmd.spawn().map_err(|e| {
            TetherError::Upstream(format!("Failed to spawn worker '{}': {e}", config.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TetherError::Upstream("worker stdin not available".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TetherError::Upstream("worker stdout not available".into()))?;

        let name = config.command.clone();

        if let Some(stderr) = child.stderr.take() {
            let worker = name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(worker = %worker, "{line}");
                }
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_stdout(stdout, tx, name.clone()));

        info!(worker = %name, pid = ?child.id(), "Upstream worker spawned");

        Ok((
            Self {
                stdin: Mutex::new(stdin),
                child: Mutex::new(child),
                closed: AtomicBool::new(false),
                name,
            },
            rx,
        ))
    }

    /// OS process id, while the worker is running.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.id()
    }
}

async fn read_stdout(stdout: ChildStdout, tx: mpsc::UnboundedSender<UpstreamEvent>, worker: String) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    let reason = loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break "worker stdout closed".to_string(),
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match JsonRpcMessage::parse(trimmed) {
                    Ok(msg) => {
                        if tx.send(UpstreamEvent::Message(msg)).is_err() {
                            // Nobody is listening anymore
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(worker = %worker, line = %trimmed, error = %e, "Non-JSON-RPC line from worker");
                    }
                }
            }
            Err(e) => {
                error!(worker = %worker, error = %e, "Error reading worker stdout");
                break format!("worker stdout read failed: {e}");
            }
        }
    };
    debug!(worker = %worker, reason = %reason, "Upstream reader finished");
    let _ = tx.send(UpstreamEvent::Closed { reason });
}

#[async_trait]
impl UpstreamTransport for StdioUpstream {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &JsonRpcMessage) -> TetherResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TetherError::Upstream("worker channel is closed".into()));
        }

        let mut line = message.to_line()?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TetherError::Upstream(format!("Failed to write to worker stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| TetherError::Upstream(format!("Failed to flush worker stdin: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> TetherResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(worker = %self.name, status = %status, "Worker already exited");
                Ok(())
            }
            _ => {
                child.kill().await.map_err(|e| {
                    warn!(worker = %self.name, error = %e, "Failed to kill worker");
                    TetherError::Upstream(format!("Failed to kill worker: {e}"))
                })?;
                info!(worker = %self.name, "Upstream worker stopped");
                Ok(())
            }
        }
    }
}
