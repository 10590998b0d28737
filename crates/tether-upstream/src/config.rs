use serde::Deserialize;
use std::collections::HashMap;
use tether_core::{TetherError, TetherResult};

/// How upstream workers are provisioned for sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerMode {
    /// One long-lived worker multiplexed across every session.
    #[default]
    Shared,
    /// A dedicated worker per session, spawned with that session's environment.
    PerSession,
}

impl std::str::FromStr for WorkerMode {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(WorkerMode::Shared),
            "per-session" => Ok(WorkerMode::PerSession),
            other => Err(TetherError::Config(format!(
                "unknown worker mode '{other}' (expected 'shared' or 'per-session')"
            ))),
        }
    }
}

/// Configuration for the upstream stdio worker.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamConfig {
    /// Program to run.
    #[serde(default)]
    pub command: String,
    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment added to every worker.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Worker provisioning mode.
    #[serde(default)]
    pub mode: WorkerMode,
}

impl UpstreamConfig {
    /// Build a config from a shell-style command line such as `npx -y some-server`.
    pub fn from_command_line(line: &str) -> TetherResult<Self> {
        let mut tokens = shell_words::split(line)
            .map_err(|e| TetherError::Config(format!("invalid upstream command: {e}")))?
            .into_iter();
        let command = tokens
            .next()
            .ok_or_else(|| TetherError::Config("upstream command is empty".into()))?;
        Ok(Self {
            command,
            args: tokens.collect(),
            ..Self::default()
        })
    }

    /// Reject configs that cannot spawn anything.
    pub fn validate(&self) -> TetherResult<()> {
        if self.command.trim().is_empty() {
            return Err(TetherError::Config("upstream command is empty".into()));
        }
        Ok(())
    }
}
