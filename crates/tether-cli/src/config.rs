//! `tether.toml` loading and command-line overrides.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tether_auth::AuthConfig;
use tether_gateway::GatewayConfig;
use tether_upstream::{UpstreamConfig, WorkerMode};

/// Full configuration of the `tether` binary.
#[derive(Debug, Default, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_sse_path")]
    pub sse_path: String,
    #[serde(default = "default_message_path")]
    pub message_path: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            sse_path: default_sse_path(),
            message_path: default_message_path(),
            base_url: String::new(),
            headers: BTreeMap::new(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ShutdownConfig {
    /// Time allowed for sessions to close after a signal.
    #[serde(default = "default_grace")]
    pub grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_grace(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_sse_path() -> String {
    "/sse".to_string()
}
fn default_message_path() -> String {
    "/messages".to_string()
}
fn default_keep_alive() -> u64 {
    15
}
fn default_grace() -> u64 {
    5
}

/// Values given on the command line or through `TETHER_*` variables.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub stdio: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub sse_path: Option<String>,
    pub message_path: Option<String>,
    pub base_url: Option<String>,
    pub auth_header: Option<String>,
    pub api_key: Option<String>,
    pub auth_url: Option<String>,
    pub no_auth: bool,
    pub worker_mode: Option<WorkerMode>,
    pub headers: Vec<String>,
}

impl TetherConfig {
    /// Read a config file, or start from defaults when none is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        let config: TetherConfig = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid config file '{}': {}", path.display(), e))?;
        Ok(config)
    }

    /// Layer command-line values over the file.
    pub fn apply(&mut self, overrides: Overrides) -> anyhow::Result<()> {
        if let Some(line) = overrides.stdio {
            let parsed = UpstreamConfig::from_command_line(&line)?;
            self.upstream.command = parsed.command;
            self.upstream.args = parsed.args;
        }
        if let Some(mode) = overrides.worker_mode {
            self.upstream.mode = mode;
        }

        if let Some(host) = overrides.host {
            self.server.host = host;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(path) = overrides.sse_path {
            self.server.sse_path = path;
        }
        if let Some(path) = overrides.message_path {
            self.server.message_path = path;
        }
        if let Some(url) = overrides.base_url {
            self.server.base_url = url;
        }
        for header in &overrides.headers {
            let (name, value) = parse_header(header)?;
            self.server.headers.insert(name, value);
        }

        if let Some(header) = overrides.auth_header {
            self.auth.header = header;
        }
        if let Some(key) = overrides.api_key {
            self.auth.api_key = Some(key);
        }
        if let Some(url) = overrides.auth_url {
            self.auth.delegate_url = Some(url);
        }
        if overrides.no_auth {
            self.auth.enabled = false;
        }
        Ok(())
    }

    /// Reject configurations that cannot start.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.upstream
            .validate()
            .map_err(|_| anyhow::anyhow!("No upstream command: pass --stdio or set [upstream].command"))?;
        self.gateway_config().validate()?;
        Ok(())
    }

    /// Listener settings for the gateway.
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            sse_path: self.server.sse_path.clone(),
            message_path: self.server.message_path.clone(),
            base_url: self.server.base_url.clone(),
            auth_header: self.auth.header.to_ascii_lowercase(),
            headers: self
                .server
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            keep_alive_secs: self.server.keep_alive_secs,
        }
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Split a `Name: value` header argument.
pub fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("Invalid header '{raw}', expected 'Name: value'"))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Invalid header '{raw}': empty name");
    }
    Ok((name.to_string(), value.trim().to_string()))
}
