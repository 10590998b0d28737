//! `tether`: serve a stdio JSON-RPC worker to many SSE clients behind API-key admission.

mod config;

use clap::Parser;
use config::{Overrides, TetherConfig};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tether_auth::AuthResolver;
use tether_gateway::{
    GatewayHandle, GatewayServer, Multiplexer, PerSessionWorkerFactory, SessionFactory,
    SharedWorkerFactory,
};
use tether_upstream::WorkerMode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long a failed startup waits before exiting, so the log gets flushed.
const STARTUP_FAILURE_GRACE: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(
    name = "tether",
    version,
    about = "Tether: serve a stdio JSON-RPC worker over authenticated SSE"
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Upstream worker command line, e.g. "npx -y some-server"
    #[arg(long, env = "TETHER_STDIO")]
    stdio: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "TETHER_PORT")]
    port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "TETHER_HOST")]
    host: Option<String>,

    /// Path of the SSE endpoint
    #[arg(long, env = "TETHER_SSE_PATH")]
    sse_path: Option<String>,

    /// Path clients post messages to
    #[arg(long, env = "TETHER_MESSAGE_PATH")]
    message_path: Option<String>,

    /// Public URL prefix for the announced message endpoint
    #[arg(long, env = "TETHER_BASE_URL")]
    base_url: Option<String>,

    /// Header the API key is read from
    #[arg(long, env = "TETHER_AUTH_HEADER")]
    auth_header: Option<String>,

    /// Static API key
    #[arg(long, env = "TETHER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Delegate verification URL, queried as GET <url>?apiKey=<key>
    #[arg(long, env = "TETHER_AUTH_URL")]
    auth_url: Option<String>,

    /// Admit every connection without a credential
    #[arg(long, env = "TETHER_NO_AUTH")]
    no_auth: bool,

    /// Worker provisioning: "shared" or "per-session"
    #[arg(long, env = "TETHER_WORKER_MODE")]
    worker_mode: Option<WorkerMode>,

    /// Extra response header as "Name: value" (repeatable)
    #[arg(long = "header", value_name = "NAME: VALUE")]
    headers: Vec<String>,

    /// Enable debug logging
    #[arg(long, env = "TETHER_DEBUG")]
    debug: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            stdio: self.stdio.clone(),
            host: self.host.clone(),
            port: self.port,
            sse_path: self.sse_path.clone(),
            message_path: self.message_path.clone(),
            base_url: self.base_url.clone(),
            auth_header: self.auth_header.clone(),
            api_key: self.api_key.clone(),
            auth_url: self.auth_url.clone(),
            no_auth: self.no_auth,
            worker_mode: self.worker_mode,
            headers: self.headers.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Logs go to stderr so they never interleave with a stdio protocol
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .init();

    if let Err(e) = run(cli).await {
        error!(error = %format!("{e:#}"), "Tether failed to start");
        tokio::time::sleep(STARTUP_FAILURE_GRACE).await;
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = TetherConfig::load(cli.config.as_deref())?;
    config.apply(cli.overrides())?;
    config.validate()?;

    let resolver = Arc::new(AuthResolver::new(&config.auth)?);

    let (factory, shared): (Arc<dyn SessionFactory>, Option<Arc<Multiplexer>>) =
        match config.upstream.mode {
            WorkerMode::Shared => {
                let factory = SharedWorkerFactory::spawn(&config.upstream)?;
                let mux = factory.multiplexer().clone();
                (Arc::new(factory), Some(mux))
            }
            WorkerMode::PerSession => (
                Arc::new(PerSessionWorkerFactory::new(config.upstream.clone())),
                None,
            ),
        };
    info!(
        command = %config.upstream.command,
        args = ?config.upstream.args,
        mode = ?config.upstream.mode,
        "Upstream worker configured"
    );

    let (app, handle) = GatewayServer::new(config.gateway_config(), resolver, factory).build()?;

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}"))?;
    info!(
        addr = %addr,
        sse = %config.server.sse_path,
        messages = %config.server.message_path,
        "Tether listening"
    );

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .into_future();

    tokio::select! {
        result = server => result?,
        () = shutdown_signal() => {
            info!("Shutdown signal received");
            drain(&handle, shared, Duration::from_secs(config.shutdown.grace_secs)).await;
        }
    }
    Ok(())
}

/// Close every session and the shared worker, giving up after `grace`.
async fn drain(handle: &GatewayHandle, shared: Option<Arc<Multiplexer>>, grace: Duration) {
    if tokio::time::timeout(grace, handle.shutdown()).await.is_err() {
        let remaining = handle.session_count().await;
        warn!(remaining, "Grace period elapsed with sessions still open");
    }
    if let Some(mux) = shared {
        if let Err(e) = mux.close().await {
            warn!(error = %e, "Failed to stop shared worker");
        }
    }
    info!("Shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
