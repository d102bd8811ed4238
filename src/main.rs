//! wshub — WebSocket connection hub (echo server)
//!
//! Accepts WebSocket connections, tracks them by numeric id, evicts idle
//! peers, and echoes every inbound message back to its sender.
//!
//! Usage:
//!   wshub                                  # Default port 7070, route /ws
//!   wshub --port 8080 --path /socket       # Custom port and route
//!   wshub --idle-timeout 30                # Kick peers silent for 30s
//!   wshub --token mysecret                 # Require ?token=mysecret

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use wshub_core::{Admission, CloseReason, ConnectionId, Hooks, Payload, RequestMeta};
use wshub_transport::{TransportConfig, TransportServer};

#[derive(Parser, Debug)]
#[command(name = "wshub", about = "wshub — WebSocket connection hub")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "7070")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Route that accepts WebSocket upgrades
    #[arg(long, default_value = "/ws")]
    path: String,

    /// Close connections with no inbound message for this many seconds (0 disables)
    #[arg(long, default_value = "0")]
    idle_timeout: u64,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Require this token as the `token` query parameter
    #[arg(long)]
    token: Option<String>,

    /// Enable permissive CORS
    #[arg(long)]
    cors: bool,

    /// Seconds between statistics reports in the log (0 disables)
    #[arg(long, default_value = "60")]
    stats_interval: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Echo application: forwards inbound messages to the main loop, which
/// sends them back through the server.
struct EchoHooks {
    token: Option<String>,
    echo_tx: mpsc::UnboundedSender<(ConnectionId, Payload)>,
}

impl Hooks for EchoHooks {
    fn on_open(&self, request: &RequestMeta) -> Admission {
        match &self.token {
            Some(token) if request.query_param("token") != Some(token.as_str()) => {
                warn!("Rejected connection from {:?}: bad token", request.remote_addr);
                Admission::Reject(401)
            }
            _ => Admission::Admit,
        }
    }

    fn on_message(&self, id: ConnectionId, payload: Payload) {
        let _ = self.echo_tx.send((id, payload));
    }

    fn on_close(&self, id: ConnectionId, reason: CloseReason) {
        info!("Client {id} gone ({reason})");
    }
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match (&cli.log_file, cli.log_json) {
        (Some(path), json) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating log directory {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let builder = builder.with_writer(std::sync::Mutex::new(file)).with_ansi(false);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
            eprintln!("Logging to {}", path.display());
        }
        (None, true) => builder.json().init(),
        (None, false) => builder.init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let (echo_tx, mut echo_rx) = mpsc::unbounded_channel();
    let hooks = EchoHooks {
        token: cli.token.clone(),
        echo_tx,
    };

    let config = TransportConfig {
        port: cli.port,
        hostname: cli.hostname.clone(),
        path: cli.path.clone(),
        idle_timeout: (cli.idle_timeout > 0).then(|| Duration::from_secs(cli.idle_timeout)),
        enable_cors: cli.cors,
        max_connections: cli.max_connections,
        ..TransportConfig::default()
    };

    let mut server = TransportServer::start(config, hooks)
        .await
        .context("failed to start transport")?;

    println!();
    println!("  wshub running on ws://{}:{}{}", cli.hostname, server.port(), cli.path);
    match cli.idle_timeout {
        0 => println!("  Idle timeout: disabled"),
        secs => println!("  Idle timeout: {secs}s"),
    }
    println!("  Press Ctrl+C to stop.");
    println!();

    let mut stats_tick = tokio::time::interval(Duration::from_secs(cli.stats_interval.max(1)));
    stats_tick.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some((id, payload)) = echo_rx.recv() => {
                if let Err(e) = server.send(id, payload).await {
                    debug!("Echo to {id} dropped: {e}");
                }
            }
            _ = stats_tick.tick(), if cli.stats_interval > 0 => {
                info!("Runtime statistics\n{}", server.stats());
            }
        }
    }

    println!();
    println!("  Shutting down...");
    server.stop().await;
    println!("{}", server.stats());
    Ok(())
}
