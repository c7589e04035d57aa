//! Demo line-echo server run through the handoff lifecycle.
//!
//! Start it directly to bind `--port`, or under a supervisor that passes
//! `LISTEN_FDS` (fd 3) and optionally a control pipe (fds 4 and 5).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use handoff::activation::ProcessEnv;
use handoff::config::{load_config, validate_config, HandoffConfig};
use handoff::lifecycle::{spawn_signal_listener, Service};
use handoff::net::{connection_handler, CloseRequest, CloseSignal, TcpServer};
use handoff::observability::init_logging;

#[derive(Parser, Debug)]
#[command(name = "handoff", version)]
#[command(about = "Line-echo server with zero-downtime listener handoff", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind when no listener is inherited.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind when no listener is inherited.
    #[arg(short, long)]
    port: Option<u16>,

    /// Look for the supervisor control pipe (true/false).
    #[arg(long)]
    supervised: Option<bool>,

    /// Seconds before a graceful drain escalates to a forceful one.
    #[arg(long)]
    drain_timeout: Option<u64>,

    /// Log level or filter directive.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(&self, config: &mut HandoffConfig) {
        if let Some(host) = &self.host {
            config.listener.host = host.clone();
        }
        if let Some(port) = self.port {
            config.listener.port = port;
        }
        if let Some(supervised) = self.supervised {
            config.control.enabled = supervised;
        }
        if let Some(secs) = self.drain_timeout {
            config.shutdown.drain_timeout_secs = Some(secs);
        }
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        }
        if self.json_logs {
            config.observability.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => HandoffConfig::default(),
    };
    cli.apply(&mut config);
    validate_config(&config).map_err(handoff::config::ConfigError::Validation)?;

    init_logging(&config.observability);

    tracing::info!(
        pid = std::process::id(),
        host = %config.listener.host,
        port = config.listener.port,
        supervised = config.control.enabled,
        "handoff v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let server = TcpServer::new(config.listener.host.clone(), connection_handler(echo));
    let service = Service::prepare(&config, Arc::new(ProcessEnv), server);
    spawn_signal_listener(service.events())?;

    let report = service.run().await?;
    println!("{}", report.connections);
    Ok(())
}

/// Greet, echo each line back, and say goodbye on a graceful close.
async fn echo(stream: TcpStream, peer: SocketAddr, mut signal: CloseSignal) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let greeting = format!("Hello there ({})\n", std::process::id());
    if write.write_all(greeting.as_bytes()).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if write.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(peer_addr = %peer, error = %err, "Read failed");
                    break;
                }
            },
            request = signal.changed() => {
                if request == CloseRequest::Graceful {
                    let _ = write.write_all(b"close handshake\n").await;
                    let _ = write.shutdown().await;
                    break;
                }
            }
        }
    }
}
