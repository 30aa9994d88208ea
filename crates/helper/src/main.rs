//! `tuneup-helperd` — the privileged helper daemon.
//!
//! Runs as root, owns a local Unix socket, and executes a small fixed set
//! of administrative operations on behalf of the Tuneup app. Everything it
//! will ever run is listed in `allowlist.rs`; everything it does is chained
//! into the invocation log.

mod allowlist;
mod invocation_log;
mod server;

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::UnixListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use invocation_log::InvocationLog;
use server::ServerState;

#[derive(Parser)]
#[command(name = "tuneup-helperd", version, about = "Tuneup privileged helper daemon")]
struct Args {
    /// Socket the app connects to.
    #[arg(long, default_value = "/var/run/tuneup-helperd.sock")]
    socket: PathBuf,

    /// Tamper-evident invocation log.
    #[arg(long, default_value = "/var/log/tuneup-helperd.log")]
    log: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let log = InvocationLog::open(&args.log)
        .with_context(|| format!("opening invocation log at {}", args.log.display()))?;
    let state = Arc::new(ServerState::new(log));

    // A stale socket from an unclean shutdown blocks the bind.
    if args.socket.exists() {
        std::fs::remove_file(&args.socket)
            .with_context(|| format!("removing stale socket {}", args.socket.display()))?;
    }
    let listener = UnixListener::bind(&args.socket)
        .with_context(|| format!("binding {}", args.socket.display()))?;
    std::fs::set_permissions(&args.socket, std::fs::Permissions::from_mode(0o600))
        .context("restricting socket permissions")?;

    info!(
        "tuneup-helperd {} listening on {}",
        env!("CARGO_PKG_VERSION"),
        args.socket.display()
    );

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let state = state.clone();
                tokio::spawn(server::handle_connection(stream, state));
            }
            Err(e) => {
                warn!("accept failed: {}", e);
            }
        }
    }
}
