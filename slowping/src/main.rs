use clap::Parser;
use std::net::Shutdown;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod delay;
mod dispatcher;
mod listener;
mod reply;
mod socket;

use config::{CliArgs, Config};
use dispatcher::Dispatcher;
use listener::Listener;
use reply::ReplyEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    config.validate()?;

    // ── Raw socket ────────────────────────────────────────────────────
    let socket = match socket::open_raw_icmp_socket(Duration::from_millis(config.read_timeout_ms)) {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            tracing::error!("Socket error: {:#}", e);
            return Err(e);
        }
    };

    // ── Dispatcher ────────────────────────────────────────────────────
    let dispatcher = Arc::new(Dispatcher::new(ReplyEngine::new(socket.clone()), &config));
    tracing::info!(
        "slowping started (mode={:?}, ceiling={} ms, queue_depth={}, full_queue={:?})",
        config.mode,
        config.ceiling_ms,
        config.queue_depth,
        config.full_queue
    );

    // ── Shutdown ──────────────────────────────────────────────────────
    let cancel = CancellationToken::new();

    let c = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received");
        c.cancel();
    })?;

    // ── Listener Thread ───────────────────────────────────────────────
    let listener = Listener::new(
        socket.clone(),
        dispatcher.clone(),
        cancel.clone(),
        config.max_datagram,
    );
    let handle = tokio::runtime::Handle::current();
    let c = cancel.clone();
    let listener_thread = std::thread::spawn(move || {
        listener.run(handle);
        c.cancel();
    });

    cancel.cancelled().await;

    // Wakes a read blocked on the socket. Unconnected raw sockets report
    // ENOTCONN here even though readers are woken.
    tracing::info!("Closing ICMP socket");
    if let Err(e) = socket.shutdown(Shutdown::Both) {
        tracing::debug!("Socket shutdown: {}", e);
    }

    match tokio::task::spawn_blocking(move || listener_thread.join()).await {
        Ok(Ok(())) => {}
        _ => tracing::error!("Listener thread panicked"),
    }

    // Per-source worker tasks still sleeping are abandoned with the runtime.
    tracing::info!("Shutting down ({} sources seen)", dispatcher.sources());
    Ok(())
}
