// SPDX-License-Identifier: MIT
//
// Entrodist: authenticated entropy distribution over TCP

//! Entropy Sink daemon
//!
//! Listens for framed entropy packets, validates each one (box open,
//! RSA-PSS verify, drift window, strict counter increase), and forwards
//! accepted chunks to the kernel entropy pool. Connections are handled
//! one at a time; throughput is negligible and serialising keeps the
//! persisted counter trivially consistent.
//!
//! The replay counter is written back to the configuration file after
//! every connection, so a restart can never accept an old packet twice.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use crypto_box::SecretKey;
use entrodist_core::config::SinkConfig;
use entrodist_core::{parse_and_sink, wire, Error, NETWORK_DEADLINE, VERSION};
use rsa::RsaPublicKey;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "entrodist-sink")]
#[command(about = "Entropy sink - receives entropy packets into the kernel pool", long_about = None)]
struct Args {
    /// Configuration file (also stores the replay counter)
    #[arg(short = 'f', long, default_value = "config.json")]
    config: PathBuf,

    /// Kernel entropy device, opened for writing at startup
    #[arg(long, default_value = "/dev/random")]
    device: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("entrodist sink v{}", VERSION);

    let mut config = SinkConfig::load(&args.config)
        .with_context(|| format!("failed to load configuration {}", args.config.display()))?;
    let signer = config
        .signer_key()
        .context("configured signer is not a valid RSA public key")?;
    let secret = config
        .secret_key()
        .context("configured decryption key is invalid")?;

    let mut pool = OpenOptions::new()
        .write(true)
        .open(&args.device)
        .with_context(|| format!("failed to open entropy device {}", args.device.display()))?;

    let listener = TcpListener::bind(&config.address)
        .await
        .with_context(|| format!("failed to listen on {}", config.address))?;
    info!("listening on {}", config.address);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown().await;
            shutdown.cancel();
        });
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("accept failed: {e}");
                        continue;
                    }
                };

                info!("new packet from {peer}");
                match receive(stream, &secret, &signer, &config, &mut pool).await {
                    Ok(counter) => {
                        config.counter = counter;
                        info!("successfully wrote packet");
                    }
                    Err(e) if e.is_rejection() => warn!("{peer}: rejected packet: {e}"),
                    Err(e) => warn!("{peer}: {e}"),
                }

                if let Err(e) = config.store(&args.config) {
                    error!("failed to persist configuration: {e}");
                }
            }
        }
    }

    info!("sink shut down gracefully");
    Ok(())
}

/// Read one framed envelope and feed its chunk to the entropy pool.
///
/// Returns the new counter high-water mark; on any error the caller's
/// counter is unchanged.
async fn receive(
    mut stream: TcpStream,
    secret: &SecretKey,
    signer: &RsaPublicKey,
    config: &SinkConfig,
    pool: &mut File,
) -> entrodist_core::Result<i64> {
    let body = timeout(NETWORK_DEADLINE, wire::read_frame(&mut stream))
        .await
        .map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "network deadline exceeded",
            ))
        })??;

    parse_and_sink(&body, secret, signer, config.drift, config.counter, pool)
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use futures::stream::StreamExt;
        use signal_hook::consts::signal::*;
        use signal_hook_tokio::Signals;

        let mut signals =
            Signals::new([SIGINT, SIGTERM]).expect("Failed to register signal handlers");

        if let Some(signal) = signals.next().await {
            info!("received signal: {:?}", signal);
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("received Ctrl+C signal");
    }
}
