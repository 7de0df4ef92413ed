// SPDX-License-Identifier: MIT
//
// Entrodist: authenticated entropy distribution over TCP

//! Entropy Source daemon
//!
//! Runs on a machine with access to hardware randomness. A Fortuna PRNG
//! is seeded from the TPM, OS randomness, and timing jitter; a scheduler
//! periodically draws one chunk per configured sink, signs and encrypts
//! it, and pushes it over TCP.
//!
//! ```text
//! ┌─────────┐  events   ┌─────────┐  chunks   ┌───────────┐   TCP    ┌──────┐
//! │ TPM/OS  │ ─────────>│ Fortuna │ ─────────>│ Scheduler │ ────────>│ Sink │
//! └─────────┘           └─────────┘           └───────────┘          └──────┘
//! ```
//!
//! Four long-lived tasks: the scheduler plus the PRNG's seed writer,
//! reseeder, and consumption accountant. All of them exit on SIGINT or
//! SIGTERM, after which a final seed file is written and the TPM handle
//! is released.

mod scheduler;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use entrodist_core::engine::EntropyEngine;
use entrodist_core::tpm::TpmDevice;
use entrodist_core::{keys, VERSION};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::scheduler::Scheduler;

#[derive(Parser, Debug)]
#[command(name = "entrodist-source")]
#[command(about = "Entropy source - generates and pushes signed entropy packets", long_about = None)]
struct Args {
    /// RSA signature key (PKCS#1 DER, optionally PEM)
    #[arg(short = 'k', long, default_value = "signer.key")]
    signer_key: PathBuf,

    /// PRNG seed file
    #[arg(short = 's', long, default_value = "source.seed")]
    seed_file: PathBuf,

    /// Target list
    #[arg(short = 't', long, default_value = "targets.json")]
    targets: PathBuf,

    /// Hardware RNG device
    #[arg(long, default_value = TpmDevice::DEFAULT_PATH)]
    tpm: PathBuf,

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

    info!("entrodist source v{}", VERSION);

    let signer = keys::load_rsa_signer(&args.signer_key)
        .with_context(|| format!("failed to load signature key {}", args.signer_key.display()))?;

    info!("initialising PRNG and TPM");
    let tpm = TpmDevice::open(&args.tpm)
        .with_context(|| format!("failed to open hardware RNG {}", args.tpm.display()))?;

    let shutdown = CancellationToken::new();
    let (engine, maintenance) =
        EntropyEngine::start(args.seed_file.clone(), Box::new(tpm), shutdown.clone())
            .context("failed to seed the PRNG")?;

    let scheduler = Scheduler::new(engine, signer, args.targets.clone());
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    wait_for_shutdown().await;
    info!("shutdown signal received");
    shutdown.cancel();

    let _ = scheduler_task.await;
    maintenance.finish().await;

    info!("source shut down gracefully");
    Ok(())
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
