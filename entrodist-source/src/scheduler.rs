// SPDX-License-Identifier: MIT
//
// Entrodist: authenticated entropy distribution over TCP

//! Target scheduler
//!
//! Scans the target list once a minute and delivers one packet to every
//! target whose next-send time has passed. A delivery is a single-shot,
//! best-effort attempt: on failure the target record is left untouched
//! and the next scan is the retry. Counters and next-send times only
//! move on success, and the target file is rewritten once per scan when
//! anything changed.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use entrodist_core::config::{self, Target};
use entrodist_core::engine::EntropyEngine;
use entrodist_core::{wire, Error, Result, NETWORK_DEADLINE};
use rsa::RsaPrivateKey;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Sleep between target scans.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Per-target delivery interval.
pub const SEND_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

pub struct Scheduler {
    engine: EntropyEngine,
    signer: RsaPrivateKey,
    targets_path: PathBuf,
}

impl Scheduler {
    pub fn new(engine: EntropyEngine, signer: RsaPrivateKey, targets_path: PathBuf) -> Self {
        Scheduler {
            engine,
            signer,
            targets_path,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            self.scan().await;

            tokio::select! {
                _ = sleep(SCAN_INTERVAL) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        info!("scheduler shutting down");
    }

    /// One pass over the target list.
    async fn scan(&self) {
        debug!("scanning targets");

        let mut targets = match config::load_targets(&self.targets_path) {
            Ok(targets) => targets,
            Err(e) => {
                error!("failed to load target list: {e}");
                return;
            }
        };

        let now = Utc::now().timestamp();
        let mut dirty = false;

        for target in targets.iter_mut() {
            if target.next >= now {
                continue;
            }

            match self.send(target).await {
                Ok(counter) => {
                    target.counter = counter;
                    target.next = now + SEND_INTERVAL.as_secs() as i64;
                    dirty = true;
                    info!("sent packet to {}", target.address);
                }
                Err(e) => error!("failed to send to {}: {e}", target.address),
            }
        }

        if dirty {
            if let Err(e) = config::store_targets(&self.targets_path, &targets) {
                error!("failed to store target list: {e}");
            }
        }
    }

    /// Deliver one packet. Returns the advanced counter; on any error the
    /// target's counter stays where it was.
    async fn send(&self, target: &Target) -> Result<i64> {
        let (counter, packet) = self.engine.new_packet(target.counter).await?;
        let body = packet.seal(&target.public_key()?, Some(&self.signer))?;

        debug!("sending {} byte packet to {}", body.len(), target.address);

        let mut conn = timeout(NETWORK_DEADLINE, TcpStream::connect(&target.address))
            .await
            .map_err(|_| deadline_exceeded())??;
        timeout(NETWORK_DEADLINE, wire::write_frame(&mut conn, &body))
            .await
            .map_err(|_| deadline_exceeded())??;
        conn.shutdown().await?;

        Ok(counter)
    }
}

fn deadline_exceeded() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        "network deadline exceeded",
    ))
}
