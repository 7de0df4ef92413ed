// SPDX-License-Identifier: MIT
//
// Entrodist: authenticated entropy distribution over TCP

//! Shared PRNG owner and its maintenance tasks
//!
//! The Fortuna state is process-wide at the source, so it lives behind a
//! single [`EntropyEngine`] handle: a mutex around the accumulator plus a
//! bounded channel on which every read publishes its byte count. Three
//! background tasks keep the PRNG healthy:
//!
//! 1. the seed writer persists the generator state every ten minutes;
//! 2. the reseeder refills the pools from the OS and the TPM every six
//!    hours;
//! 3. the accountant totals the published byte counts and stirs the PRNG
//!    once 2^32 − 1 bytes have been produced since the last refill.
//!
//! All three exit on the shutdown token; the final seed write and the
//! TPM release happen exactly once, in [`Maintenance::finish`].

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::fortuna::Fortuna;
use crate::protocol::{Packet, CHUNK_SIZE};
use crate::tpm::HardwareRng;
use crate::Result;

/// Seed-file persistence cadence.
pub const SEED_WRITE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Pool refill cadence.
pub const REFILL_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Stir once this many bytes have been produced since the last refill.
const STIR_THRESHOLD: u64 = u32::MAX as u64;

/// Emit a progress line every 2^29 bytes.
const PROGRESS_INTERVAL: u64 = 1 << 29;

/// Capacity of the consumption channel. A full channel blocks readers,
/// which is the intended back-pressure against a stalled accountant.
const CONSUMPTION_CAPACITY: usize = 4;

type SharedPrng = Arc<Mutex<Fortuna>>;
type SharedTpm = Arc<Mutex<Box<dyn HardwareRng>>>;

/// Handle to the source's PRNG. Cheap to clone; all clones share the
/// same accumulator and consumption channel.
#[derive(Clone)]
pub struct EntropyEngine {
    prng: SharedPrng,
    consumed: mpsc::Sender<u64>,
}

/// Owner of the maintenance tasks and the resources they hold.
pub struct Maintenance {
    tasks: Vec<JoinHandle<()>>,
    prng: SharedPrng,
    tpm: SharedTpm,
    seed_file: PathBuf,
}

impl EntropyEngine {
    /// Initialise the PRNG and spawn its maintenance tasks.
    ///
    /// The state is restored from `seed_file` when one exists, the pools
    /// are refilled from the OS and the TPM, and a fresh seed is written
    /// back before any output is produced. Any failure here is fatal:
    /// the source cannot run on an unseeded PRNG.
    pub fn start(
        seed_file: PathBuf,
        mut tpm: Box<dyn HardwareRng>,
        shutdown: CancellationToken,
    ) -> Result<(EntropyEngine, Maintenance)> {
        let mut prng = if seed_file.exists() {
            info!("seed file found; loading PRNG state from {}", seed_file.display());
            Fortuna::from_seed(&seed_file)?
        } else {
            info!("no seed file found, initialising new PRNG");
            Fortuna::new()
        };

        prng.refill(tpm.as_mut())?;
        prng.write_seed(&seed_file)?;

        let prng: SharedPrng = Arc::new(Mutex::new(prng));
        let tpm: SharedTpm = Arc::new(Mutex::new(tpm));
        let (consumed_tx, consumed_rx) = mpsc::channel(CONSUMPTION_CAPACITY);

        let tasks = vec![
            tokio::spawn(seed_writer_loop(
                Arc::clone(&prng),
                seed_file.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(refill_loop(
                Arc::clone(&prng),
                Arc::clone(&tpm),
                shutdown.clone(),
            )),
            tokio::spawn(accountant_loop(
                Arc::clone(&prng),
                Arc::clone(&tpm),
                consumed_rx,
                shutdown,
            )),
        ];

        let engine = EntropyEngine {
            prng: Arc::clone(&prng),
            consumed: consumed_tx,
        };
        let maintenance = Maintenance {
            tasks,
            prng,
            tpm,
            seed_file,
        };
        Ok((engine, maintenance))
    }

    /// Produce `n` random bytes and publish the count to the accountant.
    pub async fn read(&self, n: usize) -> Result<Vec<u8>> {
        let data = self.prng.lock().random_data(n)?;
        // The accountant disappears during shutdown; reads stay valid.
        let _ = self.consumed.send(data.len() as u64).await;
        Ok(data)
    }

    /// Draw one chunk and build the next packet for a target.
    pub async fn new_packet(&self, counter: i64) -> Result<(i64, Packet)> {
        let data = self.read(CHUNK_SIZE).await?;
        let mut chunk = [0u8; CHUNK_SIZE];
        chunk.copy_from_slice(&data);
        Ok(Packet::from_chunk(counter, chunk))
    }
}

impl Maintenance {
    /// Wait for the maintenance tasks (the shutdown token must already be
    /// cancelled), write the final seed, and release the TPM.
    pub async fn finish(self) {
        for task in self.tasks {
            let _ = task.await;
        }

        if let Err(e) = self.prng.lock().write_seed(&self.seed_file) {
            error!("failed to write seed file: {e}");
        }
        if let Err(e) = self.tpm.lock().close() {
            error!("TPM failed to shut down: {e}");
        }
        info!("PRNG engine shut down");
    }
}

fn refill_now(prng: &SharedPrng, tpm: &SharedTpm) -> Result<()> {
    let mut tpm = tpm.lock();
    let mut prng = prng.lock();
    prng.refill(tpm.as_mut())
}

async fn seed_writer_loop(prng: SharedPrng, seed_file: PathBuf, shutdown: CancellationToken) {
    let mut ticker = interval(SEED_WRITE_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = prng.lock().write_seed(&seed_file) {
                    warn!("periodic seed write failed: {e}");
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("seed writer shutting down");
}

async fn refill_loop(prng: SharedPrng, tpm: SharedTpm, shutdown: CancellationToken) {
    let mut ticker = interval(REFILL_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // A TPM hiccup here is not fatal; the next cycle retries.
                if let Err(e) = refill_now(&prng, &tpm) {
                    warn!("scheduled refill failed: {e}");
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("refill task shutting down");
}

async fn accountant_loop(
    prng: SharedPrng,
    tpm: SharedTpm,
    mut consumed: mpsc::Receiver<u64>,
    shutdown: CancellationToken,
) {
    let mut ledger = ConsumptionLedger::new();

    loop {
        tokio::select! {
            received = consumed.recv() => {
                let Some(n) = received else { break };
                let event = ledger.record(n);
                if event.log {
                    info!("{} total bytes read from PRNG", ledger.total);
                }
                if event.stir {
                    info!("stirring PRNG");
                    if let Err(e) = refill_now(&prng, &tpm) {
                        warn!("stir failed: {e}");
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("consumption accountant shutting down");
}

/// Running totals behind the accountant.
struct ConsumptionLedger {
    total: u64,
    since_log: u64,
    since_stir: u64,
}

struct LedgerEvent {
    log: bool,
    stir: bool,
}

impl ConsumptionLedger {
    fn new() -> Self {
        ConsumptionLedger {
            total: 0,
            since_log: 0,
            since_stir: 0,
        }
    }

    fn record(&mut self, n: u64) -> LedgerEvent {
        self.total += n;
        self.since_log += n;
        self.since_stir += n;

        let log = self.since_log >= PROGRESS_INTERVAL;
        if log {
            self.since_log = 0;
        }
        let stir = self.since_stir >= STIR_THRESHOLD;
        if stir {
            self.since_stir = 0;
        }
        LedgerEvent { log, stir }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::mock::MockTpm;
    use crate::Error;

    #[tokio::test]
    async fn engine_produces_entropy_and_persists_seed() {
        let dir = tempfile::tempdir().unwrap();
        let seed_file = dir.path().join("source.seed");
        let shutdown = CancellationToken::new();

        let (engine, maintenance) = EntropyEngine::start(
            seed_file.clone(),
            Box::new(MockTpm::new()),
            shutdown.clone(),
        )
        .unwrap();

        let a = engine.read(64).await.unwrap();
        let b = engine.read(64).await.unwrap();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);

        let (counter, packet) = engine.new_packet(30).await.unwrap();
        assert_eq!(counter, 31);
        assert_eq!(packet.counter, 31);

        assert!(seed_file.exists());

        shutdown.cancel();
        maintenance.finish().await;
    }

    #[tokio::test]
    async fn engine_restores_state_from_seed_file() {
        let dir = tempfile::tempdir().unwrap();
        let seed_file = dir.path().join("source.seed");

        {
            let shutdown = CancellationToken::new();
            let (_, maintenance) = EntropyEngine::start(
                seed_file.clone(),
                Box::new(MockTpm::new()),
                shutdown.clone(),
            )
            .unwrap();
            shutdown.cancel();
            maintenance.finish().await;
        }

        let shutdown = CancellationToken::new();
        let (engine, maintenance) =
            EntropyEngine::start(seed_file, Box::new(MockTpm::new()), shutdown.clone()).unwrap();
        assert_eq!(engine.read(32).await.unwrap().len(), 32);

        shutdown.cancel();
        maintenance.finish().await;
    }

    #[tokio::test]
    async fn startup_fails_without_hardware_randomness() {
        let dir = tempfile::tempdir().unwrap();
        let seed_file = dir.path().join("source.seed");
        let shutdown = CancellationToken::new();

        let result = EntropyEngine::start(seed_file, Box::new(MockTpm::failing()), shutdown);
        assert!(matches!(result, Err(Error::Rng(_))));
    }

    #[test]
    fn ledger_logs_every_half_gigabyte() {
        let mut ledger = ConsumptionLedger::new();

        let event = ledger.record(PROGRESS_INTERVAL - 1);
        assert!(!event.log);
        let event = ledger.record(1);
        assert!(event.log);
        assert!(!event.stir);
        assert_eq!(ledger.total, PROGRESS_INTERVAL);
    }

    #[test]
    fn ledger_stirs_at_the_output_bound() {
        let mut ledger = ConsumptionLedger::new();

        let mut stirred = false;
        for _ in 0..8 {
            stirred = ledger.record(1 << 29).stir;
        }
        assert!(stirred);
        // The stir resets the running count.
        assert!(!ledger.record(1).stir);
    }
}
