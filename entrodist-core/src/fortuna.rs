// SPDX-License-Identifier: MIT
//
// Entrodist: authenticated entropy distribution over TCP

//! Fortuna accumulator PRNG
//!
//! The standard Fortuna construction: 32 SHA-256 entropy pools feeding an
//! AES-256-CTR generator. Entropy events are tagged with a one-byte source
//! identifier and distributed cyclically across the pools, one rotation
//! per source. A reseed drains pool *i* whenever 2^i divides the reseed
//! count, so higher pools accumulate entropy over exponentially longer
//! horizons and an attacker who can predict some sources still loses
//! track of the state at the next deep reseed.
//!
//! The generator rekeys itself after every request and the whole state can
//! be persisted to (and restored from) a 64-byte seed file.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes256;
use chrono::Utc;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::tpm::HardwareRng;
use crate::{Error, Result};

/// Number of accumulator pools.
pub const POOL_COUNT: usize = 32;

/// Size of the seed file produced by [`Fortuna::write_seed`].
pub const SEED_FILE_SIZE: usize = 64;

/// Bytes pool zero must hold before a reseed may fire.
const MIN_POOL_SIZE: usize = 64;

/// Minimum spacing between reseeds.
const RESEED_SPACING: Duration = Duration::from_millis(100);

/// Upper bound on a single generator request.
const MAX_REQUEST: usize = 1 << 20;

/// Largest event accepted into a pool.
const MAX_EVENT_SIZE: usize = 32;

const BLOCK_SIZE: usize = 16;

/// Entropy source identifiers. Stable one-byte tags: events are hashed
/// into the pools together with their tag, so renumbering would change
/// the accumulator state for identical inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Source {
    /// Hardware randomness from the TPM.
    Tpm = 1,
    /// OS cryptographic randomness.
    OsRandom = 2,
    /// Timing jitter taken at fill time.
    ConnTime = 3,
}

/// AES-256-CTR generator underneath the accumulator.
struct Generator {
    key: [u8; 32],
    counter: u128,
    seeded: bool,
}

impl Generator {
    fn new() -> Self {
        Generator {
            key: [0u8; 32],
            counter: 0,
            seeded: false,
        }
    }

    /// Chain `seed` into the generator key.
    fn reseed(&mut self, seed: &[u8]) {
        let mut hash = Sha256::new();
        hash.update(self.key);
        hash.update(seed);
        self.key = hash.finalize().into();
        self.counter = self.counter.wrapping_add(1);
        self.seeded = true;
    }

    fn generate_blocks(&mut self, cipher: &Aes256, count: usize, out: &mut Vec<u8>) {
        for _ in 0..count {
            let mut block = GenericArray::clone_from_slice(&self.counter.to_be_bytes());
            cipher.encrypt_block(&mut block);
            out.extend_from_slice(&block);
            self.counter = self.counter.wrapping_add(1);
        }
    }

    /// Produce up to [`MAX_REQUEST`] bytes, then rekey.
    fn pseudo_random(&mut self, n: usize) -> Result<Vec<u8>> {
        debug_assert!(n <= MAX_REQUEST);
        if !self.seeded {
            return Err(Error::Rng("generator has not been seeded".into()));
        }

        let cipher = Aes256::new(GenericArray::from_slice(&self.key));
        let mut out = Vec::with_capacity(n + BLOCK_SIZE);
        self.generate_blocks(&cipher, (n + BLOCK_SIZE - 1) / BLOCK_SIZE, &mut out);
        out.truncate(n);

        // Rekey after every request.
        let mut key = Vec::with_capacity(2 * BLOCK_SIZE);
        self.generate_blocks(&cipher, 2, &mut key);
        self.key.copy_from_slice(&key);
        Ok(out)
    }
}

/// The accumulator PRNG.
pub struct Fortuna {
    generator: Generator,
    pools: [Sha256; POOL_COUNT],
    pool_zero_bytes: usize,
    reseed_count: u64,
    last_reseed: Option<Instant>,
    next_pool: HashMap<u8, usize>,
}

impl Fortuna {
    /// A freshly allocated PRNG. It cannot produce output until entropy
    /// has been accumulated (see [`Fortuna::refill`]) or a seed file has
    /// been loaded.
    pub fn new() -> Self {
        Fortuna {
            generator: Generator::new(),
            pools: std::array::from_fn(|_| Sha256::new()),
            pool_zero_bytes: 0,
            reseed_count: 0,
            last_reseed: None,
            next_pool: HashMap::new(),
        }
    }

    /// Append one entropy event from `source`.
    ///
    /// Each source rotates through the pools independently, so one pool
    /// ingests one event per [`POOL_COUNT`] events from that source.
    pub fn add_event(&mut self, source: Source, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() > MAX_EVENT_SIZE {
            return Err(Error::Rng(format!(
                "event of {} bytes outside 1..={}",
                data.len(),
                MAX_EVENT_SIZE
            )));
        }

        let slot = self.next_pool.entry(source as u8).or_insert(0);
        let index = *slot;
        *slot = (index + 1) % POOL_COUNT;

        self.pools[index].update([source as u8, data.len() as u8]);
        self.pools[index].update(data);
        if index == 0 {
            self.pool_zero_bytes += data.len();
        }
        Ok(())
    }

    /// Produce `n` random bytes.
    pub fn random_data(&mut self, n: usize) -> Result<Vec<u8>> {
        self.maybe_reseed();

        let mut out = Vec::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let take = remaining.min(MAX_REQUEST);
            out.extend_from_slice(&self.generator.pseudo_random(take)?);
            remaining -= take;
        }
        Ok(out)
    }

    /// Drain eligible pools into the generator when pool zero has
    /// accumulated enough and the previous reseed is old enough.
    fn maybe_reseed(&mut self) {
        if self.pool_zero_bytes < MIN_POOL_SIZE {
            return;
        }
        if let Some(last) = self.last_reseed {
            if last.elapsed() < RESEED_SPACING {
                return;
            }
        }

        self.reseed_count += 1;
        let mut seed = Vec::with_capacity(POOL_COUNT * 32);
        for (i, pool) in self.pools.iter_mut().enumerate() {
            if self.reseed_count % (1u64 << i) == 0 {
                seed.extend_from_slice(&pool.finalize_reset());
            } else {
                break;
            }
        }

        self.generator.reseed(&seed);
        self.pool_zero_bytes = 0;
        self.last_reseed = Some(Instant::now());
    }

    /// Reload the accumulator with entropy from the OS and the TPM.
    ///
    /// Two passes over all pools: the first writes a 16-byte OS event
    /// followed by a 16-byte TPM event into each pool position, the
    /// second swaps the order. A final timing event captures the
    /// nanosecond component of the clock.
    pub fn refill(&mut self, tpm: &mut dyn HardwareRng) -> Result<()> {
        let mut os_event = [0u8; 16];

        tracing::info!("refilling pools (1/2)");
        for _ in 0..POOL_COUNT {
            OsRng
                .try_fill_bytes(&mut os_event)
                .map_err(|e| Error::Rng(e.to_string()))?;
            self.add_event(Source::OsRandom, &os_event)?;
            self.add_event(Source::Tpm, &tpm.random(16)?)?;
        }

        tracing::info!("refilling pools (2/2)");
        for _ in 0..POOL_COUNT {
            self.add_event(Source::Tpm, &tpm.random(16)?)?;
            OsRng
                .try_fill_bytes(&mut os_event)
                .map_err(|e| Error::Rng(e.to_string()))?;
            self.add_event(Source::OsRandom, &os_event)?;
        }

        self.add_timing_event()
    }

    /// Hash the nanosecond component of the current time into the timing
    /// jitter source.
    fn add_timing_event(&mut self) -> Result<()> {
        let nanos = u64::from(Utc::now().timestamp_subsec_nanos());
        let digest = Sha256::digest(nanos.to_be_bytes());
        self.add_event(Source::ConnTime, &digest)
    }

    /// Persist generator state as an opaque 64-byte seed file, mode 0600.
    pub fn write_seed<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let seed = self.random_data(SEED_FILE_SIZE)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(&seed)?;
        Ok(())
    }

    /// Restore a PRNG from a seed file written by [`Fortuna::write_seed`].
    ///
    /// The caller must write a fresh seed promptly so the same seed is
    /// never loaded twice.
    pub fn from_seed<P: AsRef<Path>>(path: P) -> Result<Self> {
        let seed = fs::read(path)?;
        if seed.len() != SEED_FILE_SIZE {
            return Err(Error::Rng(format!(
                "seed file is {} bytes, expected {}",
                seed.len(),
                SEED_FILE_SIZE
            )));
        }

        let mut prng = Fortuna::new();
        prng.generator.reseed(&seed);
        Ok(prng)
    }
}

impl Default for Fortuna {
    fn default() -> Self {
        Self::new()
    }
}

/// Writer bound to one entropy source: every write appends one event.
pub struct SourceWriter<'a> {
    prng: &'a mut Fortuna,
    source: Source,
}

impl Fortuna {
    /// A [`Write`] handle that feeds events from `source`.
    pub fn source_writer(&mut self, source: Source) -> SourceWriter<'_> {
        SourceWriter { prng: self, source }
    }
}

impl Write for SourceWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.prng
            .add_event(self.source, buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Read for Fortuna {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let data = self
            .random_data(buf.len())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        buf.copy_from_slice(&data);
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::mock::MockTpm;

    /// Feed enough fixed events from one source that pool zero passes the
    /// reseed threshold.
    fn prime(prng: &mut Fortuna) {
        for i in 0..(2 * POOL_COUNT) {
            let event = [i as u8; 32];
            prng.add_event(Source::OsRandom, &event).unwrap();
        }
    }

    #[test]
    fn unseeded_prng_refuses_to_produce_output() {
        let mut prng = Fortuna::new();
        assert!(matches!(prng.random_data(16), Err(Error::Rng(_))));
    }

    #[test]
    fn identical_event_streams_yield_identical_output() {
        let mut a = Fortuna::new();
        let mut b = Fortuna::new();
        prime(&mut a);
        prime(&mut b);

        assert_eq!(a.random_data(256).unwrap(), b.random_data(256).unwrap());
    }

    #[test]
    fn successive_reads_differ() {
        let mut prng = Fortuna::new();
        prime(&mut prng);

        let first = prng.random_data(64).unwrap();
        let second = prng.random_data(64).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn events_are_rotated_across_pools_per_source() {
        let mut prng = Fortuna::new();
        // One full rotation plus one: pool zero sees two events.
        for _ in 0..=POOL_COUNT {
            prng.add_event(Source::Tpm, &[0xAA; 16]).unwrap();
        }
        assert_eq!(prng.pool_zero_bytes, 32);
    }

    #[test]
    fn source_writer_feeds_its_source() {
        let mut prng = Fortuna::new();
        {
            let mut writer = prng.source_writer(Source::ConnTime);
            assert_eq!(writer.write(&[0x55; 32]).unwrap(), 32);
            assert!(writer.write(&[0u8; 33]).is_err());
        }
        // First event from a source lands in pool zero.
        assert_eq!(prng.pool_zero_bytes, 32);
    }

    #[test]
    fn oversized_and_empty_events_are_rejected() {
        let mut prng = Fortuna::new();
        assert!(prng.add_event(Source::Tpm, &[]).is_err());
        assert!(prng.add_event(Source::Tpm, &[0u8; 33]).is_err());
    }

    #[test]
    fn refill_draws_interleaved_os_and_tpm_events() {
        let mut prng = Fortuna::new();
        let mut tpm = MockTpm::new();
        prng.refill(&mut tpm).unwrap();

        assert_eq!(tpm.reads, 2 * POOL_COUNT);
        assert_eq!(tpm.bytes, 2 * POOL_COUNT * 16);
        // The refill alone must leave the PRNG usable.
        assert_eq!(prng.random_data(32).unwrap().len(), 32);
    }

    #[test]
    fn refill_fails_when_the_tpm_fails() {
        let mut prng = Fortuna::new();
        let mut tpm = MockTpm::failing();
        assert!(matches!(prng.refill(&mut tpm), Err(Error::Rng(_))));
    }

    #[test]
    fn seed_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.seed");

        let mut prng = Fortuna::new();
        prime(&mut prng);
        prng.write_seed(&path).unwrap();

        assert_eq!(fs::read(&path).unwrap().len(), SEED_FILE_SIZE);

        let mut restored = Fortuna::from_seed(&path).unwrap();
        assert_eq!(restored.random_data(32).unwrap().len(), 32);
    }

    #[test]
    fn corrupt_seed_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.seed");
        fs::write(&path, [0u8; 7]).unwrap();

        assert!(matches!(Fortuna::from_seed(&path), Err(Error::Rng(_))));
    }

    #[test]
    fn reader_interface_fills_exactly() {
        let mut prng = Fortuna::new();
        prime(&mut prng);

        let mut buf = [0u8; 100];
        prng.read_exact(&mut buf).unwrap();
        assert_ne!(buf, [0u8; 100]);
    }
}
