// SPDX-License-Identifier: MIT
//
// Entrodist: authenticated entropy distribution over TCP

//! Hardware randomness handle
//!
//! The engine only needs one primitive from the TPM: read N random bytes.
//! `HardwareRng` is that seam, so the daemon can run against the kernel's
//! hardware RNG character device while tests substitute deterministic
//! mocks.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// A source of hardware randomness with an explicit lifecycle.
pub trait HardwareRng: Send {
    /// Read exactly `n` random bytes.
    fn random(&mut self, n: usize) -> Result<Vec<u8>>;

    /// Release the underlying handle. Safe to call more than once; reads
    /// after close fail.
    fn close(&mut self) -> Result<()>;
}

/// TPM-backed randomness read from a character device.
#[derive(Debug)]
pub struct TpmDevice {
    path: PathBuf,
    device: Option<File>,
}

impl TpmDevice {
    /// Kernel interface to the hardware RNG.
    pub const DEFAULT_PATH: &'static str = "/dev/hwrng";

    /// Open the device for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let device = File::open(&path)
            .map_err(|e| Error::Rng(format!("cannot open {}: {e}", path.display())))?;
        Ok(TpmDevice {
            path,
            device: Some(device),
        })
    }
}

impl HardwareRng for TpmDevice {
    fn random(&mut self, n: usize) -> Result<Vec<u8>> {
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| Error::Rng("hardware rng handle is closed".into()))?;

        let mut buf = vec![0u8; n];
        device
            .read_exact(&mut buf)
            .map_err(|e| Error::Rng(format!("{}: {e}", self.path.display())))?;
        Ok(buf)
    }

    fn close(&mut self) -> Result<()> {
        self.device.take();
        Ok(())
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;

    /// Deterministic stand-in for the TPM.
    pub struct MockTpm {
        pub reads: usize,
        pub bytes: usize,
        pub closed: bool,
        fail: bool,
    }

    impl MockTpm {
        pub fn new() -> Self {
            MockTpm {
                reads: 0,
                bytes: 0,
                closed: false,
                fail: false,
            }
        }

        pub fn failing() -> Self {
            MockTpm {
                fail: true,
                ..Self::new()
            }
        }
    }

    impl HardwareRng for MockTpm {
        fn random(&mut self, n: usize) -> Result<Vec<u8>> {
            if self.fail {
                return Err(Error::Rng("mock tpm failure".into()));
            }
            if self.closed {
                return Err(Error::Rng("hardware rng handle is closed".into()));
            }
            self.reads += 1;
            self.bytes += n;
            Ok((0..n).map(|i| (self.reads + i) as u8).collect())
        }

        fn close(&mut self) -> Result<()> {
            self.closed = true;
            Ok(())
        }
    }
}
