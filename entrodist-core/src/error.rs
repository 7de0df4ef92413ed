// SPDX-License-Identifier: MIT
//
// Entrodist: authenticated entropy distribution over TCP

//! Error types for the entrodist data path
//!
//! One `thiserror` taxonomy shared by the envelope, packet, and engine
//! layers. The propagation policy is strict: errors are returned to the
//! caller verbatim, and no persistent state (sender or receiver counter,
//! seed file, target file) is partially mutated on an error path.

pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for entrodist operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// RNG, TPM, or PRNG output failure
    #[error("randomness failure: {0}")]
    Rng(String),

    /// RSA-PSS signing failed
    #[error("signing failure: {0}")]
    Sign(String),

    /// DER encoding failed
    #[error("encoding failure: {0}")]
    Encode(String),

    /// DER decoding failed
    #[error("decoding failure: {0}")]
    Decode(String),

    /// NaCl box open failed; the envelope was tampered with or is not ours
    #[error("decryption failure")]
    Decrypt,

    /// RSA-PSS verification failed
    #[error("signature verification failure")]
    Signature,

    /// Packet arrived without a signature; the entropy protocol always signs
    #[error("packet was not signed")]
    Unsigned,

    /// Envelope shorter than the fixed header plus authentication tag
    #[error("invalid envelope size: {len} bytes")]
    BadSize { len: usize },

    /// Decoded chunk is not exactly one chunk long
    #[error("bad packet chunk length: {len} bytes")]
    BadChunk { len: usize },

    /// Packet timestamp outside the permitted drift window
    #[error("packet timestamp {timestamp} outside drift window around {now}")]
    Timestamp { timestamp: i64, now: i64 },

    /// Packet counter did not strictly increase
    #[error("counter has regressed: received {received}, current {current}")]
    Counter { received: i64, current: i64 },

    /// Key material could not be loaded or parsed
    #[error("key error: {0}")]
    Key(String),

    /// Configuration validation failed
    #[error("configuration error: {0}")]
    Config(String),

    /// Network or file I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors that reject a received packet without indicating a
    /// local fault; the sink logs these and keeps listening.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::Decode(_)
                | Error::Decrypt
                | Error::Signature
                | Error::Unsigned
                | Error::BadSize { .. }
                | Error::BadChunk { .. }
                | Error::Timestamp { .. }
                | Error::Counter { .. }
        )
    }
}

impl From<der::Error> for Error {
    fn from(e: der::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}
