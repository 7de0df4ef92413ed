// SPDX-License-Identifier: MIT
//
// Entrodist: authenticated entropy distribution over TCP

//! Entrodist Core Library
//!
//! Foundational types for the entrodist system: a *source* machine with
//! access to hardware randomness generates chunks of entropy, signs and
//! encrypts them, and pushes them over TCP to *sink* machines that feed
//! the chunks into their kernel entropy pool.
//!
//! # Architecture
//!
//! - `crypto`: sign-then-encrypt envelope (RSA-PSS + NaCl box)
//! - `protocol`: entropy packet codec and the replay/freshness gate
//! - `wire`: length-prefixed TCP framing
//! - `fortuna`: accumulator PRNG with named entropy sources
//! - `tpm`: hardware randomness handle
//! - `engine`: shared PRNG owner and its maintenance tasks
//! - `config`: sink configuration and target records
//! - `keys`: key material on disk
//! - `error`: unified error type

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod fortuna;
pub mod keys;
pub mod protocol;
pub mod tpm;
pub mod wire;

pub use error::{Error, Result};
pub use protocol::{parse_and_sink, Packet, CHUNK_SIZE};

/// Library version, stamped into logs at daemon startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Deadline applied to every network exchange.
pub const NETWORK_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);
