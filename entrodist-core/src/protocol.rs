// SPDX-License-Identifier: MIT
//
// Entrodist: authenticated entropy distribution over TCP

//! Entropy packet codec and the replay/freshness gate
//!
//! A packet carries a fixed 1024-byte chunk of random data together with
//! the sender's per-target counter and a unix timestamp. The encoding is
//! ASN.1 DER (a SEQUENCE of two INTEGERs and an OCTET STRING), chosen for
//! a stable byte representation under the signature.
//!
//! Counter discipline: a counter only ever advances on full success.
//! `Packet::new` leaves the sender counter untouched unless a complete
//! chunk was read, and `parse_and_sink` leaves the receiver counter
//! untouched on every error path, which is the entire defence against
//! replayed and reordered packets.

use std::io::{Read, Write};

use chrono::Utc;
use crypto_box::{PublicKey, SecretKey};
use der::{asn1::OctetString, Decode, Encode, Sequence};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::{crypto, Error, Result};

/// Number of random bytes carried by one packet.
pub const CHUNK_SIZE: usize = 1024;

/// One entropy packet: the authenticated plaintext inside the envelope.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    /// Seconds since the unix epoch, set by the sender at construction.
    pub timestamp: i64,
    /// Strictly increasing per-(source, sink) sequence number.
    pub counter: i64,
    /// Random payload.
    pub chunk: [u8; CHUNK_SIZE],
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("timestamp", &self.timestamp)
            .field("counter", &self.counter)
            .field("chunk", &format_args!("[{} bytes]", self.chunk.len()))
            .finish()
    }
}

/// DER form of a packet.
#[derive(Sequence)]
struct WirePacket {
    timestamp: i64,
    counter: i64,
    chunk: OctetString,
}

impl Packet {
    /// Build a packet by drawing exactly one chunk from `rng`.
    ///
    /// Returns the advanced counter alongside the packet. If the read
    /// fails the counter must not advance; an `Err` here carries no
    /// counter, so the caller keeps its previous value.
    pub fn new<R: Read>(counter: i64, rng: &mut R) -> Result<(i64, Packet)> {
        let mut chunk = [0u8; CHUNK_SIZE];
        rng.read_exact(&mut chunk)
            .map_err(|e| Error::Rng(e.to_string()))?;
        Ok(Self::from_chunk(counter, chunk))
    }

    /// Build a packet around an already-drawn chunk.
    pub fn from_chunk(counter: i64, chunk: [u8; CHUNK_SIZE]) -> (i64, Packet) {
        let counter = counter + 1;
        let packet = Packet {
            timestamp: Utc::now().timestamp(),
            counter,
            chunk,
        };
        (counter, packet)
    }

    /// Encode, sign, and encrypt this packet for transmission to `peer`.
    ///
    /// The resulting envelope is guaranteed to fit a 16-bit length frame.
    pub fn seal(&self, peer: &PublicKey, signer: Option<&RsaPrivateKey>) -> Result<Vec<u8>> {
        let wire = WirePacket {
            timestamp: self.timestamp,
            counter: self.counter,
            chunk: OctetString::new(&self.chunk[..]).map_err(|e| Error::Encode(e.to_string()))?,
        };
        let encoded = wire.to_der().map_err(|e| Error::Encode(e.to_string()))?;

        let envelope = crypto::encrypt(&encoded, peer, signer)?;
        if envelope.len() > u16::MAX as usize {
            return Err(Error::Encode(format!(
                "envelope of {} bytes exceeds the frame limit",
                envelope.len()
            )));
        }
        Ok(envelope)
    }

    /// Decrypt and decode a packet from the wire.
    ///
    /// Unsigned packets are rejected here: the entropy protocol always
    /// signs, and a chunk of unauthenticated origin must never reach an
    /// entropy pool.
    pub fn open(
        envelope: &[u8],
        ours: &SecretKey,
        signer: Option<&RsaPublicKey>,
    ) -> Result<Packet> {
        let (message, signed) = crypto::decrypt(envelope, ours, signer)?;
        if !signed {
            return Err(Error::Unsigned);
        }

        let wire = WirePacket::from_der(&message)?;
        let bytes = wire.chunk.as_bytes();
        if bytes.len() != CHUNK_SIZE {
            return Err(Error::BadChunk { len: bytes.len() });
        }

        let mut chunk = [0u8; CHUNK_SIZE];
        chunk.copy_from_slice(bytes);
        Ok(Packet {
            timestamp: wire.timestamp,
            counter: wire.counter,
            chunk,
        })
    }
}

/// Validate a received envelope and forward its chunk to the entropy sink.
///
/// The packet must open and verify, its timestamp must lie within `drift`
/// seconds of the local clock, and its counter must strictly exceed
/// `counter`. Only then is the chunk written to `sink`. On success the
/// packet's counter is returned as the new high-water mark; on any error
/// the caller's counter is unchanged.
pub fn parse_and_sink<W: Write>(
    envelope: &[u8],
    ours: &SecretKey,
    signer: &RsaPublicKey,
    drift: i64,
    counter: i64,
    sink: &mut W,
) -> Result<i64> {
    let packet = Packet::open(envelope, ours, Some(signer))?;

    let now = Utc::now().timestamp();
    if packet.timestamp > now + drift || packet.timestamp < now - drift {
        return Err(Error::Timestamp {
            timestamp: packet.timestamp,
            now,
        });
    }

    if packet.counter <= counter {
        return Err(Error::Counter {
            received: packet.counter,
            current: counter,
        });
    }

    sink.write_all(&packet.chunk)?;
    Ok(packet.counter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto_box::aead::OsRng;
    use rand::RngCore;
    use std::io::Cursor;
    use std::sync::OnceLock;

    fn test_signer() -> &'static RsaPrivateKey {
        static SIGNER: OnceLock<RsaPrivateKey> = OnceLock::new();
        SIGNER.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 2048).unwrap())
    }

    fn recipient() -> (SecretKey, PublicKey) {
        let secret = SecretKey::generate(&mut OsRng);
        let public = secret.public_key();
        (secret, public)
    }

    fn chunk_source() -> Cursor<Vec<u8>> {
        let mut bytes = vec![0u8; 4 * CHUNK_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Cursor::new(bytes)
    }

    #[test]
    fn new_packet_advances_counter() {
        let (counter, packet) = Packet::new(30, &mut chunk_source()).unwrap();
        assert_eq!(counter, 31);
        assert_eq!(packet.counter, 31);
        assert_eq!(packet.chunk.len(), CHUNK_SIZE);
    }

    #[test]
    fn counter_preserved_when_rng_runs_dry() {
        let mut short = Cursor::new(vec![0u8; CHUNK_SIZE - 1]);
        let err = Packet::new(30, &mut short).unwrap_err();
        assert!(matches!(err, Error::Rng(_)));
    }

    #[test]
    fn packet_round_trip() {
        let signer = test_signer();
        let (secret, public) = recipient();

        let (_, packet) = Packet::new(7, &mut chunk_source()).unwrap();
        let envelope = packet.seal(&public, Some(signer)).unwrap();
        let parsed = Packet::open(&envelope, &secret, Some(&signer.to_public_key())).unwrap();

        assert_eq!(parsed, packet);
    }

    #[test]
    fn envelope_fits_length_frame() {
        let signer = test_signer();
        let (_, public) = recipient();

        let (_, packet) = Packet::new(0, &mut chunk_source()).unwrap();
        let envelope = packet.seal(&public, Some(signer)).unwrap();

        assert!(envelope.len() <= u16::MAX as usize);
        // header + DER packet + 256-byte signature + record overhead
        assert!(envelope.len() < 2 * CHUNK_SIZE);
    }

    #[test]
    fn unsigned_packet_is_rejected() {
        let signer = test_signer();
        let (secret, public) = recipient();

        let (_, packet) = Packet::new(0, &mut chunk_source()).unwrap();
        let envelope = packet.seal(&public, None).unwrap();
        let err = Packet::open(&envelope, &secret, Some(&signer.to_public_key())).unwrap_err();
        assert!(matches!(err, Error::Unsigned));
    }

    #[test]
    fn truncated_chunk_is_rejected() {
        let signer = test_signer();
        let (secret, public) = recipient();

        let wire = WirePacket {
            timestamp: Utc::now().timestamp(),
            counter: 1,
            chunk: OctetString::new(vec![0u8; 10]).unwrap(),
        };
        let envelope = crypto::encrypt(&wire.to_der().unwrap(), &public, Some(signer)).unwrap();

        let err = Packet::open(&envelope, &secret, Some(&signer.to_public_key())).unwrap_err();
        assert!(matches!(err, Error::BadChunk { len: 10 }));
    }

    #[test]
    fn sink_accepts_then_rejects_replay() {
        let signer = test_signer();
        let (secret, public) = recipient();

        let (counter, packet) = Packet::new(30, &mut chunk_source()).unwrap();
        let envelope = packet.seal(&public, Some(signer)).unwrap();

        let drift = Utc::now().timestamp() - packet.timestamp + 1;
        let mut pool = Vec::new();
        let accepted = parse_and_sink(
            &envelope,
            &secret,
            &signer.to_public_key(),
            drift,
            0,
            &mut pool,
        )
        .unwrap();

        assert_eq!(accepted, counter);
        assert_eq!(pool, packet.chunk);

        let err = parse_and_sink(
            &envelope,
            &secret,
            &signer.to_public_key(),
            drift,
            accepted,
            &mut pool,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Counter { .. }));
        assert_eq!(pool.len(), CHUNK_SIZE);
    }

    #[test]
    fn drift_window_is_enforced_on_both_edges() {
        let signer = test_signer();
        let (secret, public) = recipient();
        let drift = 1i64;

        for skew in [drift + 1, -(drift + 1)] {
            let (_, mut packet) = Packet::new(0, &mut chunk_source()).unwrap();
            packet.timestamp = Utc::now().timestamp() + skew;
            let envelope = packet.seal(&public, Some(signer)).unwrap();

            let mut pool = Vec::new();
            let err = parse_and_sink(
                &envelope,
                &secret,
                &signer.to_public_key(),
                drift,
                0,
                &mut pool,
            )
            .unwrap_err();
            assert!(matches!(err, Error::Timestamp { .. }));
            assert!(pool.is_empty());
        }
    }

    #[test]
    fn timestamp_inside_window_is_accepted() {
        let signer = test_signer();
        let (secret, public) = recipient();

        let (_, packet) = Packet::new(0, &mut chunk_source()).unwrap();
        let envelope = packet.seal(&public, Some(signer)).unwrap();

        let drift = Utc::now().timestamp() - packet.timestamp + 2;
        let mut pool = Vec::new();
        assert!(parse_and_sink(
            &envelope,
            &secret,
            &signer.to_public_key(),
            drift,
            0,
            &mut pool
        )
        .is_ok());
    }
}
