// SPDX-License-Identifier: MIT
//
// Entrodist: authenticated entropy distribution over TCP

//! Sign-then-encrypt envelope for entropy packets
//!
//! A message is signed with the source's RSA key (RSA-PSS over SHA-256),
//! wrapped in a DER record together with its signature, and sealed to the
//! recipient's Curve25519 key with a NaCl box (X25519 + XSalsa20-Poly1305).
//! The sender side of the box is an ephemeral keypair generated per
//! envelope, so recipients never need to learn a long-term sender
//! Curve25519 key.
//!
//! Wire layout: `ephemeral_pub(32) || nonce(24) || box ciphertext`.

use crypto_box::{
    aead::{Aead, AeadCore, OsRng},
    Nonce, PublicKey, SalsaBox, SecretKey,
};
use der::{asn1::OctetString, Decode, Encode, Sequence};
use rsa::{Pss, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Size of a Curve25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a NaCl box nonce in bytes.
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag length added by the box itself.
pub const BOX_OVERHEAD: usize = 16;

/// Smallest well-formed envelope: header plus an empty sealed record.
pub const MIN_ENVELOPE_SIZE: usize = PUBLIC_KEY_SIZE + NONCE_SIZE + BOX_OVERHEAD;

/// The authenticated plaintext sealed inside the box: the message and its
/// RSA-PSS signature. An empty signature marks the message as unsigned.
#[derive(Sequence)]
struct SignedRecord {
    message: OctetString,
    signature: OctetString,
}

/// Sign `message` (when a signer is given) and seal it to `peer`.
///
/// A fresh ephemeral Curve25519 keypair and a fresh 24-byte nonce are used
/// for every envelope.
pub fn encrypt(message: &[u8], peer: &PublicKey, signer: Option<&RsaPrivateKey>) -> Result<Vec<u8>> {
    let signature = match signer {
        Some(key) => {
            let digest = Sha256::digest(message);
            key.sign_with_rng(&mut OsRng, Pss::new::<Sha256>(), &digest)
                .map_err(|e| Error::Sign(e.to_string()))?
        }
        None => Vec::new(),
    };

    let record = SignedRecord {
        message: OctetString::new(message).map_err(|e| Error::Encode(e.to_string()))?,
        signature: OctetString::new(signature).map_err(|e| Error::Encode(e.to_string()))?,
    };
    let plaintext = record.to_der().map_err(|e| Error::Encode(e.to_string()))?;

    let ephemeral = SecretKey::generate(&mut OsRng);
    let nonce = SalsaBox::generate_nonce(&mut OsRng);

    let sealed = SalsaBox::new(peer, &ephemeral)
        .encrypt(&nonce, plaintext.as_slice())
        .map_err(|_| Error::Rng("box seal failed".into()))?;

    let mut out = Vec::with_capacity(MIN_ENVELOPE_SIZE + plaintext.len());
    out.extend_from_slice(ephemeral.public_key().as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open an envelope with our Curve25519 key and verify its signature.
///
/// Returns the message and whether it was signed. An unsigned message is
/// not an error at this layer; the packet layer above decides whether
/// unsigned input is acceptable. A signed message with no verification key
/// available, or with a signature that does not verify, is rejected.
pub fn decrypt(
    envelope: &[u8],
    ours: &SecretKey,
    signer: Option<&RsaPublicKey>,
) -> Result<(Vec<u8>, bool)> {
    if envelope.len() < MIN_ENVELOPE_SIZE {
        return Err(Error::BadSize { len: envelope.len() });
    }

    let mut epub = [0u8; PUBLIC_KEY_SIZE];
    epub.copy_from_slice(&envelope[..PUBLIC_KEY_SIZE]);
    let nonce = Nonce::clone_from_slice(&envelope[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NONCE_SIZE]);
    let sealed = &envelope[PUBLIC_KEY_SIZE + NONCE_SIZE..];

    let plaintext = SalsaBox::new(&PublicKey::from(epub), ours)
        .decrypt(&nonce, sealed)
        .map_err(|_| Error::Decrypt)?;

    let record = SignedRecord::from_der(&plaintext)?;
    let message = record.message.into_bytes();
    let signature = record.signature.into_bytes();

    if signature.is_empty() {
        return Ok((message, false));
    }

    let verifier = signer.ok_or(Error::Signature)?;
    let digest = Sha256::digest(&message);
    verifier
        .verify(Pss::new::<Sha256>(), &digest, &signature)
        .map_err(|_| Error::Signature)?;

    Ok((message, true))
}
