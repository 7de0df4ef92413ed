// SPDX-License-Identifier: MIT
//
// Entrodist: authenticated entropy distribution over TCP

//! Key material on disk
//!
//! Curve25519 keys are raw 32-byte files; RSA signer keys are PKCS#1 DER
//! (private) and PKIX DER (public). Any of them may be PEM-armoured, and
//! the loaders de-armour transparently. Private key files are written
//! with mode 0600, public files 0644.

use std::fs;
use std::path::Path;

use crypto_box::{PublicKey, SecretKey};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::{Error, Result};

/// PEM type for an armoured Curve25519 private key.
pub const PEM_BOX_PRIVATE: &str = "CURVE25519 PRIVATE KEY";

/// PEM type for an armoured Curve25519 public key.
pub const PEM_BOX_PUBLIC: &str = "CURVE25519 PUBLIC KEY";

const PEM_RSA_PRIVATE: &str = "RSA PRIVATE KEY";
const PEM_RSA_PUBLIC: &str = "RSA PUBLIC KEY";
const PEM_PUBLIC: &str = "PUBLIC KEY";

const MODE_PRIVATE: u32 = 0o600;
const MODE_PUBLIC: u32 = 0o644;

/// Load a Curve25519 decryption (private) key.
pub fn load_box_secret<P: AsRef<Path>>(path: P) -> Result<SecretKey> {
    let bytes = read_key(path.as_ref(), &[PEM_BOX_PRIVATE])?;
    Ok(SecretKey::from(fixed_32(path.as_ref(), &bytes)?))
}

/// Load a Curve25519 encryption (public) key.
pub fn load_box_public<P: AsRef<Path>>(path: P) -> Result<PublicKey> {
    let bytes = read_key(path.as_ref(), &[PEM_BOX_PUBLIC])?;
    Ok(PublicKey::from(fixed_32(path.as_ref(), &bytes)?))
}

/// Load an RSA signing key (PKCS#1 DER, optionally PEM).
pub fn load_rsa_signer<P: AsRef<Path>>(path: P) -> Result<RsaPrivateKey> {
    let bytes = read_key(path.as_ref(), &[PEM_RSA_PRIVATE, "PRIVATE KEY"])?;
    RsaPrivateKey::from_pkcs1_der(&bytes)
        .map_err(|e| Error::Key(format!("{}: {e}", path.as_ref().display())))
}

/// Load an RSA verification key (PKIX DER, optionally PEM).
pub fn load_rsa_public<P: AsRef<Path>>(path: P) -> Result<RsaPublicKey> {
    let bytes = read_key(path.as_ref(), &[PEM_PUBLIC, PEM_RSA_PUBLIC])?;
    RsaPublicKey::from_public_key_der(&bytes)
        .map_err(|e| Error::Key(format!("{}: {e}", path.as_ref().display())))
}

/// Write a Curve25519 private key, optionally armoured.
pub fn save_box_secret<P: AsRef<Path>>(path: P, key: &SecretKey, armour: bool) -> Result<()> {
    write_key(path.as_ref(), &key.to_bytes(), armour.then_some(PEM_BOX_PRIVATE), MODE_PRIVATE)
}

/// Write a Curve25519 public key, optionally armoured.
pub fn save_box_public<P: AsRef<Path>>(path: P, key: &PublicKey, armour: bool) -> Result<()> {
    write_key(path.as_ref(), key.as_bytes(), armour.then_some(PEM_BOX_PUBLIC), MODE_PUBLIC)
}

/// Write an RSA signing key as PKCS#1 DER, optionally armoured.
pub fn save_rsa_signer<P: AsRef<Path>>(path: P, key: &RsaPrivateKey, armour: bool) -> Result<()> {
    let der = key
        .to_pkcs1_der()
        .map_err(|e| Error::Key(e.to_string()))?;
    write_key(path.as_ref(), der.as_bytes(), armour.then_some(PEM_RSA_PRIVATE), MODE_PRIVATE)
}

/// Write an RSA verification key as PKIX DER, optionally armoured.
pub fn save_rsa_public<P: AsRef<Path>>(path: P, key: &RsaPublicKey, armour: bool) -> Result<()> {
    let der = key
        .to_public_key_der()
        .map_err(|e| Error::Key(e.to_string()))?;
    write_key(path.as_ref(), der.as_bytes(), armour.then_some(PEM_PUBLIC), MODE_PUBLIC)
}

fn read_key(path: &Path, allowed_types: &[&str]) -> Result<Vec<u8>> {
    let raw = fs::read(path)?;
    if !raw.starts_with(b"-----BEGIN ") {
        return Ok(raw);
    }

    let block = pem::parse(&raw)
        .map_err(|e| Error::Key(format!("{}: invalid PEM: {e}", path.display())))?;
    if !allowed_types.contains(&block.tag()) {
        return Err(Error::Key(format!(
            "{}: unexpected PEM type {:?}",
            path.display(),
            block.tag()
        )));
    }
    Ok(block.contents().to_vec())
}

fn write_key(path: &Path, bytes: &[u8], armour_type: Option<&str>, mode: u32) -> Result<()> {
    let out = match armour_type {
        Some(tag) => pem::encode(&pem::Pem::new(tag, bytes)).into_bytes(),
        None => bytes.to_vec(),
    };

    fs::write(path, out)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

fn fixed_32(path: &Path, bytes: &[u8]) -> Result<[u8; 32]> {
    bytes.try_into().map_err(|_| {
        Error::Key(format!(
            "{}: key is {} bytes, expected 32",
            path.display(),
            bytes.len()
        ))
    })
}
