// SPDX-License-Identifier: MIT
//
// Entrodist: authenticated entropy distribution over TCP

//! Key and configuration authoring
//!
//! Everything the daemons expect to find on disk is produced here: the
//! source's RSA signature keypair, a sink's Curve25519 decryption
//! keypair, the sink configuration document, and individual target
//! records. JSON documents go to stdout so they can be reviewed and
//! redirected; key files are written directly with the right modes.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crypto_box::aead::OsRng;
use crypto_box::SecretKey;
use entrodist_core::config::{SinkConfig, Target};
use entrodist_core::keys;
use rsa::pkcs8::EncodePublicKey;
use rsa::RsaPrivateKey;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "entrodist-keytool")]
#[command(about = "Key and configuration authoring for entrodist", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate an RSA signature keypair for a source
    Rsa {
        /// Output file base name; writes <out>.key and <out>.pub
        #[arg(short, long, default_value = "signer")]
        out: String,

        /// RSA key size in bits
        #[arg(short = 's', long, default_value_t = 2048)]
        bits: usize,

        /// PEM-armour the key files
        #[arg(short, long)]
        armour: bool,

        /// Re-derive the public file from an existing private key
        #[arg(long)]
        from: Option<PathBuf>,
    },

    /// Generate a Curve25519 decryption keypair for a sink
    #[command(name = "box")]
    BoxKeypair {
        /// Output file base name; writes <out>.key and <out>.pub
        #[arg(short, long, default_value = "decrypt")]
        out: String,

        /// PEM-armour the key files
        #[arg(short, long)]
        armour: bool,
    },

    /// Emit a sink configuration document on stdout
    SinkConfig {
        /// Listener address
        #[arg(short, long, default_value = ":9437")]
        address: String,

        /// Sink's Curve25519 decryption key file
        #[arg(short = 'k', long, default_value = "decrypt.key")]
        key: PathBuf,

        /// Source's RSA public key file
        #[arg(short = 's', long, default_value = "signer.pub")]
        signer: PathBuf,

        /// Permitted clock drift in seconds
        #[arg(short, long, default_value_t = 120)]
        drift: i64,

        /// Initial replay counter
        #[arg(short, long, default_value_t = 0)]
        counter: i64,
    },

    /// Emit one target record on stdout
    Target {
        /// Sink address, host:port
        #[arg(short, long)]
        address: String,

        /// Sink's Curve25519 public key file
        #[arg(short = 'k', long, default_value = "decrypt.pub")]
        key: PathBuf,

        /// Initial packet counter
        #[arg(short, long, default_value_t = 0)]
        counter: i64,

        /// Initial next-send timestamp
        #[arg(short, long, default_value_t = 0)]
        next: i64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    match Args::parse().command {
        Command::Rsa {
            out,
            bits,
            armour,
            from,
        } => generate_rsa(&out, bits, armour, from),
        Command::BoxKeypair { out, armour } => generate_box(&out, armour),
        Command::SinkConfig {
            address,
            key,
            signer,
            drift,
            counter,
        } => emit_sink_config(address, &key, &signer, drift, counter),
        Command::Target {
            address,
            key,
            counter,
            next,
        } => emit_target(address, &key, counter, next),
    }
}

fn generate_rsa(out: &str, bits: usize, armour: bool, from: Option<PathBuf>) -> Result<()> {
    let key = match &from {
        Some(path) => keys::load_rsa_signer(path)
            .with_context(|| format!("failed to load private key {}", path.display()))?,
        None => RsaPrivateKey::new(&mut OsRng, bits).context("RSA key generation failed")?,
    };

    if from.is_none() {
        keys::save_rsa_signer(format!("{out}.key"), &key, armour)?;
        info!("wrote private key to {out}.key");
    }
    keys::save_rsa_public(format!("{out}.pub"), &key.to_public_key(), armour)?;
    info!("wrote public key to {out}.pub");
    Ok(())
}

fn generate_box(out: &str, armour: bool) -> Result<()> {
    let secret = SecretKey::generate(&mut OsRng);

    keys::save_box_secret(format!("{out}.key"), &secret, armour)?;
    info!("wrote private key to {out}.key");
    keys::save_box_public(format!("{out}.pub"), &secret.public_key(), armour)?;
    info!("wrote public key to {out}.pub");
    Ok(())
}

fn emit_sink_config(
    address: String,
    key: &PathBuf,
    signer: &PathBuf,
    drift: i64,
    counter: i64,
) -> Result<()> {
    let secret = keys::load_box_secret(key)
        .with_context(|| format!("failed to load decryption key {}", key.display()))?;
    let signer = keys::load_rsa_public(signer)
        .with_context(|| format!("failed to load signer public key {}", signer.display()))?;

    let config = SinkConfig {
        address,
        signer: signer
            .to_public_key_der()
            .context("failed to encode signer key")?
            .into_vec(),
        counter,
        private: secret.to_bytes().to_vec(),
        drift,
    };
    config.validate()?;

    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn emit_target(address: String, key: &PathBuf, counter: i64, next: i64) -> Result<()> {
    let public = keys::load_box_public(key)
        .with_context(|| format!("failed to load sink public key {}", key.display()))?;

    let target = Target {
        address,
        public: public.as_bytes().to_vec(),
        counter,
        next,
    };

    println!("{}", serde_json::to_string_pretty(&target)?);
    Ok(())
}
