// SPDX-License-Identifier: MIT
//
// Entrodist: authenticated entropy distribution over TCP

//! Sink configuration and target records
//!
//! Both documents live on disk as JSON with PascalCase field names and
//! base64-encoded byte fields. They are also mutable state: the sink
//! persists its replay counter after every accepted packet, and the
//! source rewrites a target's counter and next-send time after every
//! successful delivery. Rewrites go through a temp-file-and-rename so a
//! crash never leaves a half-written document.

use std::fs;
use std::path::Path;

use crypto_box::{PublicKey, SecretKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Sink-side state: one row, since a sink trusts exactly one signer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SinkConfig {
    /// Local listen endpoint, host:port.
    pub address: String,
    /// DER-encoded PKIX RSA public key of the trusted source.
    #[serde(with = "base64_bytes")]
    pub signer: Vec<u8>,
    /// Highest counter ever accepted.
    pub counter: i64,
    /// Raw 32-byte Curve25519 decryption key.
    #[serde(with = "base64_bytes")]
    pub private: Vec<u8>,
    /// Maximum permitted absolute timestamp skew, in seconds.
    pub drift: i64,
}

impl SinkConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read(path)?;
        let config: SinkConfig = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Persist the configuration, including the current counter.
    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let out = serde_json::to_vec_pretty(self)?;
        write_atomically(path.as_ref(), &out)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::Config("listen address is empty".into()));
        }
        if self.private.len() != 32 {
            return Err(Error::Config(format!(
                "decryption key is {} bytes, expected 32",
                self.private.len()
            )));
        }
        if self.drift < 0 {
            return Err(Error::Config("drift must not be negative".into()));
        }
        self.signer_key()?;
        Ok(())
    }

    /// The trusted source's RSA verification key.
    pub fn signer_key(&self) -> Result<RsaPublicKey> {
        RsaPublicKey::from_public_key_der(&self.signer)
            .map_err(|e| Error::Key(format!("signer is not a DER-encoded RSA public key: {e}")))
    }

    /// Our Curve25519 decryption key.
    pub fn secret_key(&self) -> Result<SecretKey> {
        let bytes: [u8; 32] = self
            .private
            .as_slice()
            .try_into()
            .map_err(|_| Error::Key("decryption key is not 32 bytes".into()))?;
        Ok(SecretKey::from(bytes))
    }
}

/// Source-side record of one sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Target {
    /// Sink endpoint, host:port.
    pub address: String,
    /// Raw 32-byte Curve25519 key of the sink.
    #[serde(with = "base64_bytes")]
    pub public: Vec<u8>,
    /// Last counter successfully used toward this target.
    pub counter: i64,
    /// Earliest unix-epoch second for the next send attempt.
    #[serde(default)]
    pub next: i64,
}

impl Target {
    /// The sink's Curve25519 encryption key.
    pub fn public_key(&self) -> Result<PublicKey> {
        let bytes: [u8; 32] = self
            .public
            .as_slice()
            .try_into()
            .map_err(|_| Error::Key(format!("target {}: public key is not 32 bytes", self.address)))?;
        Ok(PublicKey::from(bytes))
    }
}

/// Load the target list.
pub fn load_targets<P: AsRef<Path>>(path: P) -> Result<Vec<Target>> {
    let raw = fs::read(path)?;
    let targets: Vec<Target> = serde_json::from_slice(&raw)?;
    for target in &targets {
        if target.address.is_empty() {
            return Err(Error::Config("target with empty address".into()));
        }
        target.public_key()?;
    }
    Ok(targets)
}

/// Rewrite the target list.
pub fn store_targets<P: AsRef<Path>>(path: P, targets: &[Target]) -> Result<()> {
    let out = serde_json::to_vec_pretty(&targets)?;
    write_atomically(path.as_ref(), &out)
}

/// Write via a sibling temp file and rename, so readers always observe a
/// complete document.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

mod base64_bytes {
    //! Byte fields as standard base64 strings, the convention the wire
    //! documents have always used.

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crypto_box::aead::OsRng;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::RsaPrivateKey;
    use std::sync::OnceLock;

    fn signer_der() -> &'static Vec<u8> {
        static DER: OnceLock<Vec<u8>> = OnceLock::new();
        DER.get_or_init(|| {
            RsaPrivateKey::new(&mut OsRng, 2048)
                .unwrap()
                .to_public_key()
                .to_public_key_der()
                .unwrap()
                .into_vec()
        })
    }

    fn sample_config() -> SinkConfig {
        SinkConfig {
            address: "127.0.0.1:9437".into(),
            signer: signer_der().clone(),
            counter: 42,
            private: SecretKey::generate(&mut OsRng).to_bytes().to_vec(),
            drift: 120,
        }
    }

    #[test]
    fn sink_config_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = sample_config();
        config.store(&path).unwrap();
        let loaded = SinkConfig::load(&path).unwrap();

        assert_eq!(loaded.address, config.address);
        assert_eq!(loaded.signer, config.signer);
        assert_eq!(loaded.counter, 42);
        assert_eq!(loaded.private, config.private);
        assert_eq!(loaded.drift, 120);
    }

    #[test]
    fn sink_config_fields_are_pascal_case_base64() {
        let json = serde_json::to_string(&sample_config()).unwrap();
        for field in ["\"Address\"", "\"Signer\"", "\"Counter\"", "\"Private\"", "\"Drift\""] {
            assert!(json.contains(field), "missing {field} in {json}");
        }
    }

    #[test]
    fn bad_decryption_key_length_fails_validation() {
        let mut config = sample_config();
        config.private = vec![0u8; 31];
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn garbage_signer_fails_validation() {
        let mut config = sample_config();
        config.signer = vec![0u8; 50];
        assert!(config.validate().is_err());
    }

    #[test]
    fn target_list_round_trips_and_tolerates_missing_next() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");

        let secret = SecretKey::generate(&mut OsRng);
        let targets = vec![Target {
            address: "sink.example.org:9437".into(),
            public: secret.public_key().as_bytes().to_vec(),
            counter: 7,
            next: 0,
        }];
        store_targets(&path, &targets).unwrap();

        let loaded = load_targets(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].address, targets[0].address);
        assert_eq!(loaded[0].counter, 7);
        loaded[0].public_key().unwrap();

        // A freshly authored record may omit Next entirely.
        let json = format!(
            r#"[{{"Address":"a:1","Public":"{}","Counter":0}}]"#,
            base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                secret.public_key().as_bytes()
            )
        );
        std::fs::write(&path, json).unwrap();
        assert_eq!(load_targets(&path).unwrap()[0].next, 0);
    }

    #[test]
    fn rewrite_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        sample_config().store(&path).unwrap();
        sample_config().store(&path).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("config.json")]);
    }
}
