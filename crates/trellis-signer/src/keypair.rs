//! CA key material sources.
//!
//! The controller never holds CA material; it polls a [`KeyPairSource`] on
//! every signing attempt, so rotation is observed on the next read without
//! coordination. The file-backed source re-reads its files per call, which
//! is what makes hot-reload work.

use std::path::PathBuf;
use std::sync::RwLock;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, KeyPair,
    KeyUsagePurpose,
};
use thiserror::Error;

/// Errors reading or producing CA material.
#[derive(Debug, Error)]
pub enum KeyPairError {
    /// A backing file could not be read.
    #[error("while reading {path}: {source}")]
    Io {
        /// Path of the unreadable file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Key or certificate generation failed.
    #[error("while generating CA material: {0}")]
    Generation(String),
}

/// One CA certificate/key pair, both PEM-encoded.
#[derive(Clone, Debug)]
pub struct CaKeyPair {
    /// PEM-encoded CA certificate.
    pub cert_pem: String,
    /// PEM-encoded CA private key.
    pub key_pem: String,
}

impl CaKeyPair {
    /// Generate a fresh self-signed CA, mostly useful for tests and
    /// bootstrap tooling.
    pub fn self_signed(common_name: &str) -> Result<Self, KeyPairError> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key_pair = KeyPair::generate()
            .map_err(|e| KeyPairError::Generation(format!("failed to generate CA key: {}", e)))?;
        let key_pem = key_pair.serialize_pem();

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| KeyPairError::Generation(format!("failed to create CA cert: {}", e)))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem,
        })
    }
}

/// Atomic accessor for the current CA pair.
pub trait KeyPairSource: Send + Sync {
    /// The current `(certPEM, keyPEM)` pair.
    fn current(&self) -> Result<CaKeyPair, KeyPairError>;
}

/// Fixed (but replaceable) in-memory CA material.
pub struct StaticKeyPairSource {
    pair: RwLock<CaKeyPair>,
}

impl StaticKeyPairSource {
    /// A source serving the given pair.
    pub fn new(pair: CaKeyPair) -> Self {
        Self {
            pair: RwLock::new(pair),
        }
    }

    /// Swap in new material; observed by the next [`KeyPairSource::current`].
    pub fn replace(&self, pair: CaKeyPair) {
        *self.pair.write().expect("key pair lock poisoned") = pair;
    }
}

impl KeyPairSource for StaticKeyPairSource {
    fn current(&self) -> Result<CaKeyPair, KeyPairError> {
        Ok(self.pair.read().expect("key pair lock poisoned").clone())
    }
}

/// CA material backed by PEM files on disk, re-read on every call.
pub struct FileKeyPairSource {
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl FileKeyPairSource {
    /// A source reading from the given certificate and key files.
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

impl KeyPairSource for FileKeyPairSource {
    fn current(&self) -> Result<CaKeyPair, KeyPairError> {
        let read = |path: &PathBuf| {
            std::fs::read_to_string(path).map_err(|source| KeyPairError::Io {
                path: path.display().to_string(),
                source,
            })
        };
        Ok(CaKeyPair {
            cert_pem: read(&self.cert_path)?,
            key_pem: read(&self.key_path)?,
        })
    }
}
