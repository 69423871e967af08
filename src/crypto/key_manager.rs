//! Versioned, purpose-namespaced key store with an append-only audit trail.
//!
//! Symmetric keys (32 bytes) and Ed25519 signing keys are kept per
//! [`KeyPurpose`]. Each purpose carries one version counter shared by both
//! kinds of material, so a version number is never issued twice for a purpose.
//! Randomness comes from an injectable [`EntropySource`] and signing keys from
//! a [`SigningKeyFactory`], which lets tests run deterministically.

use crate::constants::keys::{DEFAULT_ACTOR, SYMMETRIC_KEY_LEN};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("Stale version {requested} for {purpose} (current {current})")]
    StaleVersion {
        purpose: KeyPurpose,
        requested: u32,
        current: u32,
    },
    #[error("No signing key for {0}")]
    MissingSigningKey(KeyPurpose),
    #[error("Signature verification failed")]
    SignatureInvalid,
    #[error("Entropy source failure: {0}")]
    Entropy(String),
    #[error("Version space exhausted for {0}")]
    VersionExhausted(KeyPurpose),
}

/// Named uses of key material. External subsystems must request one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyPurpose {
    NoiseStatic,
    NoiseEphemeral,
    Tls,
    Envelope,
    StateSigning,
}

impl KeyPurpose {
    pub const ALL: [KeyPurpose; 5] = [
        KeyPurpose::NoiseStatic,
        KeyPurpose::NoiseEphemeral,
        KeyPurpose::Tls,
        KeyPurpose::Envelope,
        KeyPurpose::StateSigning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyPurpose::NoiseStatic => "noise-static",
            KeyPurpose::NoiseEphemeral => "noise-ephemeral",
            KeyPurpose::Tls => "tls",
            KeyPurpose::Envelope => "envelope",
            KeyPurpose::StateSigning => "state-signing",
        }
    }
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One generation or rotation event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub purpose: KeyPurpose,
    pub version: u32,
    pub rotated_at: DateTime<Utc>,
    pub actor: String,
}

/// Source of key bytes
pub trait EntropySource: Send + Sync {
    fn fill(&self, dest: &mut [u8]) -> Result<(), KeyError>;
}

/// Operating-system randomness
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, dest: &mut [u8]) -> Result<(), KeyError> {
        OsRng
            .try_fill_bytes(dest)
            .map_err(|e| KeyError::Entropy(e.to_string()))
    }
}

/// Produces Ed25519 key pairs
pub trait SigningKeyFactory: Send + Sync {
    fn generate(&self, entropy: &dyn EntropySource) -> Result<SigningKey, KeyError>;
}

/// Derives the signing seed from the manager's entropy source
#[derive(Debug, Default, Clone, Copy)]
pub struct SeedSigningKeyFactory;

impl SigningKeyFactory for SeedSigningKeyFactory {
    fn generate(&self, entropy: &dyn EntropySource) -> Result<SigningKey, KeyError> {
        let mut seed = Zeroizing::new([0u8; 32]);
        entropy.fill(&mut seed[..])?;
        Ok(SigningKey::from_bytes(&seed))
    }
}

struct SymmetricRecord {
    version: u32,
    material: Zeroizing<[u8; SYMMETRIC_KEY_LEN]>,
}

struct SigningRecord {
    version: u32,
    key: SigningKey,
}

#[derive(Default)]
struct KeyStore {
    versions: HashMap<KeyPurpose, u32>,
    symmetric: HashMap<KeyPurpose, SymmetricRecord>,
    signing: HashMap<KeyPurpose, SigningRecord>,
    audit: Vec<AuditEntry>,
}

impl KeyStore {
    fn current_version(&self, purpose: KeyPurpose) -> u32 {
        self.versions.get(&purpose).copied().unwrap_or(0)
    }

    fn next_version(&mut self, purpose: KeyPurpose) -> Result<u32, KeyError> {
        let next = self
            .current_version(purpose)
            .checked_add(1)
            .ok_or(KeyError::VersionExhausted(purpose))?;
        self.versions.insert(purpose, next);
        Ok(next)
    }

    fn record(&mut self, purpose: KeyPurpose, version: u32, actor: &str) {
        let actor = if actor.is_empty() { DEFAULT_ACTOR } else { actor };
        self.audit.push(AuditEntry {
            purpose,
            version,
            rotated_at: Utc::now(),
            actor: actor.to_string(),
        });
    }
}

/// Single source of truth for symmetric and signing key material
pub struct KeyManager {
    entropy: Arc<dyn EntropySource>,
    factory: Arc<dyn SigningKeyFactory>,
    store: RwLock<KeyStore>,
}

impl KeyManager {
    pub fn new() -> Self {
        Self::with_sources(Arc::new(OsEntropy), Arc::new(SeedSigningKeyFactory))
    }

    pub fn with_sources(
        entropy: Arc<dyn EntropySource>,
        factory: Arc<dyn SigningKeyFactory>,
    ) -> Self {
        Self {
            entropy,
            factory,
            store: RwLock::new(KeyStore::default()),
        }
    }

    /// Draws a fresh 32-byte key for `purpose` and stores it as the next version.
    pub fn generate_symmetric_key(
        &self,
        purpose: KeyPurpose,
        actor: &str,
    ) -> Result<(u32, Zeroizing<[u8; SYMMETRIC_KEY_LEN]>), KeyError> {
        let mut material = Zeroizing::new([0u8; SYMMETRIC_KEY_LEN]);
        self.entropy.fill(&mut material[..])?;

        let mut store = self.store.write();
        let version = store.next_version(purpose)?;
        store.symmetric.insert(
            purpose,
            SymmetricRecord {
                version,
                material: material.clone(),
            },
        );
        store.record(purpose, version, actor);
        debug!("🔑 Generated {} key v{}", purpose, version);

        Ok((version, material))
    }

    /// Installs externally recovered key material. `None` takes the next version;
    /// an explicit version must be greater than the current one.
    pub fn set_symmetric_key(
        &self,
        purpose: KeyPurpose,
        material: &[u8],
        actor: &str,
        version: Option<u32>,
    ) -> Result<u32, KeyError> {
        let bytes: [u8; SYMMETRIC_KEY_LEN] =
            material
                .try_into()
                .map_err(|_| KeyError::InvalidKeyLength {
                    expected: SYMMETRIC_KEY_LEN,
                    actual: material.len(),
                })?;

        let mut store = self.store.write();
        let current = store.current_version(purpose);
        let version = match version {
            Some(v) if v > 0 => {
                if v <= current {
                    return Err(KeyError::StaleVersion {
                        purpose,
                        requested: v,
                        current,
                    });
                }
                store.versions.insert(purpose, v);
                v
            }
            _ => store.next_version(purpose)?,
        };
        store.symmetric.insert(
            purpose,
            SymmetricRecord {
                version,
                material: Zeroizing::new(bytes),
            },
        );
        store.record(purpose, version, actor);
        debug!("🔑 Installed {} key v{}", purpose, version);

        Ok(version)
    }

    /// Current symmetric key for `purpose`, copied out.
    pub fn symmetric_key(
        &self,
        purpose: KeyPurpose,
    ) -> Option<(u32, Zeroizing<[u8; SYMMETRIC_KEY_LEN]>)> {
        self.store
            .read()
            .symmetric
            .get(&purpose)
            .map(|rec| (rec.version, rec.material.clone()))
    }

    /// Generates a new Ed25519 key pair for `purpose`; returns the public half.
    pub fn generate_signing_key(
        &self,
        purpose: KeyPurpose,
        actor: &str,
    ) -> Result<(u32, VerifyingKey), KeyError> {
        let key = self.factory.generate(self.entropy.as_ref())?;
        let public = key.verifying_key();

        let mut store = self.store.write();
        let version = store.next_version(purpose)?;
        store.signing.insert(purpose, SigningRecord { version, key });
        store.record(purpose, version, actor);
        debug!("🔑 Generated {} signing key v{}", purpose, version);

        Ok((version, public))
    }

    /// Current public signing key for `purpose`.
    pub fn signing_key(&self, purpose: KeyPurpose) -> Option<(u32, VerifyingKey)> {
        self.store
            .read()
            .signing
            .get(&purpose)
            .map(|rec| (rec.version, rec.key.verifying_key()))
    }

    pub fn sign(&self, purpose: KeyPurpose, message: &[u8]) -> Result<Signature, KeyError> {
        let store = self.store.read();
        let record = store
            .signing
            .get(&purpose)
            .ok_or(KeyError::MissingSigningKey(purpose))?;
        Ok(record.key.sign(message))
    }

    /// Verifies against `public`, or the stored key for `purpose` when `None`.
    pub fn verify(
        &self,
        purpose: KeyPurpose,
        message: &[u8],
        signature: &Signature,
        public: Option<&VerifyingKey>,
    ) -> Result<(), KeyError> {
        let public = match public {
            Some(key) => *key,
            None => {
                self.signing_key(purpose)
                    .ok_or(KeyError::MissingSigningKey(purpose))?
                    .1
            }
        };
        public
            .verify(message, signature)
            .map_err(|_| KeyError::SignatureInvalid)
    }

    pub fn current_version(&self, purpose: KeyPurpose) -> u32 {
        self.store.read().current_version(purpose)
    }

    /// Every generation/rotation event since construction, oldest first.
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.store.read().audit.clone()
    }
}

impl Default for KeyManager {
    fn default() -> Self {
        Self::new()
    }
}
