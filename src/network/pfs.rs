//! Forward-secret message envelopes.
//!
//! Every `encrypt` call draws a fresh X25519 ephemeral key, agrees a secret with
//! the registered remote static key, expands it with HKDF-SHA256 and seals the
//! message with XChaCha20-Poly1305 under a random nonce:
//!
//! ```text
//! version(1) || ephemeral pubkey(32) || nonce(24) || ciphertext || tag(16)
//! ```
//!
//! Envelopes carry no sequence number; replay and ordering checks belong to
//! the caller.

use crate::constants::transport::{
    AEAD_TAG_LEN, PFS_CONTEXT, PFS_HEADER_LEN, PFS_VERSION, X25519_KEY_LEN, XNONCE_LEN,
};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PfsError {
    #[error("Remote public key not set")]
    MissingRemoteKey,
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("Plaintext is empty")]
    EmptyPlaintext,
    #[error("Envelope too short: {0} bytes")]
    TooShort(usize),
    #[error("Unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("Non-contributory key agreement")]
    WeakKey,
    #[error("Encryption failed")]
    Encryption,
    #[error("Decryption failed")]
    Decryption,
}

/// Per-message forward-secret cipher between one local and one remote static key
pub struct PfsChannel {
    local: StaticSecret,
    local_public: PublicKey,
    remote: RwLock<Option<PublicKey>>,
}

impl PfsChannel {
    pub fn new(local_private: [u8; 32]) -> Self {
        let local = StaticSecret::from(local_private);
        let local_public = PublicKey::from(&local);
        Self {
            local,
            local_public,
            remote: RwLock::new(None),
        }
    }

    pub fn generate() -> Self {
        let local = StaticSecret::random_from_rng(OsRng);
        let local_public = PublicKey::from(&local);
        Self {
            local,
            local_public,
            remote: RwLock::new(None),
        }
    }

    pub fn local_public_key(&self) -> [u8; 32] {
        *self.local_public.as_bytes()
    }

    pub fn remote_public_key(&self) -> Option<[u8; 32]> {
        self.remote.read().map(|key| *key.as_bytes())
    }

    pub fn set_remote_public_key(&self, key: &[u8]) -> Result<(), PfsError> {
        let bytes: [u8; X25519_KEY_LEN] = key.try_into().map_err(|_| PfsError::InvalidKeyLength {
            expected: X25519_KEY_LEN,
            actual: key.len(),
        })?;
        *self.remote.write() = Some(PublicKey::from(bytes));
        Ok(())
    }

    /// Seals `plaintext` for the remote key, binding `aad`.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, PfsError> {
        if plaintext.is_empty() {
            return Err(PfsError::EmptyPlaintext);
        }
        let remote = (*self.remote.read()).ok_or(PfsError::MissingRemoteKey)?;

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let cipher = derive_cipher(ephemeral.diffie_hellman(&remote))?;

        let mut nonce = [0u8; XNONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = cipher
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| PfsError::Encryption)?;

        let mut out = Vec::with_capacity(PFS_HEADER_LEN + sealed.len());
        out.push(PFS_VERSION);
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Opens an envelope addressed to the local static key.
    pub fn decrypt(&self, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, PfsError> {
        if envelope.len() < PFS_HEADER_LEN + AEAD_TAG_LEN {
            return Err(PfsError::TooShort(envelope.len()));
        }
        if envelope[0] != PFS_VERSION {
            return Err(PfsError::UnsupportedVersion(envelope[0]));
        }

        let (ephemeral, rest) = envelope[1..].split_at(X25519_KEY_LEN);
        let (nonce, sealed) = rest.split_at(XNONCE_LEN);

        let mut ephemeral_bytes = [0u8; X25519_KEY_LEN];
        ephemeral_bytes.copy_from_slice(ephemeral);
        let cipher = derive_cipher(self.local.diffie_hellman(&PublicKey::from(ephemeral_bytes)))
            .map_err(|_| PfsError::Decryption)?;

        cipher
            .decrypt(XNonce::from_slice(nonce), Payload { msg: sealed, aad })
            .map_err(|_| PfsError::Decryption)
    }

    /// SHA-256 over both static public keys in sorted order, identical on both ends.
    pub fn session_fingerprint(&self) -> Result<[u8; 32], PfsError> {
        let remote = (*self.remote.read()).ok_or(PfsError::MissingRemoteKey)?;
        let local = self.local_public.as_bytes();
        let remote = remote.as_bytes();
        let (first, second) = if local <= remote { (local, remote) } else { (remote, local) };

        let mut hasher = Sha256::new();
        hasher.update(first);
        hasher.update(second);
        Ok(hasher.finalize().into())
    }
}

fn derive_cipher(shared: SharedSecret) -> Result<XChaCha20Poly1305, PfsError> {
    if !shared.was_contributory() {
        return Err(PfsError::WeakKey);
    }
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(PFS_CONTEXT, &mut key[..])
        .map_err(|_| PfsError::Encryption)?;
    XChaCha20Poly1305::new_from_slice(&key[..]).map_err(|_| PfsError::Encryption)
}
