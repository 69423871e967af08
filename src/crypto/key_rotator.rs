//! Periodic key rotation and fan-out to registered handlers.
//!
//! A rotation generates, in order, a Noise static key, an envelope key and a
//! state-signing key pair, then calls every handler in registration order. The
//! first handler error aborts the rest. Keys generated before the abort keep
//! their new versions.

use crate::constants::keys::{ROTATOR_ACTOR, SYMMETRIC_KEY_LEN};
use crate::crypto::key_manager::{KeyError, KeyManager, KeyPurpose};
use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum RotationError {
    #[error("Rotation already running")]
    AlreadyRunning,
    #[error("Key generation failed: {0}")]
    Key(#[from] KeyError),
    #[error("Rotation handler {index} failed: {message}")]
    Handler { index: usize, message: String },
}

/// Fresh key set handed to every handler
pub struct RotationKeys {
    pub noise_static: Zeroizing<[u8; SYMMETRIC_KEY_LEN]>,
    pub noise_version: u32,
    pub envelope_key: Zeroizing<[u8; SYMMETRIC_KEY_LEN]>,
    pub envelope_version: u32,
    pub signing_key: VerifyingKey,
    pub signing_version: u32,
    pub rotated_at: DateTime<Utc>,
}

/// Subsystem that needs fresh key material (transports, sandboxes)
pub trait RotationHandler: Send + Sync {
    fn handle(&self, keys: &RotationKeys) -> Result<(), HandlerError>;
}

impl<F> RotationHandler for F
where
    F: Fn(&RotationKeys) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, keys: &RotationKeys) -> Result<(), HandlerError> {
        self(keys)
    }
}

/// Clears the in-flight flag on every exit path
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct KeyRotator {
    keys: Arc<KeyManager>,
    handlers: RwLock<Vec<Arc<dyn RotationHandler>>>,
    in_flight: AtomicBool,
    last_error: RwLock<Option<String>>,
    last_rotation: RwLock<Option<DateTime<Utc>>>,
    rotations: AtomicU64,
    actor: String,
}

impl KeyRotator {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self::with_actor(keys, ROTATOR_ACTOR)
    }

    /// `actor` is recorded in the key audit log for every rotation.
    pub fn with_actor(keys: Arc<KeyManager>, actor: impl Into<String>) -> Self {
        Self {
            keys,
            handlers: RwLock::new(Vec::new()),
            in_flight: AtomicBool::new(false),
            last_error: RwLock::new(None),
            last_rotation: RwLock::new(None),
            rotations: AtomicU64::new(0),
            actor: actor.into(),
        }
    }

    pub fn register(&self, handler: Arc<dyn RotationHandler>) {
        self.handlers.write().push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Runs one rotation. A call made while another is running fails with
    /// [`RotationError::AlreadyRunning`] instead of waiting.
    pub fn rotate(&self) -> Result<(), RotationError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Rotation requested while one is in flight");
            return Err(RotationError::AlreadyRunning);
        }
        let _guard = InFlight(&self.in_flight);

        match self.run() {
            Ok(keys) => {
                *self.last_error.write() = None;
                *self.last_rotation.write() = Some(keys.rotated_at);
                self.rotations.fetch_add(1, Ordering::Relaxed);
                info!(
                    "🔑 Keys rotated: noise v{}, envelope v{}, signing v{}",
                    keys.noise_version, keys.envelope_version, keys.signing_version
                );
                Ok(())
            }
            Err(e) => {
                warn!("⚠️  Key rotation failed: {}", e);
                *self.last_error.write() = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn run(&self) -> Result<RotationKeys, RotationError> {
        let (noise_version, noise_static) =
            self.keys.generate_symmetric_key(KeyPurpose::NoiseStatic, &self.actor)?;
        let (envelope_version, envelope_key) =
            self.keys.generate_symmetric_key(KeyPurpose::Envelope, &self.actor)?;
        let (signing_version, signing_key) =
            self.keys.generate_signing_key(KeyPurpose::StateSigning, &self.actor)?;

        let keys = RotationKeys {
            noise_static,
            noise_version,
            envelope_key,
            envelope_version,
            signing_key,
            signing_version,
            rotated_at: Utc::now(),
        };

        // Snapshot so handlers may register others without deadlocking
        let handlers = self.handlers.read().clone();
        for (index, handler) in handlers.iter().enumerate() {
            handler.handle(&keys).map_err(|e| RotationError::Handler {
                index,
                message: e.to_string(),
            })?;
        }
        Ok(keys)
    }

    /// Rotates every `interval` until `cancel` fires. The first rotation
    /// happens one interval after start.
    pub fn start(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Key rotator stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.rotate() {
                            debug!("Scheduled rotation skipped: {}", e);
                        }
                    }
                }
            }
        })
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn last_rotation(&self) -> Option<DateTime<Utc>> {
        *self.last_rotation.read()
    }

    /// Successful rotations since construction
    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }
}
