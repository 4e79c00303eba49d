//! Per-identity application-layer keys.
//!
//! Each identity has one active key and at most one previous key. The
//! previous key keeps decrypting inbound frames for the configured grace
//! window so frames sealed just before a rotation are not lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use srmc_crypto::{CryptoError, SecretKey};
use srmc_types::{IdentityId, KeyGrant};

use crate::config::KeyConfig;
use crate::registry::SessionRegistry;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key generation failed: {0}")]
    Generation(CryptoError),
    #[error("encryption failed: {0}")]
    Encrypt(CryptoError),
    #[error("decryption failed with active and previous keys")]
    DecryptionFailed,
}

/// A symmetric key bound to one identity.
#[derive(Debug)]
pub struct EncryptionKey {
    /// Unique across the process; changes on every rotation.
    pub epoch: u64,
    secret: SecretKey,
    pub created_at: DateTime<Utc>,
    /// When the key is scheduled to be superseded.
    pub expires_at: DateTime<Utc>,
    created: Instant,
    rotate_at: Instant,
}

impl EncryptionKey {
    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    pub fn is_due(&self) -> bool {
        Instant::now() >= self.rotate_at
    }

    /// Control-plane representation handed to the key's owner.
    pub fn grant(&self) -> KeyGrant {
        KeyGrant {
            epoch: self.epoch,
            key: self.secret.to_base64(),
            expires_at: self.expires_at,
        }
    }
}

struct KeyRing {
    active: Arc<EncryptionKey>,
    /// Superseded key and the instant it stops being accepted.
    previous: Option<(Arc<EncryptionKey>, Instant)>,
}

#[derive(Clone)]
pub struct KeyManager {
    inner: Arc<KeyManagerInner>,
}

struct KeyManagerInner {
    rings: RwLock<HashMap<IdentityId, Arc<RwLock<KeyRing>>>>,
    config: KeyConfig,
    next_epoch: AtomicU64,
}

impl KeyManager {
    pub fn new(config: KeyConfig) -> Self {
        Self {
            inner: Arc::new(KeyManagerInner {
                rings: RwLock::new(HashMap::new()),
                config,
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    fn generate(&self) -> Result<Arc<EncryptionKey>, KeyError> {
        let secret = SecretKey::generate().map_err(KeyError::Generation)?;
        let interval = self.inner.config.rotation_interval;
        let now = Instant::now();
        let created_at = Utc::now();
        Ok(Arc::new(EncryptionKey {
            epoch: self.inner.next_epoch.fetch_add(1, Ordering::Relaxed),
            secret,
            created_at,
            expires_at: chrono::Duration::from_std(interval)
                .ok()
                .and_then(|ttl| created_at.checked_add_signed(ttl))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            created: now,
            rotate_at: now + interval,
        }))
    }

    async fn ring(&self, identity: &IdentityId) -> Option<Arc<RwLock<KeyRing>>> {
        self.inner.rings.read().await.get(identity).cloned()
    }

    /// The identity's active key, generated on first use.
    pub async fn get_or_create_key(&self, identity: &IdentityId) -> Result<Arc<EncryptionKey>, KeyError> {
        if let Some(ring) = self.ring(identity).await {
            return Ok(ring.read().await.active.clone());
        }

        let mut rings = self.inner.rings.write().await;
        if let Some(ring) = rings.get(identity) {
            return Ok(ring.read().await.active.clone());
        }

        let key = self.generate()?;
        debug!("Issued key epoch {} for {}", key.epoch, identity);
        rings.insert(
            identity.clone(),
            Arc::new(RwLock::new(KeyRing {
                active: key.clone(),
                previous: None,
            })),
        );
        Ok(key)
    }

    /// Rotate if the active key is older than the rotation interval.
    /// Returns the new active key when a rotation happened.
    pub async fn rotate_if_due(&self, identity: &IdentityId) -> Result<Option<Arc<EncryptionKey>>, KeyError> {
        let Some(ring) = self.ring(identity).await else {
            return Ok(None);
        };
        let mut ring = ring.write().await;
        if !ring.active.is_due() {
            return Ok(None);
        }
        self.rotate_locked(identity, &mut ring).map(Some)
    }

    /// Rotate regardless of age. Returns `None` if the identity holds no
    /// key; an evicted identity stays evicted.
    pub async fn rotate_now(&self, identity: &IdentityId) -> Result<Option<Arc<EncryptionKey>>, KeyError> {
        let Some(ring) = self.ring(identity).await else {
            return Ok(None);
        };
        let mut ring = ring.write().await;
        self.rotate_locked(identity, &mut ring).map(Some)
    }

    fn rotate_locked(&self, identity: &IdentityId, ring: &mut KeyRing) -> Result<Arc<EncryptionKey>, KeyError> {
        let key = self.generate()?;
        let old = std::mem::replace(&mut ring.active, key.clone());
        // Any older previous key is dropped here.
        ring.previous = Some((old, Instant::now() + self.inner.config.grace_window));
        info!("Rotated key for {} to epoch {}", identity, key.epoch);
        Ok(key)
    }

    /// Decrypt with the active key, falling back to the previous key while
    /// it is inside its grace window.
    pub async fn decrypt_with_fallback(
        &self,
        identity: &IdentityId,
        frame: &[u8],
    ) -> Result<Vec<u8>, KeyError> {
        let ring = self.ring(identity).await.ok_or(KeyError::DecryptionFailed)?;
        let ring = ring.read().await;
        let aad = identity.as_bytes();

        if let Ok(plaintext) = srmc_crypto::open(ring.active.secret(), aad, frame) {
            return Ok(plaintext);
        }

        match &ring.previous {
            Some((previous, valid_until)) if Instant::now() < *valid_until => {
                let plaintext = srmc_crypto::open(previous.secret(), aad, frame)
                    .map_err(|_| KeyError::DecryptionFailed)?;
                debug!("{} frame decrypted with previous key epoch {}", identity, previous.epoch);
                Ok(plaintext)
            }
            _ => Err(KeyError::DecryptionFailed),
        }
    }

    /// Seal `plaintext` for `identity` with a specific key.
    pub fn encrypt_with(&self, identity: &IdentityId, key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>, KeyError> {
        srmc_crypto::seal(key.secret(), identity.as_bytes(), plaintext).map_err(KeyError::Encrypt)
    }

    /// Grant for the identity's active key, if it has one. Never creates a key.
    pub async fn active_grant(&self, identity: &IdentityId) -> Option<KeyGrant> {
        let ring = self.ring(identity).await?;
        let ring = ring.read().await;
        Some(ring.active.grant())
    }

    /// Drop every key held for `identity`.
    pub async fn forget(&self, identity: &IdentityId) -> bool {
        let removed = self.inner.rings.write().await.remove(identity).is_some();
        if removed {
            debug!("Forgot keys for {}", identity);
        }
        removed
    }

    pub async fn has_keys(&self, identity: &IdentityId) -> bool {
        self.inner.rings.read().await.contains_key(identity)
    }

    /// Number of keys currently held for `identity` (active + live previous).
    pub async fn key_count(&self, identity: &IdentityId) -> usize {
        let Some(ring) = self.ring(identity).await else {
            return 0;
        };
        let ring = ring.read().await;
        match &ring.previous {
            Some((_, valid_until)) if Instant::now() < *valid_until => 2,
            _ => 1,
        }
    }

    /// Drop the identity's keys unless it has live connections again.
    ///
    /// Connections register before asking for a key, so checking the
    /// registry while holding the key map's write lock cannot evict a key
    /// a new connection is about to use.
    pub async fn evict_if_idle(&self, identity: &IdentityId, registry: &SessionRegistry) -> bool {
        let mut rings = self.inner.rings.write().await;
        if !registry.connections_of(identity).await.is_empty() {
            return false;
        }
        let removed = rings.remove(identity).is_some();
        if removed {
            debug!("Forgot keys for idle {}", identity);
        }
        removed
    }
}
