/// SRMC Crypto Library
///
/// Application-layer confidentiality envelope, independent of the TLS
/// transport: one AES-256-GCM key per identity, random 96-bit nonce per frame,
/// identity id bound as associated data.
///
/// Frame layout: nonce(12) + ciphertext + GCM tag(16)
pub mod encrypt;
pub mod keys;

pub use encrypt::{NONCE_SIZE, TAG_SIZE, open, seal};
pub use keys::{KEY_SIZE, SecretKey};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("random number generator failure")]
    Rng,
    #[error("encryption failed")]
    Encrypt,
    #[error("encrypted frame too short")]
    TooShort,
    #[error("GCM authentication failed: data corrupted, tampered or wrong key")]
    AuthFailed,
    #[error("invalid key encoding: {0}")]
    InvalidKey(String),
}
