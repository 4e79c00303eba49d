use std::fmt;

use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

pub const KEY_SIZE: usize = 32;

/// A 256-bit AES-GCM key. Wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    /// Generate a fresh key from the OS RNG.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut key = [0u8; KEY_SIZE];
        OsRng.try_fill_bytes(&mut key).map_err(|_| CryptoError::Rng)?;
        Ok(Self(key))
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encode the key to base64 for the control plane.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let mut bytes = BASE64
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let key: [u8; KEY_SIZE] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("expected {} bytes, got {}", KEY_SIZE, bytes.len())))?;
        bytes.zeroize();
        Ok(Self(key))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        let a = SecretKey::generate().unwrap();
        let b = SecretKey::generate().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn base64_roundtrip() {
        let key = SecretKey::generate().unwrap();
        let decoded = SecretKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn wrong_length_rejected() {
        let short = BASE64.encode([1u8; 16]);
        assert!(matches!(SecretKey::from_base64(&short), Err(CryptoError::InvalidKey(_))));
        assert!(SecretKey::from_base64("not base64!").is_err());
    }

    #[test]
    fn debug_does_not_leak() {
        let key = SecretKey::from_bytes([7u8; KEY_SIZE]);
        assert_eq!(format!("{:?}", key), "SecretKey(..)");
    }
}
