use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, Payload, rand_core::RngCore},
};

use crate::CryptoError;
use crate::keys::SecretKey;

pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Encrypt `plaintext` with AES-256-GCM, binding `aad` to the ciphertext.
/// Returns nonce + ciphertext + tag.
pub fn seal(key: &SecretKey, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.try_fill_bytes(&mut nonce_bytes).map_err(|_| CryptoError::Rng)?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a frame produced by [`seal`].
pub fn open(key: &SecretKey, aad: &[u8], frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if frame.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::TooShort);
    }

    let (nonce, ciphertext) = frame.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AuthFailed)
}
