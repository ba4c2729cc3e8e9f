//! ALFA Token Seal - AEAD Encryption
//!
//! AES-256-GCM with caller-supplied IV. The IV is chosen by the session
//! factory before the user is prompted, so encryption cannot generate it.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};

use super::keys::{SealKey, IV_LEN};
use crate::error::{SealError, SealResult};

/// Encrypt `plaintext` under `key` with the given IV, binding `aad`
pub fn encrypt_aes_gcm(key: &SealKey, iv: &[u8], plaintext: &[u8], aad: &[u8]) -> SealResult<Vec<u8>> {
    if iv.len() != IV_LEN {
        return Err(SealError::InvalidIv { expected: IV_LEN, actual: iv.len() });
    }

    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| SealError::EncryptionFailed(e.to_string()))?;

    cipher
        .encrypt(Nonce::from_slice(iv), Payload { msg: plaintext, aad })
        .map_err(|e| SealError::EncryptionFailed(e.to_string()))
}

/// Decrypt `ciphertext` (with trailing GCM tag) under `key`
pub fn decrypt_aes_gcm(key: &SealKey, iv: &[u8], ciphertext: &[u8], aad: &[u8]) -> SealResult<Vec<u8>> {
    if iv.len() != IV_LEN {
        return Err(SealError::InvalidIv { expected: IV_LEN, actual: iv.len() });
    }

    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| SealError::DecryptionFailed(e.to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(iv), Payload { msg: ciphertext, aad })
        .map_err(|_| SealError::DecryptionFailed("Authentication failed".into()))
}
