//! ALFA Token Seal - Key Material
//!
//! Zeroizing key wrapper, HKDF derivation and IV generation.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;
use secrecy::{Secret, ExposeSecret};

use crate::error::{SealError, SealResult};

/// Key length for AES-256
pub const KEY_LEN: usize = 32;

/// IV length for AES-GCM
pub const IV_LEN: usize = 12;

/// HKDF contexts for key derivation
pub mod contexts {
    /// Context for named sealing keys held by the enclave
    pub const SEALING_KEY: &[u8] = b"ALFA:SEAL:KEY:v1";
}

/// Secure key wrapper with automatic zeroization
#[derive(Clone, ZeroizeOnDrop)]
pub struct SealKey {
    #[zeroize(skip)]
    inner: Secret<[u8; KEY_LEN]>,
}

impl SealKey {
    /// Create a key from bytes
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            inner: Secret::new(bytes),
        }
    }

    /// Expose the key bytes (enclave-internal use only)
    pub(crate) fn expose(&self) -> &[u8; KEY_LEN] {
        self.inner.expose_secret()
    }

    /// Generate a random key
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::new(bytes)
    }
}

impl std::fmt::Debug for SealKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealKey([REDACTED])")
    }
}

/// Derive a key using HKDF-SHA256
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> SealResult<SealKey> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_LEN];

    hk.expand(info, &mut okm)
        .map_err(|e| SealError::KeyDerivationFailed(e.to_string()))?;

    Ok(SealKey::new(okm))
}

/// Generate a random IV for AES-GCM
pub fn generate_iv() -> [u8; IV_LEN] {
    use rand::RngCore;
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}
