//! ALFA Token Seal - Error Types

use thiserror::Error;

use crate::biometrics::FailureReason;

/// Result type for sealing operations
pub type SealResult<T> = Result<T, SealError>;

/// Sealing error types
#[derive(Error, Debug)]
pub enum SealError {
    // ═══════════════════════════════════════════════════════════════
    // ENCLAVE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Secure enclave unavailable on this device")]
    EnclaveUnavailable,

    #[error("Key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Invalid IV length: expected {expected}, got {actual}")]
    InvalidIv { expected: usize, actual: usize },

    #[error("Authorization rejected: {0}")]
    AuthorizationRejected(String),

    #[error("Authorization window expired")]
    SessionExpired,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    // ═══════════════════════════════════════════════════════════════
    // BIOMETRIC ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("No biometrics enrolled")]
    NotEnrolled,

    #[error("A biometric challenge is already in progress")]
    ChallengeInProgress,

    #[error("Biometric authentication failed: {0}")]
    BiometricFailed(FailureReason),

    // ═══════════════════════════════════════════════════════════════
    // STORAGE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Nothing sealed - no stored credential")]
    NothingToUnseal,

    #[error("Sealed wrapper could not be decoded: {0}")]
    DecodeError(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    // ═══════════════════════════════════════════════════════════════
    // FLOW ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Seal failed: {0}")]
    SealFailed(#[source] Box<SealError>),

    #[error("Unseal failed: {0}")]
    UnsealFailed(#[source] Box<SealError>),

    #[error("Login rejected: {0}")]
    LoginRejected(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SealError {
    /// Innermost cause, looking through seal/unseal wrappers
    pub fn root_cause(&self) -> &SealError {
        match self {
            SealError::SealFailed(inner) | SealError::UnsealFailed(inner) => inner.root_cause(),
            other => other,
        }
    }

    /// The enclave key is gone; the user must re-enroll (password login + seal)
    pub fn requires_reenrollment(&self) -> bool {
        matches!(self.root_cause(), SealError::KeyUnavailable(_))
    }

    /// Check if this is a security-critical error
    pub fn is_security_critical(&self) -> bool {
        matches!(
            self.root_cause(),
            SealError::AuthorizationRejected(_)
                | SealError::DecryptionFailed(_)
                | SealError::BiometricFailed(FailureReason::LockoutPermanent)
        )
    }

    /// Errors the user can resolve by acting on the prompt (retry, enroll, wait)
    pub fn is_user_recoverable(&self) -> bool {
        matches!(
            self.root_cause(),
            SealError::NotEnrolled
                | SealError::ChallengeInProgress
                | SealError::SessionExpired
                | SealError::BiometricFailed(_)
        )
    }
}

impl From<serde_json::Error> for SealError {
    fn from(e: serde_json::Error) -> Self {
        SealError::Config(e.to_string())
    }
}

impl From<bincode::Error> for SealError {
    fn from(e: bincode::Error) -> Self {
        SealError::DecodeError(e.to_string())
    }
}
