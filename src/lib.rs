//! # ALFA Token Seal
//!
//! Biometric-gated sealing of server credentials.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   CREDENTIAL SEALER                      │
//! │        seal(principal)   unseal(consumer)                │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────┐  │
//! │  │  BIOMETRIC  │  │   CIPHER    │  │  SEALED BLOB    │  │
//! │  │  GATE       │  │   SESSIONS  │  │  STORE          │  │
//! │  └──────┬──────┘  └──────┬──────┘  └─────────────────┘  │
//! │         │                │                               │
//! │  ┌──────┴────────────────┴────────────────────────────┐ │
//! │  │            KEY CUSTODIAN (ENCLAVE)                  │ │
//! │  │   AES-256-GCM · auth tokens · keys never exported   │ │
//! │  └─────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - Sealing keys never leave the enclave
//! - Cipher sessions are bound before the prompt and unusable until the
//!   enclave accepts a sensor token for that exact session
//! - Fresh random IV per seal, reuse refused by the enclave
//! - Nothing is written on a cancelled or failed prompt
//! - Plaintext tokens are zeroized after use and never logged

pub mod crypto;
pub mod enclave;
pub mod session;
pub mod biometrics;
pub mod store;
pub mod login;
pub mod sealer;
pub mod error;

pub use error::{SealError, SealResult};
pub use crypto::{AuthToken, SealKey};
pub use enclave::{EnclaveConfig, KeyCustodian, Purpose, SecureKeyHandle, SoftwareEnclave};
pub use session::{AuthorizedSession, CipherSession, CipherSessionFactory};
pub use biometrics::{
    BiometricAuthenticator, BiometricCapability, BiometricGate, Completion, FailureReason,
    GateState, PendingChallenge, PromptInfo, PromptRequest, PromptResult, SensorPolicy, SensorScript,
    SoftwareSensor,
};
pub use store::{BlobStore, FileBlobStore, MemoryBlobStore, SealedBlobStore, SealedWrapper};
pub use login::{AuthenticatedPrincipal, DemoLoginSource, PasswordLogin};
pub use sealer::{CredentialSealer, SealerConfig};

/// ALFA Token Seal version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
