//! ALFA Token Seal - Cipher Sessions
//!
//! A [`CipherSession`] is bound to a key and an IV before the user is
//! prompted, but it cannot encrypt or decrypt anything. Only the biometric
//! gate turns it into an [`AuthorizedSession`].

use std::fmt;
use std::sync::Arc;

use crate::crypto::{generate_iv, AuthToken, IV_LEN};
use crate::enclave::{KeyCustodian, Purpose, SecureKeyHandle};
use crate::error::{SealError, SealResult};
use crate::store::SealedWrapper;

/// Produces one-shot cipher sessions bound to custodian keys
#[derive(Clone)]
pub struct CipherSessionFactory {
    custodian: Arc<dyn KeyCustodian>,
}

impl CipherSessionFactory {
    pub fn new(custodian: Arc<dyn KeyCustodian>) -> Self {
        Self { custodian }
    }

    /// Bind an encrypt session with a freshly generated IV
    pub fn for_seal(&self, handle: &SecureKeyHandle) -> SealResult<CipherSession> {
        let iv = generate_iv().to_vec();
        self.bind(handle, Purpose::Seal, iv)
    }

    /// Bind a decrypt session to the IV stored alongside the ciphertext
    pub fn for_unseal(&self, handle: &SecureKeyHandle, iv: &[u8]) -> SealResult<CipherSession> {
        if iv.len() != IV_LEN {
            return Err(SealError::InvalidIv { expected: IV_LEN, actual: iv.len() });
        }
        self.bind(handle, Purpose::Unseal, iv.to_vec())
    }

    fn bind(&self, handle: &SecureKeyHandle, purpose: Purpose, iv: Vec<u8>) -> SealResult<CipherSession> {
        let operation = self.custodian.begin(handle, purpose, &iv)?;
        Ok(CipherSession {
            custodian: Arc::clone(&self.custodian),
            operation,
            purpose,
            iv,
            key_name: handle.name().to_string(),
            finished: false,
        })
    }
}

/// An unauthorized, single-use cipher operation
pub struct CipherSession {
    custodian: Arc<dyn KeyCustodian>,
    operation: u64,
    purpose: Purpose,
    iv: Vec<u8>,
    key_name: String,
    finished: bool,
}

impl CipherSession {
    /// Challenge a sensor must sign to authorize this session
    pub fn challenge(&self) -> u64 {
        self.operation
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// Present a sensor token to the enclave. Only the biometric gate calls this.
    pub(crate) fn authorize(self, token: &AuthToken) -> SealResult<AuthorizedSession> {
        self.custodian.authorize(self.operation, token)?;
        Ok(AuthorizedSession { session: self })
    }

    fn run(mut self, input: &[u8]) -> SealResult<Vec<u8>> {
        self.finished = true;
        self.custodian.finish(self.operation, input)
    }
}

impl Drop for CipherSession {
    fn drop(&mut self) {
        if !self.finished {
            self.custodian.abort(self.operation);
        }
    }
}

impl fmt::Debug for CipherSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSession")
            .field("key_name", &self.key_name)
            .field("purpose", &self.purpose)
            .field("iv_len", &self.iv.len())
            .finish()
    }
}

/// A session the enclave has authorized. Consumed by its single operation.
#[derive(Debug)]
pub struct AuthorizedSession {
    session: CipherSession,
}

impl AuthorizedSession {
    pub fn purpose(&self) -> Purpose {
        self.session.purpose
    }

    /// Encrypt `plaintext` and wrap it with the session IV
    pub fn seal(self, plaintext: &[u8]) -> SealResult<SealedWrapper> {
        if self.session.purpose != Purpose::Seal {
            return Err(SealError::EncryptionFailed("session was bound for unsealing".into()));
        }
        let initialization_vector = self.session.iv.clone();
        let ciphertext = self.session.run(plaintext)?;
        Ok(SealedWrapper { ciphertext, initialization_vector })
    }

    /// Decrypt a wrapper's ciphertext
    pub fn unseal(self, ciphertext: &[u8]) -> SealResult<Vec<u8>> {
        if self.session.purpose != Purpose::Unseal {
            return Err(SealError::DecryptionFailed("session was bound for sealing".into()));
        }
        self.session.run(ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SealKey;
    use crate::enclave::{EnclaveConfig, SoftwareEnclave};

    fn setup() -> (Arc<SoftwareEnclave>, CipherSessionFactory, SealKey) {
        let pairing = SealKey::generate();
        let enclave = Arc::new(SoftwareEnclave::new(pairing.clone(), EnclaveConfig::default()));
        let factory = CipherSessionFactory::new(enclave.clone());
        (enclave, factory, pairing)
    }

    #[test]
    fn test_for_seal_generates_fresh_iv() {
        let (enclave, factory, _) = setup();
        let handle = enclave.get_or_create_key("login").unwrap();

        let s1 = factory.for_seal(&handle).unwrap();
        let s2 = factory.for_seal(&handle).unwrap();
        assert_eq!(s1.iv().len(), IV_LEN);
        assert_ne!(s1.iv(), s2.iv());
        assert_ne!(s1.challenge(), s2.challenge());
    }

    #[test]
    fn test_for_unseal_rejects_malformed_iv() {
        let (enclave, factory, _) = setup();
        let handle = enclave.get_or_create_key("login").unwrap();

        let result = factory.for_unseal(&handle, &[0u8; 5]);
        assert!(matches!(result, Err(SealError::InvalidIv { expected: 12, actual: 5 })));
    }

    #[test]
    fn test_invalidated_key_is_unavailable() {
        let (enclave, factory, _) = setup();
        let handle = enclave.get_or_create_key("login").unwrap();
        enclave.invalidate_key("login").unwrap();

        assert!(matches!(factory.for_seal(&handle), Err(SealError::KeyUnavailable(_))));
        assert!(matches!(
            factory.for_unseal(&handle, &[0u8; IV_LEN]),
            Err(SealError::KeyUnavailable(_))
        ));
    }

    #[test]
    fn test_dropped_session_aborts_operation() {
        let (enclave, factory, _) = setup();
        let handle = enclave.get_or_create_key("login").unwrap();

        let session = factory.for_seal(&handle).unwrap();
        assert_eq!(enclave.pending_operations(), 1);
        drop(session);
        assert_eq!(enclave.pending_operations(), 0);
    }

    #[test]
    fn test_authorized_roundtrip() {
        let (enclave, factory, pairing) = setup();
        let handle = enclave.get_or_create_key("login").unwrap();

        let session = factory.for_seal(&handle).unwrap();
        let token = AuthToken::issue(&pairing, session.challenge(), 1);
        let wrapper = session.authorize(&token).unwrap().seal(b"token").unwrap();

        let session = factory.for_unseal(&handle, &wrapper.initialization_vector).unwrap();
        let token = AuthToken::issue(&pairing, session.challenge(), 1);
        let plaintext = session.authorize(&token).unwrap().unseal(&wrapper.ciphertext).unwrap();
        assert_eq!(plaintext, b"token");
    }

    #[test]
    fn test_purpose_mismatch() {
        let (enclave, factory, pairing) = setup();
        let handle = enclave.get_or_create_key("login").unwrap();

        let session = factory.for_seal(&handle).unwrap();
        let token = AuthToken::issue(&pairing, session.challenge(), 1);
        assert!(session.authorize(&token).unwrap().unseal(b"x").is_err());
        assert_eq!(enclave.pending_operations(), 0);
    }

    #[test]
    fn test_forged_authorization_rejected() {
        let (enclave, factory, _) = setup();
        let handle = enclave.get_or_create_key("login").unwrap();

        let session = factory.for_seal(&handle).unwrap();
        let forged = AuthToken::issue(&SealKey::generate(), session.challenge(), 1);
        assert!(matches!(session.authorize(&forged), Err(SealError::AuthorizationRejected(_))));
        assert_eq!(enclave.pending_operations(), 0);
    }
}
