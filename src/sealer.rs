//! ALFA Token Seal - Credential Sealer
//!
//! Ties key custody, cipher sessions, the biometric gate and blob storage
//! into the two caller flows: seal a fresh server token after password login,
//! and unseal it later behind a biometric prompt.

use std::path::Path;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::biometrics::{
    BiometricAuthenticator, BiometricCapability, BiometricGate, Completion, GateState, PromptInfo,
};
use crate::enclave::KeyCustodian;
use crate::error::{SealError, SealResult};
use crate::login::AuthenticatedPrincipal;
use crate::session::CipherSessionFactory;
use crate::store::{BlobStore, SealedBlobStore};

/// Sealer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SealerConfig {
    /// Name of the enclave key
    pub key_name: String,
    /// Storage namespace
    pub namespace: String,
    /// Storage key of the sealed wrapper
    pub blob_key: String,
    /// Prompt text
    pub prompt: PromptInfo,
}

impl Default for SealerConfig {
    fn default() -> Self {
        Self {
            key_name: "alfa_token_seal_key".into(),
            namespace: "alfa_token_seal".into(),
            blob_key: "ciphertext_wrapper".into(),
            prompt: PromptInfo::default(),
        }
    }
}

impl SealerConfig {
    /// Load from a JSON file; missing fields take defaults
    pub fn load(path: &Path) -> SealResult<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Seals and unseals one server credential
pub struct CredentialSealer {
    config: SealerConfig,
    custodian: Arc<dyn KeyCustodian>,
    sessions: CipherSessionFactory,
    gate: BiometricGate,
    store: SealedBlobStore,
}

impl CredentialSealer {
    pub fn new(
        config: SealerConfig,
        custodian: Arc<dyn KeyCustodian>,
        authenticator: Arc<dyn BiometricAuthenticator>,
        backend: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            sessions: CipherSessionFactory::new(Arc::clone(&custodian)),
            gate: BiometricGate::new(authenticator, config.prompt.clone()),
            store: SealedBlobStore::new(backend),
            custodian,
            config,
        }
    }

    pub fn config(&self) -> &SealerConfig {
        &self.config
    }

    /// True only when a biometric is enrolled and the sensor is usable
    pub fn can_use_biometrics(&self) -> bool {
        self.gate.capability() == BiometricCapability::Available
    }

    /// State of the most recent biometric challenge
    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }

    /// Whether a sealed credential is stored (corrupt data counts as stored)
    pub fn has_sealed_credential(&self) -> SealResult<bool> {
        match self.store.load(&self.config.namespace, &self.config.blob_key) {
            Ok(found) => Ok(found.is_some()),
            Err(SealError::DecodeError(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Remove the stored credential
    pub fn forget(&self) -> SealResult<()> {
        log::info!("Clearing sealed credential");
        self.store.clear(&self.config.namespace, &self.config.blob_key)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SEAL
    // ═══════════════════════════════════════════════════════════════════════

    /// Encrypt the principal's token behind a biometric prompt and store it.
    ///
    /// Nothing is written unless the prompt ends in an authorized match. The
    /// principal is dropped (and its token zeroized) on every path.
    pub async fn seal(&self, principal: AuthenticatedPrincipal) -> SealResult<Completion<()>> {
        if !self.can_use_biometrics() {
            return Err(SealError::NotEnrolled);
        }

        log::info!("Sealing credential for '{}'", principal.identity);

        let handle = self
            .custodian
            .get_or_create_key(&self.config.key_name)
            .map_err(seal_failed)?;
        let session = self.sessions.for_seal(&handle).map_err(seal_failed)?;

        let token = principal.token;
        let outcome = self
            .gate
            .authenticate(session, |authorized| {
                let wrapper = authorized.seal(token.expose_secret().as_bytes())?;
                self.store
                    .save(&self.config.namespace, &self.config.blob_key, &wrapper)
            })
            .await
            .map_err(seal_failed)?;

        if outcome.is_cancelled() {
            log::info!("Sealing cancelled by user");
        } else {
            log::info!("Credential sealed");
        }
        Ok(outcome)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // UNSEAL
    // ═══════════════════════════════════════════════════════════════════════

    /// Decrypt the stored token behind a biometric prompt and hand it to
    /// `consumer`. The plaintext is not retained after `consumer` returns.
    pub async fn unseal<T, F>(&self, consumer: F) -> SealResult<Completion<T>>
    where
        F: FnOnce(SecretString) -> T,
    {
        if !self.can_use_biometrics() {
            return Err(SealError::NotEnrolled);
        }

        let wrapper = self
            .store
            .load(&self.config.namespace, &self.config.blob_key)
            .map_err(unseal_failed)?
            .ok_or(SealError::NothingToUnseal)?;

        // A missing key means the wrapper is unrecoverable; never create one here
        let handle = self
            .custodian
            .get_key(&self.config.key_name)
            .map_err(unseal_failed)?;
        let session = self
            .sessions
            .for_unseal(&handle, &wrapper.initialization_vector)
            .map_err(unseal_failed)?;

        let outcome = self
            .gate
            .authenticate(session, |authorized| {
                let plaintext = authorized.unseal(&wrapper.ciphertext)?;
                let token = String::from_utf8(plaintext).map_err(|e| {
                    e.into_bytes().zeroize();
                    SealError::DecodeError("token is not valid UTF-8".into())
                })?;
                Ok(consumer(SecretString::new(token)))
            })
            .await
            .map_err(unseal_failed)?;

        if outcome.is_cancelled() {
            log::info!("Unsealing cancelled by user");
        } else {
            log::info!("Credential unsealed");
        }
        Ok(outcome)
    }
}

/// Wrap a seal-path failure, keeping caller-actionable preconditions bare
fn seal_failed(e: SealError) -> SealError {
    match e {
        SealError::NotEnrolled | SealError::ChallengeInProgress => e,
        other => SealError::SealFailed(Box::new(other)),
    }
}

fn unseal_failed(e: SealError) -> SealError {
    match e {
        SealError::NotEnrolled | SealError::ChallengeInProgress | SealError::NothingToUnseal => e,
        other => SealError::UnsealFailed(Box::new(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::biometrics::{FailureReason, SensorScript, SoftwareSensor};
    use crate::crypto::{SealKey, IV_LEN};
    use crate::enclave::{EnclaveConfig, SoftwareEnclave};
    use crate::store::{FileBlobStore, MemoryBlobStore, SealedWrapper};

    struct Fixture {
        enclave: Arc<SoftwareEnclave>,
        sensor: Arc<SoftwareSensor>,
        backend: Arc<MemoryBlobStore>,
        sealer: Arc<CredentialSealer>,
    }

    fn fixture() -> Fixture {
        fixture_with(EnclaveConfig::default())
    }

    fn fixture_with(config: EnclaveConfig) -> Fixture {
        let pairing = SealKey::generate();
        let enclave = Arc::new(SoftwareEnclave::new(pairing.clone(), config));
        let sensor = Arc::new(SoftwareSensor::new(pairing));
        let backend = Arc::new(MemoryBlobStore::new());
        let sealer = Arc::new(CredentialSealer::new(
            SealerConfig::default(),
            enclave.clone(),
            sensor.clone(),
            backend.clone(),
        ));
        Fixture { enclave, sensor, backend, sealer }
    }

    fn stored(f: &Fixture) -> Option<SealedWrapper> {
        SealedBlobStore::new(f.backend.clone())
            .load("alfa_token_seal", "ciphertext_wrapper")
            .unwrap()
    }

    async fn unseal_string(sealer: &CredentialSealer) -> SealResult<Completion<String>> {
        sealer
            .unseal(|token| token.expose_secret().to_string())
            .await
    }

    #[tokio::test]
    async fn test_seal_unseal_roundtrip() {
        let f = fixture();
        let outcome = f
            .sealer
            .seal(AuthenticatedPrincipal::new("alice", "server-token-abc123"))
            .await
            .unwrap();
        assert_eq!(outcome, Completion::Completed(()));

        let wrapper = stored(&f).unwrap();
        assert_eq!(wrapper.initialization_vector.len(), IV_LEN);
        assert!(!wrapper
            .ciphertext
            .windows(b"server-token-abc123".len())
            .any(|w| w == b"server-token-abc123"));

        let token = unseal_string(&f.sealer).await.unwrap();
        assert_eq!(token, Completion::Completed("server-token-abc123".to_string()));
        assert_eq!(f.sensor.prompts_shown(), 2);
    }

    #[tokio::test]
    async fn test_roundtrip_various_tokens() {
        let f = fixture();
        let long = "long".repeat(500);
        for token in ["", "x", "ünïcødé-токен", long.as_str()] {
            f.sealer
                .seal(AuthenticatedPrincipal::new("alice", token))
                .await
                .unwrap();
            let out = unseal_string(&f.sealer).await.unwrap();
            assert_eq!(out.completed().as_deref(), Some(token));
        }
    }

    #[tokio::test]
    async fn test_no_write_on_cancel_or_failure() {
        let f = fixture();
        f.sensor.script([
            SensorScript::Dismiss,
            SensorScript::Reject(FailureReason::NotRecognized),
        ]);

        let outcome = f
            .sealer
            .seal(AuthenticatedPrincipal::new("alice", "t1"))
            .await
            .unwrap();
        assert!(outcome.is_cancelled());
        assert_eq!(f.sealer.gate_state(), GateState::Cancelled);

        let result = f.sealer.seal(AuthenticatedPrincipal::new("alice", "t2")).await;
        match result {
            Err(SealError::SealFailed(cause)) => {
                assert!(matches!(*cause, SealError::BiometricFailed(FailureReason::NotRecognized)))
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert_eq!(f.backend.write_count(), 0);
        assert!(!f.sealer.has_sealed_credential().unwrap());
        assert_eq!(f.enclave.pending_operations(), 0);
    }

    #[tokio::test]
    async fn test_unseal_without_seal() {
        let f = fixture();
        let result = unseal_string(&f.sealer).await;
        assert!(matches!(result, Err(SealError::NothingToUnseal)));
        assert_eq!(f.sensor.prompts_shown(), 0);
    }

    #[tokio::test]
    async fn test_distinct_ivs_across_seals() {
        let f = fixture();
        let mut ivs = HashSet::new();

        for i in 0..32 {
            f.sealer
                .seal(AuthenticatedPrincipal::new("alice", format!("token-{}", i)))
                .await
                .unwrap();
            ivs.insert(stored(&f).unwrap().initialization_vector);
        }

        assert_eq!(ivs.len(), 32);
    }

    #[tokio::test]
    async fn test_concurrent_seal_rejected() {
        let f = fixture();
        f.sensor.script([SensorScript::Hold]);

        let sealer = f.sealer.clone();
        let first = tokio::spawn(async move {
            sealer.seal(AuthenticatedPrincipal::new("alice", "first")).await
        });

        while f.sensor.held_prompts() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.sealer.gate_state(), GateState::Prompting);

        let second = f.sealer.seal(AuthenticatedPrincipal::new("alice", "second")).await;
        assert!(matches!(second, Err(SealError::ChallengeInProgress)));
        assert_eq!(f.sensor.prompts_shown(), 1);

        f.sensor.release_held(SensorScript::Match);
        let first = first.await.unwrap().unwrap();
        assert_eq!(first, Completion::Completed(()));

        let token = unseal_string(&f.sealer).await.unwrap();
        assert_eq!(token.completed().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_not_enrolled_fails_fast() {
        let f = fixture();
        f.sensor.set_capability(BiometricCapability::NotEnrolled);

        assert!(!f.sealer.can_use_biometrics());
        assert!(matches!(
            f.sealer.seal(AuthenticatedPrincipal::new("alice", "t")).await,
            Err(SealError::NotEnrolled)
        ));
        assert!(matches!(unseal_string(&f.sealer).await, Err(SealError::NotEnrolled)));
        assert_eq!(f.sensor.prompts_shown(), 0);
    }

    #[tokio::test]
    async fn test_invalidated_key_requires_reenrollment() {
        let f = fixture();
        f.sealer
            .seal(AuthenticatedPrincipal::new("alice", "t"))
            .await
            .unwrap();
        f.enclave.invalidate_key("alfa_token_seal_key").unwrap();

        let err = unseal_string(&f.sealer).await.unwrap_err();
        assert!(matches!(err, SealError::UnsealFailed(_)));
        assert!(err.requires_reenrollment());
        assert_eq!(f.sensor.prompts_shown(), 1);

        // Recovery: drop the key and the stale wrapper, then seal again
        f.enclave.delete_key("alfa_token_seal_key").unwrap();
        f.sealer.forget().unwrap();
        f.sealer
            .seal(AuthenticatedPrincipal::new("alice", "fresh"))
            .await
            .unwrap();
        let token = unseal_string(&f.sealer).await.unwrap();
        assert_eq!(token.completed().as_deref(), Some("fresh"));
    }

    fn assert_key_lost(err: SealError) {
        assert!(matches!(err, SealError::UnsealFailed(_)));
        assert!(matches!(err.root_cause(), SealError::KeyUnavailable(_)));
        assert!(err.requires_reenrollment());
        assert!(!err.is_security_critical());
    }

    #[tokio::test]
    async fn test_slow_match_still_seals() {
        let f = fixture_with(EnclaveConfig { auth_validity_secs: 1, ..Default::default() });
        f.sensor.script([SensorScript::Hold]);

        let sealer = f.sealer.clone();
        let pending = tokio::spawn(async move {
            sealer.seal(AuthenticatedPrincipal::new("alice", "server-token-abc123")).await
        });
        while f.sensor.held_prompts() == 0 {
            tokio::task::yield_now().await;
        }

        // Prompt stays on screen longer than the authorization window
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(f.sensor.release_held(SensorScript::Match));

        let outcome = pending.await.unwrap().unwrap();
        assert_eq!(outcome, Completion::Completed(()));
        let token = unseal_string(&f.sealer).await.unwrap();
        assert_eq!(token.completed().as_deref(), Some("server-token-abc123"));
    }

    #[tokio::test]
    async fn test_deleted_key_is_key_unavailable() {
        let f = fixture();
        f.sealer
            .seal(AuthenticatedPrincipal::new("alice", "t"))
            .await
            .unwrap();
        f.enclave.delete_key("alfa_token_seal_key").unwrap();

        assert_key_lost(unseal_string(&f.sealer).await.unwrap_err());
        // Failed before prompting, and no key was created on the way
        assert_eq!(f.sensor.prompts_shown(), 1);
        assert!(f.enclave.get_key("alfa_token_seal_key").is_err());
    }

    #[tokio::test]
    async fn test_key_recreated_without_reseal_is_key_unavailable() {
        let f = fixture();
        f.sealer
            .seal(AuthenticatedPrincipal::new("alice", "t"))
            .await
            .unwrap();
        f.enclave.delete_key("alfa_token_seal_key").unwrap();

        // A cancelled re-seal creates a new key but keeps the old wrapper
        f.sensor.script([SensorScript::Dismiss]);
        let outcome = f
            .sealer
            .seal(AuthenticatedPrincipal::new("alice", "t2"))
            .await
            .unwrap();
        assert!(outcome.is_cancelled());

        assert_key_lost(unseal_string(&f.sealer).await.unwrap_err());
        assert_eq!(f.sensor.prompts_shown(), 2);

        // A completed seal recovers
        f.sealer
            .seal(AuthenticatedPrincipal::new("alice", "t3"))
            .await
            .unwrap();
        let token = unseal_string(&f.sealer).await.unwrap();
        assert_eq!(token.completed().as_deref(), Some("t3"));
    }

    #[tokio::test]
    async fn test_fresh_enclave_over_same_backend_is_key_unavailable() {
        let f = fixture();
        f.sealer
            .seal(AuthenticatedPrincipal::new("alice", "t"))
            .await
            .unwrap();

        // Restarted process with an in-memory enclave
        let pairing = SealKey::generate();
        let enclave = Arc::new(SoftwareEnclave::new(pairing.clone(), EnclaveConfig::default()));
        let sensor = Arc::new(SoftwareSensor::new(pairing));
        let restarted = CredentialSealer::new(
            SealerConfig::default(),
            enclave,
            sensor.clone(),
            f.backend.clone(),
        );

        assert!(restarted.has_sealed_credential().unwrap());
        assert_key_lost(unseal_string(&restarted).await.unwrap_err());
        assert_eq!(sensor.prompts_shown(), 0);
    }

    #[tokio::test]
    async fn test_persistent_enclave_unseals_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = EnclaveConfig {
            state_path: Some(dir.path().join("enclave.state")),
            ..Default::default()
        };

        let start = |config: EnclaveConfig| {
            let pairing = SealKey::generate();
            let enclave = Arc::new(SoftwareEnclave::open(pairing.clone(), config).unwrap());
            CredentialSealer::new(
                SealerConfig::default(),
                enclave,
                Arc::new(SoftwareSensor::new(pairing)),
                Arc::new(FileBlobStore::new(dir.path())),
            )
        };

        let first = start(config.clone());
        first
            .seal(AuthenticatedPrincipal::new("alice", "server-token-abc123"))
            .await
            .unwrap();
        drop(first);

        let second = start(config);
        let token = unseal_string(&second).await.unwrap();
        assert_eq!(token.completed().as_deref(), Some("server-token-abc123"));
    }

    #[tokio::test]
    async fn test_corrupt_wrapper_is_decode_error() {
        let f = fixture();
        f.backend
            .put_raw("alfa_token_seal", "ciphertext_wrapper", b"ALFASEAL\x01\xff\xff".to_vec());

        assert!(f.sealer.has_sealed_credential().unwrap());
        let err = unseal_string(&f.sealer).await.unwrap_err();
        match err {
            SealError::UnsealFailed(cause) => assert!(matches!(*cause, SealError::DecodeError(_))),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(f.sensor.prompts_shown(), 0);
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails_after_prompt() {
        let f = fixture();
        f.sealer
            .seal(AuthenticatedPrincipal::new("alice", "t"))
            .await
            .unwrap();

        let mut wrapper = stored(&f).unwrap();
        wrapper.ciphertext[0] ^= 0xFF;
        SealedBlobStore::new(f.backend.clone())
            .save("alfa_token_seal", "ciphertext_wrapper", &wrapper)
            .unwrap();

        let err = unseal_string(&f.sealer).await.unwrap_err();
        assert!(matches!(err.root_cause(), SealError::DecryptionFailed(_)));
    }

    #[tokio::test]
    async fn test_malformed_iv_is_invalid_iv() {
        let f = fixture();
        let wrapper = SealedWrapper {
            ciphertext: vec![0u8; 32],
            initialization_vector: vec![0u8; 4],
        };
        SealedBlobStore::new(f.backend.clone())
            .save("alfa_token_seal", "ciphertext_wrapper", &wrapper)
            .unwrap();

        let err = unseal_string(&f.sealer).await.unwrap_err();
        assert!(matches!(err.root_cause(), SealError::InvalidIv { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_unseal_keeps_wrapper() {
        let f = fixture();
        f.sealer
            .seal(AuthenticatedPrincipal::new("alice", "t"))
            .await
            .unwrap();
        f.sensor.script([SensorScript::Dismiss]);

        let mut consumed = false;
        let outcome = f.sealer.unseal(|_| consumed = true).await.unwrap();
        assert!(outcome.is_cancelled());
        assert!(!consumed);
        assert!(f.sealer.has_sealed_credential().unwrap());
    }

    #[test]
    fn test_config_defaults_and_partial_json() {
        let config: SealerConfig = serde_json::from_str(r#"{"key_name": "custom"}"#).unwrap();
        assert_eq!(config.key_name, "custom");
        assert_eq!(config.namespace, "alfa_token_seal");
        assert_eq!(config.blob_key, "ciphertext_wrapper");
    }

    #[test]
    fn test_config_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sealer.json");
        std::fs::write(&path, r#"{"namespace": "prefs", "prompt": {"title": "Unlock"}}"#).unwrap();

        let config = SealerConfig::load(&path).unwrap();
        assert_eq!(config.namespace, "prefs");
        assert_eq!(config.prompt.title, "Unlock");
        assert_eq!(config.prompt.negative_button, PromptInfo::default().negative_button);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(SealerConfig::load(&path), Err(SealError::Config(_))));
    }
}
