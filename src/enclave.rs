//! ALFA Token Seal - Key Custody
//!
//! The enclave owns every sealing key. Callers only ever see a
//! [`SecureKeyHandle`]; encryption and decryption run inside the enclave and
//! only after a valid [`AuthToken`] for the pending operation is presented.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::crypto::{
    contexts, decrypt_aes_gcm, derive_key, encrypt_aes_gcm, AuthToken, SealKey, IV_LEN, KEY_LEN,
};
use crate::error::{SealError, SealResult};
use crate::store::write_atomic;

/// Direction of a cipher operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Encrypt a fresh credential
    Seal,
    /// Decrypt a stored credential
    Unseal,
}

/// Opaque reference to a key held by the enclave
#[derive(Clone, PartialEq, Eq)]
pub struct SecureKeyHandle {
    name: String,
    key_id: Uuid,
}

impl SecureKeyHandle {
    /// Stable key name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity of the key instance behind the name
    pub fn key_id(&self) -> Uuid {
        self.key_id
    }
}

impl fmt::Debug for SecureKeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureKeyHandle({}, {})", self.name, self.key_id)
    }
}

/// Enclave configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclaveConfig {
    /// Refuse to create keys unless the backend is hardware-backed
    pub require_hardware: bool,
    /// How long a biometric match stays usable (seconds)
    pub auth_validity_secs: u64,
    /// Where [`SoftwareEnclave::open`] keeps its root secret and key table
    pub state_path: Option<PathBuf>,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            require_hardware: false,
            auth_validity_secs: 30,
            state_path: None,
        }
    }
}

/// Secure key storage. Implementations never expose raw key bytes.
pub trait KeyCustodian: Send + Sync {
    /// Return the key named `name`, creating it on first use
    fn get_or_create_key(&self, name: &str) -> SealResult<SecureKeyHandle>;

    /// Return the existing key named `name`. `KeyUnavailable` if there is none.
    fn get_key(&self, name: &str) -> SealResult<SecureKeyHandle>;

    /// Bind an unauthorized operation to `handle` and `iv`.
    /// Returns the operation challenge a sensor must sign.
    fn begin(&self, handle: &SecureKeyHandle, purpose: Purpose, iv: &[u8]) -> SealResult<u64>;

    /// Verify a sensor token against a pending operation and unlock it.
    /// A rejected token burns the operation.
    fn authorize(&self, operation: u64, token: &AuthToken) -> SealResult<()>;

    /// Run an authorized operation. The operation is consumed whatever the outcome.
    fn finish(&self, operation: u64, input: &[u8]) -> SealResult<Vec<u8>>;

    /// Drop a pending operation without running it
    fn abort(&self, operation: u64);

    /// Whether key material lives in dedicated secure hardware
    fn is_hardware_backed(&self) -> bool;
}

// ═══════════════════════════════════════════════════════════════════════════
// SOFTWARE ENCLAVE
// ═══════════════════════════════════════════════════════════════════════════

/// Magic bytes of a persisted enclave state file
const STATE_MAGIC: &[u8; 8] = b"ALFAENCL";

/// Current state file version
const STATE_VERSION: u8 = 0x01;

/// Header size: MAGIC(8) + VERSION(1)
const STATE_HEADER_SIZE: usize = 8 + 1;

struct KeySlot {
    key_id: Uuid,
    key: SealKey,
    invalidated: bool,
    used_ivs: HashSet<[u8; IV_LEN]>,
}

struct PendingOperation {
    name: String,
    key_id: Uuid,
    purpose: Purpose,
    iv: [u8; IV_LEN],
    authorized_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct PersistedSlot {
    name: String,
    key_id: Uuid,
    invalidated: bool,
    used_ivs: Vec<[u8; IV_LEN]>,
}

/// On-disk form: the root secret plus key identities. Key bytes are re-derived.
#[derive(Serialize, Deserialize, ZeroizeOnDrop)]
struct PersistedState {
    root: [u8; KEY_LEN],
    #[zeroize(skip)]
    slots: Vec<PersistedSlot>,
}

/// In-process enclave for desktop builds and tests.
///
/// Sealing keys are derived from a per-device root secret with HKDF. An
/// enclave built with [`SoftwareEnclave::new`] keeps everything in memory, so
/// a restart makes stored wrappers unreadable. [`SoftwareEnclave::open`]
/// keeps the root secret and key table in `EnclaveConfig::state_path`.
pub struct SoftwareEnclave {
    root: SealKey,
    pairing_key: SealKey,
    config: EnclaveConfig,
    state_path: Option<PathBuf>,
    slots: RwLock<HashMap<String, KeySlot>>,
    pending: Mutex<HashMap<u64, PendingOperation>>,
}

impl SoftwareEnclave {
    /// Create an in-memory enclave that accepts tokens signed with `pairing_key`
    pub fn new(pairing_key: SealKey, config: EnclaveConfig) -> Self {
        Self {
            root: SealKey::generate(),
            pairing_key,
            config,
            state_path: None,
            slots: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Load the enclave kept at `config.state_path`, creating it if the file
    /// does not exist. Without a state path this is [`SoftwareEnclave::new`].
    pub fn open(pairing_key: SealKey, config: EnclaveConfig) -> SealResult<Self> {
        let path = match config.state_path.clone() {
            Some(path) => path,
            None => return Ok(Self::new(pairing_key, config)),
        };

        match Self::load_state(&path)? {
            Some(state) => {
                let root = SealKey::new(state.root);
                let mut slots = HashMap::new();
                for persisted in &state.slots {
                    slots.insert(
                        persisted.name.clone(),
                        KeySlot {
                            key_id: persisted.key_id,
                            key: Self::slot_key(&root, &persisted.name, persisted.key_id)?,
                            invalidated: persisted.invalidated,
                            used_ivs: persisted.used_ivs.iter().copied().collect(),
                        },
                    );
                }

                log::info!("Loaded enclave state with {} key(s)", slots.len());
                Ok(Self {
                    root,
                    pairing_key,
                    config,
                    state_path: Some(path),
                    slots: RwLock::new(slots),
                    pending: Mutex::new(HashMap::new()),
                })
            }
            None => {
                let enclave = Self {
                    state_path: Some(path),
                    ..Self::new(pairing_key, config)
                };
                enclave.persist(&enclave.slots.read())?;
                log::info!("Created enclave state");
                Ok(enclave)
            }
        }
    }

    /// Permanently invalidate a key, as a biometric enrollment change does
    pub fn invalidate_key(&self, name: &str) -> SealResult<bool> {
        let mut slots = self.slots.write();
        match slots.get_mut(name) {
            Some(slot) => {
                slot.invalidated = true;
                self.persist(&slots)?;
                log::warn!("Key '{}' invalidated", name);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete a key. The next `get_or_create_key` creates a new one.
    pub fn delete_key(&self, name: &str) -> SealResult<bool> {
        let mut slots = self.slots.write();
        if slots.remove(name).is_none() {
            return Ok(false);
        }
        self.persist(&slots)?;
        drop(slots);

        self.pending.lock().retain(|_, op| op.name != name);
        log::info!("Key '{}' deleted", name);
        Ok(true)
    }

    /// Number of operations bound but not yet finished or aborted
    pub fn pending_operations(&self) -> usize {
        self.pending.lock().len()
    }

    fn validity(&self) -> Duration {
        Duration::seconds(self.config.auth_validity_secs as i64)
    }

    fn new_challenge(pending: &HashMap<u64, PendingOperation>) -> u64 {
        use rand::RngCore;
        loop {
            let challenge = rand::thread_rng().next_u64();
            if challenge != 0 && !pending.contains_key(&challenge) {
                return challenge;
            }
        }
    }

    fn check_hardware(&self) -> SealResult<()> {
        if self.config.require_hardware && !self.is_hardware_backed() {
            return Err(SealError::EnclaveUnavailable);
        }
        Ok(())
    }

    fn slot_key(root: &SealKey, name: &str, key_id: Uuid) -> SealResult<SealKey> {
        let mut info = contexts::SEALING_KEY.to_vec();
        info.extend_from_slice(name.as_bytes());
        derive_key(root.expose(), key_id.as_bytes(), &info)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // STATE FILE
    // ═══════════════════════════════════════════════════════════════════════

    fn persist(&self, slots: &HashMap<String, KeySlot>) -> SealResult<()> {
        let path = match &self.state_path {
            Some(path) => path,
            None => return Ok(()),
        };

        let state = PersistedState {
            root: *self.root.expose(),
            slots: slots
                .iter()
                .map(|(name, slot)| PersistedSlot {
                    name: name.clone(),
                    key_id: slot.key_id,
                    invalidated: slot.invalidated,
                    used_ivs: slot.used_ivs.iter().copied().collect(),
                })
                .collect(),
        };
        let body = Zeroizing::new(
            bincode::serialize(&state).map_err(|e| SealError::Storage(e.to_string()))?,
        );

        let mut out = Zeroizing::new(Vec::with_capacity(STATE_HEADER_SIZE + body.len()));
        out.extend_from_slice(STATE_MAGIC);
        out.push(STATE_VERSION);
        out.extend_from_slice(&body);

        write_atomic(path, &out)
    }

    fn load_state(path: &Path) -> SealResult<Option<PersistedState>> {
        let data = match fs::read(path) {
            Ok(data) => Zeroizing::new(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if data.len() < STATE_HEADER_SIZE || &data[..8] != STATE_MAGIC {
            return Err(SealError::DecodeError("Invalid enclave state file".into()));
        }
        if data[8] != STATE_VERSION {
            return Err(SealError::DecodeError(format!("Unsupported enclave state version: {}", data[8])));
        }

        Ok(Some(bincode::deserialize(&data[STATE_HEADER_SIZE..])?))
    }
}

impl KeyCustodian for SoftwareEnclave {
    fn get_or_create_key(&self, name: &str) -> SealResult<SecureKeyHandle> {
        self.check_hardware()?;

        if let Some(slot) = self.slots.read().get(name) {
            return Ok(SecureKeyHandle { name: name.to_string(), key_id: slot.key_id });
        }

        let mut slots = self.slots.write();
        // Another caller may have created it between the two locks
        if !slots.contains_key(name) {
            let key_id = Uuid::new_v4();
            let key = Self::slot_key(&self.root, name, key_id)?;

            slots.insert(
                name.to_string(),
                KeySlot {
                    key_id,
                    key,
                    invalidated: false,
                    used_ivs: HashSet::new(),
                },
            );
            if let Err(e) = self.persist(&slots) {
                slots.remove(name);
                return Err(e);
            }
            log::info!("Created sealing key '{}'", name);
        }

        Ok(SecureKeyHandle { name: name.to_string(), key_id: slots[name].key_id })
    }

    fn get_key(&self, name: &str) -> SealResult<SecureKeyHandle> {
        self.check_hardware()?;

        self.slots
            .read()
            .get(name)
            .map(|slot| SecureKeyHandle { name: name.to_string(), key_id: slot.key_id })
            .ok_or_else(|| SealError::KeyUnavailable(format!("key '{}' does not exist", name)))
    }

    fn begin(&self, handle: &SecureKeyHandle, purpose: Purpose, iv: &[u8]) -> SealResult<u64> {
        let iv: [u8; IV_LEN] = iv
            .try_into()
            .map_err(|_| SealError::InvalidIv { expected: IV_LEN, actual: iv.len() })?;

        let slots = self.slots.read();
        let slot = slots
            .get(&handle.name)
            .ok_or_else(|| SealError::KeyUnavailable(format!("key '{}' does not exist", handle.name)))?;

        if slot.key_id != handle.key_id {
            return Err(SealError::KeyUnavailable(format!("stale handle for key '{}'", handle.name)));
        }
        if slot.invalidated {
            return Err(SealError::KeyUnavailable(format!("key '{}' was invalidated", handle.name)));
        }
        match purpose {
            Purpose::Seal if slot.used_ivs.contains(&iv) => {
                return Err(SealError::EncryptionFailed("IV already used with this key".into()));
            }
            // Ciphertext from a deleted or earlier key instance
            Purpose::Unseal if !slot.used_ivs.contains(&iv) => {
                return Err(SealError::KeyUnavailable(format!(
                    "key '{}' never sealed with this IV",
                    handle.name
                )));
            }
            _ => {}
        }

        let mut pending = self.pending.lock();
        let challenge = Self::new_challenge(&pending);
        pending.insert(
            challenge,
            PendingOperation {
                name: handle.name.clone(),
                key_id: handle.key_id,
                purpose,
                iv,
                authorized_at: None,
            },
        );

        log::debug!("Bound {:?} operation on '{}'", purpose, handle.name);
        Ok(challenge)
    }

    fn authorize(&self, operation: u64, token: &AuthToken) -> SealResult<()> {
        let mut pending = self.pending.lock();

        let rejection = if !token.verify(&self.pairing_key) {
            Some(SealError::AuthorizationRejected("token signature invalid".into()))
        } else if token.challenge != operation {
            Some(SealError::AuthorizationRejected("token bound to another operation".into()))
        } else {
            None
        };
        if let Some(err) = rejection {
            pending.remove(&operation);
            return Err(err);
        }

        let op = pending
            .get_mut(&operation)
            .ok_or_else(|| SealError::AuthorizationRejected("unknown or finished operation".into()))?;

        // The window opens at the match; time spent on the prompt does not count
        if Utc::now() - token.issued_at > self.validity() {
            pending.remove(&operation);
            return Err(SealError::SessionExpired);
        }

        op.authorized_at = Some(token.issued_at);
        Ok(())
    }

    fn finish(&self, operation: u64, input: &[u8]) -> SealResult<Vec<u8>> {
        // Single use: the operation is gone from here on
        let op = self
            .pending
            .lock()
            .remove(&operation)
            .ok_or_else(|| SealError::AuthorizationRejected("unknown or finished operation".into()))?;

        let authorized_at = op
            .authorized_at
            .ok_or_else(|| SealError::AuthorizationRejected("operation was never authorized".into()))?;
        if Utc::now() - authorized_at > self.validity() {
            return Err(SealError::SessionExpired);
        }

        let mut slots = self.slots.write();
        match slots.get_mut(&op.name) {
            Some(slot) if slot.key_id == op.key_id && !slot.invalidated => {
                if op.purpose == Purpose::Seal && !slot.used_ivs.insert(op.iv) {
                    return Err(SealError::EncryptionFailed("IV already used with this key".into()));
                }
            }
            _ => return Err(SealError::KeyUnavailable(format!("key '{}' is no longer usable", op.name))),
        }
        if op.purpose == Purpose::Seal {
            self.persist(&slots)?;
        }

        let key = &slots[&op.name].key;
        match op.purpose {
            Purpose::Seal => encrypt_aes_gcm(key, &op.iv, input, op.name.as_bytes()),
            Purpose::Unseal => decrypt_aes_gcm(key, &op.iv, input, op.name.as_bytes()),
        }
    }

    fn abort(&self, operation: u64) {
        if self.pending.lock().remove(&operation).is_some() {
            log::debug!("Aborted pending operation");
        }
    }

    fn is_hardware_backed(&self) -> bool {
        false
    }
}
