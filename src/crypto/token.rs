//! ALFA Token Seal - Hardware Auth Tokens
//!
//! A sensor that recognises the user issues an [`AuthToken`] bound to the
//! challenge of one pending enclave operation. The MAC key is shared only by
//! the sensor and the enclave, so the application can carry a token but
//! cannot mint one.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::keys::SealKey;

type HmacSha256 = Hmac<Sha256>;

/// Proof of user presence for a single operation challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    /// Operation challenge this token authorizes
    pub challenge: u64,
    /// Identifier of the issuing sensor
    pub authenticator_id: u64,
    /// Time of the biometric match
    pub issued_at: DateTime<Utc>,
    mac: [u8; 32],
}

impl AuthToken {
    /// Issue a token for `challenge`, signed with the pairing key
    pub fn issue(pairing_key: &SealKey, challenge: u64, authenticator_id: u64) -> Self {
        Self::issue_at(pairing_key, challenge, authenticator_id, Utc::now())
    }

    pub(crate) fn issue_at(
        pairing_key: &SealKey,
        challenge: u64,
        authenticator_id: u64,
        issued_at: DateTime<Utc>,
    ) -> Self {
        let mac = Self::compute_mac(pairing_key, challenge, authenticator_id, issued_at);
        Self {
            challenge,
            authenticator_id,
            issued_at,
            mac,
        }
    }

    /// Constant-time MAC check against the pairing key
    pub fn verify(&self, pairing_key: &SealKey) -> bool {
        let mut mac = Self::mac(pairing_key);
        Self::feed(&mut mac, self.challenge, self.authenticator_id, self.issued_at);
        mac.verify_slice(&self.mac).is_ok()
    }

    fn mac(key: &SealKey) -> HmacSha256 {
        HmacSha256::new_from_slice(key.expose())
            .expect("HMAC key length is always valid")
    }

    fn feed(mac: &mut HmacSha256, challenge: u64, authenticator_id: u64, issued_at: DateTime<Utc>) {
        mac.update(b"ALFA:AUTH:v1");
        mac.update(&challenge.to_be_bytes());
        mac.update(&authenticator_id.to_be_bytes());
        mac.update(&issued_at.timestamp_millis().to_be_bytes());
    }

    fn compute_mac(key: &SealKey, challenge: u64, authenticator_id: u64, issued_at: DateTime<Utc>) -> [u8; 32] {
        let mut mac = Self::mac(key);
        Self::feed(&mut mac, challenge, authenticator_id, issued_at);
        mac.finalize().into_bytes().into()
    }
}
