//! ALFA Token Seal - Password Login
//!
//! The sealer only needs the result of a password login: an identity and the
//! server token. The network protocol behind it lives elsewhere.

use secrecy::SecretString;
use uuid::Uuid;

use crate::error::{SealError, SealResult};

/// A logged-in user and the server token issued to them. Never persisted.
#[derive(Debug)]
pub struct AuthenticatedPrincipal {
    pub identity: String,
    pub token: SecretString,
}

impl AuthenticatedPrincipal {
    pub fn new(identity: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            token: SecretString::new(token.into()),
        }
    }
}

/// Password-based login service
pub trait PasswordLogin: Send + Sync {
    fn login(&self, username: &str, password: &str) -> SealResult<AuthenticatedPrincipal>;
}

/// Offline login source: accepts any non-blank credentials and issues a
/// random token.
#[derive(Debug, Default)]
pub struct DemoLoginSource;

impl PasswordLogin for DemoLoginSource {
    fn login(&self, username: &str, password: &str) -> SealResult<AuthenticatedPrincipal> {
        if username.trim().is_empty() {
            return Err(SealError::LoginRejected("username is blank".into()));
        }
        if password.is_empty() {
            return Err(SealError::LoginRejected("password is blank".into()));
        }

        log::info!("Logged in '{}'", username);
        Ok(AuthenticatedPrincipal::new(
            username.trim(),
            format!("server-token-{}", Uuid::new_v4().simple()),
        ))
    }
}
