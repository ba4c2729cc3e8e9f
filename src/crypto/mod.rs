//! ALFA Token Seal - Cryptographic Core
//!
//! Primitives used inside the enclave boundary. Nothing here is re-exported
//! past the enclave except the auth token and key wrapper types.

pub mod keys;
pub mod aead;
pub mod token;

pub use keys::*;
pub use aead::*;
pub use token::*;
