//! Access-credential generation for newly created documents
//!
//! Secrets are random, URL-safe, and stored only as Argon2id PHC strings. The
//! plaintext leaves this module once, inside [`GeneratedCredential`], whose
//! `Debug` output never shows it.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
    Argon2,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use std::fmt;

use crate::{Result, SyncError};

const SECRET_BYTES: usize = 18;

/// A secret issued during a run, handed back to the caller exactly once
#[derive(Clone, PartialEq, Eq)]
pub struct GeneratedCredential {
    pub entity_type: String,
    /// Natural key of the document the secret belongs to
    pub natural_key: String,
    pub secret: String,
}

impl fmt::Debug for GeneratedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedCredential")
            .field("entity_type", &self.entity_type)
            .field("natural_key", &self.natural_key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Fresh random secret, 24 URL-safe characters
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Argon2id PHC string for `secret`
pub fn hash_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| SyncError::Credential(e.to_string()))
}

#[cfg(test)]
pub(crate) fn verify_secret(secret: &str, hash: &str) -> Result<bool> {
    use argon2::password_hash::{PasswordHash, PasswordVerifier};

    let parsed = PasswordHash::new(hash).map_err(|e| SyncError::Credential(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(secret.as_bytes(), &parsed)
        .is_ok())
}
