//! Credential protection
//!
//! Users created by the store never keep a plaintext `password`: it is
//! replaced by a salted SHA-256 digest and the salt is stored alongside.

use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Record;

pub const MIN_PASSWORD_LENGTH: usize = 6;

/// Hashes and verifies user credentials.
pub trait CredentialHasher: Send + Sync {
    fn generate_salt(&self) -> String;

    fn hash_password(&self, password: &str, salt: &str) -> String;

    fn verify_password(&self, password: &str, hash: &str, salt: &str) -> bool {
        self.hash_password(password, salt) == hash
    }
}

/// Hex SHA-256 of `password + salt`, with a 16-byte random hex salt.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

impl CredentialHasher for Sha256Hasher {
    fn generate_salt(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    fn hash_password(&self, password: &str, salt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hasher.update(salt.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Replace a plaintext `password` by its hash and add the `salt`.
///
/// Records that already carry a salt are left alone, so calling this twice
/// never double-hashes.
pub fn protect_credentials(record: &mut Record, hasher: &dyn CredentialHasher) -> bool {
    if record.contains("salt") {
        return false;
    }
    let Some(Value::String(password)) = record.get("password").cloned() else {
        return false;
    };
    let salt = hasher.generate_salt();
    record.set("password", hasher.hash_password(&password, &salt));
    record.set("salt", salt);
    true
}

/// Check a user's stored credentials.
pub fn verify_credentials(record: &Record, password: &str, hasher: &dyn CredentialHasher) -> bool {
    match (record.get_str("password"), record.get_str("salt")) {
        (Some(hash), Some(salt)) => hasher.verify_password(password, hash, salt),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordIssue {
    TooShort,
    MissingDigit,
    MissingLetter,
}

impl std::fmt::Display for PasswordIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PasswordIssue::TooShort => {
                write!(f, "password must be at least {} characters", MIN_PASSWORD_LENGTH)
            }
            PasswordIssue::MissingDigit => f.write_str("password must contain a digit"),
            PasswordIssue::MissingLetter => f.write_str("password must contain a letter"),
        }
    }
}

/// Minimum length, at least one digit and one ASCII letter.
pub fn validate_password_strength(password: &str) -> Result<(), PasswordIssue> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(PasswordIssue::TooShort);
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(PasswordIssue::MissingDigit);
    }
    if !password.chars().any(|c| c.is_ascii_alphabetic()) {
        return Err(PasswordIssue::MissingLetter);
    }
    Ok(())
}
