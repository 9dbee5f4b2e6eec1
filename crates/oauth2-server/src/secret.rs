//! Password and client-secret hashing.
//!
//! New hashes are PHC-formatted Argon2id strings. Existing bcrypt hashes
//! (`$2a$`, `$2b$`, `$2y$`) are still accepted for verification. Verification
//! of a malformed hash is a mismatch, not an error: callers only ever need a
//! yes/no.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

/// A well-formed Argon2id hash that matches no password, with the same cost
/// parameters as [`hash_secret`]. Verifying against it when there is no
/// stored hash keeps both paths equally slow.
pub const DUMMY_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$c29tZXNhbHRzb21lc2FsdA$AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

/// Compares a plaintext secret against a stored hash.
pub trait SecretVerifier: Send + Sync {
    fn verify(&self, plaintext: &str, hash: &str) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HashVerifier;

fn is_bcrypt(hash: &str) -> bool {
    ["$2a$", "$2b$", "$2y$"]
        .iter()
        .any(|prefix| hash.starts_with(prefix))
}

impl SecretVerifier for HashVerifier {
    fn verify(&self, plaintext: &str, hash: &str) -> bool {
        if is_bcrypt(hash) {
            return bcrypt::verify(plaintext, hash).unwrap_or_else(|e| {
                tracing::warn!("Stored bcrypt hash is malformed: {}", e);
                false
            });
        }

        match PasswordHash::new(hash) {
            Ok(parsed) => Argon2::default()
                .verify_password(plaintext.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                tracing::warn!("Stored hash is not a valid PHC string: {}", e);
                false
            }
        }
    }
}

/// Hash a secret for storage using Argon2id with a random salt.
pub fn hash_secret(plaintext: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(plaintext.as_bytes(), &salt)?;
    Ok(hash.to_string())
}
