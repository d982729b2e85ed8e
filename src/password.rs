//! Password hashing with Argon2id.
//!
//! Hashes are stored in PHC string format, so verification reads the
//! parameters back from the stored hash and older hashes keep working after
//! the cost parameters change.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;

use crate::error::{GatekeeperError, Result};

/// Hashes and verifies user passwords.
#[derive(Debug, Clone)]
pub struct PasswordManager {
    params: Params,
}

impl Default for PasswordManager {
    fn default() -> Self {
        Self {
            params: Params::default(),
        }
    }
}

impl PasswordManager {
    /// Create a manager with the recommended Argon2id cost parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a manager with custom cost parameters.
    pub fn with_params(memory_kib: u32, iterations: u32, parallelism: u32) -> Result<Self> {
        let params = Params::new(memory_kib, iterations, parallelism, None)
            .map_err(|e| GatekeeperError::PasswordHash(format!("Invalid Argon2 params: {}", e)))?;
        Ok(Self { params })
    }

    /// Cheap parameters so tests do not spend seconds hashing.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self::with_params(1024, 1, 1).expect("valid test params")
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hash a password with a fresh random salt.
    pub fn hash(&self, password: &str) -> Result<String> {
        let mut salt_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt_bytes);
        let salt = SaltString::encode_b64(&salt_bytes)
            .map_err(|e| GatekeeperError::PasswordHash(format!("Salt encoding failed: {}", e)))?;

        let hash = self
            .argon2()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| GatekeeperError::PasswordHash(format!("Password hashing failed: {}", e)))?;

        Ok(hash.to_string())
    }

    /// Check a password against a stored hash.
    ///
    /// Returns `Ok(false)` on mismatch; a stored hash that cannot be parsed is
    /// an internal error.
    pub fn verify(&self, password: &str, stored_hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(stored_hash)
            .map_err(|e| GatekeeperError::PasswordHash(format!("Invalid stored hash: {}", e)))?;

        Ok(self
            .argon2()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}
