//! Credential hashing with Argon2id.
//!
//! Hashes are PHC strings, so parameters and salt travel with the hash.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

use crate::error::{RegistryError, RegistryResult};

#[derive(Debug, Clone)]
pub struct PasswordHasher {
    params: Params,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self {
            params: Params::default(),
        }
    }
}

impl PasswordHasher {
    pub fn with_params(memory_kib: u32, iterations: u32, parallelism: u32) -> RegistryResult<Self> {
        let params = Params::new(memory_kib, iterations, parallelism, None)
            .map_err(|e| RegistryError::Hashing(format!("invalid parameters: {e}")))?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    pub fn hash(&self, password: &str) -> RegistryResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| RegistryError::Hashing(e.to_string()))?;
        Ok(hash.to_string())
    }

    /// `Ok(false)` on a wrong password; a malformed stored hash is an error.
    pub fn verify(&self, password: &str, hash: &str) -> RegistryResult<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| RegistryError::Hashing(format!("stored hash is invalid: {e}")))?;
        match self.argon2().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(RegistryError::Hashing(e.to_string())),
        }
    }
}
