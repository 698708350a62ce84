//! Password hashing.
//!
//! New hashes are Argon2id PHC strings (`$argon2id$v=19$...`). Accounts
//! carried over from the older scrypt scheme store `hex(salt):hex(key)`;
//! those still verify and are reported by [`PasswordHasher::needs_rehash`]
//! so a successful login can upgrade them.

use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Algorithm, Argon2, Params, PasswordHasher as _, PasswordVerifier as _, Version};
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::error::{Result, StoreError};

pub const SALT_LEN: usize = 16;

// scrypt N = 2^14, r = 8, p = 1 with a 64-byte key.
const LEGACY_LOG_N: u8 = 14;
const LEGACY_R: u32 = 8;
const LEGACY_P: u32 = 1;
const LEGACY_KEY_LEN: usize = 64;

/// Check if a stored value is an Argon2 PHC string.
pub fn is_argon2_hash(stored: &str) -> bool {
    stored.starts_with("$argon2")
}

#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self {
            argon2: Argon2::default(),
        }
    }
}

impl PasswordHasher {
    /// Argon2id with explicit cost parameters.
    pub fn with_params(params: Params) -> Self {
        Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    pub async fn hash(&self, password: &str) -> Result<String> {
        let argon2 = self.argon2.clone();
        let password = password.to_owned();
        blocking(move || hash_argon2(&argon2, &password)).await
    }

    /// `false` for a wrong password and for any stored value that is neither
    /// a PHC string nor a well-formed legacy `salt:key` pair.
    pub async fn verify(&self, password: &str, stored: &str) -> Result<bool> {
        let argon2 = self.argon2.clone();
        let password = password.to_owned();
        let stored = stored.to_owned();
        blocking(move || {
            if is_argon2_hash(&stored) {
                Ok(verify_argon2(&argon2, &password, &stored))
            } else {
                verify_legacy(&password, &stored)
            }
        })
        .await
    }

    /// Whether `stored` predates Argon2 and should be replaced after the
    /// next successful login.
    pub fn needs_rehash(stored: &str) -> bool {
        !is_argon2_hash(stored)
    }
}

/// Key derivation is deliberately slow; keep it off the async workers.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StoreError::Password(e.to_string()))?
}

fn hash_argon2(argon2: &Argon2<'_>, password: &str) -> Result<String> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt).map_err(|e| StoreError::Password(e.to_string()))?;

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| StoreError::Password(e.to_string()))
}

fn verify_argon2(argon2: &Argon2<'_>, password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => argon2.verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}

fn verify_legacy(password: &str, stored: &str) -> Result<bool> {
    let Some((salt_hex, key_hex)) = stored.split_once(':') else {
        return Ok(false);
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(key_hex)) else {
        return Ok(false);
    };
    if salt.is_empty() || expected.len() != LEGACY_KEY_LEN {
        return Ok(false);
    }

    let params = scrypt::Params::new(LEGACY_LOG_N, LEGACY_R, LEGACY_P, LEGACY_KEY_LEN)
        .map_err(|e| StoreError::Password(e.to_string()))?;
    let mut derived = [0u8; LEGACY_KEY_LEN];
    scrypt::scrypt(password.as_bytes(), &salt, &params, &mut derived)
        .map_err(|e| StoreError::Password(e.to_string()))?;
    Ok(derived.as_slice().ct_eq(expected.as_slice()).into())
}
