// ============================
// crates/backend-lib/src/auth/password.rs
// ============================
//! Password hashing and verification for protected meetings.
use scrypt::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Scrypt,
};

use crate::error::AppError;

/// Hash a password using scrypt
pub fn hash_password(plain: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Scrypt
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| AppError::Internal(format!("password hashing failed: {e}")))?
        .to_string();
    Ok(hash)
}

/// Verify a password against a stored hash. A hash that fails to parse
/// is an infrastructure fault, not a wrong password.
pub fn verify_password(plain: &str, hash: &str) -> Result<bool, AppError> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| AppError::Internal(format!("stored password hash is invalid: {e}")))?;
    Ok(Scrypt.verify_password(plain.as_bytes(), &parsed).is_ok())
}
