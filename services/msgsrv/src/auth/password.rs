//! Argon2id password hashing for `sys_user.password`

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use errors::{HeraldError, HeraldResult};

/// Hash a password into a PHC string
pub fn hash_password(password: &str) -> HeraldResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| HeraldError::Internal(format!("Password hashing failed: {}", e)))
}

/// Verify a password against its stored hash
///
/// An unparsable stored hash is an error, a mismatch is `Ok(false)`.
pub fn verify_password(hash: &str, password: &str) -> HeraldResult<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| HeraldError::Internal(format!("Failed to parse password hash: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("123456").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password(&hash, "123456").unwrap());
        assert!(!verify_password(&hash, "654321").unwrap());
    }

    #[test]
    fn test_garbage_hash_is_error() {
        assert!(verify_password("plain-text", "123456").is_err());
    }
}
