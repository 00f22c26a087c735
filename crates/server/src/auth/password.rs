//! Password hashing and verification.
//!
//! Argon2id with per-hash random salts, PHC-formatted strings. The verify
//! path is constant-time within the hash comparison and returns a plain
//! bool so callers never learn whether the stored hash was malformed.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};

/// Hash a password for storage. Returns the PHC string.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password against a stored PHC hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let hash = hash_password("correct horse battery staple").expect("hash");
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("incorrect horse", &hash));
    }

    #[test]
    fn salts_differ_between_hashes() {
        let h1 = hash_password("same-password").expect("hash");
        let h2 = hash_password("same-password").expect("hash");
        assert_ne!(h1, h2);
        assert!(verify_password("same-password", &h1));
        assert!(verify_password("same-password", &h2));
    }

    #[test]
    fn malformed_hash_verifies_false() {
        assert!(!verify_password("password", ""));
        assert!(!verify_password("password", "not-a-phc-string"));
        assert!(!verify_password("password", "$argon2id$broken"));
    }
}
