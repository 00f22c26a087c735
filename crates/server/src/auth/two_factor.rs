//! Second-factor verification: short-lived email codes and TOTP.
//!
//! Email codes live in an in-process map keyed by user id, expire after
//! five minutes and are single-use. A code also dies after five wrong
//! guesses; the attempts counter exists to be enforced, not decorative.
//! Process restart drops in-flight codes, like the rest of the ceremony
//! state.

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use totp_rs::{Algorithm, Secret, TOTP};

pub const CODE_TTL: Duration = Duration::from_secs(5 * 60);
pub const MAX_CODE_ATTEMPTS: u32 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TwoFactorError {
    #[error("verification code has expired")]
    Expired,
    #[error("verification code does not match")]
    Mismatch,
}

#[derive(Debug)]
struct CodeEntry {
    code: String,
    expires_at: Instant,
    attempts: u32,
}

#[derive(Clone)]
pub struct TwoFactorStore {
    codes: Arc<DashMap<String, CodeEntry>>,
    last_cleanup: Arc<Mutex<Instant>>,
}

impl Default for TwoFactorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TwoFactorStore {
    pub fn new() -> Self {
        Self {
            codes: Arc::new(DashMap::new()),
            last_cleanup: Arc::new(Mutex::new(Instant::now())),
        }
    }

    fn maybe_cleanup(&self) {
        const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

        if let Ok(mut last_cleanup) = self.last_cleanup.try_lock() {
            if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                *last_cleanup = Instant::now();
                drop(last_cleanup);

                self.codes.retain(|_, entry| entry.expires_at > Instant::now());
            }
        }
    }

    /// Issue a fresh 6-digit code for this user, replacing any previous one.
    pub fn issue(&self, user_id: &str) -> String {
        self.issue_with_ttl(user_id, CODE_TTL)
    }

    fn issue_with_ttl(&self, user_id: &str, ttl: Duration) -> String {
        self.maybe_cleanup();

        let code = generate_numeric_code();
        self.codes.insert(
            user_id.to_string(),
            CodeEntry {
                code: code.clone(),
                expires_at: Instant::now() + ttl,
                attempts: 0,
            },
        );
        code
    }

    /// Check a submitted email code. The stored code is deleted on success,
    /// on expiry, and after [`MAX_CODE_ATTEMPTS`] wrong guesses.
    pub fn verify(&self, user_id: &str, submitted: &str) -> Result<(), TwoFactorError> {
        let Some(mut entry) = self.codes.get_mut(user_id) else {
            return Err(TwoFactorError::Mismatch);
        };

        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.codes.remove(user_id);
            return Err(TwoFactorError::Expired);
        }

        if entry.code != submitted {
            entry.attempts += 1;
            let exhausted = entry.attempts >= MAX_CODE_ATTEMPTS;
            drop(entry);
            if exhausted {
                self.codes.remove(user_id);
            }
            return Err(TwoFactorError::Mismatch);
        }

        drop(entry);
        self.codes.remove(user_id);
        Ok(())
    }
}

fn generate_numeric_code() -> String {
    let mut bytes = [0u8; 4];
    getrandom::fill(&mut bytes).expect("system randomness unavailable");
    let value = u32::from_be_bytes(bytes) % 1_000_000;
    format!("{value:06}")
}

/// Verify a TOTP code against the stored base32 secret using the standard
/// 30-second step with one window of skew.
pub fn verify_totp(secret_base32: &str, code: &str) -> bool {
    let Ok(secret) = Secret::Encoded(secret_base32.to_string()).to_bytes() else {
        return false;
    };
    let Ok(totp) = TOTP::new(Algorithm::SHA1, 6, 1, 30, secret) else {
        return false;
    };
    totp.check_current(code).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_six_digits() {
        let store = TwoFactorStore::new();
        let code = store.issue("user-1");
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn code_is_single_use() {
        let store = TwoFactorStore::new();
        let code = store.issue("user-1");
        assert_eq!(store.verify("user-1", &code), Ok(()));
        assert_eq!(store.verify("user-1", &code), Err(TwoFactorError::Mismatch));
    }

    #[test]
    fn wrong_code_is_rejected_and_right_code_still_works() {
        let store = TwoFactorStore::new();
        let code = store.issue("user-1");
        assert_eq!(
            store.verify("user-1", "000000"),
            Err(TwoFactorError::Mismatch)
        );
        assert_eq!(store.verify("user-1", &code), Ok(()));
    }

    #[test]
    fn attempts_are_capped() {
        let store = TwoFactorStore::new();
        let code = store.issue("user-1");
        for _ in 0..MAX_CODE_ATTEMPTS {
            assert_eq!(
                store.verify("user-1", "999999"),
                Err(TwoFactorError::Mismatch)
            );
        }
        // Code was deleted after the cap; even the right code fails now.
        assert_eq!(store.verify("user-1", &code), Err(TwoFactorError::Mismatch));
    }

    #[test]
    fn expired_code_is_rejected_and_deleted() {
        let store = TwoFactorStore::new();
        let code = store.issue_with_ttl("user-1", Duration::ZERO);
        assert_eq!(store.verify("user-1", &code), Err(TwoFactorError::Expired));
        // Deleted on expiry: second attempt is a plain mismatch.
        assert_eq!(store.verify("user-1", &code), Err(TwoFactorError::Mismatch));
    }

    #[test]
    fn fresh_code_within_ttl_is_accepted() {
        let store = TwoFactorStore::new();
        let code = store.issue_with_ttl("user-1", Duration::from_secs(299));
        assert_eq!(store.verify("user-1", &code), Ok(()));
    }

    #[test]
    fn unknown_user_is_a_mismatch() {
        let store = TwoFactorStore::new();
        assert_eq!(
            store.verify("nobody", "123456"),
            Err(TwoFactorError::Mismatch)
        );
    }

    #[test]
    fn totp_round_trip() {
        let secret = Secret::generate_secret();
        let encoded = secret.to_encoded().to_string();
        let totp = TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            secret.to_bytes().unwrap(),
        )
        .unwrap();
        let code = totp.generate_current().unwrap();
        assert!(verify_totp(&encoded, &code));
        assert!(!verify_totp(&encoded, "000000"));
    }

    #[test]
    fn totp_with_garbage_secret_is_false() {
        assert!(!verify_totp("!!!not-base32!!!", "123456"));
    }
}
