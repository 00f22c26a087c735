//! Sealed ephemeral tokens for the OAuth round trip.
//!
//! Two codecs share one AES-256-GCM sealing primitive (random 12-byte nonce
//! prepended to the ciphertext, base64-encoded, key derived from the
//! configured secret with SHA-256):
//!
//! - [`OAuthStateCodec`] carries `{target, csrf, timestamp, provider}`
//!   through the provider redirect as the `state` query parameter. It is
//!   single-use by construction: the CSRF cookie it is checked against is
//!   deleted after one parse attempt.
//! - [`BindingTokenCodec`] carries an unverified external identity through
//!   the credential-confirmation step in an httpOnly cookie.
//!
//! Both fail closed: any decrypt, decode, TTL or binding mismatch yields
//! `None` and the caller treats the flow as never having started.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const TAG_SIZE: usize = 16;

/// Both the OAuth state and the binding token live for ten minutes.
pub const STATE_TTL_SECS: i64 = 600;

fn derive_key(secret: &str) -> [u8; KEY_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    let result = hasher.finalize();
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&result);
    key
}

/// AEAD seal/open over serde payloads.
#[derive(Clone)]
struct SealedCodec {
    key: [u8; KEY_SIZE],
}

impl SealedCodec {
    fn new(secret: &str) -> Self {
        Self {
            key: derive_key(secret),
        }
    }

    fn seal<T: Serialize>(&self, payload: &T) -> Option<String> {
        use aes_gcm::aead::Aead;
        use aes_gcm::{Aes256Gcm, KeyInit, Nonce};

        let plaintext = serde_json::to_vec(payload).ok()?;
        let cipher = Aes256Gcm::new_from_slice(&self.key).ok()?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::fill(&mut nonce_bytes).ok()?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher.encrypt(nonce, plaintext.as_slice()).ok()?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Some(STANDARD.encode(&combined))
    }

    fn open<T: DeserializeOwned>(&self, sealed: &str) -> Option<T> {
        use aes_gcm::aead::Aead;
        use aes_gcm::{Aes256Gcm, KeyInit, Nonce};

        let combined = STANDARD.decode(sealed).ok()?;
        if combined.len() < NONCE_SIZE + TAG_SIZE {
            return None;
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key).ok()?;
        let nonce = Nonce::from_slice(&combined[..NONCE_SIZE]);
        let plaintext = cipher.decrypt(nonce, &combined[NONCE_SIZE..]).ok()?;
        serde_json::from_slice(&plaintext).ok()
    }
}

/// Payload carried through the provider redirect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub target: String,
    pub csrf: String,
    pub timestamp: i64,
    pub provider: String,
}

#[derive(Clone)]
pub struct OAuthStateCodec {
    sealed: SealedCodec,
}

impl OAuthStateCodec {
    pub fn new(secret: &str) -> Self {
        Self {
            sealed: SealedCodec::new(secret),
        }
    }

    /// Mint a state blob and its CSRF nonce. The nonce goes into the
    /// `oauth_csrf` cookie; the sealed blob into the `state` query param.
    pub fn generate(&self, target_origin: &str, provider: &str) -> Option<(String, String)> {
        let mut nonce = [0u8; 32];
        getrandom::fill(&mut nonce).ok()?;
        let csrf = URL_SAFE_NO_PAD.encode(nonce);

        let payload = OAuthState {
            target: target_origin.to_string(),
            csrf: csrf.clone(),
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
            provider: provider.to_string(),
        };
        let state = self.sealed.seal(&payload)?;
        Some((state, csrf))
    }

    /// Open and validate a state blob. Returns `None` on decrypt failure,
    /// a stale timestamp, an origin mismatch, or a CSRF mismatch.
    pub fn parse(
        &self,
        state: &str,
        expected_origin: &str,
        cookie_csrf: &str,
    ) -> Option<OAuthState> {
        let payload: OAuthState = self.sealed.open(state)?;
        let age = OffsetDateTime::now_utc().unix_timestamp() - payload.timestamp;
        if !(0..=STATE_TTL_SECS).contains(&age) {
            return None;
        }
        if payload.target != expected_origin {
            return None;
        }
        if cookie_csrf.is_empty() || payload.csrf != cookie_csrf {
            return None;
        }
        Some(payload)
    }
}

/// An unverified external identity pending local-credential confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingToken {
    pub provider: String,
    pub provider_user_id: String,
    pub provider_username: String,
    pub issued_at: i64,
}

#[derive(Clone)]
pub struct BindingTokenCodec {
    sealed: SealedCodec,
}

impl BindingTokenCodec {
    pub fn new(secret: &str) -> Self {
        Self {
            sealed: SealedCodec::new(secret),
        }
    }

    pub fn seal(&self, provider: &str, provider_user_id: &str, provider_username: &str) -> Option<String> {
        self.sealed.seal(&BindingToken {
            provider: provider.to_string(),
            provider_user_id: provider_user_id.to_string(),
            provider_username: provider_username.to_string(),
            issued_at: OffsetDateTime::now_utc().unix_timestamp(),
        })
    }

    pub fn open(&self, token: &str) -> Option<BindingToken> {
        let payload: BindingToken = self.sealed.open(token)?;
        let age = OffsetDateTime::now_utc().unix_timestamp() - payload.issued_at;
        if !(0..=STATE_TTL_SECS).contains(&age) {
            return None;
        }
        Some(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "state-secret-for-tests-0123456789ab";

    #[test]
    fn state_round_trip() {
        let codec = OAuthStateCodec::new(SECRET);
        let (state, csrf) = codec
            .generate("https://radio.example.org", "github")
            .unwrap();
        let parsed = codec
            .parse(&state, "https://radio.example.org", &csrf)
            .unwrap();
        assert_eq!(parsed.target, "https://radio.example.org");
        assert_eq!(parsed.provider, "github");
        assert_eq!(parsed.csrf, csrf);
    }

    #[test]
    fn wrong_csrf_fails_closed() {
        let codec = OAuthStateCodec::new(SECRET);
        let (state, _csrf) = codec
            .generate("https://radio.example.org", "github")
            .unwrap();
        assert!(
            codec
                .parse(&state, "https://radio.example.org", "not-the-nonce")
                .is_none()
        );
    }

    #[test]
    fn empty_cookie_csrf_fails_closed() {
        let codec = OAuthStateCodec::new(SECRET);
        let (state, _csrf) = codec
            .generate("https://radio.example.org", "github")
            .unwrap();
        assert!(
            codec
                .parse(&state, "https://radio.example.org", "")
                .is_none()
        );
    }

    #[test]
    fn wrong_origin_fails_closed() {
        let codec = OAuthStateCodec::new(SECRET);
        let (state, csrf) = codec
            .generate("https://radio.example.org", "github")
            .unwrap();
        assert!(codec.parse(&state, "https://evil.example.org", &csrf).is_none());
    }

    #[test]
    fn single_byte_mutation_fails_closed() {
        let codec = OAuthStateCodec::new(SECRET);
        let (state, csrf) = codec
            .generate("https://radio.example.org", "github")
            .unwrap();
        // Flip one byte in the middle of the base64 payload.
        let mut bytes = state.into_bytes();
        let mid = bytes.len() / 2;
        bytes[mid] = if bytes[mid] == b'A' { b'B' } else { b'A' };
        let mutated = String::from_utf8(bytes).unwrap();
        assert!(
            codec
                .parse(&mutated, "https://radio.example.org", &csrf)
                .is_none()
        );
    }

    #[test]
    fn stale_state_fails_closed() {
        let codec = OAuthStateCodec::new(SECRET);
        // Seal a payload with a timestamp beyond the TTL.
        let stale = OAuthState {
            target: "https://radio.example.org".into(),
            csrf: "nonce".into(),
            timestamp: OffsetDateTime::now_utc().unix_timestamp() - STATE_TTL_SECS - 1,
            provider: "github".into(),
        };
        let sealed = codec.sealed.seal(&stale).unwrap();
        assert!(
            codec
                .parse(&sealed, "https://radio.example.org", "nonce")
                .is_none()
        );
    }

    #[test]
    fn wrong_key_fails_closed() {
        let codec = OAuthStateCodec::new(SECRET);
        let other = OAuthStateCodec::new("another-secret-entirely-0123456789");
        let (state, csrf) = codec
            .generate("https://radio.example.org", "github")
            .unwrap();
        assert!(
            other
                .parse(&state, "https://radio.example.org", &csrf)
                .is_none()
        );
    }

    #[test]
    fn binding_token_round_trip() {
        let codec = BindingTokenCodec::new(SECRET);
        let token = codec.seal("github", "gh-123", "octocat").unwrap();
        let opened = codec.open(&token).unwrap();
        assert_eq!(opened.provider, "github");
        assert_eq!(opened.provider_user_id, "gh-123");
        assert_eq!(opened.provider_username, "octocat");
    }

    #[test]
    fn expired_binding_token_fails_closed() {
        let codec = BindingTokenCodec::new(SECRET);
        let stale = BindingToken {
            provider: "github".into(),
            provider_user_id: "gh-123".into(),
            provider_username: "octocat".into(),
            issued_at: OffsetDateTime::now_utc().unix_timestamp() - STATE_TTL_SECS - 1,
        };
        let sealed = codec.sealed.seal(&stale).unwrap();
        assert!(codec.open(&sealed).is_none());
    }

    #[test]
    fn binding_token_is_not_oauth_state() {
        // Same key, different payload shape: opening one as the other fails.
        let binding = BindingTokenCodec::new(SECRET);
        let state = OAuthStateCodec::new(SECRET);
        let token = binding.seal("github", "gh-123", "octocat").unwrap();
        assert!(state.parse(&token, "https://radio.example.org", "x").is_none());
    }
}
