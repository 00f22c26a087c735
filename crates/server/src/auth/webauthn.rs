//! Passkey ceremonies and their ephemeral challenge state.
//!
//! `webauthn-rs` does the cryptographic verification; this module owns the
//! in-process challenge store around it. Challenges are one-shot: the
//! pending state is removed from the map before verification, so a second
//! finish call with the same challenge id fails regardless of outcome.
//! Registration state is additionally pinned to the user that started it.
//!
//! The signature-counter replay check is not here: handlers compare the
//! verified assertion counter against the stored one through a conditional
//! database write, which is where atomicity lives.

use crate::config::WebAuthnConfig;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use webauthn_rs::prelude::*;

pub const CHALLENGE_TTL: Duration = Duration::from_secs(5 * 60);

/// Transport hints the client may report; anything else is dropped.
const KNOWN_TRANSPORTS: &[&str] = &["usb", "nfc", "ble", "internal", "hybrid", "smart-card"];

#[derive(Debug, Error)]
pub enum WebAuthnError {
    #[error("relying party configuration is invalid: {0}")]
    Config(String),
    #[error("challenge not found or already used")]
    ChallengeNotFound,
    #[error("challenge has expired")]
    ChallengeExpired,
    #[error("challenge belongs to a different user")]
    UserMismatch,
    #[error("user id is not a valid uuid")]
    BadUserId,
    #[error("no passkeys registered")]
    NoCredentials,
    #[error("ceremony verification failed")]
    Ceremony(#[from] webauthn_rs::prelude::WebauthnError),
}

/// The opaque per-credential payload persisted alongside the identity row.
/// The signature counter lives in its own column, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPasskey {
    pub label: String,
    pub passkey: Passkey,
    #[serde(default)]
    pub transports: Vec<String>,
}

impl StoredPasskey {
    pub fn new(label: &str, passkey: Passkey, transports: &[String]) -> Self {
        Self {
            label: label.to_string(),
            passkey,
            transports: filter_transports(transports),
        }
    }

    pub fn credential_id_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.passkey.cred_id().as_slice())
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

/// Keep only transport strings the registry knows about.
pub fn filter_transports(reported: &[String]) -> Vec<String> {
    reported
        .iter()
        .filter(|t| KNOWN_TRANSPORTS.contains(&t.as_str()))
        .cloned()
        .collect()
}

struct PendingRegistration {
    user_id: String,
    state: PasskeyRegistration,
    expires_at: Instant,
}

struct PendingAuthentication {
    state: PasskeyAuthentication,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct WebAuthnService {
    webauthn: Arc<Webauthn>,
    registrations: Arc<DashMap<String, PendingRegistration>>,
    authentications: Arc<DashMap<String, PendingAuthentication>>,
    last_cleanup: Arc<Mutex<Instant>>,
}

impl WebAuthnService {
    pub fn new(config: &WebAuthnConfig) -> Result<Self, WebAuthnError> {
        let rp_origin =
            Url::parse(&config.rp_origin).map_err(|e| WebAuthnError::Config(e.to_string()))?;
        let webauthn = WebauthnBuilder::new(&config.rp_id, &rp_origin)
            .map_err(|e| WebAuthnError::Config(e.to_string()))?
            .rp_name(&config.rp_name)
            .build()
            .map_err(|e| WebAuthnError::Config(e.to_string()))?;

        Ok(Self {
            webauthn: Arc::new(webauthn),
            registrations: Arc::new(DashMap::new()),
            authentications: Arc::new(DashMap::new()),
            last_cleanup: Arc::new(Mutex::new(Instant::now())),
        })
    }

    fn maybe_cleanup(&self) {
        const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

        if let Ok(mut last_cleanup) = self.last_cleanup.try_lock() {
            if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                *last_cleanup = Instant::now();
                drop(last_cleanup);

                let now = Instant::now();
                self.registrations.retain(|_, p| p.expires_at > now);
                self.authentications.retain(|_, p| p.expires_at > now);
            }
        }
    }

    /// Issue registration options for a user. Credential ids the user
    /// already holds go into `excludeCredentials` so the authenticator
    /// refuses to re-register.
    pub fn start_registration(
        &self,
        user_id: &str,
        username: &str,
        existing: &[StoredPasskey],
    ) -> Result<(CreationChallengeResponse, String), WebAuthnError> {
        self.maybe_cleanup();

        let user_uuid = Uuid::parse_str(user_id).map_err(|_| WebAuthnError::BadUserId)?;
        let exclude: Vec<CredentialID> = existing
            .iter()
            .map(|p| p.passkey.cred_id().clone())
            .collect();
        let exclude = (!exclude.is_empty()).then_some(exclude);

        let (challenge, state) =
            self.webauthn
                .start_passkey_registration(user_uuid, username, username, exclude)?;

        let challenge_id = Uuid::new_v4().to_string();
        self.registrations.insert(
            challenge_id.clone(),
            PendingRegistration {
                user_id: user_id.to_string(),
                state,
                expires_at: Instant::now() + CHALLENGE_TTL,
            },
        );
        Ok((challenge, challenge_id))
    }

    /// Remove and return the pending registration state. The state leaves
    /// the map before any verification runs.
    fn claim_registration(
        &self,
        challenge_id: &str,
        user_id: &str,
    ) -> Result<PasskeyRegistration, WebAuthnError> {
        let (_, pending) = self
            .registrations
            .remove(challenge_id)
            .ok_or(WebAuthnError::ChallengeNotFound)?;
        if pending.expires_at <= Instant::now() {
            return Err(WebAuthnError::ChallengeExpired);
        }
        if pending.user_id != user_id {
            return Err(WebAuthnError::UserMismatch);
        }
        Ok(pending.state)
    }

    /// Verify the authenticator's registration response and produce the
    /// passkey to persist.
    pub fn finish_registration(
        &self,
        challenge_id: &str,
        user_id: &str,
        response: &RegisterPublicKeyCredential,
    ) -> Result<Passkey, WebAuthnError> {
        let state = self.claim_registration(challenge_id, user_id)?;
        let passkey = self.webauthn.finish_passkey_registration(response, &state)?;
        Ok(passkey)
    }

    /// Issue an authentication challenge over the user's registered
    /// passkeys.
    pub fn start_authentication(
        &self,
        passkeys: &[StoredPasskey],
    ) -> Result<(RequestChallengeResponse, String), WebAuthnError> {
        self.maybe_cleanup();

        if passkeys.is_empty() {
            return Err(WebAuthnError::NoCredentials);
        }
        let creds: Vec<Passkey> = passkeys.iter().map(|p| p.passkey.clone()).collect();
        let (challenge, state) = self.webauthn.start_passkey_authentication(&creds)?;

        let challenge_id = Uuid::new_v4().to_string();
        self.authentications.insert(
            challenge_id.clone(),
            PendingAuthentication {
                state,
                expires_at: Instant::now() + CHALLENGE_TTL,
            },
        );
        Ok((challenge, challenge_id))
    }

    fn claim_authentication(
        &self,
        challenge_id: &str,
    ) -> Result<PasskeyAuthentication, WebAuthnError> {
        let (_, pending) = self
            .authentications
            .remove(challenge_id)
            .ok_or(WebAuthnError::ChallengeNotFound)?;
        if pending.expires_at <= Instant::now() {
            return Err(WebAuthnError::ChallengeExpired);
        }
        Ok(pending.state)
    }

    /// Verify an assertion. Callers still owe the counter comparison
    /// against persisted state.
    pub fn finish_authentication(
        &self,
        challenge_id: &str,
        response: &PublicKeyCredential,
    ) -> Result<AuthenticationResult, WebAuthnError> {
        let state = self.claim_authentication(challenge_id)?;
        let result = self
            .webauthn
            .finish_passkey_authentication(response, &state)?;
        Ok(result)
    }
}

pub fn credential_id_b64(result: &AuthenticationResult) -> String {
    URL_SAFE_NO_PAD.encode(result.cred_id().as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> WebAuthnService {
        WebAuthnService::new(&WebAuthnConfig {
            rp_id: "radio.example.org".into(),
            rp_origin: "https://radio.example.org".into(),
            rp_name: "OnAir Campus Radio".into(),
        })
        .unwrap()
    }

    const USER: &str = "5d3bb0ad-7b85-4ba4-9fd3-4a3c6ad0a6e1";

    #[test]
    fn bad_origin_is_rejected() {
        let err = WebAuthnService::new(&WebAuthnConfig {
            rp_id: "radio.example.org".into(),
            rp_origin: "not a url".into(),
            rp_name: "OnAir Campus Radio".into(),
        });
        assert!(matches!(err, Err(WebAuthnError::Config(_))));
    }

    #[test]
    fn registration_challenge_is_one_shot() {
        let service = service();
        let (_, challenge_id) = service.start_registration(USER, "dj", &[]).unwrap();

        assert!(service.claim_registration(&challenge_id, USER).is_ok());
        assert!(matches!(
            service.claim_registration(&challenge_id, USER),
            Err(WebAuthnError::ChallengeNotFound)
        ));
    }

    #[test]
    fn registration_challenge_is_pinned_to_the_user() {
        let service = service();
        let (_, challenge_id) = service.start_registration(USER, "dj", &[]).unwrap();

        let other = "11111111-2222-3333-4444-555555555555";
        assert!(matches!(
            service.claim_registration(&challenge_id, other),
            Err(WebAuthnError::UserMismatch)
        ));
        // The claim consumed the state even though it failed.
        assert!(matches!(
            service.claim_registration(&challenge_id, USER),
            Err(WebAuthnError::ChallengeNotFound)
        ));
    }

    #[test]
    fn non_uuid_user_id_is_rejected() {
        let service = service();
        assert!(matches!(
            service.start_registration("not-a-uuid", "dj", &[]),
            Err(WebAuthnError::BadUserId)
        ));
    }

    #[test]
    fn authentication_needs_at_least_one_credential() {
        let service = service();
        assert!(matches!(
            service.start_authentication(&[]),
            Err(WebAuthnError::NoCredentials)
        ));
    }

    #[test]
    fn unknown_challenge_ids_fail() {
        let service = service();
        assert!(matches!(
            service.claim_authentication("missing"),
            Err(WebAuthnError::ChallengeNotFound)
        ));
    }

    #[test]
    fn transports_are_whitelisted() {
        let reported = vec![
            "usb".to_string(),
            "internal".to_string(),
            "carrier-pigeon".to_string(),
        ];
        assert_eq!(filter_transports(&reported), vec!["usb", "internal"]);
    }

    #[test]
    fn stored_passkey_round_trips_without_counter() {
        // The blob intentionally has no counter field; decode of a blob
        // missing transports still works.
        let raw = r#"{"label":"studio key","passkey":null}"#;
        // A null passkey must fail closed rather than panic.
        assert!(StoredPasskey::decode(raw).is_none());
    }
}
