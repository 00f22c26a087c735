use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Deserialize)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

/// One registered OAuth identity provider. The registry in
/// `auth::providers` is built from this table; adding a provider is a
/// config change plus a strategy implementation, never an orchestrator
/// change.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
}

#[derive(Debug, Deserialize)]
pub struct WebAuthnConfig {
    /// Relying Party ID (the registrable domain, e.g. "radio.example.org").
    pub rp_id: String,
    /// Expected origin of ceremonies, e.g. "https://radio.example.org".
    pub rp_origin: String,
    #[serde(default = "default_rp_name")]
    pub rp_name: String,
}

fn default_rp_name() -> String {
    "OnAir Campus Radio".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockoutConfig {
    /// Failures within the window before the (username, ip) pair locks.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Sliding window over which failures accumulate.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// How long a locked pair stays locked.
    #[serde(default = "default_lock_secs")]
    pub lock_secs: u64,
}

fn default_max_failures() -> u32 {
    5
}
fn default_window_secs() -> u64 {
    600
}
fn default_lock_secs() -> u64 {
    900
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            window_secs: default_window_secs(),
            lock_secs: default_lock_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub smtp: SmtpConfig,
    /// Where browser flows land after login/bind (also the only origin the
    /// OAuth state accepts as redirect target).
    pub frontend_url: String,
    /// Public origin of this server, used for OAuth redirect URIs.
    pub public_origin: String,
    /// HMAC secret for session / pre-auth JWTs.
    pub session_secret: String,
    /// AEAD key material for the OAuth state and binding-token codecs.
    pub state_secret: String,
    pub webauthn: WebAuthnConfig,
    #[serde(default)]
    pub lockout: LockoutConfig,
    /// Provider name -> endpoints/credentials. Keys: "github", "casdoor",
    /// "google".
    #[serde(default)]
    pub oauth: HashMap<String, OAuthProviderConfig>,
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// Environment variable override convention: any var matching the key path
/// separated by double underscores (e.g. `SMTP__PORT`) overrides the file
/// value.
///
/// Returns a `ConfigError` instead of panicking so the caller can decide how
/// to fail.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};
    let cfg = Config::builder()
        .add_source(File::with_name("config.yaml"))
        .add_source(Environment::default().separator("__"))
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    validate(&app)?;
    Ok(app)
}

fn validate(app: &AppConfig) -> Result<(), ConfigError> {
    if app.session_secret.len() < 32 {
        return Err(ConfigError::Validation(
            "session_secret must be at least 32 characters".into(),
        ));
    }
    if app.state_secret.len() < 32 {
        return Err(ConfigError::Validation(
            "state_secret must be at least 32 characters".into(),
        ));
    }
    if app.smtp.port == 0 {
        return Err(ConfigError::Validation("smtp.port must be > 0".into()));
    }
    if app.webauthn.rp_id.is_empty() {
        return Err(ConfigError::Validation("webauthn.rp_id is required".into()));
    }
    if !app.webauthn.rp_origin.starts_with("http") {
        return Err(ConfigError::Validation(
            "webauthn.rp_origin must be an origin URL".into(),
        ));
    }
    Ok(())
}

/// Convenience helper for binaries wanting panic-on-error behaviour.
pub fn load_config_or_panic() -> AppConfig {
    match load_config() {
        Ok(c) => c,
        Err(e) => panic!("Failed to load configuration: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            database_url: "sqlite::memory:".into(),
            smtp: SmtpConfig {
                server: "smtp.example.org".into(),
                port: 587,
                username: "onair".into(),
                password: "secret".into(),
                from: "OnAir <no-reply@radio.example.org>".into(),
            },
            frontend_url: "https://radio.example.org".into(),
            public_origin: "https://radio.example.org".into(),
            session_secret: "0123456789abcdef0123456789abcdef".into(),
            state_secret: "fedcba9876543210fedcba9876543210".into(),
            webauthn: WebAuthnConfig {
                rp_id: "radio.example.org".into(),
                rp_origin: "https://radio.example.org".into(),
                rp_name: default_rp_name(),
            },
            lockout: LockoutConfig::default(),
            oauth: HashMap::new(),
        }
    }

    #[test]
    fn accepts_valid_config() {
        assert!(validate(&base_config()).is_ok());
    }

    #[test]
    fn rejects_short_session_secret() {
        let mut cfg = base_config();
        cfg.session_secret = "short".into();
        assert!(matches!(
            validate(&cfg),
            Err(ConfigError::Validation(msg)) if msg.contains("session_secret")
        ));
    }

    #[test]
    fn rejects_short_state_secret() {
        let mut cfg = base_config();
        cfg.state_secret = "short".into();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_zero_smtp_port() {
        let mut cfg = base_config();
        cfg.smtp.port = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_bare_rp_origin() {
        let mut cfg = base_config();
        cfg.webauthn.rp_origin = "radio.example.org".into();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn lockout_defaults() {
        let lockout = LockoutConfig::default();
        assert_eq!(lockout.max_failures, 5);
        assert_eq!(lockout.window_secs, 600);
        assert_eq!(lockout.lock_secs, 900);
    }
}
