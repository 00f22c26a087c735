use crate::auth::guard::SecurityGuard;
use crate::auth::providers::ProviderRegistry;
use crate::auth::state::{BindingTokenCodec, OAuthStateCodec};
use crate::auth::tokens::TokenCodec;
use crate::auth::two_factor::TwoFactorStore;
use crate::auth::webauthn::{WebAuthnError, WebAuthnService};
use crate::config::AppConfig;
use crate::mail::Mailer;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

pub mod api;
pub mod auth;
pub mod config;
pub mod entity;
pub mod error;
pub mod mail;

/// Shared resources handed to every request handler via an axum Extension.
#[derive(Clone)]
pub struct AppResources {
    pub db: Arc<DatabaseConnection>,
    pub mailer: Arc<dyn Mailer>,
    pub config: Arc<AppConfig>,
    pub tokens: Arc<TokenCodec>,
    pub oauth_state: Arc<OAuthStateCodec>,
    pub binding: Arc<BindingTokenCodec>,
    pub providers: Arc<ProviderRegistry>,
    pub guard: SecurityGuard,
    pub two_factor: TwoFactorStore,
    pub webauthn: Arc<WebAuthnService>,
}

impl AppResources {
    pub fn new(
        db: Arc<DatabaseConnection>,
        mailer: Arc<dyn Mailer>,
        config: Arc<AppConfig>,
    ) -> Result<Self, WebAuthnError> {
        let webauthn = Arc::new(WebAuthnService::new(&config.webauthn)?);
        Ok(Self {
            tokens: Arc::new(TokenCodec::new(&config.session_secret)),
            oauth_state: Arc::new(OAuthStateCodec::new(&config.state_secret)),
            binding: Arc::new(BindingTokenCodec::new(&config.state_secret)),
            providers: Arc::new(ProviderRegistry::from_config(&config.oauth)),
            guard: SecurityGuard::new(&config.lockout),
            two_factor: TwoFactorStore::new(),
            webauthn,
            db,
            mailer,
            config,
        })
    }

    /// Whether cookies should carry the Secure attribute. Follows the
    /// public origin scheme so plain-HTTP development works.
    pub fn secure_cookies(&self) -> bool {
        self.config.public_origin.starts_with("https://")
    }

    pub fn identities(&self) -> crate::auth::identity::IdentityStore {
        crate::auth::identity::IdentityStore::new(self.db.clone())
    }
}
