//! OAuth provider strategies.
//!
//! One implementation per identity provider behind a common trait; the
//! callback handler never branches on the provider name. Adding a provider
//! means implementing the trait and listing it in the registry — no
//! orchestrator changes.
//!
//! Upstream failures map to the stable internal codes
//! `TOKEN_EXCHANGE_FAILED` / `USER_INFO_FAILED`; raw provider error text is
//! logged server-side only.

use crate::config::OAuthProviderConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Per-request timeout for provider HTTP calls. A hung provider must not
/// hang the callback handler.
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("token exchange with the provider failed")]
    TokenExchange,
    #[error("user info fetch from the provider failed")]
    UserInfo,
}

/// Normalized profile data; everything the core needs from a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub id: String,
    pub username: String,
}

#[async_trait]
pub trait OAuthStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Full-page redirect target starting the provider's authorization leg.
    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String;

    /// Exchange an authorization code for an access token.
    async fn exchange_token(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<String, ProviderError>;

    /// Fetch and normalize the profile behind an access token.
    async fn get_user_info(&self, access_token: &str) -> Result<ProviderProfile, ProviderError>;
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .expect("reqwest client construction cannot fail with static options")
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

async fn post_token_form(
    client: &reqwest::Client,
    strategy: &str,
    token_url: &str,
    form: &[(&str, &str)],
) -> Result<String, ProviderError> {
    let response = client
        .post(token_url)
        .header("Accept", "application/json")
        .form(form)
        .send()
        .await
        .map_err(|e| {
            tracing::warn!(provider = strategy, error = %e, "token exchange request failed");
            ProviderError::TokenExchange
        })?;

    if !response.status().is_success() {
        tracing::warn!(
            provider = strategy,
            status = %response.status(),
            "token exchange returned non-success"
        );
        return Err(ProviderError::TokenExchange);
    }

    let body: TokenResponse = response.json().await.map_err(|e| {
        tracing::warn!(provider = strategy, error = %e, "token response decode failed");
        ProviderError::TokenExchange
    })?;
    Ok(body.access_token)
}

async fn get_user_info_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    strategy: &str,
    userinfo_url: &str,
    access_token: &str,
) -> Result<T, ProviderError> {
    let response = client
        .get(userinfo_url)
        .header("Accept", "application/json")
        .header("User-Agent", "onair-server")
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| {
            tracing::warn!(provider = strategy, error = %e, "user info request failed");
            ProviderError::UserInfo
        })?;

    if !response.status().is_success() {
        tracing::warn!(
            provider = strategy,
            status = %response.status(),
            "user info returned non-success"
        );
        return Err(ProviderError::UserInfo);
    }

    response.json().await.map_err(|e| {
        tracing::warn!(provider = strategy, error = %e, "user info decode failed");
        ProviderError::UserInfo
    })
}

// ---------------------------------------------------------------------------
// GitHub
// ---------------------------------------------------------------------------

pub struct GithubStrategy {
    config: OAuthProviderConfig,
    client: reqwest::Client,
}

impl GithubStrategy {
    pub fn new(config: OAuthProviderConfig) -> Self {
        Self {
            config,
            client: http_client(),
        }
    }
}

#[derive(Deserialize)]
struct GithubUser {
    id: u64,
    login: String,
}

#[async_trait]
impl OAuthStrategy for GithubStrategy {
    fn name(&self) -> &str {
        "github"
    }

    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&state={}&scope=read:user",
            self.config.auth_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(state),
        )
    }

    async fn exchange_token(&self, code: &str, redirect_uri: &str) -> Result<String, ProviderError> {
        post_token_form(
            &self.client,
            self.name(),
            &self.config.token_url,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ],
        )
        .await
    }

    async fn get_user_info(&self, access_token: &str) -> Result<ProviderProfile, ProviderError> {
        let user: GithubUser = get_user_info_json(
            &self.client,
            self.name(),
            &self.config.userinfo_url,
            access_token,
        )
        .await?;
        Ok(ProviderProfile {
            id: user.id.to_string(),
            username: user.login,
        })
    }
}

// ---------------------------------------------------------------------------
// Google
// ---------------------------------------------------------------------------

pub struct GoogleStrategy {
    config: OAuthProviderConfig,
    client: reqwest::Client,
}

impl GoogleStrategy {
    pub fn new(config: OAuthProviderConfig) -> Self {
        Self {
            config,
            client: http_client(),
        }
    }
}

#[derive(Deserialize)]
struct GoogleUser {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[async_trait]
impl OAuthStrategy for GoogleStrategy {
    fn name(&self) -> &str {
        "google"
    }

    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&state={}&response_type=code&scope=openid%20profile%20email",
            self.config.auth_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(state),
        )
    }

    async fn exchange_token(&self, code: &str, redirect_uri: &str) -> Result<String, ProviderError> {
        post_token_form(
            &self.client,
            self.name(),
            &self.config.token_url,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("grant_type", "authorization_code"),
            ],
        )
        .await
    }

    async fn get_user_info(&self, access_token: &str) -> Result<ProviderProfile, ProviderError> {
        let user: GoogleUser = get_user_info_json(
            &self.client,
            self.name(),
            &self.config.userinfo_url,
            access_token,
        )
        .await?;
        let username = user
            .name
            .or(user.email)
            .unwrap_or_else(|| user.sub.clone());
        Ok(ProviderProfile {
            id: user.sub,
            username,
        })
    }
}

// ---------------------------------------------------------------------------
// Casdoor
// ---------------------------------------------------------------------------

pub struct CasdoorStrategy {
    config: OAuthProviderConfig,
    client: reqwest::Client,
}

impl CasdoorStrategy {
    pub fn new(config: OAuthProviderConfig) -> Self {
        Self {
            config,
            client: http_client(),
        }
    }
}

#[derive(Deserialize)]
struct CasdoorUser {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "preferredUsername")]
    preferred_username: Option<String>,
}

#[async_trait]
impl OAuthStrategy for CasdoorStrategy {
    fn name(&self) -> &str {
        "casdoor"
    }

    fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&state={}&response_type=code&scope=read",
            self.config.auth_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(state),
        )
    }

    async fn exchange_token(&self, code: &str, redirect_uri: &str) -> Result<String, ProviderError> {
        post_token_form(
            &self.client,
            self.name(),
            &self.config.token_url,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("grant_type", "authorization_code"),
            ],
        )
        .await
    }

    async fn get_user_info(&self, access_token: &str) -> Result<ProviderProfile, ProviderError> {
        let user: CasdoorUser = get_user_info_json(
            &self.client,
            self.name(),
            &self.config.userinfo_url,
            access_token,
        )
        .await?;
        let username = user
            .preferred_username
            .or(user.name)
            .unwrap_or_else(|| user.sub.clone());
        Ok(ProviderProfile {
            id: user.sub,
            username,
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name-keyed strategy lookup built from config at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn OAuthStrategy>>,
}

impl ProviderRegistry {
    pub fn from_config(oauth: &HashMap<String, OAuthProviderConfig>) -> Self {
        let mut providers: HashMap<String, Arc<dyn OAuthStrategy>> = HashMap::new();
        for (name, cfg) in oauth {
            let strategy: Arc<dyn OAuthStrategy> = match name.as_str() {
                "github" => Arc::new(GithubStrategy::new(cfg.clone())),
                "google" => Arc::new(GoogleStrategy::new(cfg.clone())),
                "casdoor" => Arc::new(CasdoorStrategy::new(cfg.clone())),
                other => {
                    tracing::warn!(provider = other, "unknown oauth provider in config, skipped");
                    continue;
                }
            };
            providers.insert(name.clone(), strategy);
        }
        Self { providers }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OAuthStrategy>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}
