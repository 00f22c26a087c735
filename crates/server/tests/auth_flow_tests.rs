//! End-to-end login flows over the HTTP surface: password login, the
//! two-token 2FA handshake, lockout and logout.

use async_trait::async_trait;
use axum_test::{TestServer, TestServerConfig};
use onair_server::auth::hash_password;
use onair_server::config::{
    AppConfig, LockoutConfig, SmtpConfig, WebAuthnConfig,
};
use onair_server::entity::user;
use onair_server::mail::Mailer;
use onair_server::{AppResources, api};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ConnectionTrait, Database, DatabaseConnection, DbBackend,
    Statement,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;

/// Captures outgoing verification codes instead of speaking SMTP.
#[derive(Clone, Default)]
struct MockMailer {
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockMailer {
    fn last_code(&self) -> Option<String> {
        self.sent.lock().unwrap().last().map(|(_, code)| code.clone())
    }
}

#[async_trait]
impl Mailer for MockMailer {
    async fn send_two_factor_code(&self, to: &str, _username: &str, code: &str) -> bool {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), code.to_string()));
        true
    }
}

fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".into(),
        smtp: SmtpConfig {
            server: "smtp.example.org".into(),
            port: 587,
            username: "onair".into(),
            password: "secret".into(),
            from: "OnAir <no-reply@radio.example.org>".into(),
        },
        frontend_url: "http://localhost:5173".into(),
        public_origin: "http://localhost:8080".into(),
        session_secret: "test-session-secret-0123456789abcdef".into(),
        state_secret: "test-state-secret-0123456789abcdefgh".into(),
        webauthn: WebAuthnConfig {
            rp_id: "localhost".into(),
            rp_origin: "http://localhost:8080".into(),
            rp_name: "OnAir Campus Radio".into(),
        },
        lockout: LockoutConfig {
            max_failures: 3,
            window_secs: 600,
            lock_secs: 900,
        },
        oauth: HashMap::new(),
    }
}

async fn setup_test_db() -> Arc<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await.expect("connect");

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        r#"CREATE TABLE user (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT,
            role TEXT NOT NULL,
            status TEXT NOT NULL,
            password_changed_at TEXT,
            email TEXT,
            email_verified INTEGER NOT NULL DEFAULT 0,
            two_factor TEXT NOT NULL DEFAULT 'none',
            totp_secret TEXT,
            created_at TEXT NOT NULL,
            last_login_at TEXT
        );"#,
    ))
    .await
    .expect("create user table");

    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        r#"CREATE TABLE user_identity (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            provider_user_id TEXT NOT NULL,
            provider_username TEXT NOT NULL,
            counter INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE(provider, provider_user_id)
        );"#,
    ))
    .await
    .expect("create user_identity table");

    Arc::new(db)
}

async fn insert_user(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
    two_factor: &str,
) -> String {
    let id = uuid::Uuid::new_v4().to_string();
    user::ActiveModel {
        id: Set(id.clone()),
        username: Set(username.to_string()),
        password_hash: Set(Some(hash_password(password).expect("hash"))),
        role: Set("member".to_string()),
        status: Set(user::STATUS_ACTIVE.to_string()),
        password_changed_at: Set(None),
        email: Set(Some(format!("{username}@campus.example.org"))),
        email_verified: Set(true),
        two_factor: Set(two_factor.to_string()),
        totp_secret: Set(None),
        created_at: Set(OffsetDateTime::now_utc()),
        last_login_at: Set(None),
    }
    .insert(db)
    .await
    .expect("insert user");
    id
}

async fn spawn_server(mailer: MockMailer) -> (TestServer, Arc<DatabaseConnection>) {
    let db = setup_test_db().await;
    let resources = AppResources::new(db.clone(), Arc::new(mailer), Arc::new(test_config()))
        .expect("build resources");
    let app = api::build_router(resources);
    let server = TestServer::new_with_config(
        app,
        TestServerConfig {
            save_cookies: true,
            ..TestServerConfig::default()
        },
    )
    .expect("create test server");
    (server, db)
}

#[tokio::test]
async fn password_login_establishes_session() {
    let (server, db) = spawn_server(MockMailer::default()).await;
    insert_user(&db, "dj", "on-air-after-dark", user::TWO_FACTOR_NONE).await;

    let response = server
        .post("/auth/login")
        .json(&json!({ "username": "dj", "password": "on-air-after-dark" }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["user"]["username"], "dj");
    // Credential material never leaves the server.
    assert!(body["user"].get("password_hash").is_none());

    let me = server.get("/auth/me").await;
    me.assert_status_ok();
    let body: Value = me.json();
    assert_eq!(body["user"]["username"], "dj");
}

#[tokio::test]
async fn wrong_password_is_a_generic_401() {
    let (server, db) = spawn_server(MockMailer::default()).await;
    insert_user(&db, "dj", "on-air-after-dark", user::TWO_FACTOR_NONE).await;

    let response = server
        .post("/auth/login")
        .json(&json!({ "username": "dj", "password": "wrong" }))
        .await;
    response.assert_status_unauthorized();
    let body: Value = response.json();
    assert_eq!(body["statusCode"], 401);
    assert_eq!(body["message"], "Invalid username or password");

    // Unknown usernames produce the identical response.
    let response = server
        .post("/auth/login")
        .json(&json!({ "username": "nobody", "password": "wrong" }))
        .await;
    response.assert_status_unauthorized();
    let body2: Value = response.json();
    assert_eq!(body["message"], body2["message"]);
}

#[tokio::test]
async fn repeated_failures_lock_the_account() {
    let (server, db) = spawn_server(MockMailer::default()).await;
    insert_user(&db, "dj", "on-air-after-dark", user::TWO_FACTOR_NONE).await;

    for _ in 0..3 {
        server
            .post("/auth/login")
            .json(&json!({ "username": "dj", "password": "wrong" }))
            .await
            .assert_status_unauthorized();
    }

    // Even the correct password is refused while locked.
    let response = server
        .post("/auth/login")
        .json(&json!({ "username": "dj", "password": "on-air-after-dark" }))
        .await;
    response.assert_status_forbidden();
    let body: Value = response.json();
    assert!(
        body["message"]
            .as_str()
            .unwrap()
            .contains("Too many failed attempts")
    );
}

#[tokio::test]
async fn withdrawn_account_cannot_log_in() {
    let (server, db) = spawn_server(MockMailer::default()).await;
    insert_user(&db, "dj", "on-air-after-dark", user::TWO_FACTOR_NONE).await;
    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        "UPDATE user SET status = 'withdrawn' WHERE username = 'dj';",
    ))
    .await
    .expect("withdraw user");

    let response = server
        .post("/auth/login")
        .json(&json!({ "username": "dj", "password": "on-air-after-dark" }))
        .await;
    response.assert_status_forbidden();
}

#[tokio::test]
async fn email_two_factor_round_trip() {
    let mailer = MockMailer::default();
    let (server, db) = spawn_server(mailer.clone()).await;
    insert_user(&db, "dj", "on-air-after-dark", user::TWO_FACTOR_EMAIL).await;

    // First factor yields a pre-auth grant, not a session.
    let response = server
        .post("/auth/login")
        .json(&json!({ "username": "dj", "password": "on-air-after-dark" }))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["twoFactorRequired"], true);
    assert_eq!(body["method"], "email");
    let pre_auth = body["preAuthToken"].as_str().expect("pre-auth token").to_string();

    // The pre-auth grant does not pass session checks.
    let me = server
        .get("/auth/me")
        .authorization_bearer(&pre_auth)
        .await;
    me.assert_status_forbidden();

    // Request the code and read it off the mock mailer.
    server
        .post("/auth/2fa/send-email")
        .authorization_bearer(&pre_auth)
        .json(&json!({ "email": "dj@campus.example.org" }))
        .await
        .assert_status_ok();
    let code = mailer.last_code().expect("code captured");

    // A wrong guess is rejected.
    server
        .post("/auth/2fa/verify")
        .authorization_bearer(&pre_auth)
        .json(&json!({ "code": "000000" }))
        .await
        .assert_status_unauthorized();

    // The right code completes the login.
    let response = server
        .post("/auth/2fa/verify")
        .authorization_bearer(&pre_auth)
        .json(&json!({ "code": code }))
        .await;
    response.assert_status_ok();

    server.get("/auth/me").await.assert_status_ok();
}

#[tokio::test]
async fn email_code_is_single_use() {
    let mailer = MockMailer::default();
    let (server, db) = spawn_server(mailer.clone()).await;
    insert_user(&db, "dj", "on-air-after-dark", user::TWO_FACTOR_EMAIL).await;

    let body: Value = server
        .post("/auth/login")
        .json(&json!({ "username": "dj", "password": "on-air-after-dark" }))
        .await
        .json();
    let pre_auth = body["preAuthToken"].as_str().unwrap().to_string();

    server
        .post("/auth/2fa/send-email")
        .authorization_bearer(&pre_auth)
        .json(&json!({ "email": "dj@campus.example.org" }))
        .await
        .assert_status_ok();
    let code = mailer.last_code().unwrap();

    server
        .post("/auth/2fa/verify")
        .authorization_bearer(&pre_auth)
        .json(&json!({ "code": code }))
        .await
        .assert_status_ok();

    // Replaying the consumed code fails.
    server
        .post("/auth/2fa/verify")
        .authorization_bearer(&pre_auth)
        .json(&json!({ "code": code }))
        .await
        .assert_status_unauthorized();
}

#[tokio::test]
async fn email_code_is_refused_for_an_unverified_address() {
    let mailer = MockMailer::default();
    let (server, db) = spawn_server(mailer.clone()).await;
    insert_user(&db, "dj", "on-air-after-dark", user::TWO_FACTOR_EMAIL).await;
    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        "UPDATE user SET email_verified = 0 WHERE username = 'dj';",
    ))
    .await
    .expect("unverify email");

    let body: Value = server
        .post("/auth/login")
        .json(&json!({ "username": "dj", "password": "on-air-after-dark" }))
        .await
        .json();
    let pre_auth = body["preAuthToken"].as_str().unwrap().to_string();

    server
        .post("/auth/2fa/send-email")
        .authorization_bearer(&pre_auth)
        .json(&json!({ "email": "dj@campus.example.org" }))
        .await
        .assert_status_bad_request();
    assert!(mailer.last_code().is_none());
}

#[tokio::test]
async fn email_code_requires_the_account_address() {
    let mailer = MockMailer::default();
    let (server, db) = spawn_server(mailer.clone()).await;
    insert_user(&db, "dj", "on-air-after-dark", user::TWO_FACTOR_EMAIL).await;

    let body: Value = server
        .post("/auth/login")
        .json(&json!({ "username": "dj", "password": "on-air-after-dark" }))
        .await
        .json();
    let pre_auth = body["preAuthToken"].as_str().unwrap().to_string();

    // A different address is refused and nothing is sent.
    server
        .post("/auth/2fa/send-email")
        .authorization_bearer(&pre_auth)
        .json(&json!({ "email": "attacker@elsewhere.example.org" }))
        .await
        .assert_status_bad_request();
    assert!(mailer.last_code().is_none());

    // Case differences in the stored address are tolerated.
    server
        .post("/auth/2fa/send-email")
        .authorization_bearer(&pre_auth)
        .json(&json!({ "email": "DJ@Campus.Example.Org" }))
        .await
        .assert_status_ok();
    assert!(mailer.last_code().is_some());
}

#[tokio::test]
async fn withdrawn_account_cannot_request_email_codes() {
    let mailer = MockMailer::default();
    let (server, db) = spawn_server(mailer.clone()).await;
    insert_user(&db, "dj", "on-air-after-dark", user::TWO_FACTOR_EMAIL).await;

    let body: Value = server
        .post("/auth/login")
        .json(&json!({ "username": "dj", "password": "on-air-after-dark" }))
        .await
        .json();
    let pre_auth = body["preAuthToken"].as_str().unwrap().to_string();

    // Withdrawal between the first factor and the code request closes the door.
    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        "UPDATE user SET status = 'withdrawn' WHERE username = 'dj';",
    ))
    .await
    .expect("withdraw user");

    server
        .post("/auth/2fa/send-email")
        .authorization_bearer(&pre_auth)
        .json(&json!({ "email": "dj@campus.example.org" }))
        .await
        .assert_status_forbidden();
    assert!(mailer.last_code().is_none());
}

#[tokio::test]
async fn totp_two_factor_round_trip() {
    let (server, db) = spawn_server(MockMailer::default()).await;
    insert_user(&db, "dj", "on-air-after-dark", user::TWO_FACTOR_TOTP).await;

    let secret = totp_rs::Secret::generate_secret();
    let encoded = secret.to_encoded().to_string();
    db.execute(Statement::from_string(
        DbBackend::Sqlite,
        format!("UPDATE user SET totp_secret = '{encoded}' WHERE username = 'dj';"),
    ))
    .await
    .expect("store totp secret");

    let body: Value = server
        .post("/auth/login")
        .json(&json!({ "username": "dj", "password": "on-air-after-dark" }))
        .await
        .json();
    assert_eq!(body["method"], "totp");
    let pre_auth = body["preAuthToken"].as_str().unwrap().to_string();

    let totp = totp_rs::TOTP::new(
        totp_rs::Algorithm::SHA1,
        6,
        1,
        30,
        secret.to_bytes().unwrap(),
    )
    .unwrap();
    let code = totp.generate_current().unwrap();

    server
        .post("/auth/2fa/verify")
        .authorization_bearer(&pre_auth)
        .json(&json!({ "code": code }))
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn session_token_is_rejected_on_pre_auth_endpoints() {
    let (server, db) = spawn_server(MockMailer::default()).await;
    insert_user(&db, "dj", "on-air-after-dark", user::TWO_FACTOR_NONE).await;

    let response = server
        .post("/auth/login")
        .json(&json!({ "username": "dj", "password": "on-air-after-dark" }))
        .await;
    response.assert_status_ok();
    let session_cookie = response.cookie("auth-token");

    // A full session presented as a pre-auth grant is the wrong kind.
    let response = server
        .post("/auth/2fa/verify")
        .authorization_bearer(session_cookie.value())
        .json(&json!({ "code": "123456" }))
        .await;
    response.assert_status_forbidden();
}

#[tokio::test]
async fn logout_clears_the_session() {
    let (server, db) = spawn_server(MockMailer::default()).await;
    insert_user(&db, "dj", "on-air-after-dark", user::TWO_FACTOR_NONE).await;

    server
        .post("/auth/login")
        .json(&json!({ "username": "dj", "password": "on-air-after-dark" }))
        .await
        .assert_status_ok();
    server.get("/auth/me").await.assert_status_ok();

    server.post("/auth/logout").await.assert_status_ok();
    server.get("/auth/me").await.assert_status_unauthorized();
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (server, _db) = spawn_server(MockMailer::default()).await;
    server.get("/healthz").await.assert_status_ok();
}
