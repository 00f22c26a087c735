//! Email delivery for two-factor login codes.
//!
//! Handlers talk to the [`Mailer`] trait so tests can capture outgoing
//! codes instead of speaking SMTP.

use askama::Template;
use async_trait::async_trait;
use lettre::message::{MultiPart, SinglePart};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::sync::Arc;

#[derive(Template)]
#[template(path = "two_factor_email.html")]
pub struct TwoFactorEmailTemplate {
    pub username: String,
    pub code: String,
    pub ttl_minutes: u64,
}

impl TwoFactorEmailTemplate {
    pub fn render_text(&self) -> String {
        format!(
            r#"Hello {},

Your OnAir verification code is: {}

It expires in {} minutes. If you did not try to sign in, you can ignore
this message.

The OnAir Campus Radio Team"#,
            self.username, self.code, self.ttl_minutes
        )
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver a login verification code. Returns false on any failure;
    /// the caller decides whether that aborts the flow.
    async fn send_two_factor_code(&self, to: &str, username: &str, code: &str) -> bool;
}

pub struct SmtpMailer {
    transport: Arc<AsyncSmtpTransport<Tokio1Executor>>,
    from: String,
}

impl SmtpMailer {
    pub fn new(transport: Arc<AsyncSmtpTransport<Tokio1Executor>>, from: String) -> Self {
        Self { transport, from }
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    #[tracing::instrument(skip(self, code))]
    async fn send_two_factor_code(&self, to: &str, username: &str, code: &str) -> bool {
        let template = TwoFactorEmailTemplate {
            username: username.to_string(),
            code: code.to_string(),
            ttl_minutes: crate::auth::two_factor::CODE_TTL.as_secs() / 60,
        };

        let html_body = match template.render() {
            Ok(html) => html,
            Err(e) => {
                tracing::error!(error = %e, "failed to render verification email template");
                return false;
            }
        };
        let text_body = template.render_text();

        let from = match self.from.parse() {
            Ok(from) => from,
            Err(e) => {
                tracing::error!(error = %e, "configured smtp from address is invalid");
                return false;
            }
        };
        let to_mbox = match to.parse() {
            Ok(to_mbox) => to_mbox,
            Err(e) => {
                tracing::warn!(error = %e, "recipient address is invalid");
                return false;
            }
        };

        let message = lettre::Message::builder()
            .from(from)
            .to(to_mbox)
            .subject("Your OnAir sign-in code")
            .header(lettre::message::header::MIME_VERSION_1_0)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(lettre::message::header::ContentType::TEXT_PLAIN)
                            .body(text_body),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(lettre::message::header::ContentType::TEXT_HTML)
                            .body(html_body),
                    ),
            );

        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(error = %e, "failed to build verification email");
                return false;
            }
        };

        if let Err(e) = self.transport.send(message).await {
            tracing::error!(error = %e, "failed to send verification email");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_renders_code_in_both_bodies() {
        let template = TwoFactorEmailTemplate {
            username: "dj".to_string(),
            code: "493021".to_string(),
            ttl_minutes: 5,
        };
        let html = template.render().unwrap();
        assert!(html.contains("493021"));
        assert!(html.contains("dj"));

        let text = template.render_text();
        assert!(text.contains("493021"));
        assert!(text.contains("5 minutes"));
    }
}
