use lettre::{AsyncSmtpTransport, Tokio1Executor, transport::smtp::authentication::Credentials};
use onair_server::AppResources;
use onair_server::api::start_webserver;
use onair_server::config::load_config_or_panic;
use onair_server::mail::SmtpMailer;
use sea_orm::Database;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn initialize_tracing() {
    let default_directives = "onair_server=info,hyper=warn,sea_orm=info";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_target(true).with_level(true);

    registry.with(layer).init();
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install().expect("Failed to install `color_eyre::install`");
    dotenvy::dotenv().ok();

    initialize_tracing();

    let config = Arc::new(load_config_or_panic());

    // Set up SeaORM database connection
    let db = Arc::new(
        Database::connect(&config.database_url)
            .await
            .expect("Failed to connect to database"),
    );

    // Set up lettre SMTP client
    let creds = Credentials::new(config.smtp.username.clone(), config.smtp.password.clone());
    let transport = Arc::new(
        AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp.server)
            .expect("Failed to build SMTP transport")
            .port(config.smtp.port)
            .credentials(creds)
            .build(),
    );
    let mailer = Arc::new(SmtpMailer::new(transport, config.smtp.from.clone()));

    let resources = AppResources::new(db, mailer, config)
        .map_err(|e| color_eyre::Report::msg(format!("Failed to build resources: {e}")))?;

    if resources.providers.names().is_empty() {
        tracing::warn!("no oauth providers configured; external login disabled");
    }

    start_webserver(resources).await
}
