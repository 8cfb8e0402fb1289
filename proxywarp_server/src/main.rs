use std::sync::Arc;

use anyhow::Context;
use proxywarp_common::{
    error::Result,
    serve,
    state::{Config, Protocol},
};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("proxywarp_common=info,proxywarp_server=info")),
        )
        .with_target(true)
        .init();

    info!(
        "loading config from {}",
        confy::get_configuration_file_path("proxywarp", None)?.display()
    );

    let mut config: Config =
        confy::load("proxywarp", None).context("failed to load configuration")?;
    apply_env_overrides(&mut config)?;

    serve(Arc::new(config), shutdown_signal()).await?;

    Ok(())
}

/// The environment wins over the config file for the knobs it names.
fn apply_env_overrides(config: &mut Config) -> anyhow::Result<()> {
    use std::env;

    if let Ok(value) = env::var("PORT") {
        let port: u16 = value.parse().context("PORT must be a port number")?;
        config.host.set_port(port);
    }
    if let Ok(value) = env::var("BASE_DOMAIN") {
        config.base_domain = value;
    }
    if let Ok(value) = env::var("DEBUG") {
        config.debug = matches!(value.as_str(), "1" | "true" | "yes");
    }
    if let Ok(value) = env::var("DB_FILE") {
        config.db_file = value.into();
    }
    if let Ok(value) = env::var("TOKEN_LENGTH") {
        config.token_length = value.parse().context("TOKEN_LENGTH must be a number")?;
    }
    if let Ok(value) = env::var("CLEANUP_INTERVAL_MS") {
        config.cleanup_interval_ms = value
            .parse()
            .context("CLEANUP_INTERVAL_MS must be milliseconds")?;
    }
    if let Ok(value) = env::var("TOKEN_EXPIRATION_MS") {
        config.token_expiration_ms = value
            .parse()
            .context("TOKEN_EXPIRATION_MS must be milliseconds")?;
    }
    if let Ok(value) = env::var("DEFAULT_PROTOCOL") {
        config.default_protocol = value
            .parse::<Protocol>()
            .map_err(|err| anyhow::anyhow!(err))?;
    }
    if let Ok(value) = env::var("USER_AGENT") {
        config.user_agent = value;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_replace_file_values() {
        std::env::set_var("PORT", "8123");
        std::env::set_var("BASE_DOMAIN", "override.example");
        std::env::set_var("DEBUG", "true");
        std::env::set_var("DEFAULT_PROTOCOL", "http");

        let mut config = Config::default();
        apply_env_overrides(&mut config).expect("overrides apply");

        assert_eq!(config.host.port(), 8123);
        assert_eq!(config.base_domain, "override.example");
        assert!(config.debug);
        assert_eq!(config.default_protocol, Protocol::Http);

        std::env::remove_var("PORT");
        std::env::remove_var("BASE_DOMAIN");
        std::env::remove_var("DEBUG");
        std::env::remove_var("DEFAULT_PROTOCOL");
    }
}
