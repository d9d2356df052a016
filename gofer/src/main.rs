mod conf;
mod engine;
mod object_store;
mod scheduler;
mod secret_store;
mod storage;

use anyhow::{Context, Result};
use std::str::FromStr;
use tokio::signal;
use tracing::warn;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

fn init_logger(log_level: &str, pretty: bool) -> Result<()> {
    let level =
        LevelFilter::from_str(log_level).context("could not parse 'log_level' configuration")?;

    let filter = EnvFilter::from_default_env()
        // These directives filter out debug information that is too numerous and we generally
        // don't need during development.
        .add_directive("sqlx=off".parse().expect("Invalid directive"))
        .add_directive("hyper=off".parse().expect("Invalid directive"))
        .add_directive("rustls=off".parse().expect("Invalid directive"))
        .add_directive("bollard=off".parse().expect("Invalid directive"))
        .add_directive("reqwest=off".parse().expect("Invalid directive"))
        .add_directive(level.into()); // Accept the configured level and above for everything else.

    if pretty {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();

        warn!("pretty logging activated due to config value 'development.pretty_logging'");
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    }

    Ok(())
}

async fn listen_for_terminate_signal() {
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

#[tokio::main]
async fn main() -> Result<()> {
    let config = conf::Configuration::<conf::api::ApiConfig>::load(None)
        .context("Could not initialize configuration")?;

    init_logger(&config.api.log_level, config.development.pretty_logging)?;

    let engine = engine::Engine::new(config)
        .await
        .context("Could not initialize engine")?;

    engine.start().await.context("Could not start engine")?;

    listen_for_terminate_signal().await;

    engine.stop().await;

    Ok(())
}
