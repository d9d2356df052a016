//! A small, separately bound web service whose only job is accepting events from the outside
//! world (webhooks and the like) and forwarding them, payload untouched, to the named extension.

use crate::engine::{extensions, Engine};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Router,
};
use std::sync::Arc;
use tracing::{error, info};

pub async fn start_web_service(engine: Arc<Engine>) -> Result<()> {
    let bind_address = engine.config.external_events.bind_address.clone();

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| {
            format!(
                "Could not bind external events service to address '{bind_address}'; \
                should be in format '<ip>:<port>'"
            )
        })?;

    let shutdown = engine.shutdown.clone();

    let router = Router::new()
        .route("/external/{extension_id}", post(external_event_handler))
        .with_state(engine);

    info!(
        bind_address = bind_address,
        "Started external events http service"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("External events service failed while serving")?;

    Ok(())
}

/// Forwards the raw request body to the named extension's external event endpoint. The payload
/// is completely opaque to Gofer; interpreting it is the extension's job.
async fn external_event_handler(
    State(engine): State<Arc<Engine>>,
    Path(extension_id): Path<String>,
    body: Bytes,
) -> StatusCode {
    let extension = match engine.extensions.get(&extension_id) {
        Some(extension) => extension.value().clone(),
        None => return StatusCode::BAD_REQUEST,
    };

    let client = match extensions::ExtensionClient::new(
        &extension.url,
        &extension.secret,
        engine.config.extensions.verify_certs,
    ) {
        Ok(client) => client,
        Err(e) => {
            error!(extension_id = extension_id, error = %e,
                "Could not create extension client while forwarding external event");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    if let Err(e) = client.external_event(body.to_vec()).await {
        error!(extension_id = extension_id, error = %e,
            "Could not forward external event to extension");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    StatusCode::NO_CONTENT
}
