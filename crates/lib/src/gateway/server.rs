//! Gateway HTTP server (single port).

use crate::auth;
use crate::bot::EchoBot;
use crate::config::{self, Config};
use crate::credentials::{self, Credential};
use crate::delivery::ConnectorClient;
use crate::relay::{Relay, RelayError, RelayOptions};
use crate::token::CredentialTokenSource;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

/// Body of `GET /health`.
pub const HEALTH_TEXT: &str = "Bot is running!";

static STATUS_PAGE: &str = include_str!("../../static/index.html");

/// Shared state for the gateway: the relay is immutable once built.
#[derive(Clone)]
struct GatewayState {
    relay: Arc<Relay>,
}

/// Wire the relay for a resolved credential: JWT auth keyed on the app id, echo bot,
/// connector client with a token fetched per send. One HTTP client (with the delivery
/// timeout) serves token, key, and delivery requests.
pub fn build_relay(config: &Config, credential: Arc<Credential>) -> Result<Relay> {
    let client = reqwest::Client::builder()
        .timeout(config.delivery.timeout())
        .build()
        .context("building HTTP client")?;
    let tokens = Arc::new(CredentialTokenSource::new(
        credential.clone(),
        &config.auth,
        client.clone(),
    ));
    let authenticator = auth::authenticator_for(credential.clone(), &config.auth, client.clone());
    let handler = Arc::new(EchoBot::new(
        &config.bot,
        credential.app_id().map(str::to_string),
    ));
    let sender = Arc::new(ConnectorClient::new(client, tokens));
    Ok(Relay::new(
        authenticator,
        handler,
        sender,
        RelayOptions::from_config(config),
    ))
}

/// Routes for the given relay.
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/", get(status_page))
        .route("/health", get(health))
        .route("/api/messages", post(messages))
        .with_state(GatewayState { relay })
}

/// Run the gateway: resolve the credential, build the relay, bind `server.host:server.port`.
/// Credential errors abort startup. Anonymous mode is refused on a non-loopback bind unless
/// `server.allowAnonymous` is set. Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_server(config: Config) -> Result<()> {
    let credential =
        Arc::new(credentials::credential_from_config(&config).context("resolving credentials")?);
    if !credential.requires_auth()
        && !config::is_loopback_bind(&config.server.host)
        && !config.server.allow_anonymous
    {
        anyhow::bail!(
            "refusing to accept unauthenticated requests on {} (set {} or bind HOST to 127.0.0.1)",
            config.server.host,
            config::ENV_APP_ID
        );
    }
    let relay = Arc::new(build_relay(&config, credential)?);
    serve(&config, relay).await
}

/// Bind and serve the router for `relay` until SIGINT/SIGTERM.
pub async fn serve(config: &Config, relay: Arc<Relay>) -> Result<()> {
    let bind_addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);
    log::info!(
        "messaging endpoint: http://{}/api/messages",
        bind_addr.replace("0.0.0.0", "localhost")
    );

    axum::serve(listener, router(relay))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining connections");
}

fn error_status(err: &RelayError) -> StatusCode {
    match err {
        RelayError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
        RelayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        RelayError::AuthUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::DeliveryFailed(_) => StatusCode::BAD_GATEWAY,
        RelayError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
    }
}

/// POST /api/messages — one turn. 201 when nothing is returned synchronously, the invoke
/// status with a JSON body for invoke answers, 4xx/5xx per [`RelayError`].
async fn messages(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let auth_header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    match state.relay.process(auth_header, &body).await {
        Ok(outcome) => match outcome.invoke_response {
            Some(invoke) => {
                let status = StatusCode::from_u16(invoke.status).unwrap_or(StatusCode::OK);
                let body = invoke.body.unwrap_or(serde_json::Value::Null);
                (status, Json(body)).into_response()
            }
            None => StatusCode::CREATED.into_response(),
        },
        Err(e) => {
            let status = error_status(&e);
            if status.is_server_error() {
                log::error!("/api/messages -> {}: {}", status, e);
            } else {
                log::warn!("/api/messages -> {}: {}", status, e);
            }
            log::debug!(
                "request headers: {:?}",
                headers.keys().map(|k| k.as_str()).collect::<Vec<_>>()
            );
            status.into_response()
        }
    }
}

/// GET /health — static liveness answer; never touches credentials or the backend.
async fn health() -> &'static str {
    HEALTH_TEXT
}

/// GET / — static status page.
async fn status_page() -> Html<&'static str> {
    Html(STATUS_PAGE)
}
