use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRef, Json, Query, State};
use axum::http::header::LOCATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use shared::types::{ConnectionStatus, DisconnectResponse, InstallationSummary, WebhookAck};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::{AdminUser, AuthUser, JwtService};
use crate::connection::{
    ConnectionService, OAuthCallback, SetupCallback, WebhookDelivery, settings_error_url,
    settings_url,
};
use crate::error::ConnectionError;

/// GitHub caps webhook payloads at 25 MB
const WEBHOOK_BODY_LIMIT: usize = 25 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub connection: ConnectionService,
    pub jwt_service: JwtService,
    pub frontend_url: Arc<str>,
}

// Implement FromRef so extractors can access JwtService from AppState
impl FromRef<AppState> for JwtService {
    fn from_ref(state: &AppState) -> Self {
        state.jwt_service.clone()
    }
}

pub struct WebService {
    listener: TcpListener,
    state: AppState,
}

impl WebService {
    pub async fn bind_to_address(socket: &SocketAddrV4, state: AppState) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(socket)
            .await
            .context(format!("failed to bind to tcp socket at {socket}"))?;

        Ok(Self { listener, state })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        // If the call fails either the system ran out of resources or libc is broken, for both of
        // these cases a panic seems appropiate.
        self.listener
            .local_addr()
            .expect("getsockname should always succeed on a properly initialized listener")
    }

    pub async fn run(self, cancellation_token: CancellationToken) {
        let app = router(self.state);

        if let Err(e) = axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                cancellation_token.cancelled().await;
                info!("Web service shutting down")
            })
            .await
        {
            error!(error = %e, "Failed to start web service");
            return;
        }

        info!("Web service shutdown gracefully")
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/webhook/github",
            post(handle_github_webhook).layer(DefaultBodyLimit::max(WEBHOOK_BODY_LIMIT)),
        )
        .nest("/github", github_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Prefixed with /github/ path
fn github_routes() -> Router<AppState> {
    Router::new()
        // Browser flows, always answered with a redirect
        .route("/auth", get(initiate_handler))
        .route("/callback", get(oauth_callback_handler))
        .route("/setup", get(setup_handler))
        // Authenticated API
        .route("/status", get(status_handler).delete(disconnect_handler))
        // Admin routes (protected)
        .route("/app/installations", get(list_installations_handler))
}

/// 302 to `location`
fn found(location: String) -> Response {
    (StatusCode::FOUND, [(LOCATION, location)]).into_response()
}

fn error_redirect(state: &AppState, flow: &str, error: ConnectionError) -> Response {
    if error.status_code().is_server_error() {
        error!(%flow, "GitHub connection flow failed: {error}");
    } else {
        warn!(%flow, "GitHub connection flow rejected: {error}");
    }
    found(settings_error_url(&state.frontend_url, &error))
}

async fn initiate_handler(user: AuthUser, State(state): State<AppState>) -> Response {
    match state.connection.initiate(user.user_id()).await {
        Ok(url) => found(url),
        Err(e) => error_redirect(&state, "initiate", e),
    }
}

async fn oauth_callback_handler(
    State(state): State<AppState>,
    Query(params): Query<OAuthCallback>,
) -> Response {
    match state.connection.oauth.complete(&params).await {
        Ok(_) => found(settings_url(&state.frontend_url, &[("github_connected", "true")])),
        Err(e) => error_redirect(&state, "oauth_callback", e),
    }
}

async fn setup_handler(
    State(state): State<AppState>,
    Query(params): Query<SetupCallback>,
) -> Response {
    match state.connection.engine.complete_setup(&params).await {
        Ok(_) => found(settings_url(
            &state.frontend_url,
            &[("github_app_connected", "true")],
        )),
        Err(e) => error_redirect(&state, "app_setup", e),
    }
}

async fn handle_github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ConnectionError> {
    let delivery = WebhookDelivery::from_headers(&headers, &body);
    state.connection.engine.process_delivery(delivery).await.map(Json)
}

async fn status_handler(
    user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<ConnectionStatus>, ConnectionError> {
    state.connection.status.get_status(user.user_id()).await.map(Json)
}

async fn disconnect_handler(
    user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<DisconnectResponse>, ConnectionError> {
    state.connection.status.disconnect(user.user_id()).await.map(Json)
}

async fn list_installations_handler(
    admin: AdminUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<InstallationSummary>>, ConnectionError> {
    let broker = state
        .connection
        .broker
        .as_ref()
        .ok_or_else(|| ConnectionError::configuration("GitHub App flow is disabled"))?;

    let installations = broker.list_installations().await?;
    info!(
        admin = %admin.user.user_id(),
        count = installations.len(),
        "Listed App installations"
    );
    Ok(Json(installations))
}
