use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::JwtService;
use crate::config::Config;
use crate::connection::ConnectionService;
use crate::db::DbService;
use crate::github::{self, OAuthApi};
use crate::regeneration::RegenerationService;
use crate::web::{AppState, WebService};

mod async_service;
pub use async_service::AsyncService;

pub async fn start_services(config: Config) -> Result<()> {
    let db_service = DbService::new(&config.db_path)
        .await
        .context("attempted to create DB pool")?;

    let db_pool = db_service.pool.clone();

    let broker = match github::register_app(&config.github) {
        Ok(broker) => Some(Arc::new(broker)),
        Err(github::AppRegistrationError::Disabled) => {
            info!("GitHub App flow is disabled, only OAuth connections are available");
            None
        },
        Err(e) => Err(e).context("failed to register GitHub app")?,
    };

    let oauth_api: Option<Arc<dyn OAuthApi>> =
        match github::register_oauth(&config.github, &config.public_url)
            .context("failed to configure GitHub OAuth client")?
        {
            Some(client) => Some(Arc::new(client)),
            None => {
                // Not an error: deployments on the App flow have no use for it.
                warn!("Skipping GitHub OAuth client: github.oauth_client_id/secret are not set");
                None
            },
        };

    let regeneration_service =
        RegenerationService::new(config.regeneration.endpoint.clone(), broker.clone())?;

    let connection = ConnectionService::new(
        &config,
        db_service.clone(),
        broker,
        oauth_api,
        regeneration_service.get_sender(),
    );

    let state = AppState {
        connection,
        jwt_service: JwtService::new(&config.session_secret),
        frontend_url: config.frontend_url.as_str().into(),
    };

    let web_service = WebService::bind_to_address(&config.web.address, state)
        .await
        .context("failed to start web service")?;

    // Use `bind_addr` instead of the `addr` + `port` given by the user, to ensure the printed
    // address is always correct (even for funny things like setting the port to 0).
    info!(
        "Serving GitHub connection service on http://{}",
        web_service.bind_addr(),
    );

    let cancellation_token = CancellationToken::new();

    let regeneration_handle = regeneration_service.run(cancellation_token.clone());
    let web_handle = tokio::spawn(web_service.run(cancellation_token.clone()));

    let mut sigterm = signal(SignalKind::terminate()).context("failed to get sigterm handle")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to get sigint handle")?;

    tokio::select! {
        biased;
        _ = sigterm.recv() => {
            info!("Received SIGTERM, gracefully shutting down");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, gracefully shutting down");
        }
    }

    cancellation_token.cancel();

    // Wait for the services to shutdown
    _ = tokio::join!(web_handle, regeneration_handle);

    db_pool.close().await;

    info!("Database service pool closed");
    info!("All services shutdown gracefully");

    Ok(())
}
