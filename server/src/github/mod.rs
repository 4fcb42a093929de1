use std::sync::Arc;

use thiserror::Error;
use tracing::info;

mod broker;
mod client;
mod jwt;
mod oauth;
pub mod webhook;

pub use broker::AppCredentialBroker;
pub(crate) use client::USER_AGENT;
#[cfg(test)]
pub use client::{AppApi, InstallationToken};
use client::GitHubAppClient;
use jwt::AppJwtSigner;
#[cfg(test)]
pub use oauth::{GitHubEmail, GitHubUser};
use oauth::GitHubOAuthClient;
pub use oauth::{OAuthApi, primary_verified_email};
pub use webhook::GitHubWebhookEvent;

use crate::config::GitHubConfig;
use crate::error::ConnectionError;

#[derive(Error, Debug)]
pub enum AppRegistrationError {
    #[error("GitHub App flow is disabled")]
    Disabled,
    #[error(transparent)]
    InvalidConfig(#[from] ConnectionError),
    #[error("invalid value for github.app_private_key")]
    InvalidPrivateKey(#[from] jsonwebtoken::errors::Error),
}

/// Build the credential broker from the App settings. The private key is
/// parsed here so a broken key fails startup instead of the first request.
pub fn register_app(config: &GitHubConfig) -> Result<AppCredentialBroker, AppRegistrationError> {
    if !config.app_enabled {
        return Err(AppRegistrationError::Disabled);
    }

    let (app_id, private_key) = config.app_credentials()?;
    let signer = AppJwtSigner::new(app_id, private_key)?;
    let api = GitHubAppClient::new(&config.api_url)?;

    info!(app_id, "Successfully registered as github app");

    Ok(AppCredentialBroker::new(signer, Arc::new(api)))
}

/// OAuth client for the legacy flow, if its credentials are configured
pub fn register_oauth(
    config: &GitHubConfig,
    public_url: &str,
) -> Result<Option<GitHubOAuthClient>, ConnectionError> {
    let (Some(client_id), Some(client_secret)) = (
        config.oauth_client_id.as_deref().filter(|s| !s.is_empty()),
        config.oauth_client_secret.as_deref().filter(|s| !s.is_empty()),
    ) else {
        return Ok(None);
    };

    let redirect_url = format!("{}/github/callback", public_url.trim_end_matches('/'));
    GitHubOAuthClient::new(
        client_id,
        client_secret,
        &redirect_url,
        &config.web_url,
        &config.api_url,
    )
    .map(Some)
}

/// Broker signing with the shared test key, against any App API
#[cfg(test)]
pub(crate) fn broker_with_api(api: Arc<dyn AppApi>) -> AppCredentialBroker {
    let signer = AppJwtSigner::new(12345, &crate::tests::test_rsa_keys().private_pem)
        .expect("test key parses");
    AppCredentialBroker::new(signer, api)
}
