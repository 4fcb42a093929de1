use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use octocrab::Octocrab;
use octocrab::models::Installation;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use shared::types::InstallationSummary;
use tokio::pin;
use tracing::debug;

use crate::error::ConnectionError;

const GITHUB_JSON: &str = "application/vnd.github+json";
const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const API_VERSION: &str = "2022-11-28";
pub(crate) const USER_AGENT: &str = concat!("ghlink/", env!("CARGO_PKG_VERSION"));

/// Short-lived installation access token as returned by GitHub
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// GitHub endpoints that are called with the App JWT
#[async_trait]
pub trait AppApi: Send + Sync {
    async fn create_installation_token(
        &self,
        app_jwt: &str,
        installation_id: i64,
    ) -> Result<InstallationToken, ConnectionError>;

    async fn list_installations(
        &self,
        app_jwt: &str,
    ) -> Result<Vec<InstallationSummary>, ConnectionError>;
}

pub struct GitHubAppClient {
    http: reqwest::Client,
    api_url: String,
}

impl GitHubAppClient {
    pub fn new(api_url: &str) -> Result<Self, ConnectionError> {
        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    fn octocrab(&self, app_jwt: &str) -> Result<Octocrab, ConnectionError> {
        Octocrab::builder()
            .base_uri(self.api_url.as_str())
            .and_then(|builder| builder.personal_token(app_jwt.to_string()).build())
            .map_err(|e| ConnectionError::Internal(e.into()))
    }
}

#[async_trait]
impl AppApi for GitHubAppClient {
    async fn create_installation_token(
        &self,
        app_jwt: &str,
        installation_id: i64,
    ) -> Result<InstallationToken, ConnectionError> {
        let url = format!(
            "{}/app/installations/{installation_id}/access_tokens",
            self.api_url
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(app_jwt)
            .header(ACCEPT, GITHUB_JSON)
            .header(API_VERSION_HEADER, API_VERSION)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectionError::upstream(status.as_u16(), body));
        }

        let token: InstallationToken = response.json().await?;
        debug!(
            installation_id,
            expires_at = %token.expires_at,
            "Exchanged App JWT for an installation token"
        );
        Ok(token)
    }

    async fn list_installations(
        &self,
        app_jwt: &str,
    ) -> Result<Vec<InstallationSummary>, ConnectionError> {
        let octocrab = self.octocrab(app_jwt)?;
        let first_page = octocrab
            .apps()
            .installations()
            .send()
            .await
            .map_err(octocrab_error)?;

        let stream = first_page.into_stream(&octocrab);
        pin!(stream);

        let mut installations = Vec::new();
        while let Some(installation) = stream.try_next().await.map_err(octocrab_error)? {
            installations.push(summarize(&installation));
        }

        Ok(installations)
    }
}

fn octocrab_error(e: octocrab::Error) -> ConnectionError {
    match e {
        octocrab::Error::GitHub { source, .. } => {
            ConnectionError::upstream(source.status_code.as_u16(), source.message)
        },
        other => ConnectionError::Internal(other.into()),
    }
}

fn summarize(installation: &Installation) -> InstallationSummary {
    InstallationSummary {
        installation_id: installation.id.0 as i64,
        account_login: installation.account.login.clone(),
        account_id: installation.account.id.0 as i64,
        account_type: installation.account.r#type.clone(),
        repository_selection: installation
            .repository_selection
            .clone()
            .unwrap_or_else(|| "all".to_string()),
    }
}
