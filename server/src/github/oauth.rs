use async_trait::async_trait;
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, RequestTokenError,
    Scope, TokenResponse, TokenUrl,
};
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::client::USER_AGENT;
use crate::error::ConnectionError;

/// Scopes requested by the legacy OAuth connection
pub const OAUTH_SCOPES: [&str; 3] = ["read:user", "user:email", "repo"];

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubUser {
    pub id: i64,
    pub login: String,
    pub avatar_url: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubEmail {
    pub email: String,
    pub primary: bool,
    pub verified: bool,
}

/// Pick the address GitHub marks as primary, if it is verified
pub fn primary_verified_email(emails: &[GitHubEmail]) -> Option<String> {
    emails
        .iter()
        .find(|e| e.primary && e.verified)
        .map(|e| e.email.clone())
}

/// The OAuth web flow against GitHub
#[async_trait]
pub trait OAuthApi: Send + Sync {
    fn authorize_url(&self, state: &str) -> String;

    /// Trade the callback `code` for a user access token
    async fn exchange_code(&self, code: &str) -> Result<String, ConnectionError>;

    async fn get_user(&self, access_token: &str) -> Result<GitHubUser, ConnectionError>;

    async fn get_emails(&self, access_token: &str) -> Result<Vec<GitHubEmail>, ConnectionError>;
}

pub struct GitHubOAuthClient {
    client: BasicClient,
    http: reqwest::Client,
    api_url: String,
}

impl GitHubOAuthClient {
    pub fn new(
        client_id: &str,
        client_secret: &str,
        redirect_url: &str,
        web_url: &str,
        api_url: &str,
    ) -> Result<Self, ConnectionError> {
        let web_url = web_url.trim_end_matches('/');
        let client = BasicClient::new(
            ClientId::new(client_id.to_string()),
            Some(ClientSecret::new(client_secret.to_string())),
            AuthUrl::new(format!("{web_url}/login/oauth/authorize"))
                .map_err(|e| ConnectionError::configuration(format!("invalid auth URL: {e}")))?,
            Some(
                TokenUrl::new(format!("{web_url}/login/oauth/access_token")).map_err(|e| {
                    ConnectionError::configuration(format!("invalid token URL: {e}"))
                })?,
            ),
        )
        .set_redirect_uri(
            RedirectUrl::new(redirect_url.to_string())
                .map_err(|e| ConnectionError::configuration(format!("invalid redirect URL: {e}")))?,
        );

        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;

        Ok(Self {
            client,
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        access_token: &str,
    ) -> Result<T, ConnectionError> {
        let response = self
            .http
            .get(format!("{}{path}", self.api_url))
            .bearer_auth(access_token)
            .header(ACCEPT, "application/vnd.github+json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectionError::upstream(status.as_u16(), body));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl OAuthApi for GitHubOAuthClient {
    fn authorize_url(&self, state: &str) -> String {
        let state = state.to_string();
        let (url, _) = self
            .client
            .authorize_url(move || CsrfToken::new(state))
            .add_scopes(OAUTH_SCOPES.iter().map(|s| Scope::new(s.to_string())))
            .url();
        url.to_string()
    }

    async fn exchange_code(&self, code: &str) -> Result<String, ConnectionError> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| match e {
                RequestTokenError::ServerResponse(response) => {
                    ConnectionError::upstream(400, response.to_string())
                },
                other => ConnectionError::upstream(502, other.to_string()),
            })?;

        Ok(token.access_token().secret().clone())
    }

    async fn get_user(&self, access_token: &str) -> Result<GitHubUser, ConnectionError> {
        self.get_json("/user", access_token).await
    }

    async fn get_emails(&self, access_token: &str) -> Result<Vec<GitHubEmail>, ConnectionError> {
        self.get_json("/user/emails", access_token).await
    }
}
