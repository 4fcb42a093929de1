use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::db::{DbService, OAuthLink};
use crate::error::ConnectionError;
use crate::github::{OAuthApi, primary_verified_email};

/// Query GitHub appends when it redirects back from the authorize page
#[derive(Debug, Default, Clone, Deserialize)]
pub struct OAuthCallback {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Legacy per-user OAuth connection, kept for users that are not on the
/// App flow. Writes only the user's `OAuthLink`.
pub struct OAuthFallbackFlow {
    db: DbService,
    api: Option<Arc<dyn OAuthApi>>,
}

impl OAuthFallbackFlow {
    pub fn new(db: DbService, api: Option<Arc<dyn OAuthApi>>) -> Self {
        Self { db, api }
    }

    fn api(&self) -> Result<&Arc<dyn OAuthApi>, ConnectionError> {
        self.api
            .as_ref()
            .ok_or_else(|| ConnectionError::configuration("GitHub OAuth client is not configured"))
    }

    /// Authorize URL carrying a stored, single-use `"<random>:<user_id>"`
    /// state
    pub async fn authorize_url(&self, user_id: &str) -> Result<String, ConnectionError> {
        let api = self.api()?;
        let state = self.db.create_oauth_state(user_id).await?;
        Ok(api.authorize_url(&state))
    }

    /// Finish the OAuth flow and store the link. Returns the linked user.
    ///
    /// The user comes from the stored state, never from the callback query,
    /// so a state that was not issued by [`Self::authorize_url`] is rejected
    /// before GitHub is contacted.
    pub async fn complete(&self, params: &OAuthCallback) -> Result<String, ConnectionError> {
        let api = self.api()?;

        let state = params
            .state
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConnectionError::validation("missing state parameter"))?;
        let user_id = self
            .db
            .take_oauth_state(state)
            .await?
            .ok_or(ConnectionError::ExpiredState)?;

        if let Some(error) = &params.error {
            let reason = params.error_description.as_deref().unwrap_or(error);
            return Err(ConnectionError::validation(format!(
                "GitHub authorization failed: {reason}"
            )));
        }

        let code = params
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ConnectionError::validation("missing authorization code"))?;

        let access_token = api.exchange_code(code).await?;
        let user = api.get_user(&access_token).await?;
        let email = match api.get_emails(&access_token).await {
            Ok(emails) => primary_verified_email(&emails).or(user.email.clone()),
            Err(e) => {
                warn!(%user_id, "Failed to fetch GitHub emails, using profile email: {e}");
                user.email.clone()
            },
        };

        let link = OAuthLink {
            is_connected: true,
            access_token: Some(access_token),
            username: Some(user.login.clone()),
            avatar_url: user.avatar_url,
            email,
            connected_at: Some(Utc::now()),
        };
        if !self.db.set_oauth_link(&user_id, &link).await? {
            return Err(ConnectionError::NotFound);
        }

        info!(%user_id, github_login = %user.login, "Connected GitHub account via OAuth");
        Ok(user_id)
    }
}
