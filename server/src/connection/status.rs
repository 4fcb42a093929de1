use shared::types::{ConnectionStatus, DisconnectResponse};
use tracing::info;

use crate::db::DbService;
use crate::error::ConnectionError;

#[derive(Clone)]
pub struct StatusFacade {
    db: DbService,
}

impl StatusFacade {
    pub fn new(db: DbService) -> Self {
        Self { db }
    }

    pub async fn get_status(&self, user_id: &str) -> Result<ConnectionStatus, ConnectionError> {
        if self.db.clear_unbacked_app_link(user_id).await? {
            info!(%user_id, "Cleared App connection left without an installation");
        }

        let links = self
            .db
            .get_user_links(user_id)
            .await?
            .ok_or(ConnectionError::NotFound)?;

        Ok(ConnectionStatus {
            is_connected: links.oauth.is_connected,
            is_app_connected: links.app.is_connected,
            username: links.oauth.username.or(links.app.account_login),
            avatar_url: links.oauth.avatar_url,
            connected_at: links.oauth.connected_at,
        })
    }

    /// Forget the OAuth link. The App connection is left alone; it goes
    /// away when the App is uninstalled on GitHub.
    pub async fn disconnect(&self, user_id: &str) -> Result<DisconnectResponse, ConnectionError> {
        if !self.db.clear_oauth_link(user_id).await? {
            return Err(ConnectionError::NotFound);
        }

        info!(%user_id, "Disconnected GitHub OAuth link");
        Ok(DisconnectResponse {
            ok: true,
            is_connected: false,
        })
    }
}
