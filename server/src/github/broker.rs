use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use shared::types::InstallationSummary;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::client::{AppApi, InstallationToken};
use super::jwt::AppJwtSigner;
use crate::error::ConnectionError;

/// Tokens this close to expiry are treated as expired
pub const TOKEN_SAFETY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct CachedInstallationToken {
    pub installation_id: i64,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedInstallationToken {
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.expires_at - margin > now
    }
}

type Slot = Arc<Mutex<Option<CachedInstallationToken>>>;

/// Per-installation token cache. Callers asking for the same installation
/// wait on that installation's slot, so at most one exchange is in flight
/// for it. Different installations never block each other.
pub struct InstallationTokenCache {
    slots: Mutex<HashMap<i64, Slot>>,
    safety_margin: Duration,
}

impl Default for InstallationTokenCache {
    fn default() -> Self {
        Self::new(Duration::seconds(TOKEN_SAFETY_MARGIN_SECS))
    }
}

impl InstallationTokenCache {
    pub fn new(safety_margin: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            safety_margin,
        }
    }

    async fn slot(&self, installation_id: i64) -> Slot {
        let mut slots = self.slots.lock().await;
        slots.entry(installation_id).or_default().clone()
    }

    /// Return the cached token while it is fresh, otherwise run `refresh`
    /// while holding the installation's slot. A failed refresh leaves the
    /// slot empty.
    pub async fn get_or_refresh<F, Fut>(
        &self,
        installation_id: i64,
        refresh: F,
    ) -> Result<CachedInstallationToken, ConnectionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<InstallationToken, ConnectionError>>,
    {
        let slot = self.slot(installation_id).await;
        let mut cached = slot.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now(), self.safety_margin) {
                return Ok(token.clone());
            }
            debug!(installation_id, "Cached installation token is about to expire");
        }
        *cached = None;

        let fresh = refresh().await?;
        let token = CachedInstallationToken {
            installation_id,
            token: fresh.token,
            expires_at: fresh.expires_at,
        };
        *cached = Some(token.clone());

        Ok(token)
    }

    pub async fn invalidate(&self, installation_id: i64) {
        let slot = self.slots.lock().await.remove(&installation_id);
        if let Some(slot) = slot {
            *slot.lock().await = None;
        }
    }
}

/// Mints credentials for GitHub App operations. The App JWT never leaves
/// this type; callers only ever see installation tokens.
pub struct AppCredentialBroker {
    signer: AppJwtSigner,
    api: Arc<dyn AppApi>,
    cache: InstallationTokenCache,
}

impl AppCredentialBroker {
    pub fn new(signer: AppJwtSigner, api: Arc<dyn AppApi>) -> Self {
        Self {
            signer,
            api,
            cache: InstallationTokenCache::default(),
        }
    }

    pub async fn get_installation_token(
        &self,
        installation_id: i64,
    ) -> Result<CachedInstallationToken, ConnectionError> {
        self.cache
            .get_or_refresh(installation_id, || async {
                let jwt = self.signer.sign()?;
                let token = self.api.create_installation_token(&jwt, installation_id).await?;
                info!(
                    app_id = self.signer.app_id(),
                    installation_id,
                    expires_at = %token.expires_at,
                    "Minted installation token"
                );
                Ok::<_, ConnectionError>(token)
            })
            .await
    }

    /// Drop any cached token, e.g. after the installation was removed
    pub async fn invalidate(&self, installation_id: i64) {
        self.cache.invalidate(installation_id).await;
    }

    pub async fn list_installations(&self) -> Result<Vec<InstallationSummary>, ConnectionError> {
        let jwt = self.signer.sign()?;
        self.api.list_installations(&jwt).await
    }
}
