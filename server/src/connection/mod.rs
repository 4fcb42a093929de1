use std::sync::Arc;

use url::Url;

use crate::config::Config;
use crate::db::DbService;
use crate::error::ConnectionError;
use crate::github::{AppCredentialBroker, OAuthApi};
use crate::regeneration::RegenerationTask;

mod oauth_flow;
mod reconcile;
mod status;

pub use oauth_flow::{OAuthCallback, OAuthFallbackFlow};
pub use reconcile::{ReconciliationEngine, SetupCallback, WebhookDelivery};
pub use status::StatusFacade;

/// Everything the browser flows and the webhook receiver need, bundled so
/// handlers only carry one piece of state.
#[derive(Clone)]
pub struct ConnectionService {
    pub engine: Arc<ReconciliationEngine>,
    pub oauth: Arc<OAuthFallbackFlow>,
    pub status: StatusFacade,
    pub broker: Option<Arc<AppCredentialBroker>>,
    use_app_flow: bool,
}

impl ConnectionService {
    pub fn new(
        config: &Config,
        db: DbService,
        broker: Option<Arc<AppCredentialBroker>>,
        oauth_api: Option<Arc<dyn OAuthApi>>,
        regeneration_sender: tokio::sync::mpsc::Sender<RegenerationTask>,
    ) -> Self {
        let engine = ReconciliationEngine::new(
            db.clone(),
            config.github.clone(),
            broker.clone(),
            regeneration_sender,
        );
        let oauth = OAuthFallbackFlow::new(db.clone(), oauth_api);

        Self {
            engine: Arc::new(engine),
            oauth: Arc::new(oauth),
            status: StatusFacade::new(db),
            broker,
            use_app_flow: config.github.use_app_flow(),
        }
    }

    /// Where to send a user who asked to connect GitHub: the App
    /// installation page, or the OAuth authorize page when the App flow is
    /// off.
    pub async fn initiate(&self, user_id: &str) -> Result<String, ConnectionError> {
        if self.use_app_flow {
            self.engine.initiate(user_id).await
        } else {
            self.oauth.authorize_url(user_id).await
        }
    }
}

/// `{frontend_url}/settings` with the given query pairs
pub fn settings_url(frontend_url: &str, query: &[(&str, &str)]) -> String {
    let base = format!("{}/settings", frontend_url.trim_end_matches('/'));
    match Url::parse(&base) {
        Ok(mut url) => {
            url.query_pairs_mut().extend_pairs(query);
            url.to_string()
        },
        // frontend_url is validated at startup
        Err(_) => base,
    }
}

pub fn settings_error_url(frontend_url: &str, error: &ConnectionError) -> String {
    let message = error.user_message();
    settings_url(frontend_url, &[("error", message.as_str())])
}
