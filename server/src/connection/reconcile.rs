use std::sync::Arc;

use http::HeaderMap;
use serde::Deserialize;
use shared::types::WebhookAck;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::config::GitHubConfig;
use crate::db::{BindOutcome, DbService};
use crate::error::ConnectionError;
use crate::github::webhook::{self, InstallationEventPayload, InstallationRepositoriesPayload, PushPayload};
use crate::github::{AppCredentialBroker, GitHubWebhookEvent};
use crate::regeneration::RegenerationTask;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const DELIVERY_HEADER: &str = "x-github-delivery";
pub const EVENT_HEADER: &str = "x-github-event";

/// Query GitHub appends when it sends the user back from the installation page
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SetupCallback {
    pub installation_id: Option<String>,
    pub setup_action: Option<String>,
    pub state: Option<String>,
}

/// One webhook request as received, before anything was checked
#[derive(Debug, Clone, Copy)]
pub struct WebhookDelivery<'a> {
    pub signature: Option<&'a str>,
    pub delivery_id: Option<&'a str>,
    pub event_type: Option<&'a str>,
    pub body: &'a [u8],
}

impl<'a> WebhookDelivery<'a> {
    pub fn from_headers(headers: &'a HeaderMap, body: &'a [u8]) -> Self {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        Self {
            signature: header(SIGNATURE_HEADER),
            delivery_id: header(DELIVERY_HEADER),
            event_type: header(EVENT_HEADER),
            body,
        }
    }
}

/// Drives users from disconnected to App connected and back, from the two
/// independent signals GitHub sends: the browser setup callback and the
/// installation webhooks. Either may arrive first and both may repeat.
pub struct ReconciliationEngine {
    db: DbService,
    github: GitHubConfig,
    broker: Option<Arc<AppCredentialBroker>>,
    regeneration_sender: mpsc::Sender<RegenerationTask>,
}

impl ReconciliationEngine {
    pub fn new(
        db: DbService,
        github: GitHubConfig,
        broker: Option<Arc<AppCredentialBroker>>,
        regeneration_sender: mpsc::Sender<RegenerationTask>,
    ) -> Self {
        Self {
            db,
            github,
            broker,
            regeneration_sender,
        }
    }

    /// Start an App installation for `user_id` and return the GitHub URL
    /// the browser should be sent to.
    pub async fn initiate(&self, user_id: &str) -> Result<String, ConnectionError> {
        if !self.github.app_enabled {
            return Err(ConnectionError::configuration("GitHub App flow is disabled"));
        }

        // Checked before a pending row is written for a URL we cannot build
        self.github.installation_page()?;

        if self.db.clear_unbacked_app_link(user_id).await? {
            info!(%user_id, "Cleared App connection left without an installation");
        }
        let links = self
            .db
            .get_user_links(user_id)
            .await?
            .ok_or(ConnectionError::NotFound)?;
        if links.app.is_connected {
            return Err(ConnectionError::AlreadyConnected);
        }

        let state = self.db.create_pending(user_id).await?;
        info!(%user_id, "Started GitHub App installation");

        self.github.installation_url(&state)
    }

    /// Handle the browser coming back from GitHub after installing the App.
    /// Returns the user the installation now belongs to.
    pub async fn complete_setup(&self, params: &SetupCallback) -> Result<String, ConnectionError> {
        if !self.github.app_enabled {
            return Err(ConnectionError::configuration("GitHub App flow is disabled"));
        }

        let state = params
            .state
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConnectionError::validation("missing state parameter"))?;
        let user_id = self
            .db
            .consume_pending(state)
            .await?
            .ok_or(ConnectionError::ExpiredState)?;

        if params.setup_action.as_deref() == Some("request") {
            self.db.delete_pending(state).await?;
            info!(%user_id, "GitHub App installation awaits organization approval");
            return Err(ConnectionError::validation(
                "the installation was requested and needs approval from an organization owner",
            ));
        }

        let installation_id = params
            .installation_id
            .as_deref()
            .ok_or_else(|| ConnectionError::validation("missing installation_id parameter"))?
            .parse::<i64>()
            .map_err(|_| ConnectionError::validation("invalid installation_id parameter"))?;

        let account_login = match self.db.bind_installation_to_user(installation_id, &user_id).await? {
            BindOutcome::Bound => {
                info!(installation_id, %user_id, "Bound installation to user");
                self.db
                    .get_installation(installation_id)
                    .await?
                    .map(|installation| installation.account_login)
            },
            BindOutcome::Deferred => {
                info!(
                    installation_id,
                    %user_id,
                    "Installation webhook not received yet, binding deferred"
                );
                None
            },
            BindOutcome::Conflict => {
                warn!(installation_id, %user_id, "Installation belongs to another user");
                self.db.delete_pending(state).await?;
                return Err(ConnectionError::validation(
                    "this GitHub App installation is already linked to another account",
                ));
            },
        };

        if !self.db.set_app_connected(&user_id, account_login.as_deref()).await? {
            warn!(%user_id, "User vanished while completing App setup");
        }
        self.db.delete_pending(state).await?;

        Ok(user_id)
    }

    /// Verify, deduplicate and apply one webhook delivery
    pub async fn process_delivery(
        &self,
        delivery: WebhookDelivery<'_>,
    ) -> Result<WebhookAck, ConnectionError> {
        let secret = self.github.webhook_secret()?;
        if !webhook::verify(secret.as_bytes(), delivery.body, delivery.signature) {
            warn!(
                delivery_id = delivery.delivery_id.unwrap_or("<none>"),
                event = delivery.event_type.unwrap_or("<none>"),
                "Rejected webhook with invalid signature"
            );
            return Err(ConnectionError::Authentication);
        }

        let delivery_id = delivery
            .delivery_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ConnectionError::validation("missing x-github-delivery header"))?;
        let event_type = delivery
            .event_type
            .filter(|event| !event.is_empty())
            .ok_or_else(|| ConnectionError::validation("missing x-github-event header"))?;

        let event = GitHubWebhookEvent::parse(event_type, delivery.body).map_err(|e| {
            warn!(%delivery_id, event = %event_type, "Malformed webhook payload: {e}");
            ConnectionError::validation(format!("malformed {event_type} payload"))
        })?;

        if !self.db.record_webhook_event(delivery_id).await? {
            info!(%delivery_id, event = %event_type, "Skipping duplicate webhook delivery");
            return Ok(WebhookAck::duplicate());
        }

        let installation_id = event.installation_id();
        if let Err(e) = self.apply_event(event).await {
            error!(
                %delivery_id,
                event = %event_type,
                ?installation_id,
                "Failed to process webhook delivery: {e}"
            );
            if let Err(release_err) = self.db.release_webhook_event(delivery_id).await {
                error!(%delivery_id, "Failed to release webhook delivery: {release_err:#}");
            }
            return Err(e);
        }

        debug!(%delivery_id, event = %event_type, ?installation_id, "Processed webhook delivery");
        Ok(WebhookAck::processed())
    }

    pub async fn apply_event(&self, event: GitHubWebhookEvent) -> Result<(), ConnectionError> {
        match event {
            GitHubWebhookEvent::InstallationCreated(payload)
            | GitHubWebhookEvent::InstallationPermissionsAccepted(payload) => {
                self.on_installation_upserted(&payload).await
            },
            GitHubWebhookEvent::InstallationDeleted(payload) => {
                self.on_installation_deleted(payload.installation.id).await
            },
            GitHubWebhookEvent::InstallationSuspended(payload) => {
                let installation_id = payload.installation.id;
                self.db.suspend_installation(installation_id).await?;
                if let Some(broker) = &self.broker {
                    broker.invalidate(installation_id).await;
                }
                info!(installation_id, "Installation suspended");
                Ok(())
            },
            GitHubWebhookEvent::InstallationUnsuspended(payload) => {
                self.db.unsuspend_installation(payload.installation.id).await?;
                info!(installation_id = payload.installation.id, "Installation unsuspended");
                Ok(())
            },
            GitHubWebhookEvent::InstallationRepositoriesChanged(payload) => {
                self.on_repositories_changed(&payload).await
            },
            GitHubWebhookEvent::Push(payload) => {
                self.forward_push(payload);
                Ok(())
            },
            GitHubWebhookEvent::Unhandled { event, action } => {
                debug!(%event, ?action, "Ignoring unhandled webhook event");
                Ok(())
            },
        }
    }

    async fn on_installation_upserted(
        &self,
        payload: &InstallationEventPayload,
    ) -> Result<(), ConnectionError> {
        let installation_id = payload.installation.id;
        let fields = payload.fields();
        let claimed_by = self.db.upsert_installation(installation_id, &fields).await?;

        info!(
            installation_id,
            account = %fields.account_login,
            action = %payload.action,
            "Stored installation"
        );

        if let Some(user_id) = claimed_by {
            info!(installation_id, %user_id, "Bound installation from deferred setup");
            self.db
                .set_app_connected(&user_id, Some(&fields.account_login))
                .await?;
        }

        Ok(())
    }

    async fn on_installation_deleted(&self, installation_id: i64) -> Result<(), ConnectionError> {
        let owner = self.db.delete_installation(installation_id).await?;
        if let Some(broker) = &self.broker {
            broker.invalidate(installation_id).await;
        }

        let Some(user_id) = owner else {
            info!(installation_id, "Removed unbound installation");
            return Ok(());
        };

        let dropped = self.db.delete_all_pending_for_user(&user_id).await?;
        let remaining = self.db.installations_for_user(&user_id).await?;
        match remaining.first() {
            None => {
                self.db.clear_app_link(&user_id).await?;
            },
            Some(other) => {
                self.db
                    .set_app_connected(&user_id, Some(&other.account_login))
                    .await?;
            },
        }

        info!(
            installation_id,
            %user_id,
            pending_dropped = dropped,
            remaining = remaining.len(),
            "Removed installation"
        );
        Ok(())
    }

    async fn on_repositories_changed(
        &self,
        payload: &InstallationRepositoriesPayload,
    ) -> Result<(), ConnectionError> {
        let installation_id = payload.installation.id;
        let updated = self
            .db
            .update_installation_repositories(
                installation_id,
                payload.repository_selection.as_deref(),
                &payload.repositories_added,
                &payload.repositories_removed,
            )
            .await?;

        if updated {
            info!(
                installation_id,
                added = payload.repositories_added.len(),
                removed = payload.repositories_removed.len(),
                "Updated installation repositories"
            );
        } else {
            debug!(installation_id, "Repositories changed for unknown installation");
        }
        Ok(())
    }

    fn forward_push(&self, push: PushPayload) {
        if push.deleted || !push.targets_default_branch() {
            debug!(
                repository = %push.repository.full_name,
                git_ref = %push.git_ref,
                "Ignoring push outside the default branch"
            );
            return;
        }

        let task = RegenerationTask {
            installation_id: push.installation.map(|i| i.id),
            repository_id: push.repository.id,
            repository: push.repository.full_name,
            git_ref: push.git_ref,
            before: push.before,
            after: push.after,
            head_commit_message: push.head_commit.map(|c| c.message),
        };

        match self.regeneration_sender.try_send(task) {
            Ok(()) => debug!("Queued regeneration task"),
            Err(TrySendError::Full(task)) => {
                warn!(repository = %task.repository, "Regeneration queue full, dropping push");
            },
            Err(TrySendError::Closed(task)) => {
                warn!(repository = %task.repository, "Regeneration service stopped, dropping push");
            },
        }
    }
}
