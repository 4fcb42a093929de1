use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::github::{AppCredentialBroker, USER_AGENT};
use crate::services::AsyncService;

/// Queue depth before default-branch pushes start being dropped
pub const REGENERATION_QUEUE_SIZE: usize = 1000;

/// A push to a repository's default branch that should trigger downstream
/// regeneration of the repository's documentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegenerationTask {
    pub installation_id: Option<i64>,
    pub repository_id: i64,
    pub repository: String,
    pub git_ref: String,
    pub before: String,
    pub after: String,
    pub head_commit_message: Option<String>,
}

/// What the regeneration endpoint receives: the push, plus an installation
/// token when the push came through the App, so the receiver can read the
/// repository.
#[derive(Debug, Serialize)]
struct RegenerationRequest<'a> {
    #[serde(flatten)]
    task: &'a RegenerationTask,
    #[serde(skip_serializing_if = "Option::is_none")]
    installation_token: Option<String>,
}

/// Forwards regeneration tasks to the configured endpoint. Without an
/// endpoint tasks are only logged.
pub struct RegenerationService {
    http: reqwest::Client,
    endpoint: Option<String>,
    broker: Option<Arc<AppCredentialBroker>>,
    sender: mpsc::Sender<RegenerationTask>,
    receiver: Option<mpsc::Receiver<RegenerationTask>>,
}

impl RegenerationService {
    pub fn new(endpoint: Option<String>, broker: Option<Arc<AppCredentialBroker>>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel(REGENERATION_QUEUE_SIZE);
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build regeneration HTTP client")?;

        Ok(Self {
            http,
            endpoint,
            broker,
            sender,
            receiver: Some(receiver),
        })
    }

    async fn installation_token(&self, task: &RegenerationTask) -> Result<Option<String>> {
        let (Some(broker), Some(installation_id)) = (&self.broker, task.installation_id) else {
            return Ok(None);
        };

        let token = broker
            .get_installation_token(installation_id)
            .await
            .with_context(|| format!("failed to mint a token for installation {installation_id}"))?;
        debug!(
            installation_id = token.installation_id,
            expires_at = %token.expires_at,
            "Attaching installation token"
        );
        Ok(Some(token.token))
    }
}

impl AsyncService<RegenerationTask> for RegenerationService {
    const NAME: &'static str = "regeneration";

    fn get_sender(&self) -> mpsc::Sender<RegenerationTask> {
        self.sender.clone()
    }

    fn take_receiver(&mut self) -> Option<mpsc::Receiver<RegenerationTask>> {
        self.receiver.take()
    }

    async fn handle_task(&self, task: RegenerationTask) -> Result<()> {
        let Some(endpoint) = &self.endpoint else {
            info!(
                repository = %task.repository,
                after = %task.after,
                "Default branch updated, no regeneration endpoint configured"
            );
            return Ok(());
        };

        let request = RegenerationRequest {
            installation_token: self.installation_token(&task).await?,
            task: &task,
        };

        debug!(repository = %task.repository, %endpoint, "Forwarding regeneration task");
        self.http
            .post(endpoint)
            .json(&request)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("failed to forward regeneration of {}", task.repository))?;

        info!(repository = %task.repository, after = %task.after, "Queued regeneration");
        Ok(())
    }
}
