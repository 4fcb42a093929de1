use serde::Deserialize;

use crate::db::{InstallationFields, InstallationRepository};

mod verify;

#[cfg(test)]
pub use verify::sign;
pub use verify::verify;

#[derive(Debug, Clone, Deserialize)]
pub struct AccountPayload {
    pub login: String,
    pub id: i64,
    #[serde(rename = "type")]
    pub account_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallationPayload {
    pub id: i64,
    pub account: AccountPayload,
    #[serde(default = "default_repository_selection")]
    pub repository_selection: String,
    #[serde(default)]
    pub permissions: serde_json::Map<String, serde_json::Value>,
}

fn default_repository_selection() -> String {
    "all".to_string()
}

/// `installation` events
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationEventPayload {
    pub action: String,
    pub installation: InstallationPayload,
    /// Only sent when the selection is a list of repositories
    pub repositories: Option<Vec<InstallationRepository>>,
}

impl InstallationEventPayload {
    pub fn fields(&self) -> InstallationFields {
        let installation = &self.installation;
        InstallationFields {
            account_id: installation.account.id,
            account_login: installation.account.login.clone(),
            account_type: installation.account.account_type.clone(),
            repository_selection: installation.repository_selection.clone(),
            permissions: serde_json::Value::Object(installation.permissions.clone()),
            repositories: self.repositories.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct InstallationRef {
    pub id: i64,
}

/// `installation_repositories` events
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationRepositoriesPayload {
    pub action: String,
    pub installation: InstallationRef,
    pub repository_selection: Option<String>,
    #[serde(default)]
    pub repositories_added: Vec<InstallationRepository>,
    #[serde(default)]
    pub repositories_removed: Vec<InstallationRepository>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushRepository {
    pub id: i64,
    pub full_name: String,
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadCommit {
    pub id: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub before: String,
    pub after: String,
    #[serde(default)]
    pub deleted: bool,
    pub head_commit: Option<HeadCommit>,
    pub repository: PushRepository,
    pub installation: Option<InstallationRef>,
}

impl PushPayload {
    /// Whether this push moved the repository's default branch
    pub fn targets_default_branch(&self) -> bool {
        match &self.repository.default_branch {
            Some(branch) => self.git_ref == format!("refs/heads/{branch}"),
            None => false,
        }
    }
}

/// Every webhook delivery the connection subsystem understands. Anything
/// else ends up in `Unhandled` and is acknowledged without side effects.
#[derive(Debug, Clone)]
pub enum GitHubWebhookEvent {
    InstallationCreated(InstallationEventPayload),
    InstallationDeleted(InstallationEventPayload),
    InstallationSuspended(InstallationEventPayload),
    InstallationUnsuspended(InstallationEventPayload),
    InstallationPermissionsAccepted(InstallationEventPayload),
    InstallationRepositoriesChanged(InstallationRepositoriesPayload),
    Push(PushPayload),
    Unhandled {
        event: String,
        action: Option<String>,
    },
}

#[derive(Deserialize)]
struct ActionOnly {
    action: Option<String>,
}

impl GitHubWebhookEvent {
    /// Decode a delivery from its `X-GitHub-Event` name and raw body
    pub fn parse(event_type: &str, body: &[u8]) -> Result<Self, serde_json::Error> {
        let event = match event_type {
            "installation" => {
                let payload: InstallationEventPayload = serde_json::from_slice(body)?;
                match payload.action.as_str() {
                    "created" => Self::InstallationCreated(payload),
                    "deleted" => Self::InstallationDeleted(payload),
                    "suspend" => Self::InstallationSuspended(payload),
                    "unsuspend" => Self::InstallationUnsuspended(payload),
                    "new_permissions_accepted" => Self::InstallationPermissionsAccepted(payload),
                    _ => Self::Unhandled {
                        event: event_type.to_string(),
                        action: Some(payload.action),
                    },
                }
            },
            "installation_repositories" => {
                Self::InstallationRepositoriesChanged(serde_json::from_slice(body)?)
            },
            "push" => Self::Push(serde_json::from_slice(body)?),
            _ => {
                let action = serde_json::from_slice::<ActionOnly>(body)
                    .ok()
                    .and_then(|a| a.action);
                Self::Unhandled {
                    event: event_type.to_string(),
                    action,
                }
            },
        };

        Ok(event)
    }

    pub fn installation_id(&self) -> Option<i64> {
        match self {
            Self::InstallationCreated(p)
            | Self::InstallationDeleted(p)
            | Self::InstallationSuspended(p)
            | Self::InstallationUnsuspended(p)
            | Self::InstallationPermissionsAccepted(p) => Some(p.installation.id),
            Self::InstallationRepositoriesChanged(p) => Some(p.installation.id),
            Self::Push(p) => p.installation.as_ref().map(|i| i.id),
            Self::Unhandled { .. } => None,
        }
    }
}
