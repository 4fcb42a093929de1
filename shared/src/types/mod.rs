use chrono::{DateTime, Utc};
use serde::{self, Deserialize, Serialize};

/// Summary of a user's GitHub link, as shown on the settings page.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    /// Legacy OAuth link is active
    pub is_connected: bool,
    /// GitHub App installation is linked to this user
    pub is_app_connected: bool,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DisconnectResponse {
    pub ok: bool,
    pub is_connected: bool,
}

/// One installation of the App, as reported by GitHub.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InstallationSummary {
    pub installation_id: i64,
    pub account_login: String,
    pub account_id: i64,
    pub account_type: String,
    pub repository_selection: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WebhookAck {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

impl WebhookAck {
    pub fn processed() -> Self {
        Self {
            ok: true,
            duplicate: false,
        }
    }

    pub fn duplicate() -> Self {
        Self {
            ok: true,
            duplicate: true,
        }
    }
}
