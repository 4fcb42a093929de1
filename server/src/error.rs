use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Failures of the GitHub connection flows
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("invalid or missing webhook signature")]
    Authentication,
    #[error("{0}")]
    Validation(String),
    #[error("the GitHub connection link has expired, please try again")]
    ExpiredState,
    #[error("GitHub App is already connected")]
    AlreadyConnected,
    #[error("GitHub API error: {status} - {body}")]
    Upstream { status: u16, body: String },
    #[error("GitHub request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("not found")]
    NotFound,
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ConnectionError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn upstream(status: u16, body: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            body: body.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ConnectionError::Authentication => StatusCode::UNAUTHORIZED,
            ConnectionError::Validation(_) | ConnectionError::ExpiredState => {
                StatusCode::BAD_REQUEST
            },
            ConnectionError::AlreadyConnected => StatusCode::CONFLICT,
            ConnectionError::Upstream { .. } | ConnectionError::Network(_) => {
                StatusCode::BAD_GATEWAY
            },
            ConnectionError::NotFound => StatusCode::NOT_FOUND,
            ConnectionError::Configuration(_) | ConnectionError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        }
    }

    /// Message safe to show to an end user. Internal details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            ConnectionError::Upstream { .. } => "GitHub rejected the request".to_string(),
            ConnectionError::Network(_) => "Could not reach GitHub".to_string(),
            ConnectionError::Configuration(_) => "GitHub integration is not configured".to_string(),
            ConnectionError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<sqlx::Error> for ConnectionError {
    fn from(e: sqlx::Error) -> Self {
        ConnectionError::Internal(e.into())
    }
}

impl IntoResponse for ConnectionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": self.user_message(),
        }));

        (status, body).into_response()
    }
}
