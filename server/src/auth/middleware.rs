use std::future::Future;

use axum::Json;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use super::jwt::{JwtService, SessionClaims};

const SESSION_COOKIE: &str = "session";

/// Authenticated user extracted from request
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub claims: SessionClaims,
}

impl AuthUser {
    pub fn user_id(&self) -> &str {
        &self.claims.sub
    }

    pub fn is_admin(&self) -> bool {
        self.claims.is_admin
    }
}

/// Admin user (requires is_admin = true)
#[derive(Debug, Clone)]
pub struct AdminUser {
    pub user: AuthUser,
}

/// Bearer token from `Authorization`, falling back to the `session` cookie
fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(header) = headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok()) {
        return Some(header.strip_prefix("Bearer ").unwrap_or_default().to_string());
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .find_map(|cookie| {
            let (name, value) = cookie.trim().split_once('=')?;
            (name == SESSION_COOKIE).then(|| value.to_string())
        })
}

/// Extract AuthUser from request (validates JWT)
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    JwtService: FromRef<S>,
{
    type Rejection = AuthError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let token = session_token(&parts.headers);
        let jwt_service = JwtService::from_ref(state);

        async move {
            let token = token.ok_or(AuthError::MissingToken)?;
            if token.is_empty() {
                return Err(AuthError::InvalidToken);
            }

            let claims = jwt_service
                .validate_token(&token)
                .map_err(|_| AuthError::InvalidToken)?;

            Ok(AuthUser { claims })
        }
    }
}

/// Extract AdminUser from request (validates JWT + admin status)
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
    JwtService: FromRef<S>,
{
    type Rejection = AuthError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let fut = AuthUser::from_request_parts(parts, state);

        async move {
            let user = fut.await?;

            if !user.is_admin() {
                return Err(AuthError::Forbidden);
            }

            Ok(AdminUser { user })
        }
    }
}

/// Authentication errors
#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
    Forbidden,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization token"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::Forbidden => (StatusCode::FORBIDDEN, "Insufficient permissions"),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
