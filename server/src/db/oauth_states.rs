use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Pool, Sqlite};
use tracing::debug;

use super::pending_installations::{PENDING_INSTALLATION_TTL_MINUTES, new_state_token};

/// Mint a `"<random>:<user_id>"` state for the OAuth authorize page
pub async fn create_oauth_state(user_id: &str, pool: &Pool<Sqlite>) -> Result<String> {
    let expires_at = Utc::now() + Duration::minutes(PENDING_INSTALLATION_TTL_MINUTES);
    create_oauth_state_with_expiry(user_id, expires_at, pool).await
}

pub async fn create_oauth_state_with_expiry(
    user_id: &str,
    expires_at: DateTime<Utc>,
    pool: &Pool<Sqlite>,
) -> Result<String> {
    let state = format!("{}:{user_id}", new_state_token());

    sqlx::query("INSERT INTO OAuthStates (state, user_id, expires_at) VALUES (?, ?, ?)")
        .bind(&state)
        .bind(user_id)
        .bind(expires_at)
        .execute(pool)
        .await?;

    Ok(state)
}

/// Resolve and delete a state. Unknown, already used and expired states all
/// read as `None`.
pub async fn take_oauth_state(state: &str, pool: &Pool<Sqlite>) -> Result<Option<String>> {
    let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
        "DELETE FROM OAuthStates WHERE state = ? RETURNING user_id, expires_at",
    )
    .bind(state)
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some((user_id, expires_at)) if expires_at > Utc::now() => Some(user_id),
        Some((user_id, _)) => {
            debug!(%user_id, "OAuth state expired");
            None
        },
        None => None,
    })
}
