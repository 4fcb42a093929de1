use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sqlx::{FromRow, Pool, Sqlite};
use tracing::debug;

/// How long a user has to finish installing the App before the `state` is
/// rejected by the setup callback.
pub const PENDING_INSTALLATION_TTL_MINUTES: i64 = 10;

#[derive(Clone, Debug, FromRow)]
pub struct PendingInstallation {
    pub state: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

impl PendingInstallation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// 256 bits from the OS RNG, hex encoded
pub fn new_state_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Mint a fresh `state` for `user_id` that expires after the default TTL
pub async fn create_pending(user_id: &str, pool: &Pool<Sqlite>) -> Result<String> {
    let expires_at = Utc::now() + Duration::minutes(PENDING_INSTALLATION_TTL_MINUTES);
    create_pending_with_expiry(user_id, expires_at, pool).await
}

pub async fn create_pending_with_expiry(
    user_id: &str,
    expires_at: DateTime<Utc>,
    pool: &Pool<Sqlite>,
) -> Result<String> {
    let state = new_state_token();

    sqlx::query("INSERT INTO PendingInstallations (state, user_id, expires_at) VALUES (?, ?, ?)")
        .bind(&state)
        .bind(user_id)
        .bind(expires_at)
        .execute(pool)
        .await?;

    Ok(state)
}

/// Resolve a `state` back to the user that created it.
///
/// Expiry is checked here rather than by a sweeper, so an expired row reads
/// as absent even if it is still stored. Expired rows found this way are
/// removed. A live row is left in place for the caller to delete once it has
/// finished reconciling.
pub async fn consume_pending(state: &str, pool: &Pool<Sqlite>) -> Result<Option<String>> {
    let pending: Option<PendingInstallation> = sqlx::query_as(
        "SELECT state, user_id, expires_at FROM PendingInstallations WHERE state = ?",
    )
    .bind(state)
    .fetch_optional(pool)
    .await?;

    match pending {
        Some(pending) if pending.is_expired(Utc::now()) => {
            debug!(user_id = %pending.user_id, "Pending installation state expired");
            delete_pending(state, pool).await?;
            Ok(None)
        },
        Some(pending) => Ok(Some(pending.user_id)),
        None => Ok(None),
    }
}

pub async fn delete_pending(state: &str, pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query("DELETE FROM PendingInstallations WHERE state = ?")
        .bind(state)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn delete_all_pending_for_user(user_id: &str, pool: &Pool<Sqlite>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM PendingInstallations WHERE user_id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}
