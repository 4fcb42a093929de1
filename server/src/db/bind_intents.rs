use anyhow::Result;
use chrono::{Duration, Utc};
use sqlx::{Pool, Sqlite};

use super::pending_installations::PENDING_INSTALLATION_TTL_MINUTES;

/// Result of binding an installation to a user
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindOutcome {
    /// The installation row existed and now carries the user
    Bound,
    /// The row does not exist yet; a bind intent was recorded and will be
    /// applied by the next upsert of this installation
    Deferred,
    /// The installation, or a live intent for it, belongs to another user.
    /// Nothing was written.
    Conflict,
}

/// Bind an installation to a user, or record the intent to do so when the
/// installation webhook has not been delivered yet.
///
/// An installation bound to someone else is never rebound, and a live intent
/// of another user is never replaced. All statements run in one write
/// transaction, so a concurrent upsert of the same installation either sees
/// the intent or is seen by the update.
pub async fn bind_installation_to_user(
    installation_id: i64,
    user_id: &str,
    pool: &Pool<Sqlite>,
) -> Result<BindOutcome> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        "UPDATE GitHubInstallations SET user_id = ?
         WHERE installation_id = ? AND (user_id IS NULL OR user_id = ?)",
    )
    .bind(user_id)
    .bind(installation_id)
    .bind(user_id)
    .execute(&mut *tx)
    .await?;

    let outcome = if updated.rows_affected() > 0 {
        BindOutcome::Bound
    } else {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM GitHubInstallations WHERE installation_id = ?)",
        )
        .bind(installation_id)
        .fetch_one(&mut *tx)
        .await?;

        if exists {
            BindOutcome::Conflict
        } else {
            let expires_at = now + Duration::minutes(PENDING_INSTALLATION_TTL_MINUTES);
            let recorded = sqlx::query(
                "INSERT INTO InstallationBindIntents (installation_id, user_id, expires_at)
                 VALUES (?, ?, ?)
                 ON CONFLICT(installation_id) DO UPDATE SET
                    user_id = excluded.user_id,
                    expires_at = excluded.expires_at,
                    created_at = CURRENT_TIMESTAMP
                 WHERE InstallationBindIntents.user_id = excluded.user_id
                    OR InstallationBindIntents.expires_at <= ?",
            )
            .bind(installation_id)
            .bind(user_id)
            .bind(expires_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if recorded.rows_affected() > 0 {
                BindOutcome::Deferred
            } else {
                BindOutcome::Conflict
            }
        }
    };

    tx.commit().await?;

    Ok(outcome)
}

/// Drop every intent recorded by `user_id`, live or not
pub async fn delete_intents_for_user(user_id: &str, pool: &Pool<Sqlite>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM InstallationBindIntents WHERE user_id = ?")
        .bind(user_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// User waiting for `installation_id` to be created, if any
#[cfg(test)]
pub async fn pending_bind_intent(installation_id: i64, pool: &Pool<Sqlite>) -> Result<Option<String>> {
    let user_id = sqlx::query_scalar(
        "SELECT user_id FROM InstallationBindIntents WHERE installation_id = ?",
    )
    .bind(installation_id)
    .fetch_optional(pool)
    .await?;

    Ok(user_id)
}

/// Move an intent's expiry into the past
#[cfg(test)]
pub async fn age_bind_intent(installation_id: i64, pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query("UPDATE InstallationBindIntents SET expires_at = ? WHERE installation_id = ?")
        .bind(Utc::now() - Duration::minutes(1))
        .bind(installation_id)
        .execute(pool)
        .await?;

    Ok(())
}
