use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Pool, Sqlite};
use tracing::debug;

#[derive(Clone, Debug, FromRow)]
pub struct GitHubInstallation {
    pub installation_id: i64,
    pub account_id: i64,
    pub account_login: String,
    pub account_type: String,
    pub repository_selection: String,
    pub permissions: String,  // JSON object
    pub repositories: String, // JSON array of InstallationRepository
    pub user_id: Option<String>,
    pub suspended_at: Option<String>, // SQLite stores as TEXT
    pub last_synced_at: String,       // SQLite stores as TEXT
    pub created_at: String,           // SQLite stores as TEXT
}

impl GitHubInstallation {
    #[cfg(test)]
    pub fn repositories(&self) -> Vec<InstallationRepository> {
        serde_json::from_str(&self.repositories).unwrap_or_default()
    }
}

/// A repository granted to an installation. Only identity is kept; the
/// rest of GitHub's repository object is of no interest here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationRepository {
    pub id: i64,
    pub name: String,
    pub full_name: String,
}

/// Mutable fields carried by installation webhooks
#[derive(Clone, Debug)]
pub struct InstallationFields {
    pub account_id: i64,
    pub account_login: String,
    pub account_type: String,
    pub repository_selection: String,
    pub permissions: serde_json::Value,
    /// `None` leaves the stored list untouched
    pub repositories: Option<Vec<InstallationRepository>>,
}

const INSTALLATION_COLUMNS: &str = "installation_id, account_id, account_login, account_type, \
                                    repository_selection, permissions, repositories, user_id, \
                                    suspended_at, last_synced_at, created_at";

/// Insert or update a GitHub installation without touching its `user_id`.
///
/// If a setup callback already recorded a bind intent for this installation,
/// the intent is consumed in the same transaction and, unless it expired, the
/// row is bound to its user. Returns that user in this case.
pub async fn upsert_installation(
    installation_id: i64,
    fields: &InstallationFields,
    pool: &Pool<Sqlite>,
) -> Result<Option<String>> {
    let permissions = serde_json::to_string(&fields.permissions)?;
    let repositories = fields
        .repositories
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let now = Utc::now();
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO GitHubInstallations
         (installation_id, account_id, account_login, account_type, repository_selection,
          permissions, repositories, last_synced_at)
         VALUES (?, ?, ?, ?, ?, ?, COALESCE(?, '[]'), ?)
         ON CONFLICT(installation_id) DO UPDATE SET
            account_id = excluded.account_id,
            account_login = excluded.account_login,
            account_type = excluded.account_type,
            repository_selection = excluded.repository_selection,
            permissions = excluded.permissions,
            repositories = COALESCE(?, GitHubInstallations.repositories),
            last_synced_at = excluded.last_synced_at",
    )
    .bind(installation_id)
    .bind(fields.account_id)
    .bind(&fields.account_login)
    .bind(&fields.account_type)
    .bind(&fields.repository_selection)
    .bind(&permissions)
    .bind(&repositories)
    .bind(now)
    .bind(&repositories)
    .execute(&mut *tx)
    .await
    .context("failed to upsert installation")?;

    let intent: Option<(String, DateTime<Utc>)> = sqlx::query_as(
        "DELETE FROM InstallationBindIntents WHERE installation_id = ?
         RETURNING user_id, expires_at",
    )
    .bind(installation_id)
    .fetch_optional(&mut *tx)
    .await?;

    let claimed_by = match intent {
        Some((user_id, expires_at)) if expires_at > now => {
            let bound = sqlx::query(
                "UPDATE GitHubInstallations SET user_id = ?
                 WHERE installation_id = ? AND user_id IS NULL",
            )
            .bind(&user_id)
            .bind(installation_id)
            .execute(&mut *tx)
            .await?;
            (bound.rows_affected() > 0).then_some(user_id)
        },
        Some((user_id, _)) => {
            debug!(installation_id, %user_id, "Discarded expired bind intent");
            None
        },
        None => None,
    };

    tx.commit().await?;

    Ok(claimed_by)
}

/// Replace the stored repository list with `added` applied and `removed`
/// taken away. Returns false when the installation is unknown.
pub async fn update_installation_repositories(
    installation_id: i64,
    repository_selection: Option<&str>,
    added: &[InstallationRepository],
    removed: &[InstallationRepository],
    pool: &Pool<Sqlite>,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let current: Option<String> =
        sqlx::query_scalar("SELECT repositories FROM GitHubInstallations WHERE installation_id = ?")
            .bind(installation_id)
            .fetch_optional(&mut *tx)
            .await?;

    let Some(current) = current else {
        return Ok(false);
    };

    let mut repositories: Vec<InstallationRepository> =
        serde_json::from_str(&current).unwrap_or_default();
    repositories.retain(|repo| !removed.iter().any(|r| r.id == repo.id));
    for repo in added {
        if !repositories.iter().any(|r| r.id == repo.id) {
            repositories.push(repo.clone());
        }
    }

    sqlx::query(
        "UPDATE GitHubInstallations
         SET repositories = ?,
             repository_selection = COALESCE(?, repository_selection),
             last_synced_at = ?
         WHERE installation_id = ?",
    )
    .bind(serde_json::to_string(&repositories)?)
    .bind(repository_selection)
    .bind(Utc::now())
    .bind(installation_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(true)
}

/// Mark an installation as suspended
pub async fn suspend_installation(installation_id: i64, pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(
        "UPDATE GitHubInstallations
         SET suspended_at = CURRENT_TIMESTAMP, last_synced_at = ?
         WHERE installation_id = ?",
    )
    .bind(Utc::now())
    .bind(installation_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Mark an installation as unsuspended (clear suspended_at)
pub async fn unsuspend_installation(installation_id: i64, pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(
        "UPDATE GitHubInstallations
         SET suspended_at = NULL, last_synced_at = ?
         WHERE installation_id = ?",
    )
    .bind(Utc::now())
    .bind(installation_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Delete an installation and any bind intent recorded for it.
///
/// Returns the user the installation was bound to. When the row never
/// existed but a setup callback left a bind intent, that intent's user is
/// returned instead. Deleting an unknown installation is not an error.
pub async fn delete_installation(installation_id: i64, pool: &Pool<Sqlite>) -> Result<Option<String>> {
    let mut tx = pool.begin().await?;

    let bound: Option<Option<String>> = sqlx::query_scalar(
        "DELETE FROM GitHubInstallations WHERE installation_id = ? RETURNING user_id",
    )
    .bind(installation_id)
    .fetch_optional(&mut *tx)
    .await?;

    let intended: Option<String> = sqlx::query_scalar(
        "DELETE FROM InstallationBindIntents WHERE installation_id = ? RETURNING user_id",
    )
    .bind(installation_id)
    .fetch_optional(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(bound.flatten().or(intended))
}

/// Get an installation by its installation_id
pub async fn get_installation_by_id(
    installation_id: i64,
    pool: &Pool<Sqlite>,
) -> Result<Option<GitHubInstallation>> {
    let installation = sqlx::query_as(&format!(
        "SELECT {INSTALLATION_COLUMNS} FROM GitHubInstallations WHERE installation_id = ?"
    ))
    .bind(installation_id)
    .fetch_optional(pool)
    .await?;

    Ok(installation)
}

/// Installations bound to a user, newest first
pub async fn installations_for_user(
    user_id: &str,
    pool: &Pool<Sqlite>,
) -> Result<Vec<GitHubInstallation>> {
    let installations = sqlx::query_as(&format!(
        "SELECT {INSTALLATION_COLUMNS} FROM GitHubInstallations
         WHERE user_id = ?
         ORDER BY created_at DESC"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(installations)
}
