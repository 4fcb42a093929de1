use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Pool, Sqlite};

/// Legacy per-user OAuth connection
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OAuthLink {
    pub is_connected: bool,
    pub access_token: Option<String>,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub email: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

/// GitHub App connection. No long-lived token is kept, installation tokens
/// are minted on demand by the credential broker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppLink {
    pub is_connected: bool,
    pub account_login: Option<String>,
}

/// Both GitHub capability records of one user. They are written and
/// cleared independently of each other.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserGithubLink {
    pub user_id: String,
    pub is_admin: bool,
    pub oauth: OAuthLink,
    pub app: AppLink,
}

#[derive(FromRow)]
struct UserRow {
    user_id: String,
    is_admin: bool,
    is_github_connected: bool,
    github_access_token: Option<String>,
    github_username: Option<String>,
    github_avatar_url: Option<String>,
    github_email: Option<String>,
    github_connected_at: Option<DateTime<Utc>>,
    is_github_app_connected: bool,
    github_app_account_login: Option<String>,
}

impl From<UserRow> for UserGithubLink {
    fn from(row: UserRow) -> Self {
        Self {
            user_id: row.user_id,
            is_admin: row.is_admin,
            oauth: OAuthLink {
                is_connected: row.is_github_connected,
                access_token: row.github_access_token,
                username: row.github_username,
                avatar_url: row.github_avatar_url,
                email: row.github_email,
                connected_at: row.github_connected_at,
            },
            app: AppLink {
                is_connected: row.is_github_app_connected,
                account_login: row.github_app_account_login,
            },
        }
    }
}

pub async fn get_user_links(user_id: &str, pool: &Pool<Sqlite>) -> Result<Option<UserGithubLink>> {
    let row: Option<UserRow> = sqlx::query_as(
        "SELECT user_id, is_admin, is_github_connected, github_access_token, github_username,
                github_avatar_url, github_email, github_connected_at, is_github_app_connected,
                github_app_account_login
         FROM Users WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(Into::into))
}

/// Store a freshly completed OAuth connection. Returns false when the user
/// does not exist.
pub async fn set_oauth_link(user_id: &str, link: &OAuthLink, pool: &Pool<Sqlite>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE Users
         SET is_github_connected = ?,
             github_access_token = ?,
             github_username = ?,
             github_avatar_url = ?,
             github_email = ?,
             github_connected_at = ?
         WHERE user_id = ?",
    )
    .bind(link.is_connected)
    .bind(&link.access_token)
    .bind(&link.username)
    .bind(&link.avatar_url)
    .bind(&link.email)
    .bind(link.connected_at)
    .bind(user_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn clear_oauth_link(user_id: &str, pool: &Pool<Sqlite>) -> Result<bool> {
    set_oauth_link(user_id, &OAuthLink::default(), pool).await
}

/// Flag the App connection. A `None` login keeps whatever login is stored.
pub async fn set_app_connected(
    user_id: &str,
    account_login: Option<&str>,
    pool: &Pool<Sqlite>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE Users
         SET is_github_app_connected = 1,
             github_app_account_login = COALESCE(?, github_app_account_login)
         WHERE user_id = ?",
    )
    .bind(account_login)
    .bind(user_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn clear_app_link(user_id: &str, pool: &Pool<Sqlite>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE Users
         SET is_github_app_connected = 0,
             github_app_account_login = NULL
         WHERE user_id = ?",
    )
    .bind(user_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Clear an App connection that nothing backs any more: no installation is
/// bound to the user and no live bind intent of theirs is waiting. This is
/// what is left behind by a setup callback whose installation webhook never
/// arrived.
pub async fn clear_unbacked_app_link(user_id: &str, pool: &Pool<Sqlite>) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE Users
         SET is_github_app_connected = 0,
             github_app_account_login = NULL
         WHERE user_id = ?
           AND is_github_app_connected = 1
           AND NOT EXISTS (SELECT 1 FROM GitHubInstallations i WHERE i.user_id = Users.user_id)
           AND NOT EXISTS (
               SELECT 1 FROM InstallationBindIntents b
               WHERE b.user_id = Users.user_id AND b.expires_at > ?
           )",
    )
    .bind(user_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
pub(crate) async fn insert_test_user(user_id: &str, pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query("INSERT INTO Users (user_id, email) VALUES (?, ?)")
        .bind(user_id)
        .bind(format!("{user_id}@example.com"))
        .execute(pool)
        .await?;

    Ok(())
}
