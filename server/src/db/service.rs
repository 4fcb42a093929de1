use std::path::Path;

use sqlx::migrate;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use tracing::{debug, info};

use super::bind_intents::{self, BindOutcome};
use super::github_installations::{self, GitHubInstallation, InstallationFields, InstallationRepository};
use super::users::{self, OAuthLink, UserGithubLink};
use super::{oauth_states, pending_installations, webhook_events};

#[derive(Clone)]
pub struct DbService {
    // Instead of exposing this, we should probably have a function
    // where people can get a cloned instance
    pub pool: SqlitePool,
}

impl DbService {
    pub async fn new(location: &Path) -> anyhow::Result<DbService> {
        info!("Initializing SQLite database at {}", location.display());

        // SQlite does itself not create any directories, so we need to ensure the parent of the
        // database path already exists before creating the pool.
        if let Some(parent) = location.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(location)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        debug!("Creating database pool with {:?}", opts);

        let pool: SqlitePool = SqlitePool::connect_with(opts).await?;

        info!("Running database migrations");
        migrate!("sql/migrations").run(&pool).await?;

        Ok(DbService { pool })
    }

    /// Wrap an already migrated pool
    #[cfg(test)]
    pub fn from_pool(pool: SqlitePool) -> DbService {
        DbService { pool }
    }

    // Pending installations

    pub async fn create_pending(&self, user_id: &str) -> anyhow::Result<String> {
        pending_installations::create_pending(user_id, &self.pool).await
    }

    pub async fn consume_pending(&self, state: &str) -> anyhow::Result<Option<String>> {
        pending_installations::consume_pending(state, &self.pool).await
    }

    pub async fn delete_pending(&self, state: &str) -> anyhow::Result<()> {
        pending_installations::delete_pending(state, &self.pool).await
    }

    /// Forget every pending installation and bind intent of `user_id`
    pub async fn delete_all_pending_for_user(&self, user_id: &str) -> anyhow::Result<u64> {
        let pending = pending_installations::delete_all_pending_for_user(user_id, &self.pool).await?;
        let intents = bind_intents::delete_intents_for_user(user_id, &self.pool).await?;
        Ok(pending + intents)
    }

    // OAuth states

    pub async fn create_oauth_state(&self, user_id: &str) -> anyhow::Result<String> {
        oauth_states::create_oauth_state(user_id, &self.pool).await
    }

    pub async fn take_oauth_state(&self, state: &str) -> anyhow::Result<Option<String>> {
        oauth_states::take_oauth_state(state, &self.pool).await
    }

    // Installations

    pub async fn upsert_installation(
        &self,
        installation_id: i64,
        fields: &InstallationFields,
    ) -> anyhow::Result<Option<String>> {
        github_installations::upsert_installation(installation_id, fields, &self.pool).await
    }

    pub async fn bind_installation_to_user(
        &self,
        installation_id: i64,
        user_id: &str,
    ) -> anyhow::Result<BindOutcome> {
        bind_intents::bind_installation_to_user(installation_id, user_id, &self.pool).await
    }

    #[cfg(test)]
    pub async fn age_bind_intent(&self, installation_id: i64) -> anyhow::Result<()> {
        bind_intents::age_bind_intent(installation_id, &self.pool).await
    }

    #[cfg(test)]
    pub async fn pending_bind_intent(&self, installation_id: i64) -> anyhow::Result<Option<String>> {
        bind_intents::pending_bind_intent(installation_id, &self.pool).await
    }

    pub async fn delete_installation(&self, installation_id: i64) -> anyhow::Result<Option<String>> {
        github_installations::delete_installation(installation_id, &self.pool).await
    }

    pub async fn update_installation_repositories(
        &self,
        installation_id: i64,
        repository_selection: Option<&str>,
        added: &[InstallationRepository],
        removed: &[InstallationRepository],
    ) -> anyhow::Result<bool> {
        github_installations::update_installation_repositories(
            installation_id,
            repository_selection,
            added,
            removed,
            &self.pool,
        )
        .await
    }

    pub async fn suspend_installation(&self, installation_id: i64) -> anyhow::Result<()> {
        github_installations::suspend_installation(installation_id, &self.pool).await
    }

    pub async fn unsuspend_installation(&self, installation_id: i64) -> anyhow::Result<()> {
        github_installations::unsuspend_installation(installation_id, &self.pool).await
    }

    pub async fn get_installation(
        &self,
        installation_id: i64,
    ) -> anyhow::Result<Option<GitHubInstallation>> {
        github_installations::get_installation_by_id(installation_id, &self.pool).await
    }

    pub async fn installations_for_user(
        &self,
        user_id: &str,
    ) -> anyhow::Result<Vec<GitHubInstallation>> {
        github_installations::installations_for_user(user_id, &self.pool).await
    }

    // Webhook deliveries

    pub async fn record_webhook_event(&self, event_id: &str) -> anyhow::Result<bool> {
        webhook_events::record_if_new(event_id, webhook_events::GITHUB_SOURCE, &self.pool).await
    }

    pub async fn release_webhook_event(&self, event_id: &str) -> anyhow::Result<()> {
        webhook_events::release(event_id, &self.pool).await
    }

    // User links

    pub async fn get_user_links(&self, user_id: &str) -> anyhow::Result<Option<UserGithubLink>> {
        users::get_user_links(user_id, &self.pool).await
    }

    pub async fn set_oauth_link(&self, user_id: &str, link: &OAuthLink) -> anyhow::Result<bool> {
        users::set_oauth_link(user_id, link, &self.pool).await
    }

    pub async fn clear_oauth_link(&self, user_id: &str) -> anyhow::Result<bool> {
        users::clear_oauth_link(user_id, &self.pool).await
    }

    pub async fn set_app_connected(
        &self,
        user_id: &str,
        account_login: Option<&str>,
    ) -> anyhow::Result<bool> {
        users::set_app_connected(user_id, account_login, &self.pool).await
    }

    pub async fn clear_app_link(&self, user_id: &str) -> anyhow::Result<bool> {
        users::clear_app_link(user_id, &self.pool).await
    }

    pub async fn clear_unbacked_app_link(&self, user_id: &str) -> anyhow::Result<bool> {
        users::clear_unbacked_app_link(user_id, &self.pool).await
    }

    #[cfg(test)]
    pub async fn insert_test_user(&self, user_id: &str) -> anyhow::Result<()> {
        users::insert_test_user(user_id, &self.pool).await
    }
}
