use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use shared::types::InstallationSummary;
use sqlx::SqlitePool;
use tokio::sync::mpsc;

use crate::auth::JwtService;
use crate::config::{Config, GitHubConfig};
use crate::connection::{ConnectionService, ReconciliationEngine, WebhookDelivery};
use crate::db::DbService;
use crate::error::ConnectionError;
use crate::github::webhook::sign;
use crate::github::{AppApi, GitHubEmail, GitHubUser, InstallationToken, OAuthApi};
use crate::regeneration::RegenerationTask;
use crate::web::AppState;

pub const WEBHOOK_SECRET: &str = "test-webhook-secret";
pub const SESSION_SECRET: &str = "test-session-secret";

pub const INSTALLATION_CREATED: &str = include_str!("./installation_created.json");
pub const INSTALLATION_DELETED: &str = include_str!("./installation_deleted.json");
pub const REPOSITORIES_ADDED: &str = include_str!("./installation_repositories_added.json");
pub const PUSH_DEFAULT_BRANCH: &str = include_str!("./push_default_branch.json");
pub const PUSH_FEATURE_BRANCH: &str = include_str!("./push_feature_branch.json");

pub struct TestRsaKeys {
    pub private_pem: String,
    pub public_pem: String,
}

/// RSA key generation is slow in debug builds, so all tests share one pair
pub fn test_rsa_keys() -> &'static TestRsaKeys {
    use rsa::RsaPrivateKey;
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::pkcs8::EncodePrivateKey;

    static KEYS: OnceLock<TestRsaKeys> = OnceLock::new();
    KEYS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("generate RSA key");
        let private_pem = private_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .expect("encode private key")
            .to_string();
        let public_pem = private_key
            .to_public_key()
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .expect("encode public key");

        TestRsaKeys {
            private_pem,
            public_pem,
        }
    })
}

/// Counts token exchanges. Each exchange is slow enough for concurrent
/// callers to overlap.
pub struct FakeAppApi {
    pub exchanges: AtomicUsize,
    pub fail_next: AtomicBool,
    lifetime: Duration,
}

impl FakeAppApi {
    pub fn with_lifetime(lifetime: Duration) -> Self {
        Self {
            exchanges: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
            lifetime,
        }
    }
}

#[async_trait]
impl AppApi for FakeAppApi {
    async fn create_installation_token(
        &self,
        app_jwt: &str,
        installation_id: i64,
    ) -> Result<InstallationToken, ConnectionError> {
        assert!(!app_jwt.is_empty());
        let n = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ConnectionError::upstream(401, "Bad credentials"));
        }

        Ok(InstallationToken {
            token: format!("ghs_{installation_id}_{n}"),
            expires_at: Utc::now() + self.lifetime,
        })
    }

    async fn list_installations(
        &self,
        _app_jwt: &str,
    ) -> Result<Vec<InstallationSummary>, ConnectionError> {
        Ok(vec![InstallationSummary {
            installation_id: 555,
            account_login: "acme".to_string(),
            account_id: 42,
            account_type: "Organization".to_string(),
            repository_selection: "selected".to_string(),
        }])
    }
}

/// Accepts the code `good-code` and nothing else
#[derive(Default)]
pub struct FakeOAuthApi;

#[async_trait]
impl OAuthApi for FakeOAuthApi {
    fn authorize_url(&self, state: &str) -> String {
        format!("https://github.test/authorize?state={state}")
    }

    async fn exchange_code(&self, code: &str) -> Result<String, ConnectionError> {
        match code {
            "good-code" => Ok(format!("gho_{code}")),
            _ => Err(ConnectionError::upstream(400, "bad_verification_code")),
        }
    }

    async fn get_user(&self, _access_token: &str) -> Result<GitHubUser, ConnectionError> {
        Ok(GitHubUser {
            id: 1,
            login: "octocat".to_string(),
            avatar_url: Some("https://avatars.githubusercontent.com/u/1".to_string()),
            email: None,
        })
    }

    async fn get_emails(&self, _access_token: &str) -> Result<Vec<GitHubEmail>, ConnectionError> {
        Ok(vec![GitHubEmail {
            email: "octocat@github.com".to_string(),
            primary: true,
            verified: true,
        }])
    }
}

pub fn test_config() -> Config {
    Config {
        session_secret: SESSION_SECRET.to_string(),
        github: GitHubConfig {
            app_enabled: true,
            app_id: Some(12345),
            app_slug: Some("ghlink-test".to_string()),
            webhook_secret: Some(WEBHOOK_SECRET.to_string()),
            ..GitHubConfig::default()
        },
        ..Config::default()
    }
}

pub fn test_engine(pool: SqlitePool) -> (ReconciliationEngine, mpsc::Receiver<RegenerationTask>) {
    let (sender, receiver) = mpsc::channel(8);
    let engine = ReconciliationEngine::new(
        DbService::from_pool(pool),
        test_config().github,
        None,
        sender,
    );
    (engine, receiver)
}

pub fn test_state(pool: SqlitePool) -> (AppState, mpsc::Receiver<RegenerationTask>) {
    let config = test_config();
    let (sender, receiver) = mpsc::channel(8);
    let connection = ConnectionService::new(
        &config,
        DbService::from_pool(pool),
        None,
        Some(std::sync::Arc::new(FakeOAuthApi)),
        sender,
    );
    let state = AppState {
        connection,
        jwt_service: JwtService::new(SESSION_SECRET),
        frontend_url: config.frontend_url.as_str().into(),
    };
    (state, receiver)
}

/// A webhook request as GitHub would send it
pub struct SignedDelivery {
    pub event: String,
    pub delivery_id: String,
    pub body: Vec<u8>,
    pub signature: String,
}

impl SignedDelivery {
    pub fn new(event: &str, delivery_id: &str, body: &str) -> Self {
        Self {
            event: event.to_string(),
            delivery_id: delivery_id.to_string(),
            body: body.as_bytes().to_vec(),
            signature: sign(WEBHOOK_SECRET.as_bytes(), body.as_bytes()),
        }
    }

    pub fn as_delivery(&self) -> WebhookDelivery<'_> {
        WebhookDelivery {
            signature: Some(&self.signature),
            delivery_id: Some(&self.delivery_id),
            event_type: Some(&self.event),
            body: &self.body,
        }
    }
}

#[cfg(test)]
mod reconciliation {
    use sqlx::SqlitePool;

    use super::*;
    use crate::connection::SetupCallback;
    use crate::db::BindOutcome;

    async fn webhook_event_count(pool: &SqlitePool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM WebhookEvents")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    fn state_from_install_url(url: &str) -> String {
        let url = url::Url::parse(url).unwrap();
        assert_eq!(url.path(), "/apps/ghlink-test/installations/new");
        url.query_pairs()
            .find(|(key, _)| key == "state")
            .map(|(_, value)| value.into_owned())
            .unwrap()
    }

    fn setup(installation_id: &str, state: &str) -> SetupCallback {
        SetupCallback {
            installation_id: Some(installation_id.to_string()),
            setup_action: Some("install".to_string()),
            state: Some(state.to_string()),
        }
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_webhook_before_setup(pool: SqlitePool) -> anyhow::Result<()> {
        let db = DbService::from_pool(pool.clone());
        db.insert_test_user("u1").await?;
        let (engine, _rx) = test_engine(pool.clone());

        let state = state_from_install_url(&engine.initiate("u1").await?);

        let created = SignedDelivery::new("installation", "d-1", INSTALLATION_CREATED);
        let ack = engine.process_delivery(created.as_delivery()).await?;
        assert!(ack.ok && !ack.duplicate);

        let installation = db.get_installation(555).await?.unwrap();
        assert_eq!(installation.user_id, None);
        assert_eq!(installation.account_login, "acme");
        assert!(!db.get_user_links("u1").await?.unwrap().app.is_connected);

        let user_id = engine.complete_setup(&setup("555", &state)).await?;
        assert_eq!(user_id, "u1");

        let links = db.get_user_links("u1").await?.unwrap();
        assert!(links.app.is_connected);
        assert_eq!(links.app.account_login.as_deref(), Some("acme"));
        assert_eq!(
            db.get_installation(555).await?.unwrap().user_id.as_deref(),
            Some("u1")
        );
        assert_eq!(db.consume_pending(&state).await?, None);

        // Redelivery of d-1 changes nothing
        let ack = engine.process_delivery(created.as_delivery()).await?;
        assert!(ack.duplicate);
        assert_eq!(webhook_event_count(&pool).await, 1);
        assert_eq!(
            db.get_installation(555).await?.unwrap().user_id.as_deref(),
            Some("u1")
        );

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_setup_cannot_take_over_bound_installation(
        pool: SqlitePool,
    ) -> anyhow::Result<()> {
        let db = DbService::from_pool(pool.clone());
        db.insert_test_user("owner").await?;
        db.insert_test_user("intruder").await?;
        let (engine, _rx) = test_engine(pool.clone());

        let owner_state = state_from_install_url(&engine.initiate("owner").await?);
        let created = SignedDelivery::new("installation", "d-1", INSTALLATION_CREATED);
        engine.process_delivery(created.as_delivery()).await?;
        engine.complete_setup(&setup("555", &owner_state)).await?;

        let intruder_state = state_from_install_url(&engine.initiate("intruder").await?);
        let err = engine
            .complete_setup(&setup("555", &intruder_state))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Validation(_)));

        assert_eq!(
            db.get_installation(555).await?.unwrap().user_id.as_deref(),
            Some("owner")
        );
        assert!(db.get_user_links("owner").await?.unwrap().app.is_connected);
        assert!(!db.get_user_links("intruder").await?.unwrap().app.is_connected);
        assert_eq!(db.consume_pending(&intruder_state).await?, None);

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_setup_cannot_take_over_deferred_binding(pool: SqlitePool) -> anyhow::Result<()> {
        let db = DbService::from_pool(pool.clone());
        db.insert_test_user("owner").await?;
        db.insert_test_user("intruder").await?;
        let (engine, _rx) = test_engine(pool.clone());

        let owner_state = state_from_install_url(&engine.initiate("owner").await?);
        engine.complete_setup(&setup("555", &owner_state)).await?;

        let intruder_state = state_from_install_url(&engine.initiate("intruder").await?);
        assert!(matches!(
            engine.complete_setup(&setup("555", &intruder_state)).await,
            Err(ConnectionError::Validation(_))
        ));

        let created = SignedDelivery::new("installation", "d-1", INSTALLATION_CREATED);
        engine.process_delivery(created.as_delivery()).await?;
        assert_eq!(
            db.get_installation(555).await?.unwrap().user_id.as_deref(),
            Some("owner")
        );
        assert!(!db.get_user_links("intruder").await?.unwrap().app.is_connected);

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_expired_bind_intent_is_not_applied(pool: SqlitePool) -> anyhow::Result<()> {
        let db = DbService::from_pool(pool.clone());
        db.insert_test_user("u1").await?;
        let (engine, _rx) = test_engine(pool.clone());

        let state = state_from_install_url(&engine.initiate("u1").await?);
        engine.complete_setup(&setup("555", &state)).await?;
        assert!(db.get_user_links("u1").await?.unwrap().app.is_connected);

        // The installation webhook shows up long after the setup callback
        db.age_bind_intent(555).await?;
        let created = SignedDelivery::new("installation", "d-1", INSTALLATION_CREATED);
        engine.process_delivery(created.as_delivery()).await?;

        assert_eq!(db.get_installation(555).await?.unwrap().user_id, None);
        assert_eq!(db.pending_bind_intent(555).await?, None);

        // The dangling connection does not block a fresh attempt
        let retry = engine.initiate("u1").await?;
        state_from_install_url(&retry);
        assert!(!db.get_user_links("u1").await?.unwrap().app.is_connected);

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_failed_delivery_can_be_redelivered(pool: SqlitePool) -> anyhow::Result<()> {
        let db = DbService::from_pool(pool.clone());
        let (engine, _rx) = test_engine(pool.clone());

        sqlx::query("ALTER TABLE GitHubInstallations RENAME TO GitHubInstallationsAside")
            .execute(&pool)
            .await?;
        let created = SignedDelivery::new("installation", "d-1", INSTALLATION_CREATED);
        assert!(matches!(
            engine.process_delivery(created.as_delivery()).await,
            Err(ConnectionError::Internal(_))
        ));
        assert_eq!(webhook_event_count(&pool).await, 0);

        sqlx::query("ALTER TABLE GitHubInstallationsAside RENAME TO GitHubInstallations")
            .execute(&pool)
            .await?;
        let ack = engine.process_delivery(created.as_delivery()).await?;
        assert!(ack.ok && !ack.duplicate);
        assert_eq!(webhook_event_count(&pool).await, 1);
        assert_eq!(db.get_installation(555).await?.unwrap().account_login, "acme");

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_setup_before_webhook(pool: SqlitePool) -> anyhow::Result<()> {
        let db = DbService::from_pool(pool.clone());
        db.insert_test_user("u1").await?;
        let (engine, _rx) = test_engine(pool.clone());

        let state = state_from_install_url(&engine.initiate("u1").await?);
        engine.complete_setup(&setup("555", &state)).await?;

        assert!(db.get_installation(555).await?.is_none());
        assert_eq!(db.pending_bind_intent(555).await?.as_deref(), Some("u1"));
        let links = db.get_user_links("u1").await?.unwrap();
        assert!(links.app.is_connected);
        assert_eq!(links.app.account_login, None);

        let created = SignedDelivery::new("installation", "d-1", INSTALLATION_CREATED);
        engine.process_delivery(created.as_delivery()).await?;

        assert_eq!(
            db.get_installation(555).await?.unwrap().user_id.as_deref(),
            Some("u1")
        );
        assert_eq!(db.pending_bind_intent(555).await?, None);
        let links = db.get_user_links("u1").await?.unwrap();
        assert_eq!(links.app.account_login.as_deref(), Some("acme"));

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_concurrent_setup_and_webhook_converge(pool: SqlitePool) -> anyhow::Result<()> {
        let db = DbService::from_pool(pool.clone());
        db.insert_test_user("u1").await?;
        let (engine, _rx) = test_engine(pool.clone());
        let state = state_from_install_url(&engine.initiate("u1").await?);

        let created = SignedDelivery::new("installation", "d-1", INSTALLATION_CREATED);
        let callback = setup("555", &state);
        let (webhook, setup) = tokio::join!(
            engine.process_delivery(created.as_delivery()),
            engine.complete_setup(&callback)
        );
        webhook?;
        setup?;

        assert_eq!(
            db.get_installation(555).await?.unwrap().user_id.as_deref(),
            Some("u1")
        );
        assert_eq!(db.pending_bind_intent(555).await?, None);
        assert!(db.get_user_links("u1").await?.unwrap().app.is_connected);

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_expired_state_binds_nothing(pool: SqlitePool) -> anyhow::Result<()> {
        let db = DbService::from_pool(pool.clone());
        db.insert_test_user("u1").await?;
        let (engine, _rx) = test_engine(pool.clone());

        sqlx::query("INSERT INTO PendingInstallations (state, user_id, expires_at) VALUES (?, ?, ?)")
            .bind("stale-state")
            .bind("u1")
            .bind(Utc::now() - Duration::minutes(1))
            .execute(&pool)
            .await?;

        let err = engine.complete_setup(&setup("555", "stale-state")).await.unwrap_err();
        assert!(matches!(err, ConnectionError::ExpiredState));

        let err = engine.complete_setup(&setup("555", "never-issued")).await.unwrap_err();
        assert!(matches!(err, ConnectionError::ExpiredState));

        let err = engine
            .complete_setup(&SetupCallback {
                installation_id: Some("555".to_string()),
                ..SetupCallback::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Validation(_)));

        assert_eq!(db.pending_bind_intent(555).await?, None);
        assert!(!db.get_user_links("u1").await?.unwrap().app.is_connected);

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_setup_request_needs_approval(pool: SqlitePool) -> anyhow::Result<()> {
        let db = DbService::from_pool(pool.clone());
        db.insert_test_user("u1").await?;
        let (engine, _rx) = test_engine(pool.clone());
        let state = state_from_install_url(&engine.initiate("u1").await?);

        let request = SetupCallback {
            installation_id: None,
            setup_action: Some("request".to_string()),
            state: Some(state.clone()),
        };
        let err = engine.complete_setup(&request).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Validation(_)));

        assert_eq!(db.consume_pending(&state).await?, None);
        assert!(!db.get_user_links("u1").await?.unwrap().app.is_connected);

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_initiate_when_already_connected(pool: SqlitePool) -> anyhow::Result<()> {
        let db = DbService::from_pool(pool.clone());
        db.insert_test_user("u1").await?;
        let (engine, _rx) = test_engine(pool);

        let created = SignedDelivery::new("installation", "d-1", INSTALLATION_CREATED);
        engine.process_delivery(created.as_delivery()).await?;
        db.bind_installation_to_user(555, "u1").await?;
        db.set_app_connected("u1", Some("acme")).await?;

        assert!(matches!(
            engine.initiate("u1").await,
            Err(ConnectionError::AlreadyConnected)
        ));
        assert!(matches!(
            engine.initiate("ghost").await,
            Err(ConnectionError::NotFound)
        ));

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_initiate_without_slug_stores_nothing(pool: SqlitePool) -> anyhow::Result<()> {
        let db = DbService::from_pool(pool.clone());
        db.insert_test_user("u1").await?;
        let (sender, _rx) = mpsc::channel(8);
        let engine = ReconciliationEngine::new(
            db,
            GitHubConfig {
                app_slug: None,
                ..test_config().github
            },
            None,
            sender,
        );

        assert!(matches!(
            engine.initiate("u1").await,
            Err(ConnectionError::Configuration(_))
        ));
        let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM PendingInstallations")
            .fetch_one(&pool)
            .await?;
        assert_eq!(pending, 0);

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_uninstall_cleanup(pool: SqlitePool) -> anyhow::Result<()> {
        let db = DbService::from_pool(pool.clone());
        db.insert_test_user("u1").await?;
        let (engine, _rx) = test_engine(pool.clone());

        let created = SignedDelivery::new("installation", "d-1", INSTALLATION_CREATED);
        engine.process_delivery(created.as_delivery()).await?;
        assert_eq!(db.bind_installation_to_user(555, "u1").await?, BindOutcome::Bound);
        db.set_app_connected("u1", Some("acme")).await?;
        let leftover = db.create_pending("u1").await?;

        let deleted = SignedDelivery::new("installation", "d-2", INSTALLATION_DELETED);
        engine.process_delivery(deleted.as_delivery()).await?;

        assert!(db.get_installation(555).await?.is_none());
        let links = db.get_user_links("u1").await?.unwrap();
        assert!(!links.app.is_connected);
        assert_eq!(links.app.account_login, None);
        assert_eq!(db.consume_pending(&leftover).await?, None);

        // Already gone is fine
        let again = SignedDelivery::new("installation", "d-3", INSTALLATION_DELETED);
        assert!(engine.process_delivery(again.as_delivery()).await?.ok);

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_uninstall_before_webhook_clears_deferred_user(
        pool: SqlitePool,
    ) -> anyhow::Result<()> {
        let db = DbService::from_pool(pool.clone());
        db.insert_test_user("u1").await?;
        let (engine, _rx) = test_engine(pool.clone());
        let state = state_from_install_url(&engine.initiate("u1").await?);
        engine.complete_setup(&setup("555", &state)).await?;

        let deleted = SignedDelivery::new("installation", "d-2", INSTALLATION_DELETED);
        engine.process_delivery(deleted.as_delivery()).await?;

        assert_eq!(db.pending_bind_intent(555).await?, None);
        assert!(!db.get_user_links("u1").await?.unwrap().app.is_connected);

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_signature_rejection(pool: SqlitePool) -> anyhow::Result<()> {
        let db = DbService::from_pool(pool.clone());
        let (engine, _rx) = test_engine(pool.clone());

        let mut wrong_secret = SignedDelivery::new("installation", "d-1", INSTALLATION_CREATED);
        wrong_secret.signature = sign(b"not-the-secret", &wrong_secret.body);
        assert!(matches!(
            engine.process_delivery(wrong_secret.as_delivery()).await,
            Err(ConnectionError::Authentication)
        ));

        let mut mutated = SignedDelivery::new("installation", "d-2", INSTALLATION_CREATED);
        mutated.body = INSTALLATION_CREATED.replace("acme", "evil").into_bytes();
        assert!(matches!(
            engine.process_delivery(mutated.as_delivery()).await,
            Err(ConnectionError::Authentication)
        ));

        let unsigned = SignedDelivery::new("installation", "d-3", INSTALLATION_CREATED);
        let delivery = WebhookDelivery {
            signature: None,
            ..unsigned.as_delivery()
        };
        assert!(matches!(
            engine.process_delivery(delivery).await,
            Err(ConnectionError::Authentication)
        ));

        assert_eq!(webhook_event_count(&pool).await, 0);
        assert!(db.get_installation(555).await?.is_none());

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_invalid_requests_leave_no_dedup_record(pool: SqlitePool) -> anyhow::Result<()> {
        let (engine, _rx) = test_engine(pool.clone());

        let signed = SignedDelivery::new("installation", "d-1", INSTALLATION_CREATED);
        let no_delivery_id = WebhookDelivery {
            delivery_id: None,
            ..signed.as_delivery()
        };
        assert!(matches!(
            engine.process_delivery(no_delivery_id).await,
            Err(ConnectionError::Validation(_))
        ));

        let malformed = SignedDelivery::new("installation", "d-2", r#"{"action":"created"}"#);
        assert!(matches!(
            engine.process_delivery(malformed.as_delivery()).await,
            Err(ConnectionError::Validation(_))
        ));

        assert_eq!(webhook_event_count(&pool).await, 0);

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_unhandled_events_are_acknowledged(pool: SqlitePool) -> anyhow::Result<()> {
        let (engine, _rx) = test_engine(pool.clone());

        let ping = SignedDelivery::new("ping", "d-ping", r#"{"zen":"Keep it logically awesome."}"#);
        let ack = engine.process_delivery(ping.as_delivery()).await?;
        assert!(ack.ok && !ack.duplicate);
        assert_eq!(webhook_event_count(&pool).await, 1);

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_push_forwarding(pool: SqlitePool) -> anyhow::Result<()> {
        let (engine, mut rx) = test_engine(pool);

        let feature = SignedDelivery::new("push", "d-feature", PUSH_FEATURE_BRANCH);
        engine.process_delivery(feature.as_delivery()).await?;
        assert!(rx.try_recv().is_err());

        let main = SignedDelivery::new("push", "d-main", PUSH_DEFAULT_BRANCH);
        engine.process_delivery(main.as_delivery()).await?;
        let task = rx.try_recv()?;
        assert_eq!(task.repository, "acme/widgets");
        assert_eq!(task.installation_id, Some(555));
        assert_eq!(task.after, "0d1a26e67d8f5eaf1f6ba5c57fc3c7d91ac0fd1c");
        assert_eq!(task.head_commit_message.as_deref(), Some("Document the widget API"));

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_repository_changes(pool: SqlitePool) -> anyhow::Result<()> {
        let db = DbService::from_pool(pool.clone());
        let (engine, _rx) = test_engine(pool);

        // Unknown installation is a no-op
        let early = SignedDelivery::new("installation_repositories", "d-0", REPOSITORIES_ADDED);
        engine.process_delivery(early.as_delivery()).await?;
        assert!(db.get_installation(555).await?.is_none());

        let created = SignedDelivery::new("installation", "d-1", INSTALLATION_CREATED);
        engine.process_delivery(created.as_delivery()).await?;
        let changed = SignedDelivery::new("installation_repositories", "d-2", REPOSITORIES_ADDED);
        engine.process_delivery(changed.as_delivery()).await?;

        let repositories = db.get_installation(555).await?.unwrap().repositories();
        let names: Vec<_> = repositories.iter().map(|r| r.full_name.as_str()).collect();
        assert_eq!(names, ["acme/gadgets"]);

        Ok(())
    }

    #[sqlx::test(migrations = "./sql/migrations")]
    async fn test_suspend_and_unsuspend(pool: SqlitePool) -> anyhow::Result<()> {
        let db = DbService::from_pool(pool.clone());
        let (engine, _rx) = test_engine(pool);

        let created = SignedDelivery::new("installation", "d-1", INSTALLATION_CREATED);
        engine.process_delivery(created.as_delivery()).await?;

        let suspend = INSTALLATION_CREATED.replace(r#""action": "created""#, r#""action": "suspend""#);
        let suspended = SignedDelivery::new("installation", "d-2", &suspend);
        engine.process_delivery(suspended.as_delivery()).await?;
        assert!(db.get_installation(555).await?.unwrap().suspended_at.is_some());

        let unsuspend =
            INSTALLATION_CREATED.replace(r#""action": "created""#, r#""action": "unsuspend""#);
        let unsuspended = SignedDelivery::new("installation", "d-3", &unsuspend);
        engine.process_delivery(unsuspended.as_delivery()).await?;
        assert!(db.get_installation(555).await?.unwrap().suspended_at.is_none());

        Ok(())
    }
}
