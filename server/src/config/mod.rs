use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

use anyhow::Context;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConnectionError;

const ENV_PREFIX: &str = "GHLINK_";
const DEFAULT_PORT: u16 = 3030;
const DEFAULT_API_URL: &str = "https://api.github.com";
const DEFAULT_WEB_URL: &str = "https://github.com";

#[derive(Clone, Deserialize, Serialize)]
pub struct Config {
    pub web: WebConfig,
    pub db_path: PathBuf,
    /// Where browser flows land after GitHub sends the user back
    pub frontend_url: String,
    /// Externally reachable address of this service, used for callback URLs
    pub public_url: String,
    /// HS256 secret shared with the account service that mints sessions
    pub session_secret: String,
    pub github: GitHubConfig,
    pub regeneration: RegenerationConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WebConfig {
    pub address: SocketAddrV4,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    /// Global switch for the GitHub App flow
    pub app_enabled: bool,
    /// Send users through the App install instead of legacy OAuth
    pub prefer_app_flow: bool,
    pub app_id: Option<u64>,
    /// PEM encoded RSA key of the App
    pub app_private_key: Option<String>,
    pub app_slug: Option<String>,
    pub webhook_secret: Option<String>,
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<String>,
    pub api_url: String,
    pub web_url: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RegenerationConfig {
    /// Receives default-branch pushes. Pushes are only logged when unset.
    pub endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let db_path = xdg::BaseDirectories::with_prefix("ghlink")
            .map(|dirs| dirs.get_data_home().join("ghlink.db"))
            .unwrap_or_else(|_| PathBuf::from("ghlink.db"));

        Self {
            web: WebConfig {
                address: SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_PORT),
            },
            db_path,
            frontend_url: "http://localhost:3000".to_string(),
            public_url: format!("http://localhost:{DEFAULT_PORT}"),
            session_secret: String::new(),
            github: GitHubConfig::default(),
            regeneration: RegenerationConfig::default(),
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            app_enabled: false,
            prefer_app_flow: true,
            app_id: None,
            app_private_key: None,
            app_slug: None,
            webhook_secret: None,
            oauth_client_id: None,
            oauth_client_secret: None,
            api_url: DEFAULT_API_URL.to_string(),
            web_url: DEFAULT_WEB_URL.to_string(),
        }
    }
}

impl Config {
    /// Layer defaults, the TOML file (explicit path or `$XDG_CONFIG_HOME/ghlink/config.toml`)
    /// and `GHLINK_` environment variables, in that order.
    pub fn load(config_file: Option<&Path>) -> anyhow::Result<Self> {
        let config_file = config_file.map(Path::to_path_buf).or_else(|| {
            xdg::BaseDirectories::with_prefix("ghlink")
                .ok()
                .and_then(|dirs| dirs.find_config_file("config.toml"))
        });

        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = &config_file {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Config = figment.extract().context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on settings that would otherwise let unverified requests through
    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.session_secret.is_empty() {
            return Err(ConnectionError::configuration("session_secret is not set"));
        }

        for (name, value) in [
            ("frontend_url", &self.frontend_url),
            ("public_url", &self.public_url),
            ("github.api_url", &self.github.api_url),
            ("github.web_url", &self.github.web_url),
        ] {
            Url::parse(value)
                .map_err(|e| ConnectionError::configuration(format!("invalid {name} '{value}': {e}")))?;
        }

        if self.github.app_enabled {
            self.github.app_credentials()?;
            self.github.webhook_secret()?;
            if self.github.app_slug.as_deref().map_or(true, str::is_empty) {
                return Err(ConnectionError::configuration(
                    "github.app_slug is required when the App flow is enabled",
                ));
            }
        }

        Ok(())
    }
}

impl GitHubConfig {
    /// Whether new connections should go through the App installation
    pub fn use_app_flow(&self) -> bool {
        self.app_enabled && self.prefer_app_flow
    }

    pub fn app_credentials(&self) -> Result<(u64, &str), ConnectionError> {
        let app_id = self
            .app_id
            .ok_or_else(|| ConnectionError::configuration("github.app_id is not set"))?;
        let key = self
            .app_private_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConnectionError::configuration("github.app_private_key is not set"))?;
        Ok((app_id, key))
    }

    pub fn webhook_secret(&self) -> Result<&str, ConnectionError> {
        self.webhook_secret
            .as_deref()
            .filter(|secret| !secret.is_empty())
            .ok_or_else(|| ConnectionError::configuration("github.webhook_secret is not set"))
    }

    /// `https://github.com/apps/<slug>/installations/new`
    pub fn installation_page(&self) -> Result<Url, ConnectionError> {
        let slug = self
            .app_slug
            .as_deref()
            .filter(|slug| !slug.is_empty())
            .ok_or_else(|| ConnectionError::configuration("github.app_slug is not set"))?;

        let base = self.web_url.trim_end_matches('/');
        Url::parse(&format!("{base}/apps/{slug}/installations/new"))
            .map_err(|e| ConnectionError::configuration(format!("invalid github.web_url: {e}")))
    }

    /// The installation page with the correlation `state` attached
    pub fn installation_url(&self, state: &str) -> Result<String, ConnectionError> {
        let mut url = self.installation_page()?;
        url.query_pairs_mut()
            .append_pair("state", state)
            .append_pair("setup_action", "install");

        Ok(url.to_string())
    }
}

fn redact(value: &Option<String>) -> &'static str {
    match value {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("app_enabled", &self.app_enabled)
            .field("prefer_app_flow", &self.prefer_app_flow)
            .field("app_id", &self.app_id)
            .field("app_private_key", &redact(&self.app_private_key))
            .field("app_slug", &self.app_slug)
            .field("webhook_secret", &redact(&self.webhook_secret))
            .field("oauth_client_id", &self.oauth_client_id)
            .field("oauth_client_secret", &redact(&self.oauth_client_secret))
            .field("api_url", &self.api_url)
            .field("web_url", &self.web_url)
            .finish()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("web", &self.web)
            .field("db_path", &self.db_path)
            .field("frontend_url", &self.frontend_url)
            .field("public_url", &self.public_url)
            .field("session_secret", &"[REDACTED]")
            .field("github", &self.github)
            .field("regeneration", &self.regeneration)
            .finish()
    }
}
