mod bind_intents;
mod github_installations;
mod oauth_states;
mod pending_installations;
mod service;
mod users;
mod webhook_events;

pub use bind_intents::BindOutcome;
pub use github_installations::{InstallationFields, InstallationRepository};
pub use service::DbService;
pub use users::OAuthLink;
