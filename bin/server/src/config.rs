//! Centralized server configuration.
//!
//! Strongly-typed configuration loaded via the `config` crate from
//! environment variables, with `__` as the nesting separator
//! (`PROVIDER__CLIENT_ID`, `INVITATION__VALIDITY_DAYS`, ...).

use gatehouse_identity::ProviderConfig;
use gatehouse_invitation::InvitationConfig;
use serde::Deserialize;

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Address the HTTP server binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Identity provider settings.
    pub provider: ProviderConfig,

    /// Invitation policy settings.
    #[serde(default)]
    pub invitation: InvitationConfig,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
