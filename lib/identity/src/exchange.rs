//! Token endpoint client for the three supported OAuth grants.
//!
//! All grants post to the same realm token endpoint and share one response
//! shape, so a single request path serves password, refresh and
//! authorization-code exchanges. Error taxonomy follows the provider's
//! `{error, error_description}` body: `invalid_grant` is the one error the
//! callers treat specially, everything else is a provider fault.

use crate::error::ExchangeError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

const DEFAULT_SCOPES: &str = "openid,email,profile";
const DEFAULT_TIMEOUT_SECONDS: u64 = 10;

fn default_scopes() -> String {
    DEFAULT_SCOPES.to_string()
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

/// Identity provider connection settings.
///
/// Deserializable so the server config layer can load it straight from the
/// environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the provider, without a trailing slash.
    pub base_url: String,
    /// Realm the platform's clients live in.
    pub realm: String,
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// Redirect URI registered for the authorization-code flow.
    pub redirect_uri: String,
    /// Comma-separated scopes requested on interactive flows.
    #[serde(default = "default_scopes")]
    pub scopes: String,
    /// Identity-provider hint forwarded as `kc_idp_hint`, when set.
    #[serde(default)]
    pub idp_hint: Option<String>,
    /// Request timeout for token endpoint calls.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl ProviderConfig {
    #[must_use]
    pub fn new(
        base_url: String,
        realm: String,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
    ) -> Self {
        Self {
            base_url,
            realm,
            client_id,
            client_secret,
            redirect_uri,
            scopes: default_scopes(),
            idp_hint: None,
            timeout_seconds: default_timeout_seconds(),
        }
    }

    /// The realm token endpoint all grants post to.
    #[must_use]
    pub fn token_endpoint(&self) -> String {
        format!(
            "{}/realms/{}/protocol/openid-connect/token",
            self.base_url.trim_end_matches('/'),
            self.realm
        )
    }

    /// Builds the interactive authorization URL carrying the given opaque
    /// state.
    ///
    /// # Errors
    ///
    /// Returns an error when the configured base URL does not parse.
    pub fn authorize_url(&self, state: &str) -> Result<Url, ExchangeError> {
        let mut url = Url::parse(&format!(
            "{}/realms/{}/protocol/openid-connect/auth",
            self.base_url.trim_end_matches('/'),
            self.realm
        ))
        .map_err(|e| ExchangeError::Configuration {
            reason: format!("invalid provider base URL: {e}"),
        })?;

        let scope = self
            .scopes
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &scope)
            .append_pair("state", state);
        if let Some(hint) = &self.idp_hint {
            url.query_pairs_mut().append_pair("kc_idp_hint", hint);
        }
        Ok(url)
    }
}

/// The credential pair returned by a successful grant.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_credential: String,
    pub refresh_credential: String,
    /// Advisory access credential lifetime, when the provider reports one.
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Client for the provider's token endpoint.
pub struct TokenExchangeClient {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl TokenExchangeClient {
    /// Builds a client with the configured request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::Configuration`] when the HTTP client cannot
    /// be constructed.
    pub fn new(config: ProviderConfig) -> Result<Self, ExchangeError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| ExchangeError::Configuration {
                reason: e.to_string(),
            })?;
        Ok(Self { http, config })
    }

    /// Returns the provider configuration this client was built with.
    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Exchanges a username and password for a credential pair.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::InvalidGrant`] means the credentials were rejected.
    pub async fn password_grant(
        &self,
        username: &str,
        password: &str,
    ) -> Result<TokenPair, ExchangeError> {
        self.request_token(&[
            ("grant_type", "password"),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("username", username),
            ("password", password),
        ])
        .await
    }

    /// Exchanges a refresh credential for a fresh pair.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::InvalidGrant`] means the refresh credential is dead;
    /// the caller must tear the session down rather than retry.
    pub async fn refresh_grant(&self, refresh_credential: &str) -> Result<TokenPair, ExchangeError> {
        self.request_token(&[
            ("grant_type", "refresh_token"),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("refresh_token", refresh_credential),
        ])
        .await
    }

    /// Exchanges a single-use authorization code for a credential pair.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::InvalidGrant`] means the code was already spent or
    /// has expired; it must never be re-submitted.
    pub async fn code_grant(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenPair, ExchangeError> {
        self.request_token(&[
            ("grant_type", "authorization_code"),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ])
        .await
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<TokenPair, ExchangeError> {
        let response = self
            .http
            .post(self.config.token_endpoint())
            .form(form)
            .send()
            .await
            .map_err(|e| ExchangeError::Network {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body: ProviderErrorBody = response.json().await.unwrap_or(ProviderErrorBody {
                error: String::new(),
                error_description: String::new(),
            });
            if body.error == "invalid_grant" {
                return Err(ExchangeError::InvalidGrant {
                    description: body.error_description,
                });
            }
            let description = if body.error_description.is_empty() {
                body.error
            } else {
                body.error_description
            };
            return Err(ExchangeError::Provider {
                status: status.as_u16(),
                description,
            });
        }

        let body: TokenResponse =
            response.json().await.map_err(|e| ExchangeError::Provider {
                status: status.as_u16(),
                description: format!("unparsable token response: {e}"),
            })?;

        let refresh_credential = body.refresh_token.ok_or_else(|| ExchangeError::Provider {
            status: status.as_u16(),
            description: "token response carried no refresh_token".to_string(),
        })?;

        Ok(TokenPair {
            access_credential: body.access_token,
            refresh_credential,
            expires_in: body.expires_in,
        })
    }
}
