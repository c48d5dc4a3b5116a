//! Client-side identity for the gatehouse platform.
//!
//! This crate provides the session and credential lifecycle for clients of a
//! multi-tenant platform authenticating against an external OpenID-Connect
//! compatible identity provider:
//!
//! - Structural credential decoding (`Claims`)
//! - Session state with derived tenant binding (`Session`, `SessionStore`)
//! - The three OAuth grant exchanges (`TokenExchangeClient`)
//! - An authenticated request gateway with bounded silent renewal
//!   (`ApiGateway`)
//! - The invitation handshake controller (`HandshakeController`)
//!
//! # Tenant binding
//!
//! The tenant a session is scoped to is always re-derived from the access
//! credential's claims. No API in this crate accepts a tenant value from any
//! other source, so a stale or attacker-supplied tenant header can never
//! detach from the credential that backs it.
//!
//! # Example
//!
//! ```no_run
//! use gatehouse_identity::{ProviderConfig, SessionStore, TokenExchangeClient};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProviderConfig::new(
//!     "https://auth.example.com".to_string(),
//!     "agentic".to_string(),
//!     "platform-client".to_string(),
//!     "client-secret".to_string(),
//!     "https://app.example.com/auth/callback".to_string(),
//! );
//! let exchange = TokenExchangeClient::new(config)?;
//! let store = Arc::new(SessionStore::new());
//!
//! let tokens = exchange.password_grant("alice@example.com", "secret").await?;
//! let session = store.set(tokens.access_credential, tokens.refresh_credential).await?;
//! assert!(session.claims().subject.len() > 0);
//! # Ok(())
//! # }
//! ```

pub mod claims;
pub mod error;
pub mod exchange;
pub mod gateway;
pub mod handshake;
pub mod session;
pub mod store;

pub use claims::Claims;
pub use error::{
    DecodeError, ExchangeError, GatewayError, HandshakeError, SessionStoreError,
};
pub use exchange::{ProviderConfig, TokenExchangeClient, TokenPair};
pub use gateway::{ApiGateway, ApiRequest};
pub use handshake::{HandshakeController, HandshakePhase, InvitationPreview};
pub use session::Session;
pub use store::{FilePersistence, PersistedCredentials, SessionPersistence, SessionStore};
