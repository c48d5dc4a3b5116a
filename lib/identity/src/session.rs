//! The live session and its derived tenant binding.
//!
//! Exactly one session is live per client at a time; it is owned by the
//! [`SessionStore`](crate::store::SessionStore) and mutated only through it.

use crate::claims::Claims;
use crate::error::DecodeError;

/// An established session: both credentials plus the claims derived from
/// the access credential.
///
/// The tenant binding is part of the derived claims and is recomputed on
/// every construction. There is deliberately no way to build a `Session`
/// with a tenant that did not come out of the access credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    access_credential: String,
    refresh_credential: String,
    claims: Claims,
}

impl Session {
    /// Builds a session from a credential pair, deriving claims and tenant
    /// binding from the access credential.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] when the access credential is not
    /// structurally well-formed.
    pub fn from_credentials(
        access_credential: String,
        refresh_credential: String,
    ) -> Result<Self, DecodeError> {
        let claims = Claims::decode(&access_credential)?;
        Ok(Self {
            access_credential,
            refresh_credential,
            claims,
        })
    }

    /// Returns the bearer credential for API calls.
    #[must_use]
    pub fn access_credential(&self) -> &str {
        &self.access_credential
    }

    /// Returns the credential used for silent renewal.
    #[must_use]
    pub fn refresh_credential(&self) -> &str {
        &self.refresh_credential
    }

    /// Returns the claims derived from the access credential.
    #[must_use]
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// Returns the tenant this session is bound to, if any.
    ///
    /// Always derived from the access credential's claims, never supplied
    /// independently.
    #[must_use]
    pub fn tenant_binding(&self) -> Option<&str> {
        self.claims.tenant_slug.as_deref()
    }
}
