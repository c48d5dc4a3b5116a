//! Structural decoding of access credentials into claims.
//!
//! The codec is a pure parse: it splits the credential into its segments,
//! base64url-decodes the payload, and reads the claims the platform cares
//! about. It never validates the signature (the provider's job) or the
//! expiry (the gateway's job, via the 401 renewal protocol).

use crate::error::DecodeError;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Decoded, read-only view of an access credential.
///
/// Optional claims that are absent decode to empty defaults rather than
/// failing; only a missing subject is an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// The subject claim (unique user identifier at the provider).
    pub subject: String,
    /// Preferred username, if the provider issued one.
    pub username: Option<String>,
    /// Display name, falling back to the preferred username.
    pub display_name: Option<String>,
    /// Authorization roles, from `realm_access.roles` with a top-level
    /// `roles` fallback.
    pub roles: Vec<String>,
    /// Email address, if present.
    pub email: Option<String>,
    /// The tenant this credential is scoped to. Absent means the caller
    /// must not be treated as tenant-bound.
    pub tenant_slug: Option<String>,
}

impl Claims {
    /// Decodes an access credential into claims.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] when the credential is not well-formed:
    /// wrong segment count, invalid base64url payload, unparsable JSON, or
    /// a claims object without a subject.
    pub fn decode(access_credential: &str) -> Result<Self, DecodeError> {
        // Credential is base64url(header).base64url(payload).signature
        let segments: Vec<&str> = access_credential.split('.').collect();
        if segments.len() != 3 {
            return Err(DecodeError::WrongSegmentCount {
                found: segments.len(),
            });
        }

        let payload_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(segments[1])
            .map_err(|e| DecodeError::InvalidEncoding {
                reason: e.to_string(),
            })?;

        let payload: serde_json::Value =
            serde_json::from_slice(&payload_bytes).map_err(|e| DecodeError::MalformedPayload {
                reason: e.to_string(),
            })?;

        if !payload.is_object() {
            return Err(DecodeError::MalformedPayload {
                reason: "payload is not a JSON object".to_string(),
            });
        }

        let subject = payload
            .get("sub")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or(DecodeError::MissingSubject)?;

        let username = payload
            .get("preferred_username")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let display_name = payload
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| username.clone());

        let email = payload
            .get("email")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        // Roles live under realm_access.roles for Keycloak-shaped providers;
        // some deployments flatten them to a top-level roles claim.
        let roles = payload
            .get("realm_access")
            .and_then(|v| v.get("roles"))
            .or_else(|| payload.get("roles"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let tenant_slug = payload
            .get("tenant")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(Self {
            subject,
            username,
            display_name,
            roles,
            email,
            tenant_slug,
        })
    }

    /// Returns true if this credential is scoped to a tenant.
    #[must_use]
    pub fn is_tenant_bound(&self) -> bool {
        self.tenant_slug.is_some()
    }
}
