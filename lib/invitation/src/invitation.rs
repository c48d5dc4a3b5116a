//! The invitation record and its status machine.

use crate::token;
use chrono::{DateTime, Duration, Utc};
use gatehouse_core::{InvitationId, TenantId, UserId};
use serde::{Deserialize, Serialize};

/// Stored invitation status.
///
/// `Expired` is normally a computed view over a lapsed `Pending` record,
/// not a written value; see [`Invitation::effective_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Expired,
    Cancelled,
}

impl InvitationStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for InvitationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An invitation into a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invitation {
    /// Unique identifier.
    pub id: InvitationId,
    /// Email address the invitation was issued to.
    pub email: String,
    /// The tenant the invitee joins on acceptance.
    pub tenant_id: TenantId,
    /// The tenant's slug, cross-checked against the credential issued to
    /// the invitee at acceptance time.
    pub tenant_slug: String,
    /// The single-use acceptance token. Replaced on resend; kept after
    /// acceptance or cancellation so stale links answer "consumed" rather
    /// than "unknown".
    pub token: Option<String>,
    /// Stored status. Read paths should prefer
    /// [`effective_status`](Self::effective_status).
    pub status: InvitationStatus,
    /// The member who issued the invitation.
    pub invited_by: UserId,
    /// When the invitation was issued (reset on resend).
    pub invited_at: DateTime<Utc>,
    /// When the invitation was accepted, if it was.
    pub accepted_at: Option<DateTime<Utc>>,
    /// End of the acceptance window.
    pub expires_at: DateTime<Utc>,
    /// Roles granted to the invitee on acceptance.
    pub roles: Vec<String>,
}

impl Invitation {
    /// Issues a new pending invitation with a fresh token and the given
    /// acceptance window.
    #[must_use]
    pub fn new(
        email: impl Into<String>,
        tenant_id: TenantId,
        tenant_slug: impl Into<String>,
        invited_by: UserId,
        roles: Vec<String>,
        validity: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: InvitationId::new(),
            email: email.into(),
            tenant_id,
            tenant_slug: tenant_slug.into(),
            token: Some(token::generate()),
            status: InvitationStatus::Pending,
            invited_by,
            invited_at: now,
            accepted_at: None,
            expires_at: now + validity,
            roles,
        }
    }

    /// Returns true when the acceptance window has passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// The status as seen by read paths: a lapsed pending record reads as
    /// expired even though the stored field still says pending.
    #[must_use]
    pub fn effective_status(&self, now: DateTime<Utc>) -> InvitationStatus {
        if self.status == InvitationStatus::Pending && self.is_expired(now) {
            InvitationStatus::Expired
        } else {
            self.status
        }
    }

    /// Replaces the token and restarts the acceptance window.
    pub fn reissue(&mut self, validity: Duration) {
        let now = Utc::now();
        self.token = Some(token::generate());
        self.invited_at = now;
        self.expires_at = now + validity;
        self.status = InvitationStatus::Pending;
        self.accepted_at = None;
    }
}
