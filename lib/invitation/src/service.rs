//! The invitation state machine and membership provisioning.

use crate::error::InvitationError;
use crate::invitation::{Invitation, InvitationStatus};
use crate::store::{InvitationStore, MembershipLink, PlatformUser, UserDirectory};
use chrono::{Duration, Utc};
use gatehouse_core::{InvitationId, TenantId};
use serde::Deserialize;
use std::sync::Arc;

fn default_validity_days() -> u32 {
    7
}

/// Invitation policy settings.
#[derive(Debug, Clone, Deserialize)]
pub struct InvitationConfig {
    /// Length of the acceptance window, in days.
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
}

impl Default for InvitationConfig {
    fn default() -> Self {
        Self {
            validity_days: default_validity_days(),
        }
    }
}

/// Parameters for issuing an invitation.
#[derive(Debug, Clone)]
pub struct NewInvitation {
    pub email: String,
    pub tenant_id: TenantId,
    pub tenant_slug: String,
    pub roles: Vec<String>,
    pub invited_by: gatehouse_core::UserId,
}

/// The federated identity presenting an invitation token at acceptance.
#[derive(Debug, Clone)]
pub struct FederatedIdentity {
    /// Subject claim from the credential the provider issued.
    pub subject: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// Outcome of a successful accept: the consumed invitation and the
/// membership it provisioned.
#[derive(Debug, Clone)]
pub struct AcceptedMembership {
    pub invitation: Invitation,
    pub user: PlatformUser,
}

/// Server-side invitation lifecycle.
pub struct InvitationService {
    store: Arc<dyn InvitationStore>,
    directory: Arc<dyn UserDirectory>,
    validity: Duration,
}

impl InvitationService {
    #[must_use]
    pub fn new(
        store: Arc<dyn InvitationStore>,
        directory: Arc<dyn UserDirectory>,
        config: InvitationConfig,
    ) -> Self {
        Self {
            store,
            directory,
            validity: Duration::days(i64::from(config.validity_days)),
        }
    }

    /// Issues an invitation for an email into a tenant.
    ///
    /// A lapsed or cancelled invitation for the same pair is re-issued in
    /// place rather than duplicated, keeping one record per invitee per
    /// tenant.
    ///
    /// # Errors
    ///
    /// - [`InvitationError::DuplicateActiveInvitation`] when a pending,
    ///   non-expired invitation already exists for this pair
    /// - [`InvitationError::AlreadyMember`] when the pair's invitation was
    ///   already accepted
    pub async fn create(&self, new: NewInvitation) -> Result<Invitation, InvitationError> {
        let now = Utc::now();
        if let Some(mut existing) = self
            .store
            .find_by_email_and_tenant(&new.email, new.tenant_id)
            .await?
        {
            return match existing.effective_status(now) {
                InvitationStatus::Pending => Err(InvitationError::DuplicateActiveInvitation {
                    email: new.email,
                }),
                InvitationStatus::Accepted => {
                    Err(InvitationError::AlreadyMember { email: new.email })
                }
                InvitationStatus::Expired | InvitationStatus::Cancelled => {
                    existing.reissue(self.validity);
                    existing.invited_by = new.invited_by;
                    existing.roles = new.roles;
                    self.store.update(&existing).await?;
                    tracing::info!(invitation = %existing.id, email = %existing.email, "invitation re-issued");
                    Ok(existing)
                }
            };
        }

        let invitation = Invitation::new(
            new.email,
            new.tenant_id,
            new.tenant_slug,
            new.invited_by,
            new.roles,
            self.validity,
        );
        self.store.insert(invitation.clone()).await?;
        tracing::info!(invitation = %invitation.id, email = %invitation.email, "invitation created");
        Ok(invitation)
    }

    /// Replaces the token and restarts the window of a pending invitation.
    /// The previous token stops authorizing anything.
    ///
    /// # Errors
    ///
    /// Returns [`InvitationError::NotPending`] when the effective status is
    /// not pending.
    pub async fn resend(&self, id: InvitationId) -> Result<Invitation, InvitationError> {
        let mut invitation = self.require_effectively_pending(id).await?;
        invitation.reissue(self.validity);
        self.store.update(&invitation).await?;
        tracing::info!(invitation = %invitation.id, "invitation token rotated");
        Ok(invitation)
    }

    /// Cancels a pending invitation. Terminal.
    ///
    /// # Errors
    ///
    /// Returns [`InvitationError::NotPending`] when the effective status is
    /// not pending.
    pub async fn cancel(&self, id: InvitationId) -> Result<Invitation, InvitationError> {
        let mut invitation = self.require_effectively_pending(id).await?;
        invitation.status = InvitationStatus::Cancelled;
        self.store.update(&invitation).await?;
        tracing::info!(invitation = %invitation.id, "invitation cancelled");
        Ok(invitation)
    }

    /// Consumes an invitation token and provisions the presenting identity
    /// into the invited tenant.
    ///
    /// The check-and-set on the invitation record is atomic; of any number
    /// of concurrent callers with the same token, exactly one provisions a
    /// membership and the rest observe [`InvitationError::AlreadyConsumed`].
    ///
    /// # Errors
    ///
    /// - [`InvitationError::NotFound`] when no record holds this token
    /// - [`InvitationError::Expired`] when the window passed; the stored
    ///   record keeps saying pending
    /// - [`InvitationError::AlreadyConsumed`] when the record was already
    ///   accepted or cancelled
    pub async fn accept(
        &self,
        token: &str,
        identity: &FederatedIdentity,
    ) -> Result<AcceptedMembership, InvitationError> {
        let now = Utc::now();

        if let Some(invitation) = self.store.claim_pending(token, now).await? {
            let email = identity
                .email
                .clone()
                .unwrap_or_else(|| invitation.email.clone());
            let user = self
                .directory
                .link_membership(&MembershipLink {
                    subject: identity.subject.clone(),
                    email,
                    display_name: identity.display_name.clone(),
                    tenant_id: invitation.tenant_id,
                    roles: invitation.roles.clone(),
                })
                .await?;
            tracing::info!(
                invitation = %invitation.id,
                user = %user.id,
                tenant = %invitation.tenant_slug,
                "invitation accepted"
            );
            return Ok(AcceptedMembership { invitation, user });
        }

        // The claim missed; classify why for the caller.
        match self.store.find_by_token(token).await? {
            None => Err(InvitationError::NotFound),
            Some(i) if i.status == InvitationStatus::Pending && i.is_expired(now) => {
                Err(InvitationError::Expired)
            }
            Some(_) => Err(InvitationError::AlreadyConsumed),
        }
    }

    /// Accepts the pending invitation addressed to an email, when the
    /// federated callback arrives without a token. The regular accept
    /// path and all of its checks still apply.
    ///
    /// # Errors
    ///
    /// Returns [`InvitationError::NotFound`] when no pending invitation is
    /// addressed to this email; otherwise as [`accept`](Self::accept).
    pub async fn accept_for_email(
        &self,
        email: &str,
        identity: &FederatedIdentity,
    ) -> Result<AcceptedMembership, InvitationError> {
        let invitation = self
            .store
            .find_pending_by_email(email)
            .await?
            .ok_or(InvitationError::NotFound)?;
        let token = invitation.token.ok_or(InvitationError::NotFound)?;
        self.accept(&token, identity).await
    }

    /// Looks an invitation up by token, for the public preview endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`InvitationError::NotFound`] when no record holds this
    /// token.
    pub async fn lookup(&self, token: &str) -> Result<Invitation, InvitationError> {
        self.store
            .find_by_token(token)
            .await?
            .ok_or(InvitationError::NotFound)
    }

    /// Fetches an invitation by id.
    ///
    /// # Errors
    ///
    /// Returns [`InvitationError::NotFound`] when no record has this id.
    pub async fn get(&self, id: InvitationId) -> Result<Invitation, InvitationError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or(InvitationError::NotFound)
    }

    /// Lists a tenant's invitations, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`InvitationError::Storage`] when the backend fails.
    pub async fn list(&self, tenant_id: TenantId) -> Result<Vec<Invitation>, InvitationError> {
        Ok(self.store.list_for_tenant(tenant_id).await?)
    }

    async fn require_effectively_pending(
        &self,
        id: InvitationId,
    ) -> Result<Invitation, InvitationError> {
        let invitation = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(InvitationError::NotFound)?;
        let status = invitation.effective_status(Utc::now());
        if status != InvitationStatus::Pending {
            return Err(InvitationError::NotPending {
                status: status.to_string(),
            });
        }
        Ok(invitation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryInvitationStore, MemoryUserDirectory};
    use gatehouse_core::UserId;

    struct Fixture {
        service: InvitationService,
        store: Arc<MemoryInvitationStore>,
        directory: Arc<MemoryUserDirectory>,
        tenant_id: TenantId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryInvitationStore::new());
        let directory = Arc::new(MemoryUserDirectory::new());
        let service = InvitationService::new(
            store.clone(),
            directory.clone(),
            InvitationConfig::default(),
        );
        Fixture {
            service,
            store,
            directory,
            tenant_id: TenantId::new(),
        }
    }

    fn new_invitation(fixture: &Fixture, email: &str) -> NewInvitation {
        NewInvitation {
            email: email.to_string(),
            tenant_id: fixture.tenant_id,
            tenant_slug: "acme".to_string(),
            roles: vec!["USER".to_string()],
            invited_by: UserId::new(),
        }
    }

    fn invitee() -> FederatedIdentity {
        FederatedIdentity {
            subject: "kc-42".to_string(),
            email: Some("invitee@example.com".to_string()),
            display_name: Some("Invitee".to_string()),
        }
    }

    async fn set_expired(fixture: &Fixture, invitation: &Invitation) {
        let mut lapsed = invitation.clone();
        lapsed.expires_at = Utc::now() - Duration::seconds(1);
        fixture.store.update(&lapsed).await.expect("update");
    }

    #[tokio::test]
    async fn create_rejects_duplicate_pending() {
        let f = fixture();
        f.service
            .create(new_invitation(&f, "a@x.com"))
            .await
            .expect("create");

        let err = f
            .service
            .create(new_invitation(&f, "a@x.com"))
            .await
            .expect_err("duplicate");
        assert!(matches!(
            err,
            InvitationError::DuplicateActiveInvitation { .. }
        ));
    }

    #[tokio::test]
    async fn create_reissues_after_expiry() {
        let f = fixture();
        let first = f
            .service
            .create(new_invitation(&f, "a@x.com"))
            .await
            .expect("create");
        set_expired(&f, &first).await;

        let second = f
            .service
            .create(new_invitation(&f, "a@x.com"))
            .await
            .expect("re-issue");
        assert_eq!(second.id, first.id);
        assert_ne!(second.token, first.token);
        assert_eq!(second.status, InvitationStatus::Pending);
    }

    #[tokio::test]
    async fn create_rejects_already_accepted_email() {
        let f = fixture();
        let invitation = f
            .service
            .create(new_invitation(&f, "a@x.com"))
            .await
            .expect("create");
        f.service
            .accept(invitation.token.as_deref().expect("token"), &invitee())
            .await
            .expect("accept");

        let err = f
            .service
            .create(new_invitation(&f, "a@x.com"))
            .await
            .expect_err("member");
        assert!(matches!(err, InvitationError::AlreadyMember { .. }));
    }

    #[tokio::test]
    async fn accept_provisions_membership_once() {
        let f = fixture();
        let invitation = f
            .service
            .create(new_invitation(&f, "a@x.com"))
            .await
            .expect("create");
        let token = invitation.token.clone().expect("token");

        let accepted = f.service.accept(&token, &invitee()).await.expect("accept");
        assert_eq!(accepted.invitation.status, InvitationStatus::Accepted);
        assert!(accepted.invitation.accepted_at.is_some());
        assert_eq!(accepted.user.tenant_id, f.tenant_id);
        assert_eq!(accepted.user.roles, vec!["USER".to_string()]);

        let err = f.service.accept(&token, &invitee()).await.expect_err("second");
        assert_eq!(err, InvitationError::AlreadyConsumed);
        assert_eq!(f.directory.len().await, 1);
    }

    #[tokio::test]
    async fn accept_falls_back_to_invited_email() {
        let f = fixture();
        let invitation = f
            .service
            .create(new_invitation(&f, "invited@x.com"))
            .await
            .expect("create");
        let identity = FederatedIdentity {
            subject: "kc-7".to_string(),
            email: None,
            display_name: None,
        };

        let accepted = f
            .service
            .accept(invitation.token.as_deref().expect("token"), &identity)
            .await
            .expect("accept");
        assert_eq!(accepted.user.email, "invited@x.com");
    }

    #[tokio::test]
    async fn accept_boundary_straddles_expiry() {
        let f = fixture();

        // One second of window left: accept succeeds.
        let invitation = f
            .service
            .create(new_invitation(&f, "early@x.com"))
            .await
            .expect("create");
        let mut closing = invitation.clone();
        closing.expires_at = Utc::now() + Duration::seconds(1);
        f.store.update(&closing).await.expect("update");
        f.service
            .accept(closing.token.as_deref().expect("token"), &invitee())
            .await
            .expect("accept inside window");

        // One second past the window: Expired, and the record stays pending.
        let invitation = f
            .service
            .create(new_invitation(&f, "late@x.com"))
            .await
            .expect("create");
        set_expired(&f, &invitation).await;
        let token = invitation.token.clone().expect("token");
        let err = f.service.accept(&token, &invitee()).await.expect_err("late");
        assert_eq!(err, InvitationError::Expired);

        let stored = f
            .store
            .find_by_token(&token)
            .await
            .expect("find")
            .expect("record");
        assert_eq!(stored.status, InvitationStatus::Pending);
        assert_eq!(
            stored.effective_status(Utc::now()),
            InvitationStatus::Expired
        );
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let f = fixture();
        let err = f
            .service
            .accept("no-such-token", &invitee())
            .await
            .expect_err("missing");
        assert_eq!(err, InvitationError::NotFound);
    }

    #[tokio::test]
    async fn resend_invalidates_the_previous_token() {
        let f = fixture();
        let invitation = f
            .service
            .create(new_invitation(&f, "a@x.com"))
            .await
            .expect("create");
        let old_token = invitation.token.clone().expect("token");

        let resent = f.service.resend(invitation.id).await.expect("resend");
        let new_token = resent.token.clone().expect("token");
        assert_ne!(old_token, new_token);

        // The superseded token never authorizes an accept again.
        let err = f
            .service
            .accept(&old_token, &invitee())
            .await
            .expect_err("stale token");
        assert_eq!(err, InvitationError::NotFound);

        f.service
            .accept(&new_token, &invitee())
            .await
            .expect("accept with current token");
    }

    #[tokio::test]
    async fn resend_requires_effectively_pending() {
        let f = fixture();
        let invitation = f
            .service
            .create(new_invitation(&f, "a@x.com"))
            .await
            .expect("create");
        set_expired(&f, &invitation).await;

        let err = f.service.resend(invitation.id).await.expect_err("lapsed");
        assert_eq!(
            err,
            InvitationError::NotPending {
                status: "expired".to_string()
            }
        );
    }

    #[tokio::test]
    async fn cancelled_invitation_never_provisions() {
        let f = fixture();
        let invitation = f
            .service
            .create(new_invitation(&f, "a@x.com"))
            .await
            .expect("create");
        let token = invitation.token.clone().expect("token");

        f.service.cancel(invitation.id).await.expect("cancel");

        let err = f.service.accept(&token, &invitee()).await.expect_err("cancelled");
        assert_eq!(err, InvitationError::AlreadyConsumed);
        assert!(f.directory.is_empty().await);

        // Cancellation is terminal for resend and cancel as well.
        let err = f.service.resend(invitation.id).await.expect_err("resend");
        assert!(matches!(err, InvitationError::NotPending { .. }));
        let err = f.service.cancel(invitation.id).await.expect_err("cancel");
        assert!(matches!(err, InvitationError::NotPending { .. }));
    }

    #[tokio::test]
    async fn concurrent_accepts_provision_exactly_one_membership() {
        let f = fixture();
        let invitation = f
            .service
            .create(new_invitation(&f, "a@x.com"))
            .await
            .expect("create");
        let token = invitation.token.clone().expect("token");

        let service = Arc::new(f.service);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                service.accept(&token, &invitee()).await
            }));
        }

        let mut wins = 0;
        let mut losses = 0;
        for handle in handles {
            match handle.await.expect("join") {
                Ok(_) => wins += 1,
                Err(InvitationError::AlreadyConsumed) => losses += 1,
                Err(other) => panic!("unexpected loser error {other:?}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(losses, 7);
        assert_eq!(f.directory.len().await, 1);
    }

    #[tokio::test]
    async fn accept_for_email_uses_the_pending_invitation() {
        let f = fixture();
        f.service
            .create(new_invitation(&f, "invitee@example.com"))
            .await
            .expect("create");

        let accepted = f
            .service
            .accept_for_email("invitee@example.com", &invitee())
            .await
            .expect("accept");
        assert_eq!(accepted.invitation.email, "invitee@example.com");
        assert_eq!(f.directory.len().await, 1);

        let err = f
            .service
            .accept_for_email("stranger@example.com", &invitee())
            .await
            .expect_err("no invitation");
        assert_eq!(err, InvitationError::NotFound);
    }

    #[tokio::test]
    async fn lookup_reports_effective_status_to_read_paths() {
        let f = fixture();
        let invitation = f
            .service
            .create(new_invitation(&f, "a@x.com"))
            .await
            .expect("create");
        set_expired(&f, &invitation).await;

        let found = f
            .service
            .lookup(invitation.token.as_deref().expect("token"))
            .await
            .expect("lookup");
        assert_eq!(found.status, InvitationStatus::Pending);
        assert_eq!(
            found.effective_status(Utc::now()),
            InvitationStatus::Expired
        );
    }

    #[tokio::test]
    async fn list_is_tenant_scoped() {
        let f = fixture();
        f.service
            .create(new_invitation(&f, "a@x.com"))
            .await
            .expect("create");
        f.service
            .create(new_invitation(&f, "b@x.com"))
            .await
            .expect("create");

        let other_tenant = NewInvitation {
            tenant_id: TenantId::new(),
            ..new_invitation(&f, "c@y.com")
        };
        f.service.create(other_tenant).await.expect("create");

        let listed = f.service.list(f.tenant_id).await.expect("list");
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|i| i.tenant_id == f.tenant_id));
    }
}
