//! Storage traits for invitations and platform users, with in-memory
//! implementations for tests and local development.

use crate::invitation::{Invitation, InvitationStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gatehouse_core::{InvitationId, TenantId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::Mutex;

/// Errors from a storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Backend { details: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend { details } => write!(f, "storage backend error: {details}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Trait for invitation storage.
#[async_trait]
pub trait InvitationStore: Send + Sync {
    /// Inserts a new invitation.
    async fn insert(&self, invitation: Invitation) -> Result<(), StoreError>;

    /// Looks an invitation up by id.
    async fn find_by_id(&self, id: InvitationId) -> Result<Option<Invitation>, StoreError>;

    /// Looks an invitation up by its current token.
    async fn find_by_token(&self, token: &str) -> Result<Option<Invitation>, StoreError>;

    /// Finds the invitation for an email within a tenant, if any.
    async fn find_by_email_and_tenant(
        &self,
        email: &str,
        tenant_id: TenantId,
    ) -> Result<Option<Invitation>, StoreError>;

    /// Finds a stored-pending invitation for an email, across tenants.
    /// Used by the federated callback when no invitation token was carried.
    async fn find_pending_by_email(&self, email: &str)
    -> Result<Option<Invitation>, StoreError>;

    /// Writes an updated invitation back.
    async fn update(&self, invitation: &Invitation) -> Result<(), StoreError>;

    /// Atomically accepts the pending, unexpired invitation holding this
    /// token, setting `accepted_at` to `now`.
    ///
    /// Returns the accepted invitation, or `None` when no record matched
    /// the condition. Concurrent callers on the same token must conflict
    /// so at most one receives `Some`.
    async fn claim_pending(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Invitation>, StoreError>;

    /// Lists a tenant's invitations, newest first.
    async fn list_for_tenant(&self, tenant_id: TenantId) -> Result<Vec<Invitation>, StoreError>;
}

/// A provisioned platform user, linked to its federated subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformUser {
    pub id: UserId,
    /// Subject claim at the identity provider.
    pub subject: String,
    pub email: String,
    pub display_name: Option<String>,
    pub tenant_id: TenantId,
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// The membership an accepted invitation provisions.
#[derive(Debug, Clone)]
pub struct MembershipLink {
    pub subject: String,
    pub email: String,
    pub display_name: Option<String>,
    pub tenant_id: TenantId,
    pub roles: Vec<String>,
}

/// Trait for the platform user directory.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Finds the user linked to a federated subject.
    async fn find_by_subject(&self, subject: &str) -> Result<Option<PlatformUser>, StoreError>;

    /// Finds a user by id.
    async fn find_by_id(&self, id: UserId) -> Result<Option<PlatformUser>, StoreError>;

    /// Links a federated identity into a tenant, creating the user record
    /// if it does not exist yet. Upserts by subject, so repeated links
    /// never create duplicate records.
    async fn link_membership(&self, link: &MembershipLink) -> Result<PlatformUser, StoreError>;
}

/// In-memory invitation store. Atomicity of `claim_pending` comes from
/// holding the store lock across the check and the write.
#[derive(Default)]
pub struct MemoryInvitationStore {
    records: Mutex<Vec<Invitation>>,
}

impl MemoryInvitationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvitationStore for MemoryInvitationStore {
    async fn insert(&self, invitation: Invitation) -> Result<(), StoreError> {
        self.records.lock().await.push(invitation);
        Ok(())
    }

    async fn find_by_id(&self, id: InvitationId) -> Result<Option<Invitation>, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .find(|i| i.id == id)
            .cloned())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Invitation>, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .find(|i| i.token.as_deref() == Some(token))
            .cloned())
    }

    async fn find_by_email_and_tenant(
        &self,
        email: &str,
        tenant_id: TenantId,
    ) -> Result<Option<Invitation>, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .find(|i| i.email == email && i.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_pending_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Invitation>, StoreError> {
        // Newest wins, matching the Postgres store's ordering.
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|i| i.email == email && i.status == InvitationStatus::Pending)
            .max_by_key(|i| i.invited_at)
            .cloned())
    }

    async fn update(&self, invitation: &Invitation) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        match records.iter_mut().find(|i| i.id == invitation.id) {
            Some(existing) => {
                *existing = invitation.clone();
                Ok(())
            }
            None => Err(StoreError::Backend {
                details: format!("no invitation with id {}", invitation.id),
            }),
        }
    }

    async fn claim_pending(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Invitation>, StoreError> {
        let mut records = self.records.lock().await;
        let Some(record) = records.iter_mut().find(|i| {
            i.token.as_deref() == Some(token)
                && i.status == InvitationStatus::Pending
                && !i.is_expired(now)
        }) else {
            return Ok(None);
        };
        record.status = InvitationStatus::Accepted;
        record.accepted_at = Some(now);
        Ok(Some(record.clone()))
    }

    async fn list_for_tenant(&self, tenant_id: TenantId) -> Result<Vec<Invitation>, StoreError> {
        let mut invitations: Vec<Invitation> = self
            .records
            .lock()
            .await
            .iter()
            .filter(|i| i.tenant_id == tenant_id)
            .cloned()
            .collect();
        invitations.sort_by(|a, b| b.invited_at.cmp(&a.invited_at));
        Ok(invitations)
    }
}

/// In-memory user directory.
#[derive(Default)]
pub struct MemoryUserDirectory {
    records: Mutex<Vec<PlatformUser>>,
}

impl MemoryUserDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of user records, for provisioning assertions in tests.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Returns true when the directory holds no users.
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find_by_subject(&self, subject: &str) -> Result<Option<PlatformUser>, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .find(|u| u.subject == subject)
            .cloned())
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<PlatformUser>, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .find(|u| u.id == id)
            .cloned())
    }

    async fn link_membership(&self, link: &MembershipLink) -> Result<PlatformUser, StoreError> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.iter_mut().find(|u| u.subject == link.subject) {
            existing.email = link.email.clone();
            existing.display_name = link.display_name.clone();
            existing.tenant_id = link.tenant_id;
            existing.roles = link.roles.clone();
            return Ok(existing.clone());
        }
        let user = PlatformUser {
            id: UserId::new(),
            subject: link.subject.clone(),
            email: link.email.clone(),
            display_name: link.display_name.clone(),
            tenant_id: link.tenant_id,
            roles: link.roles.clone(),
            created_at: Utc::now(),
        };
        records.push(user.clone());
        Ok(user)
    }
}
