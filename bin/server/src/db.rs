//! Postgres-backed invitation store and user directory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gatehouse_core::{InvitationId, TenantId, UserId};
use gatehouse_invitation::store::{
    InvitationStore, MembershipLink, PlatformUser, StoreError, UserDirectory,
};
use gatehouse_invitation::{Invitation, InvitationStatus};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

fn backend_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend {
        details: e.to_string(),
    }
}

fn parse_status(raw: &str) -> Result<InvitationStatus, StoreError> {
    match raw {
        "pending" => Ok(InvitationStatus::Pending),
        "accepted" => Ok(InvitationStatus::Accepted),
        "expired" => Ok(InvitationStatus::Expired),
        "cancelled" => Ok(InvitationStatus::Cancelled),
        other => Err(StoreError::Backend {
            details: format!("unknown invitation status '{other}'"),
        }),
    }
}

/// Row type for invitation queries.
#[derive(FromRow)]
struct InvitationRow {
    id: String,
    email: String,
    tenant_id: String,
    tenant_slug: String,
    token: Option<String>,
    status: String,
    invited_by: String,
    invited_at: DateTime<Utc>,
    accepted_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
    roles: serde_json::Value,
}

impl InvitationRow {
    fn try_into_invitation(self) -> Result<Invitation, StoreError> {
        let id = InvitationId::from_str(&self.id).map_err(backend_err)?;
        let tenant_id = TenantId::from_str(&self.tenant_id).map_err(backend_err)?;
        let invited_by = UserId::from_str(&self.invited_by).map_err(backend_err)?;
        let status = parse_status(&self.status)?;
        let roles: Vec<String> = serde_json::from_value(self.roles).unwrap_or_default();

        Ok(Invitation {
            id,
            email: self.email,
            tenant_id,
            tenant_slug: self.tenant_slug,
            token: self.token,
            status,
            invited_by,
            invited_at: self.invited_at,
            accepted_at: self.accepted_at,
            expires_at: self.expires_at,
            roles,
        })
    }
}

/// Row type for platform user queries.
#[derive(FromRow)]
struct UserRow {
    id: String,
    subject: String,
    email: String,
    display_name: Option<String>,
    tenant_id: String,
    roles: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl UserRow {
    fn try_into_user(self) -> Result<PlatformUser, StoreError> {
        let id = UserId::from_str(&self.id).map_err(backend_err)?;
        let tenant_id = TenantId::from_str(&self.tenant_id).map_err(backend_err)?;
        let roles: Vec<String> = serde_json::from_value(self.roles).unwrap_or_default();

        Ok(PlatformUser {
            id,
            subject: self.subject,
            email: self.email,
            display_name: self.display_name,
            tenant_id,
            roles,
            created_at: self.created_at,
        })
    }
}

const INVITATION_COLUMNS: &str = "id, email, tenant_id, tenant_slug, token, status, \
     invited_by, invited_at, accepted_at, expires_at, roles";

/// Postgres invitation store.
pub struct PgInvitationStore {
    pool: PgPool,
}

impl PgInvitationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InvitationStore for PgInvitationStore {
    async fn insert(&self, invitation: Invitation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO invitations
                (id, email, tenant_id, tenant_slug, token, status,
                 invited_by, invited_at, accepted_at, expires_at, roles)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(invitation.id.to_string())
        .bind(&invitation.email)
        .bind(invitation.tenant_id.to_string())
        .bind(&invitation.tenant_slug)
        .bind(&invitation.token)
        .bind(invitation.status.as_str())
        .bind(invitation.invited_by.to_string())
        .bind(invitation.invited_at)
        .bind(invitation.accepted_at)
        .bind(invitation.expires_at)
        .bind(serde_json::json!(invitation.roles))
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn find_by_id(&self, id: InvitationId) -> Result<Option<Invitation>, StoreError> {
        let row: Option<InvitationRow> = sqlx::query_as(&format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        row.map(InvitationRow::try_into_invitation).transpose()
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Invitation>, StoreError> {
        let row: Option<InvitationRow> = sqlx::query_as(&format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations WHERE token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        row.map(InvitationRow::try_into_invitation).transpose()
    }

    async fn find_by_email_and_tenant(
        &self,
        email: &str,
        tenant_id: TenantId,
    ) -> Result<Option<Invitation>, StoreError> {
        let row: Option<InvitationRow> = sqlx::query_as(&format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations \
             WHERE email = $1 AND tenant_id = $2"
        ))
        .bind(email)
        .bind(tenant_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        row.map(InvitationRow::try_into_invitation).transpose()
    }

    async fn find_pending_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Invitation>, StoreError> {
        let row: Option<InvitationRow> = sqlx::query_as(&format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations \
             WHERE email = $1 AND status = 'pending' \
             ORDER BY invited_at DESC LIMIT 1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        row.map(InvitationRow::try_into_invitation).transpose()
    }

    async fn update(&self, invitation: &Invitation) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE invitations
            SET email = $2, tenant_id = $3, tenant_slug = $4, token = $5,
                status = $6, invited_by = $7, invited_at = $8,
                accepted_at = $9, expires_at = $10, roles = $11
            WHERE id = $1
            "#,
        )
        .bind(invitation.id.to_string())
        .bind(&invitation.email)
        .bind(invitation.tenant_id.to_string())
        .bind(&invitation.tenant_slug)
        .bind(&invitation.token)
        .bind(invitation.status.as_str())
        .bind(invitation.invited_by.to_string())
        .bind(invitation.invited_at)
        .bind(invitation.accepted_at)
        .bind(invitation.expires_at)
        .bind(serde_json::json!(invitation.roles))
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Backend {
                details: format!("no invitation with id {}", invitation.id),
            });
        }
        Ok(())
    }

    async fn claim_pending(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Invitation>, StoreError> {
        // Single conditional UPDATE; concurrent acceptors race on the row
        // and only one matches the pending predicate.
        let row: Option<InvitationRow> = sqlx::query_as(&format!(
            "UPDATE invitations \
             SET status = 'accepted', accepted_at = $2 \
             WHERE token = $1 AND status = 'pending' AND expires_at >= $2 \
             RETURNING {INVITATION_COLUMNS}"
        ))
        .bind(token)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        row.map(InvitationRow::try_into_invitation).transpose()
    }

    async fn list_for_tenant(&self, tenant_id: TenantId) -> Result<Vec<Invitation>, StoreError> {
        let rows: Vec<InvitationRow> = sqlx::query_as(&format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations \
             WHERE tenant_id = $1 ORDER BY invited_at DESC"
        ))
        .bind(tenant_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        rows.into_iter()
            .map(InvitationRow::try_into_invitation)
            .collect()
    }
}

/// Postgres user directory.
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_by_subject(&self, subject: &str) -> Result<Option<PlatformUser>, StoreError> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, subject, email, display_name, tenant_id, roles, created_at \
             FROM platform_users WHERE subject = $1",
        )
        .bind(subject)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        row.map(UserRow::try_into_user).transpose()
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<PlatformUser>, StoreError> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, subject, email, display_name, tenant_id, roles, created_at \
             FROM platform_users WHERE id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        row.map(UserRow::try_into_user).transpose()
    }

    async fn link_membership(&self, link: &MembershipLink) -> Result<PlatformUser, StoreError> {
        // Upsert by subject so repeated links never duplicate a user.
        let row: UserRow = sqlx::query_as(
            r#"
            INSERT INTO platform_users
                (id, subject, email, display_name, tenant_id, roles, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (subject) DO UPDATE
            SET email = EXCLUDED.email,
                display_name = EXCLUDED.display_name,
                tenant_id = EXCLUDED.tenant_id,
                roles = EXCLUDED.roles
            RETURNING id, subject, email, display_name, tenant_id, roles, created_at
            "#,
        )
        .bind(UserId::new().to_string())
        .bind(&link.subject)
        .bind(&link.email)
        .bind(&link.display_name)
        .bind(link.tenant_id.to_string())
        .bind(serde_json::json!(link.roles))
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(backend_err)?;
        row.try_into_user()
    }
}
