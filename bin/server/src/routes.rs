//! HTTP routes: the federated callback, the public invitation preview,
//! and the inviter-facing invitation management endpoints.
//!
//! Tenant scoping on every authenticated route comes from the caller's
//! credential claims, never from a request field. A request body cannot
//! name a tenant.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use gatehouse_core::InvitationId;
use gatehouse_identity::error::ExchangeError;
use gatehouse_identity::handshake::decode_state;
use gatehouse_identity::{Claims, TokenExchangeClient};
use gatehouse_invitation::store::{PlatformUser, UserDirectory};
use gatehouse_invitation::{
    FederatedIdentity, Invitation, InvitationError, InvitationService, InvitationStatus,
    NewInvitation,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub invitations: Arc<InvitationService>,
    pub directory: Arc<dyn UserDirectory>,
    pub exchange: Arc<TokenExchangeClient>,
}

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/auth/sso/callback", post(sso_callback))
        .route("/invitations", post(create_invitation).get(list_invitations))
        // The path parameter is a share-link token on GET and an invitation
        // id on the admin verbs; axum requires one name for the segment.
        .route(
            "/invitations/{key}",
            get(lookup_invitation).delete(cancel_invitation),
        )
        .route("/invitations/{key}/resend", post(resend_invitation))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// API-level errors with their HTTP mapping.
#[derive(Debug)]
pub enum ApiError {
    Invitation(InvitationError),
    Unauthorized { reason: String },
    NoMembership,
    CodeRejected { description: String },
    Upstream { details: String },
}

impl From<InvitationError> for ApiError {
    fn from(e: InvitationError) -> Self {
        Self::Invitation(e)
    }
}

impl From<gatehouse_invitation::StoreError> for ApiError {
    fn from(e: gatehouse_invitation::StoreError) -> Self {
        Self::Invitation(InvitationError::from(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::Invitation(InvitationError::NotFound) => {
                (StatusCode::NOT_FOUND, "invitation not found".to_string())
            }
            Self::Invitation(InvitationError::Expired) => {
                (StatusCode::GONE, "invitation has expired".to_string())
            }
            Self::Invitation(InvitationError::AlreadyConsumed) => (
                StatusCode::GONE,
                "invitation was already accepted or cancelled".to_string(),
            ),
            Self::Invitation(e @ InvitationError::NotPending { .. }) => {
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            Self::Invitation(
                e @ (InvitationError::DuplicateActiveInvitation { .. }
                | InvitationError::AlreadyMember { .. }),
            ) => (StatusCode::CONFLICT, e.to_string()),
            Self::Invitation(InvitationError::Storage { details }) => {
                tracing::error!(details, "invitation storage failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
            Self::Unauthorized { reason } => {
                tracing::debug!(reason, "rejected unauthenticated request");
                (StatusCode::UNAUTHORIZED, "not authenticated".to_string())
            }
            Self::NoMembership => (
                StatusCode::FORBIDDEN,
                "no invitation and no existing membership".to_string(),
            ),
            Self::CodeRejected { description } => (
                StatusCode::BAD_REQUEST,
                format!("authorization code rejected: {description}"),
            ),
            Self::Upstream { details } => {
                tracing::warn!(details, "identity provider failure");
                (
                    StatusCode::BAD_GATEWAY,
                    "identity provider unavailable".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Resolves the caller from its bearer credential.
///
/// Claims are decoded structurally; the provider signed the credential and
/// the resource API trusts its own provider configuration for that. The
/// caller must already be a provisioned platform user.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(PlatformUser, Claims), ApiError> {
    let credential = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized {
            reason: "missing bearer credential".to_string(),
        })?;

    let claims = Claims::decode(credential).map_err(|e| ApiError::Unauthorized {
        reason: e.to_string(),
    })?;

    let user = state
        .directory
        .find_by_subject(&claims.subject)
        .await?
        .ok_or(ApiError::NoMembership)?;
    Ok((user, claims))
}

#[derive(Debug, Deserialize)]
struct CallbackRequest {
    code: String,
    /// Defaults to the provider's registered redirect URI.
    redirect_uri: Option<String>,
    /// The round-tripped state; may embed an invitation token.
    state: Option<String>,
    /// Explicit invitation token, preferred over the state-embedded one.
    invitation_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CallbackUser {
    id: String,
    subject: String,
    email: Option<String>,
    name: Option<String>,
    roles: Vec<String>,
    tenant: Option<String>,
    invitation_accepted: bool,
}

#[derive(Debug, Serialize)]
struct CallbackResponse {
    access_token: String,
    refresh_token: String,
    token_type: &'static str,
    expires_in: Option<u64>,
    user: CallbackUser,
}

/// Federated login callback. Exchanges the single-use authorization code
/// server-side, then applies the invitation accept transition when a token
/// is present, falls back to a pending invitation addressed to the
/// credential's email, and finally to an existing membership.
async fn sso_callback(
    State(state): State<AppState>,
    Json(body): Json<CallbackRequest>,
) -> Result<Json<CallbackResponse>, ApiError> {
    let redirect_uri = body
        .redirect_uri
        .unwrap_or_else(|| state.exchange.config().redirect_uri.clone());

    let pair = state
        .exchange
        .code_grant(&body.code, &redirect_uri)
        .await
        .map_err(|e| match e {
            ExchangeError::InvalidGrant { description } => ApiError::CodeRejected { description },
            other => ApiError::Upstream {
                details: other.to_string(),
            },
        })?;

    let claims = Claims::decode(&pair.access_credential).map_err(|e| ApiError::Upstream {
        details: format!("provider issued an undecodable credential: {e}"),
    })?;
    let identity = FederatedIdentity {
        subject: claims.subject.clone(),
        email: claims.email.clone(),
        display_name: claims.display_name.clone(),
    };

    let invitation_token = body.invitation_token.or_else(|| {
        let raw = body.state.as_deref()?;
        match decode_state(raw) {
            Ok(decoded) => Some(decoded.invitation_token),
            Err(e) => {
                tracing::debug!(error = %e, "callback state carried no usable invitation token");
                None
            }
        }
    });

    let (user, tenant, invitation_accepted) = if let Some(token) = invitation_token {
        let accepted = state.invitations.accept(&token, &identity).await?;
        (accepted.user, Some(accepted.invitation.tenant_slug), true)
    } else if let Some(email) = &claims.email {
        match state.invitations.accept_for_email(email, &identity).await {
            Ok(accepted) => (accepted.user, Some(accepted.invitation.tenant_slug), true),
            Err(InvitationError::NotFound) => existing_membership(&state, &claims).await?,
            Err(e) => return Err(e.into()),
        }
    } else {
        existing_membership(&state, &claims).await?
    };

    tracing::info!(
        user = %user.id,
        tenant = tenant.as_deref().unwrap_or("-"),
        invitation_accepted,
        "federated login completed"
    );

    Ok(Json(CallbackResponse {
        access_token: pair.access_credential,
        refresh_token: pair.refresh_credential,
        token_type: "bearer",
        expires_in: pair.expires_in,
        user: CallbackUser {
            id: user.id.to_string(),
            subject: claims.subject,
            email: claims.email,
            name: claims.display_name,
            roles: claims.roles,
            tenant,
            invitation_accepted,
        },
    }))
}

async fn existing_membership(
    state: &AppState,
    claims: &Claims,
) -> Result<(PlatformUser, Option<String>, bool), ApiError> {
    let user = state
        .directory
        .find_by_subject(&claims.subject)
        .await?
        .ok_or(ApiError::NoMembership)?;
    // Tenant always comes from the credential, not the stored record.
    Ok((user, claims.tenant_slug.clone(), false))
}

#[derive(Debug, Serialize)]
struct PreviewResponse {
    email: String,
    tenant_slug: String,
    status: InvitationStatus,
    expires_at: DateTime<Utc>,
    roles: Vec<String>,
    invited_by_name: Option<String>,
}

/// Public invitation preview by token. Serves pending and lapsed records;
/// consumed and cancelled ones answer 410 so stale links read as spent,
/// not unknown.
async fn lookup_invitation(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let invitation = state.invitations.lookup(&token).await?;
    let status = invitation.effective_status(Utc::now());
    if matches!(
        status,
        InvitationStatus::Accepted | InvitationStatus::Cancelled
    ) {
        return Err(InvitationError::AlreadyConsumed.into());
    }

    let invited_by_name = state
        .directory
        .find_by_id(invitation.invited_by)
        .await?
        .and_then(|u| u.display_name);

    Ok(Json(PreviewResponse {
        email: invitation.email,
        tenant_slug: invitation.tenant_slug,
        status,
        expires_at: invitation.expires_at,
        roles: invitation.roles,
        invited_by_name,
    }))
}

#[derive(Debug, Deserialize)]
struct CreateInvitationRequest {
    email: String,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Serialize)]
struct InvitationView {
    id: String,
    email: String,
    tenant_slug: String,
    status: InvitationStatus,
    token: Option<String>,
    invited_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    accepted_at: Option<DateTime<Utc>>,
    roles: Vec<String>,
}

impl InvitationView {
    fn from_invitation(invitation: Invitation, now: DateTime<Utc>) -> Self {
        let status = invitation.effective_status(now);
        Self {
            id: invitation.id.to_string(),
            email: invitation.email,
            tenant_slug: invitation.tenant_slug,
            status,
            token: invitation.token,
            invited_at: invitation.invited_at,
            expires_at: invitation.expires_at,
            accepted_at: invitation.accepted_at,
            roles: invitation.roles,
        }
    }
}

/// Issues an invitation into the caller's tenant.
async fn create_invitation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateInvitationRequest>,
) -> Result<(StatusCode, Json<InvitationView>), ApiError> {
    let (user, claims) = authenticate(&state, &headers).await?;
    let tenant_slug = claims.tenant_slug.ok_or(ApiError::NoMembership)?;

    let invitation = state
        .invitations
        .create(NewInvitation {
            email: body.email,
            tenant_id: user.tenant_id,
            tenant_slug,
            roles: body.roles,
            invited_by: user.id,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(InvitationView::from_invitation(invitation, Utc::now())),
    ))
}

/// Lists the caller's tenant's invitations with effective statuses.
async fn list_invitations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<InvitationView>>, ApiError> {
    let (user, _) = authenticate(&state, &headers).await?;
    let now = Utc::now();
    let invitations = state.invitations.list(user.tenant_id).await?;
    Ok(Json(
        invitations
            .into_iter()
            .map(|i| InvitationView::from_invitation(i, now))
            .collect(),
    ))
}

/// Finds an invitation by id, scoped to the caller's tenant. A foreign
/// tenant's invitation answers 404, not 403, to avoid confirming it exists.
async fn tenant_scoped(
    state: &AppState,
    user: &PlatformUser,
    raw_id: &str,
) -> Result<Invitation, ApiError> {
    let id = InvitationId::from_str(raw_id).map_err(|_| InvitationError::NotFound)?;
    let invitation = state.invitations.get(id).await?;
    if invitation.tenant_id != user.tenant_id {
        return Err(InvitationError::NotFound.into());
    }
    Ok(invitation)
}

/// Rotates a pending invitation's token and window.
async fn resend_invitation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<InvitationView>, ApiError> {
    let (user, _) = authenticate(&state, &headers).await?;
    let invitation = tenant_scoped(&state, &user, &id).await?;
    let resent = state.invitations.resend(invitation.id).await?;
    Ok(Json(InvitationView::from_invitation(resent, Utc::now())))
}

/// Cancels a pending invitation. Terminal.
async fn cancel_invitation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<InvitationView>, ApiError> {
    let (user, _) = authenticate(&state, &headers).await?;
    let invitation = tenant_scoped(&state, &user, &id).await?;
    let cancelled = state.invitations.cancel(invitation.id).await?;
    Ok(Json(InvitationView::from_invitation(cancelled, Utc::now())))
}
