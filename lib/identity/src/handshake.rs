//! Client side of the invitation handshake.
//!
//! The controller walks one invitation link through the interactive flow:
//! load the preview, send the user to the provider with the invitation
//! token folded into the redirect state, then complete the exchange and
//! verify the resulting session landed in the invited tenant.

use crate::error::HandshakeError;
use crate::exchange::ProviderConfig;
use crate::store::SessionStore;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

const STATE_VERSION: u32 = 1;

/// The state parameter round-tripped through the provider redirect.
///
/// Versioned so a future shape change invalidates stale in-flight
/// handshakes instead of misreading them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectState {
    pub v: u32,
    pub invitation_token: String,
}

/// Encodes a redirect state for the given invitation token.
#[must_use]
pub fn encode_state(invitation_token: &str) -> String {
    let state = RedirectState {
        v: STATE_VERSION,
        invitation_token: invitation_token.to_string(),
    };
    // Serializing this shape cannot fail.
    let json = serde_json::to_vec(&state).unwrap_or_default();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
}

/// Decodes a redirect state parameter.
///
/// # Errors
///
/// Returns [`HandshakeError::InvalidState`] when the parameter is not
/// base64url, not the expected JSON shape, or carries a different version.
pub fn decode_state(raw: &str) -> Result<RedirectState, HandshakeError> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(raw)
        .map_err(|e| HandshakeError::InvalidState {
            reason: format!("not base64url: {e}"),
        })?;
    let state: RedirectState =
        serde_json::from_slice(&bytes).map_err(|e| HandshakeError::InvalidState {
            reason: format!("unexpected shape: {e}"),
        })?;
    if state.v != STATE_VERSION {
        return Err(HandshakeError::InvalidState {
            reason: format!("unsupported state version {}", state.v),
        });
    }
    Ok(state)
}

/// Preview of an invitation, as served by the lookup endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitationPreview {
    pub email: String,
    pub tenant_slug: String,
    /// Effective status at lookup time; an overdue pending invitation
    /// reads as `expired` here.
    pub status: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub invited_by_name: Option<String>,
}

/// Where the handshake currently stands.
#[derive(Debug, Clone)]
pub enum HandshakePhase {
    /// Nothing loaded yet.
    Loading,
    /// Invitation loaded and still acceptable.
    Ready { invitation: InvitationPreview },
    /// Invitation does not exist or was already consumed or cancelled.
    Invalid,
    /// Invitation exists but its window has passed.
    Expired,
    /// User has been handed the authorization URL and is at the provider.
    Redirecting { authorize_url: Url },
    /// Authorization code received, exchange in flight.
    Exchanging,
    /// Session established in the invited tenant.
    Done,
    /// Handshake failed; the message is safe to show the user.
    Failed { message: String },
}

#[derive(Serialize)]
struct CallbackRequest<'a> {
    code: &'a str,
    redirect_uri: &'a str,
    state: &'a str,
}

#[derive(Deserialize)]
struct CallbackResponse {
    access_token: String,
    refresh_token: String,
}

/// Drives one invitation link from preview to an established session.
pub struct HandshakeController {
    http: reqwest::Client,
    api_base: Url,
    provider: ProviderConfig,
    store: Arc<SessionStore>,
    phase: HandshakePhase,
    link_token: Option<String>,
    sent_state: Option<String>,
    invitation: Option<InvitationPreview>,
}

impl HandshakeController {
    #[must_use]
    pub fn new(api_base: Url, provider: ProviderConfig, store: Arc<SessionStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base,
            provider,
            store,
            phase: HandshakePhase::Loading,
            link_token: None,
            sent_state: None,
            invitation: None,
        }
    }

    #[must_use]
    pub fn phase(&self) -> &HandshakePhase {
        &self.phase
    }

    /// Loads the invitation behind a link token and settles into `Ready`,
    /// `Expired` or `Invalid`.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Network`] when the lookup endpoint is
    /// unreachable; the phase moves to `Failed`.
    pub async fn load(&mut self, link_token: &str) -> Result<(), HandshakeError> {
        let url = self
            .api_base
            .join(&format!("/invitations/{link_token}"))
            .map_err(|e| HandshakeError::Network {
                reason: e.to_string(),
            })?;

        let response = match self.http.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                let err = HandshakeError::Network {
                    reason: e.to_string(),
                };
                self.phase = HandshakePhase::Failed {
                    message: "could not reach the invitation service".to_string(),
                };
                return Err(err);
            }
        };

        match response.status() {
            reqwest::StatusCode::OK => match response.json::<InvitationPreview>().await {
                Ok(invitation) if invitation.status == "pending" => {
                    self.link_token = Some(link_token.to_string());
                    self.invitation = Some(invitation.clone());
                    self.phase = HandshakePhase::Ready { invitation };
                    Ok(())
                }
                Ok(invitation) if invitation.status == "expired" => {
                    self.phase = HandshakePhase::Expired;
                    Ok(())
                }
                Ok(_) => {
                    self.phase = HandshakePhase::Invalid;
                    Ok(())
                }
                Err(e) => {
                    self.phase = HandshakePhase::Failed {
                        message: "invitation service answered unexpectedly".to_string(),
                    };
                    Err(HandshakeError::Network {
                        reason: e.to_string(),
                    })
                }
            },
            reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::GONE => {
                self.phase = HandshakePhase::Invalid;
                Ok(())
            }
            status => {
                self.phase = HandshakePhase::Failed {
                    message: "invitation service answered unexpectedly".to_string(),
                };
                Err(HandshakeError::Network {
                    reason: format!("invitation lookup answered {status}"),
                })
            }
        }
    }

    /// Begins the interactive flow from `Ready`, returning the provider
    /// authorization URL to send the user to.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::WrongPhase`] outside `Ready`.
    pub fn begin(&mut self) -> Result<Url, HandshakeError> {
        let HandshakePhase::Ready { .. } = &self.phase else {
            return Err(HandshakeError::WrongPhase { expected: "ready" });
        };
        // Guarded by the phase check above.
        let link_token = self.link_token.as_deref().unwrap_or_default();

        let state = encode_state(link_token);
        let authorize_url =
            self.provider
                .authorize_url(&state)
                .map_err(|e| HandshakeError::Network {
                    reason: e.to_string(),
                })?;

        self.sent_state = Some(state);
        self.phase = HandshakePhase::Redirecting {
            authorize_url: authorize_url.clone(),
        };
        Ok(authorize_url)
    }

    /// Completes the handshake with the code and state the provider
    /// redirected back with.
    ///
    /// The state must byte-match the value sent in [`begin`](Self::begin).
    /// After the exchange, the session's tenant binding is checked against
    /// the invited tenant; a mismatch tears the session down.
    ///
    /// # Errors
    ///
    /// - [`HandshakeError::WrongPhase`] outside `Redirecting`
    /// - [`HandshakeError::StateMismatch`] on a state that does not match
    /// - [`HandshakeError::Network`] when the exchange endpoint fails
    pub async fn complete(
        &mut self,
        code: &str,
        returned_state: &str,
    ) -> Result<(), HandshakeError> {
        let HandshakePhase::Redirecting { .. } = &self.phase else {
            return Err(HandshakeError::WrongPhase {
                expected: "redirecting",
            });
        };
        if self.sent_state.as_deref() != Some(returned_state) {
            self.phase = HandshakePhase::Failed {
                message: "sign-in response did not match this handshake".to_string(),
            };
            return Err(HandshakeError::StateMismatch);
        }

        self.phase = HandshakePhase::Exchanging;

        let url = self
            .api_base
            .join("/auth/sso/callback")
            .map_err(|e| HandshakeError::Network {
                reason: e.to_string(),
            })?;
        let request = CallbackRequest {
            code,
            redirect_uri: &self.provider.redirect_uri,
            state: returned_state,
        };

        let response = self
            .http
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.fail_network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.fail_network(format!("callback exchange answered {status}")));
        }

        let body: CallbackResponse = response
            .json()
            .await
            .map_err(|e| self.fail_network(e.to_string()))?;

        let session = self
            .store
            .set(body.access_token, body.refresh_token)
            .await
            .map_err(|e| self.fail_network(e.to_string()))?;

        if let Some(invitation) = &self.invitation {
            if session.tenant_binding() != Some(invitation.tenant_slug.as_str()) {
                self.store.clear().await;
                let message = "signed-in account does not belong to the invited workspace";
                self.phase = HandshakePhase::Failed {
                    message: message.to_string(),
                };
                return Err(HandshakeError::InvalidState {
                    reason: message.to_string(),
                });
            }
        }

        self.phase = HandshakePhase::Done;
        Ok(())
    }

    fn fail_network(&mut self, reason: String) -> HandshakeError {
        self.phase = HandshakePhase::Failed {
            message: "sign-in could not be completed".to_string(),
        };
        HandshakeError::Network { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::tests::fabricate_credential;
    use axum::Router;
    use axum::extract::{Path, State};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use std::collections::HashMap;

    fn provider() -> ProviderConfig {
        ProviderConfig::new(
            "https://auth.example.com".to_string(),
            "agentic".to_string(),
            "platform-client".to_string(),
            "secret".to_string(),
            "http://localhost/auth/callback".to_string(),
        )
    }

    #[derive(Clone)]
    struct Stub {
        // invitation token -> (status, tenant)
        invitations: Arc<HashMap<String, (String, String)>>,
        // tenant the callback's issued credential is bound to
        issued_tenant: Arc<String>,
    }

    async fn stub_lookup(
        State(stub): State<Stub>,
        Path(token): Path<String>,
    ) -> axum::response::Response {
        match stub.invitations.get(&token) {
            Some((status, _)) if status == "accepted" || status == "cancelled" => {
                axum::http::StatusCode::GONE.into_response()
            }
            Some((status, tenant)) => axum::Json(serde_json::json!({
                "email": "invitee@example.com",
                "tenant_slug": tenant,
                "status": status,
                "expires_at": "2026-09-05T00:00:00Z",
                "roles": ["USER"],
                "invited_by_name": "Admin",
            }))
            .into_response(),
            None => axum::http::StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn stub_callback(State(stub): State<Stub>) -> axum::response::Response {
        let access = fabricate_credential(serde_json::json!({
            "sub": "kc-9",
            "tenant": stub.issued_tenant.as_str(),
        }));
        axum::Json(serde_json::json!({
            "access_token": access,
            "refresh_token": "rt-9",
            "token_type": "bearer",
            "expires_in": 300,
        }))
        .into_response()
    }

    async fn spawn_stub(stub: Stub) -> Url {
        let app = Router::new()
            .route("/invitations/{token}", get(stub_lookup))
            .route("/auth/sso/callback", post(stub_callback))
            .with_state(stub);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        Url::parse(&format!("http://{addr}")).expect("url")
    }

    fn stub_with(entries: &[(&str, &str, &str)], issued_tenant: &str) -> Stub {
        let invitations = entries
            .iter()
            .map(|(token, status, tenant)| {
                ((*token).to_string(), ((*status).to_string(), (*tenant).to_string()))
            })
            .collect();
        Stub {
            invitations: Arc::new(invitations),
            issued_tenant: Arc::new(issued_tenant.to_string()),
        }
    }

    #[test]
    fn state_round_trips() {
        let encoded = encode_state("tok-123");
        let decoded = decode_state(&encoded).expect("decode");
        assert_eq!(decoded.invitation_token, "tok-123");
        assert_eq!(decoded.v, STATE_VERSION);
    }

    #[test]
    fn garbage_state_is_rejected() {
        assert!(matches!(
            decode_state("!!not-base64!!"),
            Err(HandshakeError::InvalidState { .. })
        ));

        let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let wrong_shape = engine.encode(br#"{"something": "else"}"#);
        assert!(matches!(
            decode_state(&wrong_shape),
            Err(HandshakeError::InvalidState { .. })
        ));

        let wrong_version = engine.encode(br#"{"v": 99, "invitation_token": "t"}"#);
        assert!(matches!(
            decode_state(&wrong_version),
            Err(HandshakeError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn pending_invitation_loads_ready() {
        let api_base = spawn_stub(stub_with(&[("tok-1", "pending", "acme")], "acme")).await;
        let mut controller =
            HandshakeController::new(api_base, provider(), Arc::new(SessionStore::new()));

        controller.load("tok-1").await.expect("load");
        match controller.phase() {
            HandshakePhase::Ready { invitation } => {
                assert_eq!(invitation.tenant_slug, "acme");
                assert_eq!(invitation.status, "pending");
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_and_consumed_invitations_settle_terminal() {
        let api_base = spawn_stub(stub_with(
            &[("tok-old", "expired", "acme"), ("tok-used", "accepted", "acme")],
            "acme",
        ))
        .await;
        let store = Arc::new(SessionStore::new());

        let mut controller = HandshakeController::new(api_base.clone(), provider(), store.clone());
        controller.load("tok-old").await.expect("load");
        assert!(matches!(controller.phase(), HandshakePhase::Expired));
        assert!(controller.begin().is_err());

        let mut controller = HandshakeController::new(api_base.clone(), provider(), store.clone());
        controller.load("tok-used").await.expect("load");
        assert!(matches!(controller.phase(), HandshakePhase::Invalid));

        let mut controller = HandshakeController::new(api_base, provider(), store);
        controller.load("tok-missing").await.expect("load");
        assert!(matches!(controller.phase(), HandshakePhase::Invalid));
    }

    #[tokio::test]
    async fn full_handshake_establishes_tenant_session() {
        let api_base = spawn_stub(stub_with(&[("tok-1", "pending", "acme")], "acme")).await;
        let store = Arc::new(SessionStore::new());
        let mut controller = HandshakeController::new(api_base, provider(), store.clone());

        controller.load("tok-1").await.expect("load");
        let authorize_url = controller.begin().expect("begin");

        // The state parameter embeds the invitation token.
        let query: HashMap<_, _> = authorize_url.query_pairs().into_owned().collect();
        let state = query.get("state").expect("state").clone();
        let decoded = decode_state(&state).expect("decode");
        assert_eq!(decoded.invitation_token, "tok-1");

        controller.complete("code-abc", &state).await.expect("complete");
        assert!(matches!(controller.phase(), HandshakePhase::Done));
        let session = store.get().await.expect("session");
        assert_eq!(session.tenant_binding(), Some("acme"));
    }

    #[tokio::test]
    async fn tampered_state_fails_the_handshake() {
        let api_base = spawn_stub(stub_with(&[("tok-1", "pending", "acme")], "acme")).await;
        let store = Arc::new(SessionStore::new());
        let mut controller = HandshakeController::new(api_base, provider(), store.clone());

        controller.load("tok-1").await.expect("load");
        controller.begin().expect("begin");

        let err = controller
            .complete("code-abc", &encode_state("tok-other"))
            .await
            .expect_err("mismatch");
        assert!(matches!(err, HandshakeError::StateMismatch));
        assert!(matches!(controller.phase(), HandshakePhase::Failed { .. }));
        assert!(store.get().await.is_none());
    }

    #[tokio::test]
    async fn wrong_tenant_session_is_torn_down() {
        // Callback issues a credential bound to another tenant.
        let api_base = spawn_stub(stub_with(&[("tok-1", "pending", "acme")], "globex")).await;
        let store = Arc::new(SessionStore::new());
        let mut controller = HandshakeController::new(api_base, provider(), store.clone());

        controller.load("tok-1").await.expect("load");
        let authorize_url = controller.begin().expect("begin");
        let query: HashMap<_, _> = authorize_url.query_pairs().into_owned().collect();
        let state = query.get("state").expect("state").clone();

        let err = controller.complete("code-abc", &state).await.expect_err("mismatch");
        assert!(matches!(err, HandshakeError::InvalidState { .. }));
        assert!(store.get().await.is_none());
        assert!(matches!(controller.phase(), HandshakePhase::Failed { .. }));
    }

    #[tokio::test]
    async fn complete_requires_redirecting_phase() {
        let api_base = spawn_stub(stub_with(&[("tok-1", "pending", "acme")], "acme")).await;
        let mut controller =
            HandshakeController::new(api_base, provider(), Arc::new(SessionStore::new()));

        controller.load("tok-1").await.expect("load");
        let err = controller
            .complete("code", "state")
            .await
            .expect_err("wrong phase");
        assert!(matches!(err, HandshakeError::WrongPhase { .. }));
    }
}
