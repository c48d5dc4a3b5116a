//! Authenticated request gateway with bounded silent renewal.
//!
//! Every platform API call goes through [`ApiGateway::send`], which attaches
//! the session's bearer credential and tenant header, and on a 401 runs the
//! renew-once-retry-once protocol: one refresh grant, one retry, then the
//! session is torn down. Renewal is single-flight; concurrent 401s agree on
//! one refresh via the store's generation counter.

use crate::error::GatewayError;
use crate::exchange::TokenExchangeClient;
use crate::session::Session;
use crate::store::SessionStore;
use reqwest::header::AUTHORIZATION;
use std::sync::Arc;
use tokio::sync::Mutex;
use url::Url;

const TENANT_HEADER: &str = "X-Tenant-ID";

/// A request to the platform API, relative to the gateway's base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: reqwest::Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<serde_json::Value>,
}

impl ApiRequest {
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: reqwest::Method::GET,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: reqwest::Method::POST,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: reqwest::Method::DELETE,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Appends a query parameter.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Gateway through which all authenticated platform API calls flow.
pub struct ApiGateway {
    http: reqwest::Client,
    base_url: Url,
    store: Arc<SessionStore>,
    exchange: TokenExchangeClient,
    renewal: Mutex<()>,
}

impl ApiGateway {
    #[must_use]
    pub fn new(base_url: Url, store: Arc<SessionStore>, exchange: TokenExchangeClient) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            store,
            exchange,
            renewal: Mutex::new(()),
        }
    }

    /// Returns the session store this gateway dispatches from.
    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Sends an authenticated request, renewing the session at most once.
    ///
    /// Non-401 responses, including other error statuses, are returned to
    /// the caller untouched.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Unauthenticated`] when no session exists
    /// - [`GatewayError::SessionExpired`] when renewal is exhausted; the
    ///   session has been cleared
    /// - [`GatewayError::Network`] when the API is unreachable
    pub async fn send(&self, request: &ApiRequest) -> Result<reqwest::Response, GatewayError> {
        let Some((session, generation)) = self.store.snapshot().await else {
            return Err(GatewayError::Unauthenticated);
        };

        let response = self.dispatch(&session, request).await?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        self.renew(generation).await?;

        let Some((session, _)) = self.store.snapshot().await else {
            return Err(GatewayError::SessionExpired);
        };
        let response = self.dispatch(&session, request).await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            // Renewed credential was still rejected. Do not loop.
            self.store.clear().await;
            return Err(GatewayError::SessionExpired);
        }
        Ok(response)
    }

    async fn dispatch(
        &self,
        session: &Session,
        request: &ApiRequest,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = self
            .base_url
            .join(&request.path)
            .map_err(|e| GatewayError::Network {
                reason: format!("invalid request path {:?}: {e}", request.path),
            })?;

        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .header(
                AUTHORIZATION,
                format!("Bearer {}", session.access_credential()),
            )
            .query(&request.query);
        if let Some(tenant) = session.tenant_binding() {
            builder = builder.header(TENANT_HEADER, tenant);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        builder.send().await.map_err(|e| GatewayError::Network {
            reason: e.to_string(),
        })
    }

    /// Renews the session, deduplicating concurrent attempts.
    ///
    /// The caller passes the generation it dispatched with. Under the
    /// renewal lock, a generation that has since moved means another caller
    /// already renewed (or tore down) the session; this caller just
    /// observes the outcome instead of spending the refresh credential
    /// again.
    async fn renew(&self, seen_generation: u64) -> Result<(), GatewayError> {
        let _guard = self.renewal.lock().await;

        if self.store.generation().await != seen_generation {
            return if self.store.get().await.is_some() {
                Ok(())
            } else {
                Err(GatewayError::SessionExpired)
            };
        }

        let Some(session) = self.store.get().await else {
            return Err(GatewayError::SessionExpired);
        };

        match self.exchange.refresh_grant(session.refresh_credential()).await {
            Ok(pair) => {
                if let Err(e) = self
                    .store
                    .set(pair.access_credential, pair.refresh_credential)
                    .await
                {
                    tracing::warn!(error = %e, "renewed credential could not be stored");
                    self.store.clear().await;
                    return Err(GatewayError::SessionExpired);
                }
                Ok(())
            }
            Err(e) => {
                tracing::debug!(error = %e, "silent renewal failed, tearing down session");
                self.store.clear().await;
                Err(GatewayError::SessionExpired)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::tests::fabricate_credential;
    use crate::exchange::ProviderConfig;
    use axum::Router;
    use axum::extract::State;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn credential(nonce: usize) -> String {
        fabricate_credential(serde_json::json!({
            "sub": "kc-1",
            "tenant": "acme",
            "nonce": nonce,
        }))
    }

    #[derive(Clone)]
    struct Stub {
        valid_credential: Arc<std::sync::Mutex<String>>,
        api_calls: Arc<AtomicUsize>,
        refreshes: Arc<AtomicUsize>,
        fail_refresh: Arc<AtomicBool>,
        rotate_on_refresh: Arc<AtomicBool>,
    }

    async fn stub_api(
        State(stub): State<Stub>,
        headers: axum::http::HeaderMap,
    ) -> axum::response::Response {
        stub.api_calls.fetch_add(1, Ordering::SeqCst);
        let expected = format!(
            "Bearer {}",
            stub.valid_credential.lock().expect("lock").clone()
        );
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == expected);
        if !authorized {
            return axum::http::StatusCode::UNAUTHORIZED.into_response();
        }
        let tenant = headers
            .get("x-tenant-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        axum::Json(serde_json::json!({"tenant": tenant})).into_response()
    }

    async fn stub_token(
        State(stub): State<Stub>,
        axum::Form(form): axum::Form<HashMap<String, String>>,
    ) -> axum::response::Response {
        assert_eq!(
            form.get("grant_type").map(String::as_str),
            Some("refresh_token")
        );
        let n = stub.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        if stub.fail_refresh.load(Ordering::SeqCst) {
            return (
                axum::http::StatusCode::BAD_REQUEST,
                axum::Json(serde_json::json!({
                    "error": "invalid_grant",
                    "error_description": "Session not active",
                })),
            )
                .into_response();
        }
        let fresh = credential(n);
        if stub.rotate_on_refresh.load(Ordering::SeqCst) {
            *stub.valid_credential.lock().expect("lock") = fresh.clone();
        }
        axum::Json(serde_json::json!({
            "access_token": fresh,
            "refresh_token": format!("rt-{n}"),
            "expires_in": 300,
        }))
        .into_response()
    }

    async fn spawn_stub(stub: Stub) -> String {
        let app = Router::new()
            .route("/api/things", get(stub_api))
            .route(
                "/realms/agentic/protocol/openid-connect/token",
                post(stub_token),
            )
            .with_state(stub);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn new_stub(valid: String) -> Stub {
        Stub {
            valid_credential: Arc::new(std::sync::Mutex::new(valid)),
            api_calls: Arc::new(AtomicUsize::new(0)),
            refreshes: Arc::new(AtomicUsize::new(0)),
            fail_refresh: Arc::new(AtomicBool::new(false)),
            rotate_on_refresh: Arc::new(AtomicBool::new(true)),
        }
    }

    async fn gateway_against(base_url: &str, store: Arc<SessionStore>) -> ApiGateway {
        let config = ProviderConfig::new(
            base_url.to_string(),
            "agentic".to_string(),
            "platform-client".to_string(),
            "secret".to_string(),
            "http://localhost/callback".to_string(),
        );
        let exchange = TokenExchangeClient::new(config).expect("client");
        ApiGateway::new(Url::parse(base_url).expect("url"), store, exchange)
    }

    #[tokio::test]
    async fn without_session_is_unauthenticated() {
        let stub = new_stub(credential(0));
        let base_url = spawn_stub(stub).await;
        let gateway = gateway_against(&base_url, Arc::new(SessionStore::new())).await;

        let err = gateway
            .send(&ApiRequest::get("/api/things"))
            .await
            .expect_err("unauthenticated");
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[tokio::test]
    async fn valid_session_attaches_tenant_header() {
        let valid = credential(0);
        let stub = new_stub(valid.clone());
        let base_url = spawn_stub(stub.clone()).await;

        let store = Arc::new(SessionStore::new());
        store.set(valid, "rt-0".to_string()).await.expect("set");
        let gateway = gateway_against(&base_url, store).await;

        let response = gateway
            .send(&ApiRequest::get("/api/things"))
            .await
            .expect("response");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = response.json().await.expect("json");
        assert_eq!(body["tenant"], "acme");
        assert_eq!(stub.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_credential_renews_once_and_retries_once() {
        // The store holds a credential the API no longer accepts.
        let stub = new_stub(credential(999));
        let base_url = spawn_stub(stub.clone()).await;

        let store = Arc::new(SessionStore::new());
        store
            .set(credential(0), "rt-0".to_string())
            .await
            .expect("set");
        let gateway = gateway_against(&base_url, store.clone()).await;

        let response = gateway
            .send(&ApiRequest::get("/api/things"))
            .await
            .expect("response");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(stub.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(stub.api_calls.load(Ordering::SeqCst), 2);

        // The renewed pair replaced the stale one.
        let session = store.get().await.expect("session");
        assert_eq!(session.refresh_credential(), "rt-1");
    }

    #[tokio::test]
    async fn concurrent_expiries_agree_on_one_renewal() {
        let stub = new_stub(credential(999));
        let base_url = spawn_stub(stub.clone()).await;

        let store = Arc::new(SessionStore::new());
        store
            .set(credential(0), "rt-0".to_string())
            .await
            .expect("set");
        let gateway = Arc::new(gateway_against(&base_url, store).await);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gateway = gateway.clone();
            handles.push(tokio::spawn(async move {
                gateway.send(&ApiRequest::get("/api/things")).await
            }));
        }
        for handle in handles {
            let response = handle.await.expect("join").expect("response");
            assert_eq!(response.status(), reqwest::StatusCode::OK);
        }
        assert_eq!(stub.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_refresh_credential_tears_down_session() {
        let stub = new_stub(credential(999));
        stub.fail_refresh.store(true, Ordering::SeqCst);
        let base_url = spawn_stub(stub.clone()).await;

        let store = Arc::new(SessionStore::new());
        store
            .set(credential(0), "rt-0".to_string())
            .await
            .expect("set");
        let gateway = gateway_against(&base_url, store.clone()).await;

        let err = gateway
            .send(&ApiRequest::get("/api/things"))
            .await
            .expect_err("expired");
        assert!(matches!(err, GatewayError::SessionExpired));
        assert!(store.get().await.is_none());
    }

    #[tokio::test]
    async fn rejected_renewed_credential_does_not_loop() {
        // Refresh succeeds but the API keeps rejecting; the gateway must
        // stop after one renewal and one retry.
        let stub = new_stub(credential(999));
        stub.rotate_on_refresh.store(false, Ordering::SeqCst);
        let base_url = spawn_stub(stub.clone()).await;

        let store = Arc::new(SessionStore::new());
        store
            .set(credential(0), "rt-0".to_string())
            .await
            .expect("set");
        let gateway = gateway_against(&base_url, store.clone()).await;

        let err = gateway
            .send(&ApiRequest::get("/api/things"))
            .await
            .expect_err("expired");
        assert!(matches!(err, GatewayError::SessionExpired));
        assert_eq!(stub.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(stub.api_calls.load(Ordering::SeqCst), 2);
        assert!(store.get().await.is_none());
    }
}
