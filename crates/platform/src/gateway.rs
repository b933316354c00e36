//! Sidecar gateway connector
//!
//! The protocol sessions run inside a local gateway daemon; this module talks
//! to it over HTTP JSON. One gateway session maps to one platform session:
//!
//! - `POST   /v1/sessions`                          open (credential + proxy)
//! - `GET    /v1/sessions/{id}/authorized`          authorization check
//! - `GET    /v1/sessions/{id}/me`                  live identity
//! - `GET    /v1/sessions/{id}/messages?wait=N`     long-poll inbound messages
//! - `POST   /v1/sessions/{id}/reset-authorizations`
//! - `DELETE /v1/sessions/{id}`
//!
//! Failures come back as `{"error": "<code>", "seconds": n, "message": "..."}`
//! and are mapped onto [`Error`] by [`classify_error`].

use std::collections::VecDeque;
use std::time::Duration;

use account_store::{Credential, DeviceFingerprint};
use common::{ProxyEndpoint, Secret};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::{BoxFuture, Connector, InboundMessage, SelfIdentity, Session};

/// How long one message long-poll is held open by the gateway.
const DEFAULT_POLL_WAIT: Duration = Duration::from_secs(25);

/// Slack on top of the poll window before the HTTP request itself times out.
const POLL_GRACE: Duration = Duration::from_secs(10);

/// Connector backed by the local gateway daemon.
#[derive(Clone)]
pub struct GatewayConnector {
    client: reqwest::Client,
    base_url: String,
    token: Option<Secret<String>>,
    poll_wait: Duration,
}

impl GatewayConnector {
    /// `client` should carry the gateway request timeout; long-polls override it.
    pub fn new(client: reqwest::Client, base_url: &str, token: Option<Secret<String>>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            poll_wait: DEFAULT_POLL_WAIT,
        }
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    async fn open(
        &self,
        credential: &Credential,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<Box<dyn Session>> {
        let session_ref = credential
            .session_ref
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Protocol(format!("credential {} has no session", credential.id)))?;

        let body = OpenSessionBody {
            credential_id: credential.id,
            session_ref,
            api_id: credential.api_id,
            api_hash: credential.api_hash.as_ref().map(|h| h.expose().as_str()),
            device: &credential.device,
            proxy: proxy.map(ProxyBody::from),
        };

        let request = authorize(
            self.client.post(format!("{}/v1/sessions", self.base_url)),
            &self.token,
        )
        .json(&body);
        let opened: OpenSessionResponse = send_json(request).await?;

        debug!(
            credential_id = credential.id,
            session_id = %opened.session_id,
            proxy = proxy.map(|p| p.masked()).unwrap_or_else(|| "direct".into()),
            "gateway session opened"
        );

        Ok(Box::new(GatewaySession {
            client: self.client.clone(),
            session_url: format!("{}/v1/sessions/{}", self.base_url, opened.session_id),
            token: self.token.clone(),
            poll_wait: self.poll_wait,
            buffered: VecDeque::new(),
            closed: false,
        }))
    }
}

impl Connector for GatewayConnector {
    fn connect<'a>(
        &'a self,
        credential: &'a Credential,
        proxy: Option<&'a ProxyEndpoint>,
    ) -> BoxFuture<'a, Result<Box<dyn Session>>> {
        Box::pin(self.open(credential, proxy))
    }
}

struct GatewaySession {
    client: reqwest::Client,
    session_url: String,
    token: Option<Secret<String>>,
    poll_wait: Duration,
    buffered: VecDeque<InboundMessage>,
    closed: bool,
}

impl GatewaySession {
    async fn authorized(&self) -> Result<bool> {
        let request = authorize(
            self.client.get(format!("{}/authorized", self.session_url)),
            &self.token,
        );
        let body: AuthorizedResponse = send_json(request).await?;
        Ok(body.authorized)
    }

    async fn me(&self) -> Result<SelfIdentity> {
        let request = authorize(
            self.client.get(format!("{}/me", self.session_url)),
            &self.token,
        );
        send_json(request).await
    }

    async fn next(&mut self) -> Result<Option<InboundMessage>> {
        loop {
            if let Some(message) = self.buffered.pop_front() {
                return Ok(Some(message));
            }
            if self.closed {
                return Ok(None);
            }
            let request = authorize(
                self.client.get(format!(
                    "{}/messages?wait={}",
                    self.session_url,
                    self.poll_wait.as_secs()
                )),
                &self.token,
            )
            .timeout(self.poll_wait + POLL_GRACE);
            let batch: MessageBatch = send_json(request).await?;
            self.closed = batch.closed;
            self.buffered.extend(batch.messages);
        }
    }

    async fn reset_authorizations(&self) -> Result<()> {
        let request = authorize(
            self.client
                .post(format!("{}/reset-authorizations", self.session_url)),
            &self.token,
        );
        let _: serde_json::Value = send_json(request).await?;
        Ok(())
    }

    async fn close(&self) {
        let request = authorize(self.client.delete(&self.session_url), &self.token);
        match request.send().await {
            Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 404 => {
                debug!(session = %self.session_url, "gateway session closed");
            }
            Ok(resp) => {
                warn!(session = %self.session_url, status = resp.status().as_u16(), "gateway refused session close");
            }
            Err(e) => {
                warn!(session = %self.session_url, error = %e, "gateway session close failed");
            }
        }
    }
}

impl Session for GatewaySession {
    fn is_authorized(&mut self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(self.authorized())
    }

    fn self_identity(&mut self) -> BoxFuture<'_, Result<SelfIdentity>> {
        Box::pin(self.me())
    }

    fn next_message(&mut self) -> BoxFuture<'_, Result<Option<InboundMessage>>> {
        Box::pin(self.next())
    }

    fn reset_other_sessions(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.reset_authorizations())
    }

    fn disconnect(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.close())
    }
}

#[derive(Serialize)]
struct OpenSessionBody<'a> {
    credential_id: u64,
    session_ref: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_hash: Option<&'a str>,
    device: &'a DeviceFingerprint,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<ProxyBody<'a>>,
}

#[derive(Serialize)]
struct ProxyBody<'a> {
    kind: &'static str,
    host: &'a str,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
}

impl<'a> From<&'a ProxyEndpoint> for ProxyBody<'a> {
    fn from(p: &'a ProxyEndpoint) -> Self {
        Self {
            kind: p.kind.label(),
            host: &p.host,
            port: p.port,
            username: p.username.as_deref(),
            password: p.password.as_ref().map(|s| s.expose().as_str()),
        }
    }
}

#[derive(Deserialize)]
struct OpenSessionResponse {
    session_id: String,
}

#[derive(Deserialize)]
struct AuthorizedResponse {
    authorized: bool,
}

#[derive(Deserialize)]
struct MessageBatch {
    #[serde(default)]
    messages: Vec<InboundMessage>,
    #[serde(default)]
    closed: bool,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    seconds: Option<u64>,
    #[serde(default)]
    message: Option<String>,
}

fn authorize(
    request: reqwest::RequestBuilder,
    token: &Option<Secret<String>>,
) -> reqwest::RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token.expose()),
        None => request,
    }
}

async fn send_json<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| Error::Protocol(format!("decoding gateway response: {e}")));
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_error(status.as_u16(), &body))
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        Error::Network(e.to_string())
    } else {
        Error::Protocol(e.to_string())
    }
}

/// Classify a gateway error response by status and body.
///
/// Known error codes map onto their variants. Bodies without a code fall back
/// to the status: gateway-side timeouts and 5xx are network-class, 401 means
/// the session key was rejected, anything else is a protocol error.
pub fn classify_error(status: u16, body: &str) -> Error {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        let code = parsed.error.to_ascii_lowercase();
        return match code.as_str() {
            "auth_key_unregistered" | "auth_key_invalid" | "session_revoked" | "unauthorized" => {
                Error::AuthKeyUnregistered
            }
            "session_password_needed" | "two_factor_required" => Error::TwoFactorRequired,
            "user_deactivated" | "user_deactivated_ban" | "phone_number_banned" => {
                Error::Deactivated
            }
            "flood_wait" => Error::FloodWait {
                seconds: parsed.seconds.unwrap_or_default(),
            },
            "network" | "timeout" | "proxy_error" | "connection_failed" => {
                Error::Network(parsed.message.unwrap_or(code))
            }
            _ => Error::Rpc(match parsed.message {
                Some(message) => format!("{code}: {message}"),
                None => code,
            }),
        };
    }

    match status {
        401 => Error::AuthKeyUnregistered,
        408 | 502 | 503 | 504 => Error::Network(format!("gateway returned {status}")),
        _ => Error::Protocol(format!("unexpected gateway status {status}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::Json;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use common::ProxyKind;
    use tokio::net::TcpListener;

    #[test]
    fn classify_known_codes() {
        assert_eq!(
            classify_error(401, r#"{"error":"AUTH_KEY_UNREGISTERED"}"#),
            Error::AuthKeyUnregistered
        );
        assert_eq!(
            classify_error(403, r#"{"error":"session_password_needed"}"#),
            Error::TwoFactorRequired
        );
        assert_eq!(
            classify_error(403, r#"{"error":"user_deactivated_ban"}"#),
            Error::Deactivated
        );
        assert_eq!(
            classify_error(429, r#"{"error":"flood_wait","seconds":42}"#),
            Error::FloodWait { seconds: 42 }
        );
        assert!(classify_error(502, r#"{"error":"proxy_error","message":"socks refused"}"#).is_network());
    }

    #[test]
    fn classify_unknown_code_is_rpc_with_message() {
        let err = classify_error(400, r#"{"error":"peer_id_invalid","message":"bad peer"}"#);
        assert_eq!(err, Error::Rpc("peer_id_invalid: bad peer".into()));
    }

    #[test]
    fn classify_falls_back_to_status() {
        assert!(classify_error(503, "upstream unavailable").is_network());
        assert!(classify_error(504, "").is_network());
        assert_eq!(classify_error(401, "nope"), Error::AuthKeyUnregistered);
        assert!(matches!(classify_error(418, ""), Error::Protocol(_)));
    }

    #[derive(Default)]
    struct MockGateway {
        opened: Mutex<Vec<serde_json::Value>>,
        polls: Mutex<u32>,
        closed: Mutex<Vec<String>>,
    }

    async fn start_mock_gateway() -> (String, Arc<MockGateway>) {
        let state = Arc::new(MockGateway::default());

        async fn open(
            State(state): State<Arc<MockGateway>>,
            Json(body): Json<serde_json::Value>,
        ) -> (StatusCode, Json<serde_json::Value>) {
            if body["session_ref"] == "revoked" {
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(serde_json::json!({"error": "auth_key_unregistered"})),
                );
            }
            state.opened.lock().unwrap().push(body);
            (StatusCode::OK, Json(serde_json::json!({"session_id": "s1"})))
        }

        async fn messages(State(state): State<Arc<MockGateway>>) -> Json<serde_json::Value> {
            let mut polls = state.polls.lock().unwrap();
            *polls += 1;
            match *polls {
                1 => Json(serde_json::json!({
                    "messages": [
                        {"sender_id": 777000, "text": "Login code: 12345", "timestamp": "2025-01-01T00:00:00Z"},
                        {"sender_id": 777000, "text": "again 12345", "timestamp": "2025-01-01T00:00:01Z"}
                    ]
                })),
                _ => Json(serde_json::json!({"messages": [], "closed": true})),
            }
        }

        async fn close(
            State(state): State<Arc<MockGateway>>,
            Path(id): Path<String>,
        ) -> StatusCode {
            state.closed.lock().unwrap().push(id);
            StatusCode::NO_CONTENT
        }

        let app = axum::Router::new()
            .route("/v1/sessions", post(open))
            .route(
                "/v1/sessions/{id}/authorized",
                get(|| async { Json(serde_json::json!({"authorized": true})) }),
            )
            .route(
                "/v1/sessions/{id}/me",
                get(|| async {
                    Json(serde_json::json!({
                        "user_id": 555,
                        "phone": "79990001122",
                        "display_name": "ivan",
                        "is_premium": true
                    }))
                }),
            )
            .route("/v1/sessions/{id}/messages", get(messages))
            .route(
                "/v1/sessions/{id}/reset-authorizations",
                post(|| async { Json(serde_json::json!({"ok": true})) }),
            )
            .route("/v1/sessions/{id}", axum::routing::delete(close))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), state)
    }

    #[tokio::test]
    async fn session_round_trip_through_gateway() {
        let (url, state) = start_mock_gateway().await;
        let connector = GatewayConnector::new(reqwest::Client::new(), &url, None);

        let mut credential = Credential::new(1, "sessions/1.session");
        credential.api_id = Some(2040);
        let proxy = ProxyEndpoint::new(ProxyKind::Socks5, "10.0.0.1", 1080).with_auth("u", "p");

        let mut session = connector.connect(&credential, Some(&proxy)).await.unwrap();
        assert!(session.is_authorized().await.unwrap());

        let me = session.self_identity().await.unwrap();
        assert_eq!(me.user_id, 555);
        assert_eq!(me.display_name.as_deref(), Some("ivan"));
        assert!(me.is_premium);

        let first = session.next_message().await.unwrap().unwrap();
        assert_eq!(first.text, "Login code: 12345");
        let second = session.next_message().await.unwrap().unwrap();
        assert_eq!(second.text, "again 12345");
        assert!(session.next_message().await.unwrap().is_none());

        session.reset_other_sessions().await.unwrap();
        session.disconnect().await;

        let opened = state.opened.lock().unwrap();
        assert_eq!(opened[0]["proxy"]["kind"], "socks5");
        assert_eq!(opened[0]["proxy"]["password"], "p");
        assert_eq!(opened[0]["device"]["device_model"], "Samsung SM-S918B");
        assert_eq!(*state.closed.lock().unwrap(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn open_maps_gateway_error_codes() {
        let (url, _state) = start_mock_gateway().await;
        let connector = GatewayConnector::new(reqwest::Client::new(), &url, None);

        let credential = Credential::new(2, "revoked");
        let err = connector.connect(&credential, None).await.err().unwrap();
        assert_eq!(err, Error::AuthKeyUnregistered);
    }

    #[tokio::test]
    async fn unreachable_gateway_is_network_error() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector =
            GatewayConnector::new(reqwest::Client::new(), &format!("http://{addr}"), None);
        let credential = Credential::new(3, "sessions/3.session");
        let err = connector.connect(&credential, None).await.err().unwrap();
        assert!(err.is_network(), "got {err:?}");
    }

    #[tokio::test]
    async fn credential_without_session_is_rejected_locally() {
        let connector = GatewayConnector::new(reqwest::Client::new(), "http://127.0.0.1:9", None);
        let mut credential = Credential::new(4, "");
        credential.session_ref = None;
        let err = connector.connect(&credential, None).await.err().unwrap();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
