//! Platform client abstraction
//!
//! Defines the `Connector` / `Session` traits the listener uses to reach the
//! messaging platform. A connector opens one session per credential, routed
//! through an optional proxy; the session then answers authorization and
//! identity queries and yields inbound messages one at a time.
//!
//! `GatewayConnector` implements the traits against a local sidecar daemon
//! that hosts the actual protocol sessions.
//!
//! Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
//! (`Arc<dyn Connector>`, `Box<dyn Session>`).

pub mod error;
pub mod gateway;

pub use account_store::BoxFuture;
pub use error::{Error, Result};
pub use gateway::{GatewayConnector, classify_error};

use account_store::Credential;
use chrono::{DateTime, Utc};
use common::ProxyEndpoint;
use serde::{Deserialize, Serialize};

/// One inbound message delivered to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub sender_id: i64,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Identity of the logged-in account as reported live by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfIdentity {
    pub user_id: i64,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_premium: bool,
}

/// Opens platform sessions for credentials.
pub trait Connector: Send + Sync {
    /// Connect the credential's session, through `proxy` if given.
    ///
    /// Network-class failures come back as [`Error::Network`] so the caller can
    /// rotate proxies and retry.
    fn connect<'a>(
        &'a self,
        credential: &'a Credential,
        proxy: Option<&'a ProxyEndpoint>,
    ) -> BoxFuture<'a, Result<Box<dyn Session>>>;
}

/// A connected platform session. Dropping it without `disconnect` leaks the
/// remote session until the platform times it out.
pub trait Session: Send {
    fn is_authorized(&mut self) -> BoxFuture<'_, Result<bool>>;

    fn self_identity(&mut self) -> BoxFuture<'_, Result<SelfIdentity>>;

    /// Wait for the next inbound message. `Ok(None)` means the stream closed.
    fn next_message(&mut self) -> BoxFuture<'_, Result<Option<InboundMessage>>>;

    /// Terminate every other authorization of this account.
    fn reset_other_sessions(&mut self) -> BoxFuture<'_, Result<()>>;

    fn disconnect(&mut self) -> BoxFuture<'_, ()>;
}
