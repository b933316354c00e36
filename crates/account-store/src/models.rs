//! Persisted record types

use chrono::{DateTime, Utc};
use common::{ProxyEndpoint, Secret};
use serde::{Deserialize, Serialize};

pub type CredentialId = u64;
pub type RequestId = u64;
pub type ProxyId = u64;
/// Platform-side id of the person asking for a credential.
pub type RequesterId = i64;

/// Default number of credentials a proxy may carry (0 means unbounded).
pub const DEFAULT_PROXY_CAPACITY: u32 = 6;

/// Issuance status of a credential.
///
/// Transitions:
/// - Free → Assigned (claim)
/// - Assigned → Free (release)
/// - any → Disabled (auth revoked, banned)
/// - NeedsConversion → Free (import tooling, outside this workspace)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Free,
    Assigned,
    Disabled,
    NeedsConversion,
}

impl CredentialStatus {
    /// Status label for API responses and logging.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialStatus::Free => "free",
            CredentialStatus::Assigned => "assigned",
            CredentialStatus::Disabled => "disabled",
            CredentialStatus::NeedsConversion => "needs_conversion",
        }
    }
}

/// Client fingerprint presented to the platform when connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceFingerprint {
    pub device_model: String,
    pub system_version: String,
    pub app_version: String,
    pub lang_code: String,
    pub system_lang_code: String,
}

impl Default for DeviceFingerprint {
    fn default() -> Self {
        Self {
            device_model: "Samsung SM-S918B".into(),
            system_version: "SDK 34".into(),
            app_version: "10.14.5 (5447)".into(),
            lang_code: "en".into(),
            system_lang_code: "en".into(),
        }
    }
}

/// A managed platform identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub status: CredentialStatus,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub platform_user_id: Option<i64>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_premium: bool,
    /// Opaque reference to the session blob produced by import.
    #[serde(default)]
    pub session_ref: Option<String>,
    #[serde(default)]
    pub proxy_id: Option<ProxyId>,
    #[serde(default)]
    pub api_id: Option<i32>,
    #[serde(default)]
    pub api_hash: Option<Secret<String>>,
    #[serde(default)]
    pub device: DeviceFingerprint,
    #[serde(default)]
    pub error_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// A fresh Free credential with the given session reference.
    pub fn new(id: CredentialId, session_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: CredentialStatus::Free,
            phone: None,
            platform_user_id: None,
            display_name: None,
            is_premium: false,
            session_ref: Some(session_ref.into()),
            proxy_id: None,
            api_id: None,
            api_hash: None,
            device: DeviceFingerprint::default(),
            error_text: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Free and backed by a usable session reference.
    pub fn is_claimable(&self) -> bool {
        self.status == CredentialStatus::Free
            && self.session_ref.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Live identity fields to merge into a credential. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityPatch {
    pub platform_user_id: Option<i64>,
    pub phone: Option<String>,
    pub display_name: Option<String>,
    pub is_premium: Option<bool>,
}

impl IdentityPatch {
    pub fn is_empty(&self) -> bool {
        *self == IdentityPatch::default()
    }
}

/// Lifecycle of one issuance request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Revoked,
}

impl RequestStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Revoked => "revoked",
        }
    }

    /// Pending → {Approved, Rejected}, Approved → Revoked. Nothing else.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (RequestStatus::Pending, RequestStatus::Approved)
                | (RequestStatus::Pending, RequestStatus::Rejected)
                | (RequestStatus::Approved, RequestStatus::Revoked)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Rejected | RequestStatus::Revoked)
    }
}

/// One allocation lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub requester_id: RequesterId,
    #[serde(default)]
    pub credential_id: Option<CredentialId>,
    pub status: RequestStatus,
    #[serde(default)]
    pub confirmation_code: Option<String>,
    #[serde(default)]
    pub risk_score: Option<f64>,
    #[serde(default)]
    pub credential_was_premium: Option<bool>,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Request {
    /// Counts against the requester's quota: approved and a code was delivered.
    pub fn is_active_issuance(&self) -> bool {
        self.status == RequestStatus::Approved && self.confirmation_code.is_some()
    }
}

/// A status change applied by [`crate::Store::transition_request`].
#[derive(Debug, Clone, PartialEq)]
pub enum RequestChange {
    Approve {
        credential_id: CredentialId,
        credential_was_premium: bool,
    },
    Reject,
    Revoke,
}

impl RequestChange {
    pub fn target(&self) -> RequestStatus {
        match self {
            RequestChange::Approve { .. } => RequestStatus::Approved,
            RequestChange::Reject => RequestStatus::Rejected,
            RequestChange::Revoke => RequestStatus::Revoked,
        }
    }

    pub(crate) fn apply(&self, request: &mut Request, now: DateTime<Utc>) {
        request.status = self.target();
        match self {
            RequestChange::Approve {
                credential_id,
                credential_was_premium,
            } => {
                request.credential_id = Some(*credential_id);
                request.credential_was_premium = Some(*credential_was_premium);
                request.approved_at = Some(now);
            }
            RequestChange::Reject => request.rejected_at = Some(now),
            RequestChange::Revoke => request.revoked_at = Some(now),
        }
    }
}

/// Admin-facing view of a proxy, including the persisted health counters.
///
/// `is_active` is the manual/auto-disable flag; live selection health is
/// tracked separately in memory by the proxy pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub id: ProxyId,
    pub endpoint: ProxyEndpoint,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_check_ip: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub fail_count: u64,
    #[serde(default)]
    pub consecutive_fails: u32,
    pub created_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

fn default_capacity() -> u32 {
    DEFAULT_PROXY_CAPACITY
}

impl ProxyRecord {
    pub fn new(id: ProxyId, endpoint: ProxyEndpoint) -> Self {
        Self {
            id,
            endpoint,
            is_active: true,
            country: None,
            capacity: DEFAULT_PROXY_CAPACITY,
            comment: None,
            last_checked_at: None,
            last_check_ip: None,
            latency_ms: None,
            success_count: 0,
            fail_count: 0,
            consecutive_fails: 0,
            created_at: Utc::now(),
        }
    }
}
