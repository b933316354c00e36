//! Error types for the issuance core

use account_store::{RequestId, RequestStatus};

/// Errors returned to the command layer by orchestrator operations.
///
/// Listener failures never surface here; they are reported through
/// [`crate::ListenerEvents::on_error`] as a [`ListenerFailure`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no free credentials")]
    NoFreeCredentials,

    #[error("request {0} was already processed")]
    AlreadyProcessed(RequestId),

    #[error("request {id} is {status:?}, cannot {action}")]
    InvalidTransition {
        id: RequestId,
        status: RequestStatus,
        action: &'static str,
    },

    #[error("requester already holds {active} active credentials (limit {limit})")]
    QuotaExceeded { active: usize, limit: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] account_store::Error),
}

impl Error {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NoFreeCredentials => "no_free_credentials",
            Error::AlreadyProcessed(_) => "already_processed",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::NotFound(_) => "not_found",
            Error::Store(_) => "store",
        }
    }
}

/// Result alias for issuance operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a listener stopped without a timeout.
///
/// Each variant carries an operator-facing message so the operator can tell
/// retryable conditions from ones that need escalation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListenerFailure {
    #[error("session revoked by the platform")]
    AuthRevoked,

    #[error("two-factor password required, escalate to an administrator")]
    TwoFactorRequired,

    #[error("account deactivated or banned by the platform")]
    Deactivated,

    #[error("could not connect after {attempts} attempts")]
    NetworkExhausted { attempts: u32 },

    #[error("duplicate identity: already registered as credential {existing}")]
    DuplicateIdentity { existing: u64 },

    #[error("rate limited by the platform, wait {seconds}s")]
    Throttled { seconds: u64 },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("platform error: {0}")]
    Protocol(String),

    #[error("unexpected listener failure: {0}")]
    Unexpected(String),
}

impl ListenerFailure {
    /// Stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ListenerFailure::AuthRevoked => "auth_revoked",
            ListenerFailure::TwoFactorRequired => "two_factor_required",
            ListenerFailure::Deactivated => "deactivated",
            ListenerFailure::NetworkExhausted { .. } => "network_exhausted",
            ListenerFailure::DuplicateIdentity { .. } => "duplicate_identity",
            ListenerFailure::Throttled { .. } => "throttled",
            ListenerFailure::ConnectionLost(_) => "connection_lost",
            ListenerFailure::Protocol(_) => "protocol",
            ListenerFailure::Unexpected(_) => "unexpected",
        }
    }

    /// The credential can no longer be issued and must be disabled.
    pub fn disables_credential(&self) -> bool {
        matches!(self, ListenerFailure::AuthRevoked | ListenerFailure::Deactivated)
    }
}

impl From<platform::Error> for ListenerFailure {
    fn from(e: platform::Error) -> Self {
        match e {
            platform::Error::AuthKeyUnregistered => ListenerFailure::AuthRevoked,
            platform::Error::TwoFactorRequired => ListenerFailure::TwoFactorRequired,
            platform::Error::Deactivated => ListenerFailure::Deactivated,
            platform::Error::FloodWait { seconds } => ListenerFailure::Throttled { seconds },
            platform::Error::Network(msg) => ListenerFailure::ConnectionLost(msg),
            platform::Error::Rpc(msg) | platform::Error::Protocol(msg) => {
                ListenerFailure::Protocol(msg)
            }
        }
    }
}
