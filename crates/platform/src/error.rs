//! Errors reported by platform sessions

/// Failure classes a platform session can report.
///
/// Only `Network` is worth retrying through another proxy; the rest are
/// decided by the caller (disable, escalate, report).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(String),

    #[error("authorization key unregistered or revoked")]
    AuthKeyUnregistered,

    #[error("two-factor password required")]
    TwoFactorRequired,

    #[error("account deactivated by the platform")]
    Deactivated,

    #[error("flood wait: retry after {seconds}s")]
    FloodWait { seconds: u64 },

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Whether reconnecting (possibly through another proxy) may help.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

/// Result alias for platform operations.
pub type Result<T> = std::result::Result<T, Error>;
