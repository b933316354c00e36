//! Error types for proxy pool operations

/// Errors from proxy registry and parsing operations.
///
/// Live pool bookkeeping (mark failed, probe failures) never returns errors;
/// it only moves health counters.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid proxy line: {0}")]
    Parse(String),

    #[error("proxy not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] account_store::Error),
}

/// Result alias for proxy pool operations.
pub type Result<T> = std::result::Result<T, Error>;
