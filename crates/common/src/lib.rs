//! Shared types for the credential issuer workspace

mod error;
mod proxy;
mod secret;

pub use error::{Error, Result};
pub use proxy::{ProxyEndpoint, ProxyKind};
pub use secret::Secret;
