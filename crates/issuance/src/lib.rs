//! Credential issuance core
//!
//! Claims free credentials for approved requests, binds them to proxies and
//! runs one listener per credential that waits for the platform's
//! confirmation code.
//!
//! Request lifecycle:
//! 1. `create_request` opens a Pending request (subject to the requester's quota)
//! 2. `approve` claims a credential, binds a proxy and starts its listener
//! 3. The listener connects (rotating proxies on network failures), checks
//!    the session and reports codes until its deadline
//! 4. `revoke` resets the credential's other sessions, stops the listener
//!    and returns the credential to the pool
//!
//! Listener outcomes reach the caller only through [`ListenerEvents`]; no
//! listener failure is ever returned from an orchestrator call.

pub mod allocator;
pub mod code;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod manager;
pub mod orchestrator;
pub mod worker;

#[cfg(test)]
mod testing;

pub use allocator::{CLAIM_ATTEMPTS, CredentialAllocator};
pub use code::extract_code;
pub use error::{Error, ListenerFailure, Result};
pub use events::{ChannelEvents, ListenerContext, ListenerEvents, ListenerNotice};
pub use lifecycle::{MAX_CONNECT_ATTEMPTS, RETRY_DELAYS, WorkerState};
pub use manager::{ListenerInfo, ListenerRequest, WorkerManager};
pub use orchestrator::{Approval, IssuanceConfig, REVOKE_RESET_TIMEOUT, RequestOrchestrator};
pub use worker::{DEFAULT_CODE_WAIT, Termination};
