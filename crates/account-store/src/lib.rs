//! Persistent records for credentials, issuance requests and proxies
//!
//! The issuance core talks to storage only through the [`Store`] trait. The
//! one primitive that must stay atomic across callers is
//! [`Store::claim_if_free`]: a conditional Free → Assigned update that fails
//! when another caller won the race. [`FileStore`] provides it in-process
//! by serializing all mutations behind a single lock; a database-backed store
//! would implement it as `UPDATE ... WHERE status = 'free'`.
//!
//! Record lifecycle:
//! 1. Credentials are created by the import tooling (status `Free` once a
//!    session reference exists)
//! 2. `claim_if_free` moves a credential to `Assigned` for one request
//! 3. Release or disable moves it back to `Free` or to `Disabled`
//! 4. Requests move Pending → Approved/Rejected, Approved → Revoked, never back

pub mod error;
pub mod file;
pub mod models;
pub mod store;

pub use error::{Error, Result};
pub use file::FileStore;
pub use models::{
    Credential, CredentialId, CredentialStatus, DEFAULT_PROXY_CAPACITY, DeviceFingerprint,
    IdentityPatch, ProxyId, ProxyRecord, Request, RequestChange, RequestId, RequestStatus,
    RequesterId,
};
pub use store::{BoxFuture, Store};
