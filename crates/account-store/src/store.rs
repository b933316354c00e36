//! Storage abstraction consumed by the issuance core
//!
//! Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
//! (`Arc<dyn Store>`).

use std::future::Future;
use std::pin::Pin;

use common::ProxyEndpoint;

use crate::error::Result;
use crate::models::{
    Credential, CredentialId, CredentialStatus, IdentityPatch, ProxyId, ProxyRecord, Request,
    RequestChange, RequestId, RequestStatus, RequesterId,
};

/// Boxed future returned by dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Transactional access to credentials, requests and proxy records.
///
/// Every method is a single atomic unit. Conditional methods
/// (`claim_if_free`, `transition_request`, `set_confirmation_code`) report
/// whether their precondition held instead of failing.
pub trait Store: Send + Sync {
    // --- Credentials ---

    fn credential(&self, id: CredentialId) -> BoxFuture<'_, Result<Option<Credential>>>;

    fn credentials(&self) -> BoxFuture<'_, Result<Vec<Credential>>>;

    /// Insert or replace a credential by id.
    fn upsert_credential(&self, credential: Credential) -> BoxFuture<'_, Result<()>>;

    /// Id of some claimable credential (Free with a session reference), lowest id first.
    fn first_claimable(&self) -> BoxFuture<'_, Result<Option<CredentialId>>>;

    /// Free → Assigned, only if the credential is still Free at write time.
    ///
    /// Returns `false` when another caller claimed it first.
    fn claim_if_free(&self, id: CredentialId) -> BoxFuture<'_, Result<bool>>;

    fn set_credential_status(
        &self,
        id: CredentialId,
        status: CredentialStatus,
        error_text: Option<String>,
    ) -> BoxFuture<'_, Result<()>>;

    fn set_credential_proxy(
        &self,
        id: CredentialId,
        proxy_id: Option<ProxyId>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Credential already recorded with the given platform user id.
    fn find_credential_by_user(
        &self,
        platform_user_id: i64,
    ) -> BoxFuture<'_, Result<Option<CredentialId>>>;

    fn update_credential_identity(
        &self,
        id: CredentialId,
        patch: IdentityPatch,
    ) -> BoxFuture<'_, Result<()>>;

    // --- Requests ---

    fn create_request(
        &self,
        requester_id: RequesterId,
        risk_score: Option<f64>,
    ) -> BoxFuture<'_, Result<Request>>;

    fn request(&self, id: RequestId) -> BoxFuture<'_, Result<Option<Request>>>;

    fn requests(&self) -> BoxFuture<'_, Result<Vec<Request>>>;

    /// Apply `change` only if the request is currently in `from`.
    ///
    /// Returns the updated request, or `None` if the status had already moved on.
    fn transition_request(
        &self,
        id: RequestId,
        from: RequestStatus,
        change: RequestChange,
    ) -> BoxFuture<'_, Result<Option<Request>>>;

    /// Store a delivered code. Only applies while the request is Approved.
    fn set_confirmation_code(&self, id: RequestId, code: String) -> BoxFuture<'_, Result<bool>>;

    /// Approved requests with a delivered code for this requester.
    fn count_active_for_requester(
        &self,
        requester_id: RequesterId,
    ) -> BoxFuture<'_, Result<usize>>;

    // --- Proxies ---

    fn proxies(&self) -> BoxFuture<'_, Result<Vec<ProxyRecord>>>;

    fn proxy(&self, id: ProxyId) -> BoxFuture<'_, Result<Option<ProxyRecord>>>;

    /// Insert a proxy, or refresh transport and credentials of the record with the same key.
    fn upsert_proxy(&self, endpoint: ProxyEndpoint) -> BoxFuture<'_, Result<ProxyRecord>>;

    /// Replace an existing proxy record by id.
    fn save_proxy(&self, record: ProxyRecord) -> BoxFuture<'_, Result<()>>;

    /// Delete a proxy record and unlink every credential bound to it.
    fn remove_proxy(&self, id: ProxyId) -> BoxFuture<'_, Result<Option<ProxyRecord>>>;

    fn count_credentials_on_proxy(&self, id: ProxyId) -> BoxFuture<'_, Result<usize>>;
}
