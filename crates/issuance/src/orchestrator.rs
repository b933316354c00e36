//! Request lifecycle: approve, reject, revoke
//!
//! The orchestrator is the one root object that owns the allocator, the
//! proxy pool handle and the listener manager. It is built once at startup
//! and passed to the command layer explicitly.
//!
//! Listener failures never come back through these calls; they reach the
//! configured [`ListenerEvents`] sink instead.

use std::sync::Arc;
use std::time::Duration;

use account_store::{
    BoxFuture, Credential, CredentialId, Request, RequestChange, RequestId, RequestStatus,
    RequesterId, Store,
};
use platform::{Connector, SelfIdentity};
use proxy_pool::{ProxyAssignment, ProxyPool, ProxyRegistry, country_for_phone, spawn_probe_task};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::allocator::CredentialAllocator;
use crate::error::{Error, ListenerFailure, Result};
use crate::events::{ListenerContext, ListenerEvents};
use crate::manager::{ListenerRequest, WorkerManager};
use crate::worker::{DEFAULT_CODE_WAIT, WorkerDeps};

/// Bound on the best-effort session reset during revoke.
pub const REVOKE_RESET_TIMEOUT: Duration = Duration::from_secs(25);

#[derive(Debug, Clone)]
pub struct IssuanceConfig {
    /// Listener deadline, measured from listener start.
    pub code_wait: Duration,
    /// Approved requests with a delivered code a requester may hold at once.
    pub max_active_per_requester: usize,
    pub revoke_reset_timeout: Duration,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            code_wait: DEFAULT_CODE_WAIT,
            max_active_per_requester: 3,
            revoke_reset_timeout: REVOKE_RESET_TIMEOUT,
        }
    }
}

/// Result of a successful approval or relisten.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Approval {
    pub request_id: RequestId,
    pub credential_id: CredentialId,
    /// Masked proxy URL, `None` when the listener connects directly.
    pub proxy: Option<String>,
}

pub struct RequestOrchestrator {
    store: Arc<dyn Store>,
    pool: Arc<ProxyPool>,
    connector: Arc<dyn Connector>,
    allocator: Arc<CredentialAllocator>,
    manager: WorkerManager,
    events: Arc<dyn ListenerEvents>,
    config: IssuanceConfig,
    shutdown: CancellationToken,
}

impl RequestOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        pool: Arc<ProxyPool>,
        connector: Arc<dyn Connector>,
        events: Arc<dyn ListenerEvents>,
        config: IssuanceConfig,
    ) -> Self {
        let allocator = Arc::new(CredentialAllocator::new(store.clone()));
        let deps = Arc::new(WorkerDeps {
            connector: connector.clone(),
            store: store.clone(),
            allocator: allocator.clone(),
            pool: pool.clone(),
            code_wait: config.code_wait,
        });
        let recorder: Arc<dyn ListenerEvents> = Arc::new(CodeRecorder {
            store: store.clone(),
            inner: events,
        });
        Self {
            store,
            pool,
            connector,
            allocator,
            manager: WorkerManager::new(deps),
            events: recorder,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    pub fn allocator(&self) -> &Arc<CredentialAllocator> {
        &self.allocator
    }

    pub fn manager(&self) -> &WorkerManager {
        &self.manager
    }

    /// Start the periodic proxy probe. It stops on [`Self::shutdown`].
    pub fn spawn_probe(
        &self,
        registry: Option<Arc<ProxyRegistry>>,
        interval: Duration,
    ) -> JoinHandle<()> {
        info!(interval_secs = interval.as_secs(), "starting proxy probe task");
        spawn_probe_task(
            self.pool.clone(),
            registry,
            interval,
            self.shutdown.child_token(),
        )
    }

    /// Open a request, unless the requester is already at their quota.
    pub async fn create_request(
        &self,
        requester_id: RequesterId,
        risk_score: Option<f64>,
    ) -> Result<Request> {
        let active = self.store.count_active_for_requester(requester_id).await?;
        let limit = self.config.max_active_per_requester;
        if active >= limit {
            info!(requester_id, active, limit, "request refused, quota reached");
            return Err(Error::QuotaExceeded { active, limit });
        }
        let request = self.store.create_request(requester_id, risk_score).await?;
        info!(request_id = request.id, requester_id, "request created");
        Ok(request)
    }

    /// Approve a pending request: claim a credential, bind a proxy and start
    /// listening for its confirmation code.
    ///
    /// With no free credential the request stays Pending. If the request
    /// stops being Pending while a credential is claimed, the credential is
    /// released again and the call fails with [`Error::AlreadyProcessed`].
    pub async fn approve(&self, request_id: RequestId) -> Result<Approval> {
        let request = self.pending(request_id, "approve").await?;

        let Some(credential_id) = self.allocator.claim_free().await? else {
            metrics::counter!("issuance_allocations_total", "outcome" => "no_free_credentials")
                .increment(1);
            warn!(request_id, "approval failed, no free credentials");
            return Err(Error::NoFreeCredentials);
        };

        match self.link(&request, credential_id).await {
            Ok(approval) => {
                metrics::counter!("issuance_allocations_total", "outcome" => "approved")
                    .increment(1);
                Ok(approval)
            }
            Err(e) => {
                metrics::counter!("issuance_allocations_total", "outcome" => e.kind())
                    .increment(1);
                self.pool.release(credential_id).await;
                if let Err(release_err) = self.allocator.release(credential_id).await {
                    warn!(credential_id, error = %release_err, "failed to release credential");
                }
                Err(e)
            }
        }
    }

    /// Everything after the claim. Any error here rolls the claim back.
    async fn link(&self, request: &Request, credential_id: CredentialId) -> Result<Approval> {
        let credential = self
            .store
            .credential(credential_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("credential {credential_id}")))?;
        let proxy = self.bind_proxy(&credential).await;

        let change = RequestChange::Approve {
            credential_id,
            credential_was_premium: credential.is_premium,
        };
        if self
            .store
            .transition_request(request.id, RequestStatus::Pending, change)
            .await?
            .is_none()
        {
            info!(request_id = request.id, credential_id, "request changed during approval");
            return Err(Error::AlreadyProcessed(request.id));
        }
        info!(
            request_id = request.id,
            requester_id = request.requester_id,
            credential_id,
            proxy = proxy.as_ref().map(|p| p.key.as_str()).unwrap_or("direct"),
            "request approved"
        );

        Ok(self
            .start_listener(request.id, request.requester_id, credential, proxy)
            .await)
    }

    /// Pending → Rejected. No credential was claimed, so nothing to undo.
    pub async fn reject(&self, request_id: RequestId) -> Result<Request> {
        let request = self.pending(request_id, "reject").await?;
        let rejected = self
            .store
            .transition_request(request_id, RequestStatus::Pending, RequestChange::Reject)
            .await?
            .ok_or(Error::AlreadyProcessed(request_id))?;
        info!(request_id, requester_id = request.requester_id, "request rejected");
        Ok(rejected)
    }

    /// Approved → Revoked: reset the credential's other sessions (best effort),
    /// stop its listener and return it to the free pool.
    pub async fn revoke(&self, request_id: RequestId) -> Result<Request> {
        let request = self.approved(request_id, "revoke").await?;
        let credential_id = request.credential_id;

        if let Some(id) = credential_id {
            match self.store.credential(id).await {
                Ok(Some(credential)) => self.reset_sessions(&credential).await,
                Ok(None) => warn!(credential_id = id, "revoked credential no longer exists"),
                Err(e) => warn!(credential_id = id, error = %e, "credential lookup failed"),
            }
            self.manager.stop(id).await;
        }

        let revoked = self
            .store
            .transition_request(request_id, RequestStatus::Approved, RequestChange::Revoke)
            .await?
            .ok_or(Error::AlreadyProcessed(request_id))?;

        if let Some(id) = credential_id {
            self.allocator.release(id).await?;
            self.pool.release(id).await;
        }
        info!(request_id, credential_id, "request revoked");
        Ok(revoked)
    }

    /// Restart the listener of an approved request, e.g. when the requester
    /// needs a fresh code. Replaces a listener that is still running.
    pub async fn relisten(&self, request_id: RequestId) -> Result<Approval> {
        let request = self.approved(request_id, "relisten").await?;
        let credential_id = request
            .credential_id
            .ok_or_else(|| Error::NotFound(format!("credential of request {request_id}")))?;
        let credential = self
            .store
            .credential(credential_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("credential {credential_id}")))?;
        let proxy = self.bind_proxy(&credential).await;
        Ok(self
            .start_listener(request_id, request.requester_id, credential, proxy)
            .await)
    }

    /// Stop a credential's listener. `false` when none was running.
    pub async fn stop_listener(&self, credential_id: CredentialId) -> bool {
        self.manager.stop(credential_id).await
    }

    /// Cancel the background probe and stop every listener.
    ///
    /// Returns how many listeners were stopped.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        let stopped = self.manager.stop_all().await;
        info!(stopped, "issuance shut down");
        stopped
    }

    async fn pending(&self, request_id: RequestId, action: &'static str) -> Result<Request> {
        self.request_in(request_id, RequestStatus::Pending, action)
            .await
    }

    async fn approved(&self, request_id: RequestId, action: &'static str) -> Result<Request> {
        self.request_in(request_id, RequestStatus::Approved, action)
            .await
    }

    async fn request_in(
        &self,
        request_id: RequestId,
        expected: RequestStatus,
        action: &'static str,
    ) -> Result<Request> {
        let request = self
            .store
            .request(request_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("request {request_id}")))?;
        if request.status != expected {
            return Err(Error::InvalidTransition {
                id: request_id,
                status: request.status,
                action,
            });
        }
        Ok(request)
    }

    /// Proxy for a credential: its persisted proxy while eligible, otherwise
    /// a fresh selection in the credential's country. A new choice is
    /// written back to the credential.
    ///
    /// `None` means the listener connects directly.
    async fn bind_proxy(&self, credential: &Credential) -> Option<ProxyAssignment> {
        let credential_id = credential.id;
        if let Some(record_id) = credential.proxy_id {
            self.pool.restore_binding(credential_id, record_id).await;
        }
        let country = credential.phone.as_deref().and_then(country_for_phone);

        let Some(assignment) = self.pool.get_proxy_for(credential_id, country).await else {
            warn!(credential_id, country, "no eligible proxy, connecting directly");
            return None;
        };
        if assignment.record_id.is_some() && assignment.record_id != credential.proxy_id {
            if let Err(e) = self
                .store
                .set_credential_proxy(credential_id, assignment.record_id)
                .await
            {
                warn!(credential_id, error = %e, "failed to persist proxy binding");
            }
        }
        Some(assignment)
    }

    async fn start_listener(
        &self,
        request_id: RequestId,
        requester_id: RequesterId,
        credential: Credential,
        proxy: Option<ProxyAssignment>,
    ) -> Approval {
        let approval = Approval {
            request_id,
            credential_id: credential.id,
            proxy: proxy.as_ref().map(|p| p.endpoint.masked()),
        };
        let request = ListenerRequest {
            credential,
            proxy,
            requester_id,
            request_id: Some(request_id),
        };
        self.manager.start(request, self.events.clone()).await;
        approval
    }

    /// Log out every other session of the credential. Never fails the caller.
    async fn reset_sessions(&self, credential: &Credential) {
        let credential_id = credential.id;
        let country = credential.phone.as_deref().and_then(country_for_phone);
        let proxy = self.pool.get_proxy_for(credential_id, country).await;
        let endpoint = proxy.as_ref().map(|p| &p.endpoint);

        match tokio::time::timeout(
            self.config.revoke_reset_timeout,
            reset_other_sessions(self.connector.as_ref(), credential, endpoint),
        )
        .await
        {
            Ok(Ok(())) => info!(credential_id, "other sessions reset"),
            Ok(Err(e)) => warn!(credential_id, error = %e, "session reset failed"),
            Err(_) => warn!(
                credential_id,
                timeout_secs = self.config.revoke_reset_timeout.as_secs(),
                "session reset timed out"
            ),
        }
    }
}

async fn reset_other_sessions(
    connector: &dyn Connector,
    credential: &Credential,
    proxy: Option<&common::ProxyEndpoint>,
) -> platform::Result<()> {
    let mut session = connector.connect(credential, proxy).await?;
    let result = session.reset_other_sessions().await;
    session.disconnect().await;
    result
}

/// Persists delivered codes on the request before passing them on.
struct CodeRecorder {
    store: Arc<dyn Store>,
    inner: Arc<dyn ListenerEvents>,
}

impl ListenerEvents for CodeRecorder {
    fn on_connected<'a>(
        &'a self,
        ctx: ListenerContext,
        identity: &'a SelfIdentity,
    ) -> BoxFuture<'a, ()> {
        self.inner.on_connected(ctx, identity)
    }

    fn on_code<'a>(&'a self, ctx: ListenerContext, code: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Some(request_id) = ctx.request_id {
                match self
                    .store
                    .set_confirmation_code(request_id, code.to_string())
                    .await
                {
                    Ok(true) => debug!(request_id, "confirmation code stored"),
                    Ok(false) => debug!(request_id, "request no longer approved, code not stored"),
                    Err(e) => warn!(request_id, error = %e, "failed to store confirmation code"),
                }
            }
            self.inner.on_code(ctx, code).await;
        })
    }

    fn on_timeout(&self, ctx: ListenerContext) -> BoxFuture<'_, ()> {
        self.inner.on_timeout(ctx)
    }

    fn on_error<'a>(
        &'a self,
        ctx: ListenerContext,
        failure: &'a ListenerFailure,
    ) -> BoxFuture<'a, ()> {
        self.inner.on_error(ctx, failure)
    }
}
