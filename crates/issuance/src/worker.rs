//! One listener run for one credential
//!
//! The worker drives [`crate::lifecycle`] with real I/O: it connects through
//! the credential's proxy (rotating on network failures), checks the session,
//! reconciles the live identity with the stored record and then reads inbound
//! messages until the deadline, a failure or cancellation.
//!
//! Every suspension point races the cancellation token and the overall
//! deadline. Event callbacks and failure bookkeeping run outside that race
//! so a stop never interrupts one halfway.

use std::sync::Arc;
use std::time::Duration;

use account_store::{Credential, IdentityPatch, Store};
use platform::{Connector, SelfIdentity, Session};
use proxy_pool::{ProxyAssignment, ProxyPool, country_for_phone};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::allocator::CredentialAllocator;
use crate::code::extract_code;
use crate::error::ListenerFailure;
use crate::events::{ListenerContext, ListenerEvents};
use crate::lifecycle::{WorkerAction, WorkerEvent, WorkerState, handle_event};

/// Default window for code delivery, measured from listener start.
pub const DEFAULT_CODE_WAIT: Duration = Duration::from_secs(180);

/// Upper bound on closing a session once the run is over.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Collaborators shared by every listener.
pub(crate) struct WorkerDeps {
    pub connector: Arc<dyn Connector>,
    pub store: Arc<dyn Store>,
    pub allocator: Arc<CredentialAllocator>,
    pub pool: Arc<ProxyPool>,
    pub code_wait: Duration,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Stopped,
    TimedOut,
    Failed(ListenerFailure),
}

pub(crate) struct ListenerWorker {
    ctx: ListenerContext,
    credential: Credential,
    country: Option<String>,
    proxy: Option<ProxyAssignment>,
    deps: Arc<WorkerDeps>,
    events: Arc<dyn ListenerEvents>,
    cancel: CancellationToken,
    deadline: Instant,
    /// Identity verified by the last `Verify`, announced by the run loop.
    connected: Option<SelfIdentity>,
}

impl ListenerWorker {
    pub(crate) fn new(
        ctx: ListenerContext,
        credential: Credential,
        proxy: Option<ProxyAssignment>,
        deps: Arc<WorkerDeps>,
        events: Arc<dyn ListenerEvents>,
        cancel: CancellationToken,
    ) -> Self {
        let country = credential
            .phone
            .as_deref()
            .and_then(country_for_phone)
            .map(str::to_string);
        let deadline = Instant::now() + deps.code_wait;
        Self {
            ctx,
            credential,
            country,
            proxy,
            deps,
            events,
            cancel,
            deadline,
            connected: None,
        }
    }

    pub(crate) async fn run(mut self) -> Termination {
        let credential_id = self.ctx.credential_id;
        info!(
            credential_id,
            requester_id = self.ctx.requester_id,
            proxy = self.proxy_label(),
            country = self.country.as_deref().unwrap_or("unknown"),
            "listener starting"
        );

        let cancel = self.cancel.clone();
        let deadline = self.deadline;
        let mut session: Option<Box<dyn Session>> = None;
        let mut state = WorkerState::initial();
        let mut action = WorkerAction::Connect;

        let termination = loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => WorkerEvent::Cancelled,
                _ = tokio::time::sleep_until(deadline) => WorkerEvent::Deadline,
                event = self.perform(&action, &mut session) => event,
            };

            let (next, next_action) = handle_event(state, event);
            debug!(credential_id, state = next.label(), "listener transition");
            state = next;

            if let Some(identity) = self.connected.take()
                && matches!(next_action, WorkerAction::Listen)
            {
                self.events.on_connected(self.ctx, &identity).await;
            }

            match next_action {
                WorkerAction::DeliverCode(code) => {
                    self.deliver_code(&code).await;
                    action = WorkerAction::Listen;
                }
                WorkerAction::ReportTimeout => break Termination::TimedOut,
                WorkerAction::ReportError(failure) => {
                    self.record_failure(&failure).await;
                    break Termination::Failed(failure);
                }
                WorkerAction::None if state == WorkerState::Stopped => break Termination::Stopped,
                WorkerAction::None => {
                    break Termination::Failed(ListenerFailure::Unexpected(format!(
                        "listener stalled in state {}",
                        state.label()
                    )));
                }
                other => action = other,
            }
        };

        if let Some(mut s) = session.take()
            && tokio::time::timeout(DISCONNECT_TIMEOUT, s.disconnect())
                .await
                .is_err()
        {
            warn!(credential_id, "session disconnect timed out");
        }

        info!(credential_id, outcome = ?termination, "listener finished");
        termination
    }

    /// Execute one action and return the event it produced.
    async fn perform(
        &mut self,
        action: &WorkerAction,
        session: &mut Option<Box<dyn Session>>,
    ) -> WorkerEvent {
        match action {
            WorkerAction::Connect => self.connect(session).await,
            WorkerAction::ScheduleRetry { delay } => {
                self.rotate_proxy().await;
                info!(
                    credential_id = self.ctx.credential_id,
                    delay_secs = delay.as_secs(),
                    "waiting before reconnect"
                );
                tokio::time::sleep(*delay).await;
                WorkerEvent::RetryTimer
            }
            WorkerAction::Verify => match session.as_deref_mut() {
                Some(s) => self.verify(s).await,
                None => WorkerEvent::Rejected(ListenerFailure::Unexpected("no session".into())),
            },
            WorkerAction::Listen => match session.as_deref_mut() {
                Some(s) => next_code(s).await,
                None => WorkerEvent::Failure(ListenerFailure::Unexpected("no session".into())),
            },
            // Handled by the run loop; never raced
            WorkerAction::DeliverCode(_)
            | WorkerAction::ReportTimeout
            | WorkerAction::ReportError(_)
            | WorkerAction::None => std::future::pending().await,
        }
    }

    async fn connect(&mut self, slot: &mut Option<Box<dyn Session>>) -> WorkerEvent {
        let credential_id = self.ctx.credential_id;
        let endpoint = self.proxy.as_ref().map(|p| &p.endpoint);
        match self.deps.connector.connect(&self.credential, endpoint).await {
            Ok(session) => {
                *slot = Some(session);
                if let Some(proxy) = &self.proxy {
                    self.deps.pool.mark_success(&proxy.key).await;
                }
                info!(credential_id, proxy = self.proxy_label(), "session connected");
                WorkerEvent::Opened
            }
            Err(e) => {
                warn!(credential_id, proxy = self.proxy_label(), error = %e, "connect failed");
                WorkerEvent::ConnectFailed(e)
            }
        }
    }

    /// Move to a different proxy after a failed connection attempt.
    ///
    /// Keeps the current proxy when the pool has no alternative; the pool
    /// holds the credential's binding to it in that case.
    async fn rotate_proxy(&mut self) {
        let credential_id = self.ctx.credential_id;
        let pool = &self.deps.pool;
        let current = self.proxy.take();

        // The pool marks the bound proxy failed; a proxy we were handed
        // without a binding has to be marked here.
        if let Some(cur) = &current
            && pool.binding_of(credential_id).await.as_deref() != Some(cur.key.as_str())
        {
            pool.mark_failed(&cur.key).await;
        }

        match pool
            .get_new_proxy_for(credential_id, self.country.as_deref())
            .await
        {
            Some(next) => {
                info!(
                    credential_id,
                    from = current.as_ref().map(|p| p.key.as_str()).unwrap_or("direct"),
                    to = %next.key,
                    "switched proxy"
                );
                self.proxy = Some(next);
            }
            None => {
                warn!(credential_id, "no alternative proxy, retrying with the current one");
                self.proxy = current;
            }
        }
    }

    async fn verify(&mut self, session: &mut dyn Session) -> WorkerEvent {
        let credential_id = self.ctx.credential_id;

        match session.is_authorized().await {
            Ok(true) => {}
            Ok(false) => return WorkerEvent::Rejected(ListenerFailure::AuthRevoked),
            Err(e) => return WorkerEvent::Rejected(ListenerFailure::from(e)),
        }

        let identity = match session.self_identity().await {
            Ok(identity) => identity,
            Err(e @ (platform::Error::AuthKeyUnregistered
            | platform::Error::TwoFactorRequired
            | platform::Error::Deactivated)) => {
                return WorkerEvent::Rejected(ListenerFailure::from(e));
            }
            Err(e) => {
                warn!(credential_id, error = %e, "identity unavailable, listening anyway");
                return WorkerEvent::Verified;
            }
        };

        if let Err(failure) = self.reconcile(&identity).await {
            return WorkerEvent::Rejected(failure);
        }
        self.connected = Some(identity);
        WorkerEvent::Verified
    }

    /// Merge the live identity into the stored record.
    ///
    /// Fails only when another credential already owns the live user id.
    async fn reconcile(&mut self, identity: &SelfIdentity) -> Result<(), ListenerFailure> {
        let credential_id = self.ctx.credential_id;
        let store = &self.deps.store;

        match store.find_credential_by_user(identity.user_id).await {
            Ok(Some(existing)) if existing != credential_id => {
                warn!(
                    credential_id,
                    existing,
                    platform_user_id = identity.user_id,
                    "live identity already registered to another credential"
                );
                return Err(ListenerFailure::DuplicateIdentity { existing });
            }
            Ok(_) => {}
            Err(e) => warn!(credential_id, error = %e, "duplicate check failed"),
        }

        let stored = &self.credential;
        if let Some(stored_id) = stored.platform_user_id
            && stored_id != identity.user_id
        {
            warn!(
                credential_id,
                stored = stored_id,
                live = identity.user_id,
                "platform user id mismatch"
            );
        }

        let patch = IdentityPatch {
            platform_user_id: stored
                .platform_user_id
                .is_none()
                .then_some(identity.user_id),
            phone: identity.phone.clone().filter(|_| stored.phone.is_none()),
            display_name: identity
                .display_name
                .clone()
                .filter(|_| stored.display_name.is_none()),
            is_premium: (stored.is_premium != identity.is_premium).then_some(identity.is_premium),
        };
        if patch.is_empty() {
            return Ok(());
        }

        match store
            .update_credential_identity(credential_id, patch.clone())
            .await
        {
            Ok(()) => {
                info!(credential_id, platform_user_id = identity.user_id, "credential identity updated");
                let c = &mut self.credential;
                c.platform_user_id = patch.platform_user_id.or(c.platform_user_id);
                if let Some(phone) = patch.phone {
                    c.phone = Some(phone);
                }
                if let Some(name) = patch.display_name {
                    c.display_name = Some(name);
                }
                if let Some(premium) = patch.is_premium {
                    c.is_premium = premium;
                }
            }
            Err(e) => warn!(credential_id, error = %e, "failed to persist identity"),
        }
        Ok(())
    }

    async fn deliver_code(&self, code: &str) {
        info!(credential_id = self.ctx.credential_id, "confirmation code received");
        metrics::counter!("issuance_codes_delivered_total").increment(1);
        self.events.on_code(self.ctx, code).await;
    }

    /// Side effects of a terminal failure that belong to the credential itself.
    async fn record_failure(&self, failure: &ListenerFailure) {
        let credential_id = self.ctx.credential_id;
        warn!(credential_id, reason = failure.kind(), error = %failure, "listener failed");
        if failure.disables_credential() {
            if let Err(e) = self
                .deps
                .allocator
                .disable(credential_id, &failure.to_string())
                .await
            {
                warn!(credential_id, error = %e, "failed to disable credential");
            }
            self.deps.pool.release(credential_id).await;
        }
    }

    fn proxy_label(&self) -> &str {
        self.proxy.as_ref().map(|p| p.key.as_str()).unwrap_or("direct")
    }
}

/// Read messages until one carries a code.
async fn next_code(session: &mut dyn Session) -> WorkerEvent {
    loop {
        match session.next_message().await {
            Ok(Some(message)) => {
                if let Some(code) = extract_code(&message.text) {
                    return WorkerEvent::CodeMatched(code.to_string());
                }
                debug!(sender_id = message.sender_id, "message without code");
            }
            Ok(None) => {
                return WorkerEvent::Failure(ListenerFailure::ConnectionLost(
                    "message stream closed".into(),
                ));
            }
            Err(e) => return WorkerEvent::Failure(ListenerFailure::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelEvents, ListenerNotice};
    use crate::manager::ListenerRequest;
    use crate::testing::{Harness, identity, message};
    use account_store::{BoxFuture, CredentialStatus};
    use common::{ProxyEndpoint, ProxyKind};
    use proxy_pool::ProxySeed;

    fn net_err() -> platform::Error {
        platform::Error::Network("connection refused".into())
    }

    async fn expect_error(h: &mut Harness) -> ListenerFailure {
        match h.next_notice(300).await {
            ListenerNotice::Error { failure, .. } => failure,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeated_code_delivered_once() {
        let mut h = Harness::new(1).await;
        h.listen(1, None).await;
        assert!(matches!(h.next_notice(5).await, ListenerNotice::Connected { .. }));

        h.inbound.send(message("Login code: 12345")).unwrap();
        h.inbound.send(message("Login code: 12345")).unwrap();
        h.inbound.send(message("hello there")).unwrap();
        h.inbound.send(message("Login code: 67890")).unwrap();

        let codes: Vec<String> = [h.next_notice(5).await, h.next_notice(5).await]
            .into_iter()
            .map(|n| match n {
                ListenerNotice::Code { code, .. } => code,
                other => panic!("expected code, got {other:?}"),
            })
            .collect();
        assert_eq!(codes, ["12345", "67890"]);
        assert!(h.queued_notices().is_empty());
        h.orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_rotate_to_third_proxy() {
        let mut h = Harness::new(1).await;
        for host in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            h.pool
                .add_proxy(ProxySeed::new(ProxyEndpoint::new(ProxyKind::Socks5, host, 1080)))
                .await;
        }
        let first = h.pool.get_proxy_for(1, None).await.unwrap();
        assert_eq!(first.endpoint.host, "10.0.0.1");
        h.connector.fail_next([net_err(), net_err()]);

        h.listen(1, Some(first)).await;
        assert!(matches!(h.next_notice(120).await, ListenerNotice::Connected { .. }));

        assert_eq!(
            h.connector.connects(),
            ["connect:1:10.0.0.1", "connect:1:10.0.0.2", "connect:1:10.0.0.3"]
        );
        let bound = h.pool.binding_of(1).await.unwrap();
        assert!(bound.contains("10.0.0.3"), "bound to {bound}");
        assert!(h.queued_notices().is_empty(), "connected fires once");
        h.orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retry_without_alternative_keeps_the_proxy_slot() {
        let mut h = Harness::new(2).await;
        let only = h
            .pool
            .add_proxy(
                ProxySeed::new(ProxyEndpoint::new(ProxyKind::Socks5, "10.0.0.1", 1080)).capacity(1),
            )
            .await;
        let proxy = h.pool.get_proxy_for(1, None).await;
        h.connector.fail_next([net_err()]);

        h.listen(1, proxy).await;
        assert!(matches!(h.next_notice(120).await, ListenerNotice::Connected { .. }));

        assert_eq!(
            h.connector.connects(),
            ["connect:1:10.0.0.1", "connect:1:10.0.0.1"]
        );
        assert_eq!(h.pool.binding_of(1).await, Some(only.clone()));
        assert_eq!(h.pool.bound_count(&only).await, 1);
        assert!(h.pool.get_proxy_for(2, None).await.is_none());
        h.orchestrator.shutdown().await;
    }

    /// Events whose connected callback takes a while to finish.
    struct SlowConnected(ChannelEvents);

    impl ListenerEvents for SlowConnected {
        fn on_connected<'a>(
            &'a self,
            ctx: ListenerContext,
            identity: &'a SelfIdentity,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                self.0.on_connected(ctx, identity).await;
            })
        }

        fn on_code<'a>(&'a self, ctx: ListenerContext, code: &'a str) -> BoxFuture<'a, ()> {
            self.0.on_code(ctx, code)
        }

        fn on_timeout(&self, ctx: ListenerContext) -> BoxFuture<'_, ()> {
            self.0.on_timeout(ctx)
        }

        fn on_error<'a>(
            &'a self,
            ctx: ListenerContext,
            failure: &'a ListenerFailure,
        ) -> BoxFuture<'a, ()> {
            self.0.on_error(ctx, failure)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_connected_callback() {
        let mut h = Harness::new(1).await;
        let request = ListenerRequest {
            credential: h.store.credential(1).await.unwrap(),
            proxy: None,
            requester_id: 42,
            request_id: None,
        };
        let orchestrator = h.orchestrator.clone();
        let manager = orchestrator.manager();
        manager
            .start(request, Arc::new(SlowConnected(h.events.clone())))
            .await;

        // Verified and inside the callback
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.queued_notices().is_empty());

        assert!(manager.stop(1).await);
        assert!(matches!(
            h.queued_notices().as_slice(),
            [ListenerNotice::Connected { .. }]
        ));
        assert!(!manager.is_running(1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn network_failures_exhaust_after_three_attempts() {
        let mut h = Harness::new(1).await;
        h.connector.fail_next([net_err(), net_err(), net_err()]);
        h.listen(1, None).await;

        assert_eq!(
            expect_error(&mut h).await,
            ListenerFailure::NetworkExhausted { attempts: 3 }
        );
        assert_eq!(h.connector.connects().len(), 3);
        assert_eq!(h.store.credential(1).await.unwrap().status, CredentialStatus::Free);
        assert!(!h.orchestrator.manager().is_running(1).await);
    }

    #[tokio::test]
    async fn revoked_session_disables_credential() {
        let mut h = Harness::new(1).await;
        h.pool
            .add_proxy(ProxySeed::new(ProxyEndpoint::new(ProxyKind::Socks5, "10.0.0.1", 1080)))
            .await;
        let proxy = h.pool.get_proxy_for(1, None).await;
        *h.connector.authorized.lock().unwrap() = Ok(false);

        h.listen(1, proxy).await;
        assert_eq!(expect_error(&mut h).await, ListenerFailure::AuthRevoked);

        let credential = h.store.credential(1).await.unwrap();
        assert_eq!(credential.status, CredentialStatus::Disabled);
        assert!(credential.error_text.is_some());
        assert_eq!(h.pool.binding_of(1).await, None);
        assert!(
            h.connector
                .log
                .lock()
                .unwrap()
                .contains(&"disconnect:1".to_string())
        );
    }

    #[tokio::test]
    async fn two_factor_is_reported_without_disabling() {
        let mut h = Harness::new(1).await;
        *h.connector.authorized.lock().unwrap() = Err(platform::Error::TwoFactorRequired);

        h.listen(1, None).await;
        assert_eq!(expect_error(&mut h).await, ListenerFailure::TwoFactorRequired);
        assert_eq!(h.store.credential(1).await.unwrap().status, CredentialStatus::Free);
    }

    #[tokio::test]
    async fn live_identity_owned_by_other_credential_fails() {
        let mut h = Harness::new(2).await;
        h.store
            .update_credential_identity(
                2,
                IdentityPatch {
                    platform_user_id: Some(1000),
                    ..IdentityPatch::default()
                },
            )
            .await
            .unwrap();

        h.listen(1, None).await;
        assert_eq!(
            expect_error(&mut h).await,
            ListenerFailure::DuplicateIdentity { existing: 2 }
        );
        assert_eq!(h.store.credential(1).await.unwrap().status, CredentialStatus::Free);
    }

    #[tokio::test]
    async fn identity_fills_unknown_fields() {
        let mut h = Harness::new(1).await;
        *h.connector.identity.lock().unwrap() = Ok(SelfIdentity {
            is_premium: true,
            ..identity(555)
        });

        h.listen(1, None).await;
        match h.next_notice(5).await {
            ListenerNotice::Connected { identity, ctx } => {
                assert_eq!(identity.user_id, 555);
                assert_eq!(ctx.credential_id, 1);
            }
            other => panic!("expected connected, got {other:?}"),
        }

        let credential = h.store.credential(1).await.unwrap();
        assert_eq!(credential.platform_user_id, Some(555));
        assert_eq!(credential.phone.as_deref(), Some("79161234567"));
        assert_eq!(credential.display_name.as_deref(), Some("issued"));
        assert!(credential.is_premium);
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn identity_lookup_error_keeps_listening() {
        let mut h = Harness::new(1).await;
        *h.connector.identity.lock().unwrap() = Err(platform::Error::Rpc("INTERNAL".into()));

        h.listen(1, None).await;
        h.inbound.send(message("your code 246810")).unwrap();
        match h.next_notice(5).await {
            ListenerNotice::Code { code, .. } => assert_eq!(code, "246810"),
            other => panic!("expected code without connected notice, got {other:?}"),
        }
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn closed_message_stream_is_connection_lost() {
        let mut h = Harness::new(1).await;
        h.listen(1, None).await;
        assert!(matches!(h.next_notice(5).await, ListenerNotice::Connected { .. }));

        let (closed, _) = tokio::sync::mpsc::unbounded_channel();
        h.inbound = closed;
        assert!(matches!(
            expect_error(&mut h).await,
            ListenerFailure::ConnectionLost(_)
        ));
    }
}
