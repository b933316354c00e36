//! Scripted platform and prober fakes for listener tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use account_store::{BoxFuture, Credential, CredentialId, FileStore};
use chrono::Utc;
use common::ProxyEndpoint;
use platform::{Connector, InboundMessage, SelfIdentity, Session};
use proxy_pool::{ProbeOutcome, Prober, ProxyAssignment, ProxyPool};
use tokio::sync::{Mutex, mpsc};

use crate::events::{ChannelEvents, ListenerNotice};
use crate::manager::ListenerRequest;
use crate::orchestrator::{IssuanceConfig, RequestOrchestrator};

pub(crate) type Log = Arc<StdMutex<Vec<String>>>;

pub(crate) fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Prober that reports every proxy healthy.
pub(crate) struct OkProber;

impl Prober for OkProber {
    fn probe<'a>(&'a self, _endpoint: &'a ProxyEndpoint) -> BoxFuture<'a, ProbeOutcome> {
        Box::pin(async { ProbeOutcome::success("203.0.113.1", 10) })
    }
}

/// Connector whose first connects fail as scripted, then opens sessions fed
/// from one shared message channel.
pub(crate) struct FakeConnector {
    pub connect_errors: StdMutex<VecDeque<platform::Error>>,
    pub authorized: StdMutex<platform::Result<bool>>,
    pub identity: StdMutex<platform::Result<SelfIdentity>>,
    pub reset_delay: StdMutex<Duration>,
    pub panic_on_connect: AtomicBool,
    pub messages: Arc<Mutex<mpsc::UnboundedReceiver<InboundMessage>>>,
    pub log: Log,
}

impl FakeConnector {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedSender<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            connect_errors: StdMutex::new(VecDeque::new()),
            authorized: StdMutex::new(Ok(true)),
            identity: StdMutex::new(Ok(identity(1000))),
            reset_delay: StdMutex::new(Duration::ZERO),
            panic_on_connect: AtomicBool::new(false),
            messages: Arc::new(Mutex::new(rx)),
            log: Arc::new(StdMutex::new(Vec::new())),
        });
        (connector, tx)
    }

    pub(crate) fn fail_next(&self, errors: impl IntoIterator<Item = platform::Error>) {
        self.connect_errors.lock().unwrap().extend(errors);
    }

    pub(crate) fn connects(&self) -> Vec<String> {
        entries(&self.log)
            .into_iter()
            .filter(|e| e.starts_with("connect:"))
            .collect()
    }
}

impl Connector for FakeConnector {
    fn connect<'a>(
        &'a self,
        credential: &'a Credential,
        proxy: Option<&'a ProxyEndpoint>,
    ) -> BoxFuture<'a, platform::Result<Box<dyn Session>>> {
        Box::pin(async move {
            let via = proxy.map(|p| p.host.clone()).unwrap_or_else(|| "direct".into());
            self.log
                .lock()
                .unwrap()
                .push(format!("connect:{}:{via}", credential.id));
            if self.panic_on_connect.load(Ordering::SeqCst) {
                panic!("connector exploded");
            }
            if let Some(e) = self.connect_errors.lock().unwrap().pop_front() {
                return Err(e);
            }
            let session = FakeSession {
                credential_id: credential.id,
                authorized: self.authorized.lock().unwrap().clone(),
                identity: self.identity.lock().unwrap().clone(),
                reset_delay: *self.reset_delay.lock().unwrap(),
                messages: self.messages.clone(),
                log: self.log.clone(),
            };
            Ok(Box::new(session) as Box<dyn Session>)
        })
    }
}

pub(crate) struct FakeSession {
    credential_id: CredentialId,
    authorized: platform::Result<bool>,
    identity: platform::Result<SelfIdentity>,
    reset_delay: Duration,
    messages: Arc<Mutex<mpsc::UnboundedReceiver<InboundMessage>>>,
    log: Log,
}

impl Session for FakeSession {
    fn is_authorized(&mut self) -> BoxFuture<'_, platform::Result<bool>> {
        let result = self.authorized.clone();
        Box::pin(async move { result })
    }

    fn self_identity(&mut self) -> BoxFuture<'_, platform::Result<SelfIdentity>> {
        let result = self.identity.clone();
        Box::pin(async move { result })
    }

    fn next_message(&mut self) -> BoxFuture<'_, platform::Result<Option<InboundMessage>>> {
        Box::pin(async move { Ok(self.messages.lock().await.recv().await) })
    }

    fn reset_other_sessions(&mut self) -> BoxFuture<'_, platform::Result<()>> {
        Box::pin(async move {
            tokio::time::sleep(self.reset_delay).await;
            self.log
                .lock()
                .unwrap()
                .push(format!("reset:{}", self.credential_id));
            Ok(())
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.log
                .lock()
                .unwrap()
                .push(format!("disconnect:{}", self.credential_id));
        })
    }
}

pub(crate) fn identity(user_id: i64) -> SelfIdentity {
    SelfIdentity {
        user_id,
        phone: Some("79161234567".into()),
        display_name: Some("issued".into()),
        is_premium: false,
    }
}

pub(crate) fn message(text: &str) -> InboundMessage {
    InboundMessage {
        sender_id: 777000,
        text: text.to_string(),
        timestamp: Utc::now(),
    }
}

/// Orchestrator over a temp-dir store, fake connector and channel events.
pub(crate) struct Harness {
    pub _dir: tempfile::TempDir,
    pub store: Arc<FileStore>,
    pub pool: Arc<ProxyPool>,
    pub connector: Arc<FakeConnector>,
    pub inbound: mpsc::UnboundedSender<InboundMessage>,
    pub events: ChannelEvents,
    pub notices: mpsc::UnboundedReceiver<ListenerNotice>,
    pub orchestrator: Arc<RequestOrchestrator>,
}

impl Harness {
    pub(crate) async fn new(credentials: u64) -> Self {
        Self::with_config(credentials, IssuanceConfig::default()).await
    }

    pub(crate) async fn with_config(credentials: u64, config: IssuanceConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::load(dir.path().join("store.json")).await.unwrap());
        for id in 1..=credentials {
            store
                .upsert_credential(Credential::new(id, format!("sessions/{id}.session")))
                .await
                .unwrap();
        }
        let pool = Arc::new(ProxyPool::new(Arc::new(OkProber)));
        let (connector, inbound) = FakeConnector::new();
        let (events, notices) = ChannelEvents::new();
        let orchestrator = Arc::new(RequestOrchestrator::new(
            store.clone(),
            pool.clone(),
            connector.clone(),
            Arc::new(events.clone()),
            config,
        ));
        Self {
            _dir: dir,
            store,
            pool,
            connector,
            inbound,
            events,
            notices,
            orchestrator,
        }
    }

    /// Start a listener for a stored credential without an issuance request.
    pub(crate) async fn listen(
        &self,
        credential_id: CredentialId,
        proxy: Option<ProxyAssignment>,
    ) -> bool {
        let credential = self.store.credential(credential_id).await.unwrap();
        let request = ListenerRequest {
            credential,
            proxy,
            requester_id: 42,
            request_id: None,
        };
        self.orchestrator
            .manager()
            .start(request, Arc::new(self.events.clone()))
            .await
    }

    /// Next notice, failing the test if none arrives within `secs` of test time.
    pub(crate) async fn next_notice(&mut self, secs: u64) -> ListenerNotice {
        tokio::time::timeout(Duration::from_secs(secs), self.notices.recv())
            .await
            .expect("no listener notice in time")
            .expect("notice channel closed")
    }

    /// Drain notices already queued without waiting.
    pub(crate) fn queued_notices(&mut self) -> Vec<ListenerNotice> {
        let mut out = Vec::new();
        while let Ok(n) = self.notices.try_recv() {
            out.push(n);
        }
        out
    }
}
