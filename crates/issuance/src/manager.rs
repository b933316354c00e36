//! Live listener registry
//!
//! At most one listener runs per credential. Starting a listener for a
//! credential that already has one cancels the old run and waits for it to
//! finish before the new run is spawned.
//!
//! A run that ends on its own removes its registry entry before reporting
//! a timeout or failure, so a later `stop` finds nothing and returns false.
//! A run removed by `stop` reports nothing.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use account_store::{Credential, CredentialId, RequestId, RequesterId};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use proxy_pool::ProxyAssignment;

use crate::error::ListenerFailure;
use crate::events::{ListenerContext, ListenerEvents};
use crate::worker::{ListenerWorker, Termination, WorkerDeps};

/// Everything needed to start one listener.
#[derive(Debug, Clone)]
pub struct ListenerRequest {
    pub credential: Credential,
    pub proxy: Option<ProxyAssignment>,
    pub requester_id: RequesterId,
    pub request_id: Option<RequestId>,
}

/// Admin view of a running listener.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerInfo {
    pub credential_id: CredentialId,
    pub requester_id: RequesterId,
    pub request_id: Option<RequestId>,
    pub proxy: Option<String>,
    pub running_secs: u64,
}

struct ListenerEntry {
    run_id: u64,
    ctx: ListenerContext,
    proxy: Option<String>,
    started_at: Instant,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<CredentialId, ListenerEntry>>>;

pub struct WorkerManager {
    deps: Arc<WorkerDeps>,
    listeners: Registry,
    /// Serializes start/stop so a replacement never overlaps its predecessor.
    gate: Mutex<()>,
    next_run: AtomicU64,
}

impl WorkerManager {
    pub(crate) fn new(deps: Arc<WorkerDeps>) -> Self {
        Self {
            deps,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            gate: Mutex::new(()),
            next_run: AtomicU64::new(1),
        }
    }

    /// Start a listener, replacing any listener already running for the credential.
    ///
    /// Returns `true` when a previous listener was stopped first.
    pub async fn start(&self, request: ListenerRequest, events: Arc<dyn ListenerEvents>) -> bool {
        let _gate = self.gate.lock().await;
        let credential_id = request.credential.id;

        let previous = self.listeners.lock().await.remove(&credential_id);
        let replaced = previous.is_some();
        if let Some(prev) = previous {
            info!(credential_id, run_id = prev.run_id, "replacing running listener");
            finish(prev).await;
        }

        let ctx = ListenerContext {
            credential_id,
            requester_id: request.requester_id,
            request_id: request.request_id,
        };
        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let proxy = request.proxy.as_ref().map(|p| p.endpoint.masked());
        let worker = ListenerWorker::new(
            ctx,
            request.credential,
            request.proxy,
            self.deps.clone(),
            events.clone(),
            cancel.clone(),
        );

        // Hold the registry lock until the entry is in place; the run cannot
        // deregister itself before it was registered.
        let mut listeners = self.listeners.lock().await;
        let task = tokio::spawn(supervise(
            worker,
            ctx,
            run_id,
            events,
            self.listeners.clone(),
        ));
        listeners.insert(
            credential_id,
            ListenerEntry {
                run_id,
                ctx,
                proxy,
                started_at: Instant::now(),
                cancel,
                task,
            },
        );
        record_active(listeners.len());
        debug!(credential_id, run_id, "listener registered");
        replaced
    }

    /// Stop the credential's listener and wait for it to finish.
    ///
    /// Returns `false` when no listener was running. Never fails.
    pub async fn stop(&self, credential_id: CredentialId) -> bool {
        let _gate = self.gate.lock().await;
        let entry = {
            let mut listeners = self.listeners.lock().await;
            let entry = listeners.remove(&credential_id);
            record_active(listeners.len());
            entry
        };
        match entry {
            Some(entry) => {
                info!(credential_id, run_id = entry.run_id, "stopping listener");
                finish(entry).await;
                true
            }
            None => false,
        }
    }

    /// Stop every listener. Returns how many were running.
    pub async fn stop_all(&self) -> usize {
        let _gate = self.gate.lock().await;
        let entries: Vec<ListenerEntry> = {
            let mut listeners = self.listeners.lock().await;
            let drained = listeners.drain().map(|(_, e)| e).collect();
            record_active(0);
            drained
        };
        let count = entries.len();
        for entry in &entries {
            entry.cancel.cancel();
        }
        for entry in entries {
            finish(entry).await;
        }
        if count > 0 {
            info!(count, "all listeners stopped");
        }
        count
    }

    pub async fn is_running(&self, credential_id: CredentialId) -> bool {
        self.listeners.lock().await.contains_key(&credential_id)
    }

    pub async fn active_count(&self) -> usize {
        self.listeners.lock().await.len()
    }

    pub async fn active(&self) -> Vec<ListenerInfo> {
        let listeners = self.listeners.lock().await;
        let mut out: Vec<ListenerInfo> = listeners
            .values()
            .map(|e| ListenerInfo {
                credential_id: e.ctx.credential_id,
                requester_id: e.ctx.requester_id,
                request_id: e.ctx.request_id,
                proxy: e.proxy.clone(),
                running_secs: e.started_at.elapsed().as_secs(),
            })
            .collect();
        out.sort_by_key(|i| i.credential_id);
        out
    }
}

/// Cancel a run and wait for it. Task errors are logged, never raised.
async fn finish(entry: ListenerEntry) {
    entry.cancel.cancel();
    if let Err(e) = entry.task.await {
        warn!(
            credential_id = entry.ctx.credential_id,
            error = %e,
            "listener task ended abnormally"
        );
    }
}

/// Task body: run the worker, contain panics, deregister, then report.
async fn supervise(
    worker: ListenerWorker,
    ctx: ListenerContext,
    run_id: u64,
    events: Arc<dyn ListenerEvents>,
    listeners: Registry,
) {
    let termination = match AssertUnwindSafe(worker.run()).catch_unwind().await {
        Ok(termination) => termination,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(credential_id = ctx.credential_id, panic = %message, "listener panicked");
            Termination::Failed(ListenerFailure::Unexpected(message))
        }
    };

    let owned = {
        let mut listeners = listeners.lock().await;
        let owned = listeners
            .get(&ctx.credential_id)
            .is_some_and(|e| e.run_id == run_id);
        if owned {
            listeners.remove(&ctx.credential_id);
            record_active(listeners.len());
        }
        owned
    };
    if !owned {
        // Stopped or replaced: the caller asked for silence.
        return;
    }

    match termination {
        Termination::TimedOut => {
            metrics::counter!("issuance_listener_timeouts_total").increment(1);
            events.on_timeout(ctx).await;
        }
        Termination::Failed(failure) => {
            metrics::counter!("issuance_listener_errors_total", "reason" => failure.kind())
                .increment(1);
            events.on_error(ctx, &failure).await;
        }
        Termination::Stopped => {}
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_string()
    }
}

fn record_active(count: usize) {
    metrics::gauge!("issuance_active_listeners").set(count as f64);
}
