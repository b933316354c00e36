//! Live proxy pool: selection, sticky bindings, capacity and health
//!
//! The pool holds every known proxy with its live health and the map of
//! credential → proxy bindings, both behind one mutex. Selection prefers a
//! proxy in the requested country and otherwise the least-loaded eligible
//! proxy. Ties go to the shorter failure streak, then to the lower key, so
//! selection is deterministic.
//!
//! Eligible means: flag-active, `Healthy` or `Unknown`, and under capacity
//! (capacity 0 is unbounded). A binding is sticky: it is returned again as
//! long as its proxy stays usable, and it is dropped when the proxy turns
//! unhealthy, is deactivated or removed, or the credential is released.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use account_store::{CredentialId, DEFAULT_PROXY_CAPACITY, ProxyId, ProxyRecord};
use chrono::{DateTime, Utc};
use common::ProxyEndpoint;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::probe::{ProbeOutcome, Prober};

/// Consecutive failed uses before a proxy is taken out of live selection.
pub const MAX_CONSECUTIVE_FAILS: u32 = 3;

/// Proxies probed concurrently by [`ProxyPool::check_all`].
const PROBE_CONCURRENCY: usize = 8;

/// Live health of a pooled proxy.
///
/// Transitions:
/// - Unknown/Healthy → Unhealthy (3 consecutive failures, or a failed probe)
/// - any → Healthy (successful use or probe)
/// - any → Checking (probe in flight) → Healthy/Unhealthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyHealth {
    Unknown,
    Healthy,
    Unhealthy,
    Checking,
}

impl ProxyHealth {
    pub fn label(&self) -> &'static str {
        match self {
            ProxyHealth::Unknown => "unknown",
            ProxyHealth::Healthy => "healthy",
            ProxyHealth::Unhealthy => "unhealthy",
            ProxyHealth::Checking => "checking",
        }
    }
}

/// Static description of a proxy to add to the pool.
#[derive(Debug, Clone)]
pub struct ProxySeed {
    pub endpoint: ProxyEndpoint,
    pub record_id: Option<ProxyId>,
    pub country: Option<String>,
    pub capacity: u32,
    pub active: bool,
}

impl ProxySeed {
    pub fn new(endpoint: ProxyEndpoint) -> Self {
        Self {
            endpoint,
            record_id: None,
            country: None,
            capacity: DEFAULT_PROXY_CAPACITY,
            active: true,
        }
    }

    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }
}

impl From<&ProxyRecord> for ProxySeed {
    fn from(record: &ProxyRecord) -> Self {
        Self {
            endpoint: record.endpoint.clone(),
            record_id: Some(record.id),
            country: record.country.clone(),
            capacity: record.capacity,
            active: record.is_active,
        }
    }
}

/// A proxy handed to a credential.
#[derive(Debug, Clone)]
pub struct ProxyAssignment {
    pub key: String,
    pub record_id: Option<ProxyId>,
    pub endpoint: ProxyEndpoint,
}

/// Pool-wide health counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub checking: usize,
    pub inactive: usize,
    pub bound: usize,
}

/// Read-only view of one pooled proxy, safe to serialize (password masked).
#[derive(Debug, Clone, Serialize)]
pub struct ProxySnapshot {
    pub key: String,
    pub proxy: String,
    pub record_id: Option<ProxyId>,
    pub active: bool,
    pub country: Option<String>,
    pub capacity: u32,
    pub bound: usize,
    pub health: ProxyHealth,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_check_ip: Option<String>,
    pub latency_ms: Option<u64>,
    pub success_count: u64,
    pub fail_count: u64,
    pub consecutive_fails: u32,
}

#[derive(Debug)]
struct PooledProxy {
    endpoint: ProxyEndpoint,
    record_id: Option<ProxyId>,
    active: bool,
    country: Option<String>,
    capacity: u32,
    health: ProxyHealth,
    last_checked_at: Option<DateTime<Utc>>,
    last_check_ip: Option<String>,
    latency_ms: Option<u64>,
    success_count: u64,
    fail_count: u64,
    consecutive_fails: u32,
}

impl PooledProxy {
    fn from_seed(seed: ProxySeed) -> Self {
        Self {
            endpoint: seed.endpoint,
            record_id: seed.record_id,
            active: seed.active,
            country: seed.country,
            capacity: seed.capacity,
            health: ProxyHealth::Unknown,
            last_checked_at: None,
            last_check_ip: None,
            latency_ms: None,
            success_count: 0,
            fail_count: 0,
            consecutive_fails: 0,
        }
    }

    fn has_room(&self, bound: usize) -> bool {
        self.capacity == 0 || bound < self.capacity as usize
    }

    fn selectable(&self, bound: usize) -> bool {
        self.active
            && matches!(self.health, ProxyHealth::Healthy | ProxyHealth::Unknown)
            && self.has_room(bound)
    }

    /// Whether an existing binding to this proxy may be kept.
    ///
    /// A probe in flight does not break stickiness.
    fn keeps_binding(&self) -> bool {
        self.active
            && matches!(
                self.health,
                ProxyHealth::Healthy | ProxyHealth::Unknown | ProxyHealth::Checking
            )
    }

    fn in_country(&self, country: &str) -> bool {
        self.country
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(country))
    }
}

#[derive(Debug, Default)]
struct PoolState {
    proxies: HashMap<String, PooledProxy>,
    bindings: HashMap<CredentialId, String>,
}

struct Candidate<'a> {
    key: &'a str,
    load: usize,
    fails: u32,
    country_match: bool,
}

fn by_load(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    a.load
        .cmp(&b.load)
        .then_with(|| a.fails.cmp(&b.fails))
        .then_with(|| a.key.cmp(b.key))
}

impl PoolState {
    fn bound_count(&self, key: &str) -> usize {
        self.bindings.values().filter(|k| k.as_str() == key).count()
    }

    fn unbind_proxy(&mut self, key: &str) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, k| k != key);
        before - self.bindings.len()
    }

    /// Keep at most `capacity` bindings on `key`, dropping the highest credential ids.
    fn trim_to_capacity(&mut self, key: &str) {
        let Some(proxy) = self.proxies.get(key) else {
            return;
        };
        if proxy.capacity == 0 {
            return;
        }
        let mut bound: Vec<CredentialId> = self
            .bindings
            .iter()
            .filter(|(_, k)| k.as_str() == key)
            .map(|(c, _)| *c)
            .collect();
        bound.sort_unstable();
        for credential_id in bound.into_iter().skip(proxy.capacity as usize) {
            debug!(credential_id, proxy = key, "binding dropped, proxy over capacity");
            self.bindings.remove(&credential_id);
        }
    }

    fn select(&self, country: Option<&str>, exclude: Option<&str>) -> Option<String> {
        let candidates: Vec<Candidate<'_>> = self
            .proxies
            .iter()
            .filter(|(key, _)| Some(key.as_str()) != exclude)
            .filter_map(|(key, proxy)| {
                let load = self.bound_count(key);
                proxy.selectable(load).then(|| Candidate {
                    key,
                    load,
                    fails: proxy.consecutive_fails,
                    country_match: country.is_some_and(|c| proxy.in_country(c)),
                })
            })
            .collect();

        candidates
            .iter()
            .filter(|c| c.country_match)
            .min_by(|a, b| by_load(a, b))
            .or_else(|| candidates.iter().min_by(|a, b| by_load(a, b)))
            .map(|c| c.key.to_string())
    }

    fn assignment(&self, key: &str) -> Option<ProxyAssignment> {
        self.proxies.get(key).map(|p| ProxyAssignment {
            key: key.to_string(),
            record_id: p.record_id,
            endpoint: p.endpoint.clone(),
        })
    }

    fn bind(&mut self, credential_id: CredentialId, key: String) -> Option<ProxyAssignment> {
        let assignment = self.assignment(&key);
        self.bindings.insert(credential_id, key);
        assignment
    }

    fn record_failure(&mut self, key: &str) {
        let Some(proxy) = self.proxies.get_mut(key) else {
            return;
        };
        proxy.fail_count += 1;
        proxy.consecutive_fails += 1;
        let consecutive = proxy.consecutive_fails;
        if consecutive >= MAX_CONSECUTIVE_FAILS && proxy.health != ProxyHealth::Unhealthy {
            proxy.health = ProxyHealth::Unhealthy;
            let dropped = self.unbind_proxy(key);
            warn!(
                proxy = key,
                consecutive_fails = consecutive,
                bindings_dropped = dropped,
                "proxy marked unhealthy"
            );
        } else {
            debug!(proxy = key, consecutive_fails = consecutive, "proxy failure recorded");
        }
    }
}

/// In-memory proxy pool. Single-process only.
pub struct ProxyPool {
    state: Mutex<PoolState>,
    prober: Arc<dyn Prober>,
}

impl ProxyPool {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            prober,
        }
    }

    /// Add a proxy, or update the static fields of an existing one.
    ///
    /// Updating keeps live health and counters. Lowering the capacity drops
    /// bindings beyond the new limit. Returns the proxy key.
    pub async fn add_proxy(&self, seed: ProxySeed) -> String {
        let key = seed.endpoint.key();
        let mut state = self.state.lock().await;
        match state.proxies.get_mut(&key) {
            Some(existing) => {
                existing.endpoint = seed.endpoint;
                existing.record_id = seed.record_id.or(existing.record_id);
                existing.country = seed.country;
                existing.capacity = seed.capacity;
                existing.active = seed.active;
                if !seed.active {
                    state.unbind_proxy(&key);
                }
                state.trim_to_capacity(&key);
                debug!(proxy = %key, "proxy updated");
            }
            None => {
                info!(proxy = %key, country = ?seed.country, capacity = seed.capacity, "proxy added to pool");
                state.proxies.insert(key.clone(), PooledProxy::from_seed(seed));
            }
        }
        key
    }

    /// Remove a proxy and every binding to it.
    pub async fn remove_proxy(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.proxies.remove(key).is_some();
        if removed {
            let dropped = state.unbind_proxy(key);
            info!(proxy = key, bindings_dropped = dropped, "proxy removed from pool");
        }
        removed
    }

    /// Set the manual active flag. Deactivating drops the proxy's bindings.
    pub async fn set_active(&self, key: &str, active: bool) -> bool {
        let mut state = self.state.lock().await;
        let Some(proxy) = state.proxies.get_mut(key) else {
            return false;
        };
        if proxy.active != active {
            proxy.active = active;
            info!(proxy = key, active, "proxy active flag changed");
        }
        if !active {
            state.unbind_proxy(key);
        }
        true
    }

    /// Proxy for a credential, reusing its sticky binding while that proxy stays usable.
    ///
    /// Otherwise selects a proxy in `country` (least loaded), falling back to
    /// the least-loaded eligible proxy anywhere, and records the binding.
    /// Returns `None` when no proxy is eligible.
    pub async fn get_proxy_for(
        &self,
        credential_id: CredentialId,
        country: Option<&str>,
    ) -> Option<ProxyAssignment> {
        let mut state = self.state.lock().await;

        if let Some(key) = state.bindings.get(&credential_id).cloned() {
            match state.proxies.get(&key) {
                Some(proxy) if proxy.keeps_binding() => return state.assignment(&key),
                _ => {
                    debug!(credential_id, proxy = %key, "sticky proxy no longer usable, reselecting");
                    state.bindings.remove(&credential_id);
                }
            }
        }

        let key = state.select(country, None)?;
        debug!(credential_id, proxy = %key, country, "proxy bound");
        state.bind(credential_id, key)
    }

    /// Rotate a credential away from its current proxy after a connection failure.
    ///
    /// Marks the current proxy failed, drops the binding and selects again,
    /// never returning the proxy just abandoned. When nothing else is
    /// eligible the credential stays bound to its current proxy, as long as
    /// that proxy may still keep bindings, and `None` is returned.
    pub async fn get_new_proxy_for(
        &self,
        credential_id: CredentialId,
        country: Option<&str>,
    ) -> Option<ProxyAssignment> {
        let mut state = self.state.lock().await;
        let current = state.bindings.remove(&credential_id);
        if let Some(key) = &current {
            state.record_failure(key);
        }

        let Some(key) = state.select(country, current.as_deref()) else {
            if let Some(key) = current
                && state.proxies.get(&key).is_some_and(|p| p.keeps_binding())
            {
                debug!(credential_id, proxy = %key, "no alternative proxy, binding kept");
                state.bindings.insert(credential_id, key);
            }
            return None;
        };
        info!(
            credential_id,
            from = current.as_deref().unwrap_or("none"),
            to = %key,
            "proxy rotated"
        );
        state.bind(credential_id, key)
    }

    /// Bind a credential to the proxy persisted for it, if it is still eligible.
    ///
    /// No-op when the credential already has a binding.
    pub async fn restore_binding(
        &self,
        credential_id: CredentialId,
        record_id: ProxyId,
    ) -> Option<ProxyAssignment> {
        let mut state = self.state.lock().await;
        if state.bindings.contains_key(&credential_id) {
            return None;
        }
        let key = state
            .proxies
            .iter()
            .find(|(_, p)| p.record_id == Some(record_id))
            .map(|(k, _)| k.clone())?;
        let load = state.bound_count(&key);
        if !state.proxies.get(&key)?.selectable(load) {
            return None;
        }
        state.bind(credential_id, key)
    }

    /// Drop a credential's binding. Returns the proxy key it was bound to.
    pub async fn release(&self, credential_id: CredentialId) -> Option<String> {
        self.state.lock().await.bindings.remove(&credential_id)
    }

    pub async fn mark_failed(&self, key: &str) {
        self.state.lock().await.record_failure(key);
    }

    pub async fn mark_success(&self, key: &str) {
        let mut state = self.state.lock().await;
        if let Some(proxy) = state.proxies.get_mut(key) {
            if proxy.health != ProxyHealth::Healthy {
                debug!(proxy = key, previous = proxy.health.label(), "proxy healthy");
            }
            proxy.health = ProxyHealth::Healthy;
            proxy.consecutive_fails = 0;
            proxy.success_count += 1;
        }
    }

    /// Probe one proxy and fold the result into its live health.
    ///
    /// The lock is not held while the probe runs. Returns `None` for an
    /// unknown key.
    pub async fn check_health(&self, key: &str) -> Option<ProbeOutcome> {
        let endpoint = {
            let mut state = self.state.lock().await;
            let proxy = state.proxies.get_mut(key)?;
            proxy.health = ProxyHealth::Checking;
            proxy.endpoint.clone()
        };

        let outcome = self.prober.probe(&endpoint).await;

        let mut state = self.state.lock().await;
        let Some(proxy) = state.proxies.get_mut(key) else {
            return Some(outcome);
        };
        proxy.last_checked_at = Some(Utc::now());
        if outcome.ok {
            proxy.health = ProxyHealth::Healthy;
            proxy.consecutive_fails = 0;
            proxy.success_count += 1;
            proxy.latency_ms = outcome.latency_ms;
            if outcome.external_ip.is_some() {
                proxy.last_check_ip = outcome.external_ip.clone();
            }
            debug!(proxy = key, ip = ?outcome.external_ip, latency_ms = ?outcome.latency_ms, "probe ok");
        } else {
            proxy.health = ProxyHealth::Unhealthy;
            proxy.consecutive_fails += 1;
            proxy.fail_count += 1;
            let dropped = state.unbind_proxy(key);
            warn!(proxy = key, error = ?outcome.error, bindings_dropped = dropped, "probe failed");
        }
        Some(outcome)
    }

    /// Probe every proxy with bounded concurrency.
    pub async fn check_all(&self) -> Vec<(String, Option<ProxyId>, ProbeOutcome)> {
        let targets: Vec<(String, Option<ProxyId>)> = {
            let state = self.state.lock().await;
            state
                .proxies
                .iter()
                .map(|(k, p)| (k.clone(), p.record_id))
                .collect()
        };

        let results: Vec<_> = futures_util::stream::iter(targets)
            .map(|(key, record_id)| async move {
                let outcome = self.check_health(&key).await;
                (key, record_id, outcome)
            })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect()
            .await;

        results
            .into_iter()
            .filter_map(|(key, record_id, outcome)| outcome.map(|o| (key, record_id, o)))
            .collect()
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let mut stats = PoolStats {
            total: state.proxies.len(),
            bound: state.bindings.len(),
            ..PoolStats::default()
        };
        for proxy in state.proxies.values() {
            match proxy.health {
                ProxyHealth::Healthy => stats.healthy += 1,
                ProxyHealth::Unhealthy => stats.unhealthy += 1,
                ProxyHealth::Unknown => stats.unknown += 1,
                ProxyHealth::Checking => stats.checking += 1,
            }
            if !proxy.active {
                stats.inactive += 1;
            }
        }
        stats
    }

    pub async fn snapshot(&self) -> Vec<ProxySnapshot> {
        let state = self.state.lock().await;
        let mut out: Vec<ProxySnapshot> = state
            .proxies
            .iter()
            .map(|(key, p)| ProxySnapshot {
                key: key.clone(),
                proxy: p.endpoint.masked(),
                record_id: p.record_id,
                active: p.active,
                country: p.country.clone(),
                capacity: p.capacity,
                bound: state.bound_count(key),
                health: p.health,
                last_checked_at: p.last_checked_at,
                last_check_ip: p.last_check_ip.clone(),
                latency_ms: p.latency_ms,
                success_count: p.success_count,
                fail_count: p.fail_count,
                consecutive_fails: p.consecutive_fails,
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub async fn binding_of(&self, credential_id: CredentialId) -> Option<String> {
        self.state.lock().await.bindings.get(&credential_id).cloned()
    }

    pub async fn bound_count(&self, key: &str) -> usize {
        self.state.lock().await.bound_count(key)
    }

    pub async fn health_of(&self, key: &str) -> Option<ProxyHealth> {
        self.state.lock().await.proxies.get(key).map(|p| p.health)
    }

    /// Pool key of the proxy loaded from the given record.
    pub async fn key_for_record(&self, record_id: ProxyId) -> Option<String> {
        let state = self.state.lock().await;
        state
            .proxies
            .iter()
            .find(|(_, p)| p.record_id == Some(record_id))
            .map(|(k, _)| k.clone())
    }
}
