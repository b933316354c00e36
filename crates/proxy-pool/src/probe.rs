//! Proxy reachability probes and the periodic probe task

use std::sync::Arc;
use std::time::{Duration, Instant};

use account_store::BoxFuture;
use common::ProxyEndpoint;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pool::{PoolStats, ProxyPool};
use crate::registry::ProxyRegistry;

/// Result of one probe through a proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub ok: bool,
    /// Address the probe endpoint saw, i.e. the proxy's exit IP.
    pub external_ip: Option<String>,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn success(external_ip: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            ok: true,
            external_ip: Some(external_ip.into()),
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            external_ip: None,
            latency_ms: None,
            error: Some(error.into()),
        }
    }
}

/// Checks whether a proxy can reach the outside world.
///
/// Uses `Pin<Box<dyn Future>>` so the pool can hold an `Arc<dyn Prober>`.
pub trait Prober: Send + Sync {
    fn probe<'a>(&'a self, endpoint: &'a ProxyEndpoint) -> BoxFuture<'a, ProbeOutcome>;
}

/// Probes by fetching an IP-echo URL through the proxy.
pub struct HttpProber {
    url: String,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    async fn fetch(&self, endpoint: &ProxyEndpoint) -> Result<String, String> {
        let proxy = reqwest::Proxy::all(endpoint.url()).map_err(|e| format!("proxy url: {e}"))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .map_err(|e| format!("client: {e}"))?;

        let resp = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| format!("request: {e}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("probe endpoint returned {status}"));
        }
        let body = resp.text().await.map_err(|e| format!("body: {e}"))?;
        parse_ip_body(&body).ok_or_else(|| "probe endpoint returned no address".to_string())
    }
}

impl Prober for HttpProber {
    fn probe<'a>(&'a self, endpoint: &'a ProxyEndpoint) -> BoxFuture<'a, ProbeOutcome> {
        Box::pin(async move {
            let started = Instant::now();
            match self.fetch(endpoint).await {
                Ok(ip) => ProbeOutcome::success(ip, started.elapsed().as_millis() as u64),
                Err(e) => ProbeOutcome::failure(e),
            }
        })
    }
}

/// Accepts a bare address (`203.0.113.5`) or a JSON object with an `ip` field.
fn parse_ip_body(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        return value
            .get("ip")
            .and_then(|v| v.as_str())
            .map(str::to_string);
    }
    Some(trimmed.to_string())
}

/// Spawn a background task that probes every pooled proxy on an interval.
///
/// Results feed the live pool health and, when a registry is given, the
/// persisted counters and auto-disable rule. The first tick is skipped
/// since proxies were just loaded. Stops when `cancel` fires.
pub fn spawn_probe_task(
    pool: Arc<ProxyPool>,
    registry: Option<Arc<ProxyRegistry>>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("probe task stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            probe_cycle(&pool, registry.as_deref()).await;
        }
    })
}

/// Probe every proxy once and record the results.
pub async fn probe_cycle(pool: &ProxyPool, registry: Option<&ProxyRegistry>) {
    let results = pool.check_all().await;
    let mut failed = 0usize;

    for (key, record_id, outcome) in &results {
        let result = if outcome.ok { "ok" } else { "failed" };
        metrics::counter!("proxy_probes_total", "result" => result).increment(1);
        if !outcome.ok {
            failed += 1;
        }

        let (Some(registry), Some(record_id)) = (registry, record_id) else {
            continue;
        };
        if let Err(e) = registry.record_check(*record_id, outcome).await {
            warn!(proxy = %key, error = %e, "failed to persist probe result");
        }
    }

    let stats = pool.stats().await;
    record_pool_gauges(&stats);
    info!(
        probed = results.len(),
        failed,
        healthy = stats.healthy,
        unhealthy = stats.unhealthy,
        "proxy probe cycle complete"
    );
}

/// Publish per-health proxy counts as gauges.
pub fn record_pool_gauges(stats: &PoolStats) {
    for (health, count) in [
        ("healthy", stats.healthy),
        ("unhealthy", stats.unhealthy),
        ("unknown", stats.unknown),
        ("checking", stats.checking),
    ] {
        metrics::gauge!("proxy_pool_proxies", "health" => health).set(count as f64);
    }
}

/// Prober with scripted answers by host.
#[cfg(test)]
pub(crate) struct FixedProber {
    failing: Vec<String>,
}

#[cfg(test)]
impl FixedProber {
    pub(crate) fn healthy() -> Self {
        Self {
            failing: Vec::new(),
        }
    }

    pub(crate) fn failing(hosts: &[&str]) -> Self {
        Self {
            failing: hosts.iter().map(|h| h.to_string()).collect(),
        }
    }
}

#[cfg(test)]
impl Prober for FixedProber {
    fn probe<'a>(&'a self, endpoint: &'a ProxyEndpoint) -> BoxFuture<'a, ProbeOutcome> {
        let failing = self.failing.iter().any(|h| *h == endpoint.host);
        Box::pin(async move {
            if failing {
                ProbeOutcome::failure("connection refused")
            } else {
                ProbeOutcome::success("203.0.113.10", 42)
            }
        })
    }
}
