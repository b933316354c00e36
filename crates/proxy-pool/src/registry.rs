//! Persisted proxy records and the auto-disable rule
//!
//! The registry owns the store side of proxies and keeps the live pool in
//! step with it: imports add to both, removal and activation changes are
//! mirrored, and probe results update the persisted counters.

use std::collections::HashSet;
use std::sync::Arc;

use account_store::{ProxyId, ProxyRecord, Store};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::geo::GeoLookup;
use crate::parse::parse_proxy_list;
use crate::pool::{ProxyPool, ProxySeed};
use crate::probe::ProbeOutcome;

/// Consecutive failed probes after which a proxy is deactivated.
pub const AUTO_DISABLE_AFTER: u32 = 5;

/// Fold one probe result into a persisted record.
///
/// Returns the new `is_active` value when the flag changed.
pub fn apply_check(
    record: &mut ProxyRecord,
    outcome: &ProbeOutcome,
    country: Option<String>,
    now: DateTime<Utc>,
) -> Option<bool> {
    let was_active = record.is_active;
    record.last_checked_at = Some(now);

    if outcome.ok {
        record.success_count += 1;
        record.fail_count = 0;
        record.consecutive_fails = 0;
        record.is_active = true;
        if outcome.external_ip.is_some() {
            record.last_check_ip = outcome.external_ip.clone();
        }
        record.latency_ms = outcome.latency_ms;
        if let Some(country) = country {
            record.country = Some(country);
        }
    } else {
        record.fail_count += 1;
        record.consecutive_fails += 1;
        if record.consecutive_fails >= AUTO_DISABLE_AFTER {
            record.is_active = false;
        }
    }

    (record.is_active != was_active).then_some(record.is_active)
}

/// Result of importing a proxy list.
#[derive(Debug, Default, Serialize)]
pub struct ImportReport {
    pub added: usize,
    pub updated: usize,
    pub errors: Vec<String>,
}

pub struct ProxyRegistry {
    store: Arc<dyn Store>,
    pool: Arc<ProxyPool>,
    geo: Option<Arc<dyn GeoLookup>>,
}

impl ProxyRegistry {
    pub fn new(store: Arc<dyn Store>, pool: Arc<ProxyPool>) -> Self {
        Self {
            store,
            pool,
            geo: None,
        }
    }

    /// Fill missing proxy countries from the exit IP after successful probes.
    pub fn with_geo(mut self, geo: Arc<dyn GeoLookup>) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    /// Add every stored proxy to the pool, inactive ones included with their flag.
    pub async fn load_into_pool(&self) -> Result<usize> {
        let records = self.store.proxies().await?;
        for record in &records {
            self.pool.add_proxy(ProxySeed::from(record)).await;
        }
        info!(count = records.len(), "proxies loaded into pool");
        Ok(records.len())
    }

    pub async fn records(&self) -> Result<Vec<ProxyRecord>> {
        Ok(self.store.proxies().await?)
    }

    /// Persist one probe result and mirror activation changes into the pool.
    pub async fn record_check(&self, id: ProxyId, outcome: &ProbeOutcome) -> Result<()> {
        let mut record = self
            .store
            .proxy(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("proxy {id}")))?;

        let country = match (&self.geo, &outcome.external_ip) {
            (Some(geo), Some(ip)) if outcome.ok && record.country.is_none() => {
                geo.country_of(ip).await
            }
            _ => None,
        };
        let country_filled = country.is_some();

        let changed = apply_check(&mut record, outcome, country, Utc::now());
        self.store.save_proxy(record.clone()).await?;

        match changed {
            Some(false) => warn!(
                proxy_id = id,
                consecutive_fails = record.consecutive_fails,
                "proxy auto-disabled"
            ),
            Some(true) => info!(proxy_id = id, "proxy reactivated after successful check"),
            None => {}
        }
        if changed.is_some() || country_filled {
            self.pool.add_proxy(ProxySeed::from(&record)).await;
        }
        Ok(())
    }

    /// Parse a proxy list, upsert every valid line and add it to the pool.
    pub async fn import(&self, text: &str) -> Result<ImportReport> {
        let parsed = parse_proxy_list(text);
        let known: HashSet<String> = self
            .store
            .proxies()
            .await?
            .iter()
            .map(|r| r.endpoint.key())
            .collect();

        let mut report = ImportReport {
            errors: parsed.errors,
            ..ImportReport::default()
        };
        for endpoint in parsed.endpoints {
            let existed = known.contains(&endpoint.key());
            let record = self.store.upsert_proxy(endpoint).await?;
            self.pool.add_proxy(ProxySeed::from(&record)).await;
            if existed {
                report.updated += 1;
            } else {
                report.added += 1;
            }
        }

        info!(
            added = report.added,
            updated = report.updated,
            rejected = report.errors.len(),
            "proxy list imported"
        );
        Ok(report)
    }

    /// Manually enable or disable a proxy. Enabling clears the failure streak.
    pub async fn set_active(&self, id: ProxyId, active: bool) -> Result<ProxyRecord> {
        let mut record = self
            .store
            .proxy(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("proxy {id}")))?;
        record.is_active = active;
        if active {
            record.consecutive_fails = 0;
        }
        self.store.save_proxy(record.clone()).await?;
        self.pool.add_proxy(ProxySeed::from(&record)).await;
        info!(proxy_id = id, active, "proxy active flag set");
        Ok(record)
    }

    /// Delete a proxy record, unlink its credentials and drop it from the pool.
    pub async fn remove(&self, id: ProxyId) -> Result<ProxyRecord> {
        let record = self
            .store
            .remove_proxy(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("proxy {id}")))?;
        self.pool.remove_proxy(&record.endpoint.key()).await;
        info!(proxy_id = id, proxy = %record.endpoint, "proxy removed");
        Ok(record)
    }
}
