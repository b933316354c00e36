//! Race-free credential claim and release
//!
//! The only writer of `Credential.status`. Claims go through the store's
//! conditional Free → Assigned update, so two callers can never receive the
//! same credential even when they race on the same candidate.

use std::sync::Arc;

use account_store::{CredentialId, CredentialStatus, Store};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Select+claim rounds before giving up on a contended pool.
pub const CLAIM_ATTEMPTS: u32 = 5;

pub struct CredentialAllocator {
    store: Arc<dyn Store>,
}

impl CredentialAllocator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Claim one free credential.
    ///
    /// Each round picks a claimable candidate and tries the conditional
    /// update; losing the race starts a new round. Returns `None` when the
    /// pool is empty or every round lost.
    pub async fn claim_free(&self) -> Result<Option<CredentialId>> {
        for attempt in 1..=CLAIM_ATTEMPTS {
            let Some(candidate) = self.store.first_claimable().await? else {
                debug!("no claimable credentials");
                return Ok(None);
            };
            if self.store.claim_if_free(candidate).await? {
                info!(credential_id = candidate, attempt, "credential claimed");
                return Ok(Some(candidate));
            }
            debug!(credential_id = candidate, attempt, "claim lost race, retrying");
        }
        warn!(attempts = CLAIM_ATTEMPTS, "credential claim gave up under contention");
        Ok(None)
    }

    /// Put a credential back into the free pool. Idempotent.
    ///
    /// A Disabled credential stays disabled.
    pub async fn release(&self, id: CredentialId) -> Result<()> {
        match self.store.credential(id).await? {
            Some(c) if c.status == CredentialStatus::Assigned => {
                self.store
                    .set_credential_status(id, CredentialStatus::Free, None)
                    .await?;
                info!(credential_id = id, "credential released");
            }
            Some(c) => debug!(credential_id = id, status = c.status.label(), "release skipped"),
            None => debug!(credential_id = id, "release of unknown credential"),
        }
        Ok(())
    }

    /// Take a credential out of rotation until an operator reactivates it.
    pub async fn disable(&self, id: CredentialId, reason: &str) -> Result<()> {
        self.store
            .set_credential_status(id, CredentialStatus::Disabled, Some(reason.to_string()))
            .await?;
        warn!(credential_id = id, reason, "credential disabled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_store::{Credential, FileStore};
    use std::collections::HashSet;

    async fn store_with(dir: &tempfile::TempDir, n: u64) -> Arc<FileStore> {
        let store = Arc::new(FileStore::load(dir.path().join("store.json")).await.unwrap());
        for id in 1..=n {
            store
                .upsert_credential(Credential::new(id, format!("sessions/{id}.session")))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn concurrent_claims_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, 4).await;
        let allocator = Arc::new(CredentialAllocator::new(store.clone()));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move { allocator.claim_free().await.unwrap() }));
        }
        let mut claimed = Vec::new();
        for h in handles {
            if let Some(id) = h.await.unwrap() {
                claimed.push(id);
            }
        }

        let unique: HashSet<_> = claimed.iter().copied().collect();
        assert_eq!(unique.len(), claimed.len(), "credential handed out twice");
        assert!(claimed.len() <= 4);
        for id in &claimed {
            assert_eq!(
                store.credential(*id).await.unwrap().status,
                CredentialStatus::Assigned
            );
        }
    }

    #[tokio::test]
    async fn empty_pool_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, 0).await;
        let allocator = CredentialAllocator::new(store);
        assert_eq!(allocator.claim_free().await.unwrap(), None);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_keeps_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, 2).await;
        let allocator = CredentialAllocator::new(store.clone());

        let id = allocator.claim_free().await.unwrap().unwrap();
        allocator.release(id).await.unwrap();
        allocator.release(id).await.unwrap();
        assert_eq!(store.credential(id).await.unwrap().status, CredentialStatus::Free);

        allocator.disable(2, "auth key unregistered").await.unwrap();
        allocator.release(2).await.unwrap();
        let disabled = store.credential(2).await.unwrap();
        assert_eq!(disabled.status, CredentialStatus::Disabled);
        assert_eq!(disabled.error_text.as_deref(), Some("auth key unregistered"));

        allocator.release(99).await.unwrap();
    }

    #[tokio::test]
    async fn claim_skips_disabled_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(&dir, 2).await;
        let allocator = CredentialAllocator::new(store);
        allocator.disable(1, "banned").await.unwrap();
        assert_eq!(allocator.claim_free().await.unwrap(), Some(2));
        assert_eq!(allocator.claim_free().await.unwrap(), None);
    }
}
