//! JSON file store
//!
//! Keeps the full record set in memory and persists it as one JSON file. All
//! writes use atomic temp-file + rename to prevent corruption on crash. A
//! tokio Mutex serializes every read-modify-write, which is what makes the
//! conditional updates (`claim_if_free`, `transition_request`) atomic.
//!
//! The file is only safe for a single process; multi-process deployments need
//! a store whose conditional update is enforced by the database.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use common::ProxyEndpoint;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{
    Credential, CredentialId, CredentialStatus, IdentityPatch, ProxyId, ProxyRecord, Request,
    RequestChange, RequestId, RequestStatus, RequesterId,
};
use crate::store::{BoxFuture, Store};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    next_request_id: RequestId,
    #[serde(default)]
    next_proxy_id: ProxyId,
    #[serde(default)]
    credentials: BTreeMap<CredentialId, Credential>,
    #[serde(default)]
    requests: BTreeMap<RequestId, Request>,
    #[serde(default)]
    proxies: BTreeMap<ProxyId, ProxyRecord>,
}

/// Outcome of one state edit: `Keep` skips the write.
enum Edit<T> {
    Keep(T),
    Write(T),
}

/// Thread-safe JSON file store.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Load the store from the given file path.
    ///
    /// If the file doesn't exist, creates it empty (cold start with no
    /// credentials, requests or proxies).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading store file: {e}")))?;
            let state: StoreState = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing store file: {e}")))?;
            info!(
                path = %path.display(),
                credentials = state.credentials.len(),
                requests = state.requests.len(),
                proxies = state.proxies.len(),
                "loaded store"
            );
            state
        } else {
            info!(path = %path.display(), "store file not found, starting empty");
            let state = StoreState::default();
            write_atomic(&path, &state).await?;
            state
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub async fn credential(&self, id: CredentialId) -> Option<Credential> {
        self.state.lock().await.credentials.get(&id).cloned()
    }

    pub async fn credentials(&self) -> Vec<Credential> {
        self.state.lock().await.credentials.values().cloned().collect()
    }

    /// Apply `edit` to a copy of the state and persist the copy. The copy
    /// replaces the in-memory state only after the write succeeds, so a
    /// failed write leaves memory and disk in agreement.
    async fn commit<T>(
        &self,
        edit: impl FnOnce(&mut StoreState) -> Result<Edit<T>>,
    ) -> Result<T> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        match edit(&mut next)? {
            Edit::Keep(value) => Ok(value),
            Edit::Write(value) => {
                write_atomic(&self.path, &next).await?;
                *state = next;
                Ok(value)
            }
        }
    }

    pub async fn upsert_credential(&self, credential: Credential) -> Result<()> {
        let id = credential.id;
        self.commit(move |state| {
            state.credentials.insert(credential.id, credential);
            Ok(Edit::Write(()))
        })
        .await?;
        debug!(credential_id = id, "upserted credential");
        Ok(())
    }

    pub async fn first_claimable(&self) -> Option<CredentialId> {
        let state = self.state.lock().await;
        state
            .credentials
            .values()
            .find(|c| c.is_claimable())
            .map(|c| c.id)
    }

    pub async fn claim_if_free(&self, id: CredentialId) -> Result<bool> {
        self.commit(|state| match state.credentials.get_mut(&id) {
            Some(credential) if credential.is_claimable() => {
                credential.status = CredentialStatus::Assigned;
                credential.updated_at = Utc::now();
                Ok(Edit::Write(true))
            }
            _ => Ok(Edit::Keep(false)),
        })
        .await
    }

    pub async fn set_credential_status(
        &self,
        id: CredentialId,
        status: CredentialStatus,
        error_text: Option<String>,
    ) -> Result<()> {
        self.commit(move |state| {
            let credential = credential_mut(state, id)?;
            credential.status = status;
            credential.error_text = error_text;
            credential.updated_at = Utc::now();
            Ok(Edit::Write(()))
        })
        .await
    }

    pub async fn set_credential_proxy(
        &self,
        id: CredentialId,
        proxy_id: Option<ProxyId>,
    ) -> Result<()> {
        self.commit(|state| {
            let credential = credential_mut(state, id)?;
            credential.proxy_id = proxy_id;
            credential.updated_at = Utc::now();
            Ok(Edit::Write(()))
        })
        .await
    }

    pub async fn find_credential_by_user(&self, platform_user_id: i64) -> Option<CredentialId> {
        let state = self.state.lock().await;
        state
            .credentials
            .values()
            .find(|c| c.platform_user_id == Some(platform_user_id))
            .map(|c| c.id)
    }

    pub async fn update_credential_identity(
        &self,
        id: CredentialId,
        patch: IdentityPatch,
    ) -> Result<()> {
        self.commit(move |state| {
            let credential = credential_mut(state, id)?;
            if let Some(user_id) = patch.platform_user_id {
                credential.platform_user_id = Some(user_id);
            }
            if let Some(phone) = patch.phone {
                credential.phone = Some(phone);
            }
            if let Some(name) = patch.display_name {
                credential.display_name = Some(name);
            }
            if let Some(premium) = patch.is_premium {
                credential.is_premium = premium;
            }
            credential.updated_at = Utc::now();
            Ok(Edit::Write(()))
        })
        .await
    }

    pub async fn create_request(
        &self,
        requester_id: RequesterId,
        risk_score: Option<f64>,
    ) -> Result<Request> {
        self.commit(|state| {
            state.next_request_id += 1;
            let request = Request {
                id: state.next_request_id,
                requester_id,
                credential_id: None,
                status: RequestStatus::Pending,
                confirmation_code: None,
                risk_score,
                credential_was_premium: None,
                requested_at: Utc::now(),
                approved_at: None,
                rejected_at: None,
                revoked_at: None,
            };
            state.requests.insert(request.id, request.clone());
            Ok(Edit::Write(request))
        })
        .await
    }

    pub async fn request(&self, id: RequestId) -> Option<Request> {
        self.state.lock().await.requests.get(&id).cloned()
    }

    pub async fn requests(&self) -> Vec<Request> {
        self.state.lock().await.requests.values().cloned().collect()
    }

    pub async fn transition_request(
        &self,
        id: RequestId,
        from: RequestStatus,
        change: RequestChange,
    ) -> Result<Option<Request>> {
        self.commit(move |state| {
            let request = state
                .requests
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("request {id}")))?;
            if request.status != from || !from.can_transition_to(change.target()) {
                return Ok(Edit::Keep(None));
            }
            change.apply(request, Utc::now());
            Ok(Edit::Write(Some(request.clone())))
        })
        .await
    }

    pub async fn set_confirmation_code(&self, id: RequestId, code: String) -> Result<bool> {
        self.commit(move |state| match state.requests.get_mut(&id) {
            Some(request) if request.status == RequestStatus::Approved => {
                request.confirmation_code = Some(code);
                Ok(Edit::Write(true))
            }
            _ => Ok(Edit::Keep(false)),
        })
        .await
    }

    pub async fn count_active_for_requester(&self, requester_id: RequesterId) -> usize {
        let state = self.state.lock().await;
        state
            .requests
            .values()
            .filter(|r| r.requester_id == requester_id && r.is_active_issuance())
            .count()
    }

    pub async fn proxies(&self) -> Vec<ProxyRecord> {
        self.state.lock().await.proxies.values().cloned().collect()
    }

    pub async fn proxy(&self, id: ProxyId) -> Option<ProxyRecord> {
        self.state.lock().await.proxies.get(&id).cloned()
    }

    pub async fn upsert_proxy(&self, endpoint: ProxyEndpoint) -> Result<ProxyRecord> {
        let key = endpoint.key();
        let (record, added) = self
            .commit(move |state| {
                let existing = state
                    .proxies
                    .values_mut()
                    .find(|p| p.endpoint.key() == key);
                let outcome = match existing {
                    Some(record) => {
                        record.endpoint = endpoint;
                        (record.clone(), false)
                    }
                    None => {
                        state.next_proxy_id += 1;
                        let record = ProxyRecord::new(state.next_proxy_id, endpoint);
                        state.proxies.insert(record.id, record.clone());
                        (record, true)
                    }
                };
                Ok(Edit::Write(outcome))
            })
            .await?;
        if added {
            info!(proxy_id = record.id, proxy = %record.endpoint, "added proxy record");
        }
        Ok(record)
    }

    pub async fn save_proxy(&self, record: ProxyRecord) -> Result<()> {
        self.commit(move |state| {
            let slot = state
                .proxies
                .get_mut(&record.id)
                .ok_or_else(|| Error::NotFound(format!("proxy {}", record.id)))?;
            *slot = record;
            Ok(Edit::Write(()))
        })
        .await
    }

    pub async fn remove_proxy(&self, id: ProxyId) -> Result<Option<ProxyRecord>> {
        let removed = self
            .commit(|state| {
                let Some(removed) = state.proxies.remove(&id) else {
                    return Ok(Edit::Keep(None));
                };
                for credential in state.credentials.values_mut() {
                    if credential.proxy_id == Some(id) {
                        credential.proxy_id = None;
                        credential.updated_at = Utc::now();
                    }
                }
                Ok(Edit::Write(Some(removed)))
            })
            .await?;
        if removed.is_some() {
            info!(proxy_id = id, "removed proxy record");
        }
        Ok(removed)
    }

    pub async fn count_credentials_on_proxy(&self, id: ProxyId) -> usize {
        let state = self.state.lock().await;
        state
            .credentials
            .values()
            .filter(|c| c.proxy_id == Some(id))
            .count()
    }
}

fn credential_mut(state: &mut StoreState, id: CredentialId) -> Result<&mut Credential> {
    state
        .credentials
        .get_mut(&id)
        .ok_or_else(|| Error::NotFound(format!("credential {id}")))
}

impl Store for FileStore {
    fn credential(&self, id: CredentialId) -> BoxFuture<'_, Result<Option<Credential>>> {
        Box::pin(async move { Ok(FileStore::credential(self, id).await) })
    }

    fn credentials(&self) -> BoxFuture<'_, Result<Vec<Credential>>> {
        Box::pin(async move { Ok(FileStore::credentials(self).await) })
    }

    fn upsert_credential(&self, credential: Credential) -> BoxFuture<'_, Result<()>> {
        Box::pin(FileStore::upsert_credential(self, credential))
    }

    fn first_claimable(&self) -> BoxFuture<'_, Result<Option<CredentialId>>> {
        Box::pin(async move { Ok(FileStore::first_claimable(self).await) })
    }

    fn claim_if_free(&self, id: CredentialId) -> BoxFuture<'_, Result<bool>> {
        Box::pin(FileStore::claim_if_free(self, id))
    }

    fn set_credential_status(
        &self,
        id: CredentialId,
        status: CredentialStatus,
        error_text: Option<String>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(FileStore::set_credential_status(self, id, status, error_text))
    }

    fn set_credential_proxy(
        &self,
        id: CredentialId,
        proxy_id: Option<ProxyId>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(FileStore::set_credential_proxy(self, id, proxy_id))
    }

    fn find_credential_by_user(
        &self,
        platform_user_id: i64,
    ) -> BoxFuture<'_, Result<Option<CredentialId>>> {
        Box::pin(async move { Ok(FileStore::find_credential_by_user(self, platform_user_id).await) })
    }

    fn update_credential_identity(
        &self,
        id: CredentialId,
        patch: IdentityPatch,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(FileStore::update_credential_identity(self, id, patch))
    }

    fn create_request(
        &self,
        requester_id: RequesterId,
        risk_score: Option<f64>,
    ) -> BoxFuture<'_, Result<Request>> {
        Box::pin(FileStore::create_request(self, requester_id, risk_score))
    }

    fn request(&self, id: RequestId) -> BoxFuture<'_, Result<Option<Request>>> {
        Box::pin(async move { Ok(FileStore::request(self, id).await) })
    }

    fn requests(&self) -> BoxFuture<'_, Result<Vec<Request>>> {
        Box::pin(async move { Ok(FileStore::requests(self).await) })
    }

    fn transition_request(
        &self,
        id: RequestId,
        from: RequestStatus,
        change: RequestChange,
    ) -> BoxFuture<'_, Result<Option<Request>>> {
        Box::pin(FileStore::transition_request(self, id, from, change))
    }

    fn set_confirmation_code(&self, id: RequestId, code: String) -> BoxFuture<'_, Result<bool>> {
        Box::pin(FileStore::set_confirmation_code(self, id, code))
    }

    fn count_active_for_requester(
        &self,
        requester_id: RequesterId,
    ) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move { Ok(FileStore::count_active_for_requester(self, requester_id).await) })
    }

    fn proxies(&self) -> BoxFuture<'_, Result<Vec<ProxyRecord>>> {
        Box::pin(async move { Ok(FileStore::proxies(self).await) })
    }

    fn proxy(&self, id: ProxyId) -> BoxFuture<'_, Result<Option<ProxyRecord>>> {
        Box::pin(async move { Ok(FileStore::proxy(self, id).await) })
    }

    fn upsert_proxy(&self, endpoint: ProxyEndpoint) -> BoxFuture<'_, Result<ProxyRecord>> {
        Box::pin(FileStore::upsert_proxy(self, endpoint))
    }

    fn save_proxy(&self, record: ProxyRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(FileStore::save_proxy(self, record))
    }

    fn remove_proxy(&self, id: ProxyId) -> BoxFuture<'_, Result<Option<ProxyRecord>>> {
        Box::pin(FileStore::remove_proxy(self, id))
    }

    fn count_credentials_on_proxy(&self, id: ProxyId) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move { Ok(FileStore::count_credentials_on_proxy(self, id).await) })
    }
}

/// Write the store to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 since the file holds session
/// references, API hashes and proxy passwords.
async fn write_atomic(path: &Path, state: &StoreState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| Error::Parse(format!("serializing store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("store path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".store.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp store file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting store file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp store file: {e}")))?;

    debug!(path = %path.display(), "persisted store");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ProxyKind;
    use std::collections::HashSet;
    use std::sync::Arc;

    async fn test_store(dir: &tempfile::TempDir) -> FileStore {
        FileStore::load(dir.path().join("store.json")).await.unwrap()
    }

    #[tokio::test]
    async fn load_creates_file_if_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        assert!(!path.exists());

        let store = FileStore::load(path.clone()).await.unwrap();
        assert!(path.exists());
        assert!(store.credentials().await.is_empty());
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        {
            let store = FileStore::load(path.clone()).await.unwrap();
            store.upsert_credential(Credential::new(1, "s/1")).await.unwrap();
            store.create_request(42, Some(0.1)).await.unwrap();
            store
                .upsert_proxy(ProxyEndpoint::new(ProxyKind::Http, "10.0.0.1", 8080).with_auth("u", "p"))
                .await
                .unwrap();
        }

        let store = FileStore::load(path).await.unwrap();
        assert_eq!(store.credentials().await.len(), 1);
        let request = store.request(1).await.unwrap();
        assert_eq!(request.requester_id, 42);
        let proxies = store.proxies().await;
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].endpoint.password.as_ref().unwrap().expose(), "p");

        // Ids keep counting after reload
        let next = store.create_request(42, None).await.unwrap();
        assert_eq!(next.id, 2);
    }

    #[tokio::test]
    async fn claim_if_free_only_succeeds_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        store.upsert_credential(Credential::new(1, "s/1")).await.unwrap();

        assert!(store.claim_if_free(1).await.unwrap());
        assert!(!store.claim_if_free(1).await.unwrap());
        assert_eq!(
            store.credential(1).await.unwrap().status,
            CredentialStatus::Assigned
        );
        assert_eq!(store.first_claimable().await, None);
    }

    #[tokio::test]
    async fn claim_skips_credentials_without_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let mut no_session = Credential::new(1, "");
        no_session.session_ref = None;
        store.upsert_credential(no_session).await.unwrap();
        store.upsert_credential(Credential::new(2, "s/2")).await.unwrap();

        assert_eq!(store.first_claimable().await, Some(2));
        assert!(!store.claim_if_free(1).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_credential() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(test_store(&dir).await);
        for id in 1..=3 {
            store.upsert_credential(Credential::new(id, format!("s/{id}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let Some(id) = store.first_claimable().await else {
                        return None;
                    };
                    if store.claim_if_free(id).await.unwrap() {
                        return Some(id);
                    }
                }
                None
            }));
        }

        let mut won = Vec::new();
        for h in handles {
            if let Some(id) = h.await.unwrap() {
                won.push(id);
            }
        }
        let unique: HashSet<_> = won.iter().copied().collect();
        assert_eq!(won.len(), unique.len(), "credential handed out twice: {won:?}");
        assert_eq!(unique.len(), 3);
    }

    #[tokio::test]
    async fn transition_request_is_conditional() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let request = store.create_request(42, None).await.unwrap();

        let approved = store
            .transition_request(
                request.id,
                RequestStatus::Pending,
                RequestChange::Approve {
                    credential_id: 9,
                    credential_was_premium: true,
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(approved.status, RequestStatus::Approved);
        assert_eq!(approved.credential_id, Some(9));
        assert_eq!(approved.credential_was_premium, Some(true));
        assert!(approved.approved_at.is_some());

        // A second approval or a rejection no longer applies
        let again = store
            .transition_request(request.id, RequestStatus::Pending, RequestChange::Reject)
            .await
            .unwrap();
        assert!(again.is_none());

        // Backward moves are refused even with a matching `from`
        let backward = store
            .transition_request(request.id, RequestStatus::Approved, RequestChange::Reject)
            .await
            .unwrap();
        assert!(backward.is_none());

        let revoked = store
            .transition_request(request.id, RequestStatus::Approved, RequestChange::Revoke)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(revoked.status, RequestStatus::Revoked);
        assert!(revoked.revoked_at.is_some());
    }

    #[tokio::test]
    async fn transition_unknown_request_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let result = store
            .transition_request(99, RequestStatus::Pending, RequestChange::Reject)
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn codes_only_stick_to_approved_requests_and_count_as_active() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let pending = store.create_request(42, None).await.unwrap();
        assert!(!store.set_confirmation_code(pending.id, "12345".into()).await.unwrap());

        let approved = store.create_request(42, None).await.unwrap();
        store
            .transition_request(
                approved.id,
                RequestStatus::Pending,
                RequestChange::Approve {
                    credential_id: 1,
                    credential_was_premium: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(store.count_active_for_requester(42).await, 0);

        assert!(store.set_confirmation_code(approved.id, "54321".into()).await.unwrap());
        assert_eq!(store.count_active_for_requester(42).await, 1);
        assert_eq!(store.count_active_for_requester(7).await, 0);
    }

    #[tokio::test]
    async fn identity_patch_only_touches_given_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let mut credential = Credential::new(1, "s/1");
        credential.phone = Some("79990001122".into());
        store.upsert_credential(credential).await.unwrap();

        store
            .update_credential_identity(
                1,
                IdentityPatch {
                    platform_user_id: Some(555),
                    is_premium: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let c = store.credential(1).await.unwrap();
        assert_eq!(c.platform_user_id, Some(555));
        assert!(c.is_premium);
        assert_eq!(c.phone.as_deref(), Some("79990001122"));
        assert_eq!(store.find_credential_by_user(555).await, Some(1));
    }

    #[tokio::test]
    async fn upsert_proxy_dedupes_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let a = store
            .upsert_proxy(ProxyEndpoint::new(ProxyKind::Http, "10.0.0.1", 8080).with_auth("u", "old"))
            .await
            .unwrap();
        let b = store
            .upsert_proxy(ProxyEndpoint::new(ProxyKind::Socks5, "10.0.0.1", 8080).with_auth("u", "new"))
            .await
            .unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(store.proxies().await.len(), 1);
        let stored = store.proxy(a.id).await.unwrap();
        assert_eq!(stored.endpoint.kind, ProxyKind::Socks5);
        assert_eq!(stored.endpoint.password.as_ref().unwrap().expose(), "new");
    }

    #[tokio::test]
    async fn remove_proxy_unlinks_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let proxy = store
            .upsert_proxy(ProxyEndpoint::new(ProxyKind::Http, "10.0.0.1", 8080))
            .await
            .unwrap();
        store.upsert_credential(Credential::new(1, "s/1")).await.unwrap();
        store.set_credential_proxy(1, Some(proxy.id)).await.unwrap();
        assert_eq!(store.count_credentials_on_proxy(proxy.id).await, 1);

        let removed = store.remove_proxy(proxy.id).await.unwrap();
        assert!(removed.is_some());
        assert_eq!(store.credential(1).await.unwrap().proxy_id, None);
        assert!(store.remove_proxy(proxy.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_proxy_requires_existing_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let record = ProxyRecord::new(77, ProxyEndpoint::new(ProxyKind::Http, "10.0.0.9", 80));
        assert!(matches!(store.save_proxy(record).await, Err(Error::NotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn store_file_has_0600_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = FileStore::load(path.clone()).await.unwrap();
        store.upsert_credential(Credential::new(1, "s/1")).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "store file should be owner-only, got {mode:o}");
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("state");
        std::fs::create_dir(&sub).unwrap();
        let store = FileStore::load(sub.join("store.json")).await.unwrap();
        store.upsert_credential(Credential::new(1, "s/1")).await.unwrap();
        let request = store.create_request(42, None).await.unwrap();

        std::fs::remove_dir_all(&sub).unwrap();

        assert!(matches!(store.claim_if_free(1).await, Err(Error::Io(_))));
        assert_eq!(store.credential(1).await.unwrap().status, CredentialStatus::Free);
        assert_eq!(store.first_claimable().await, Some(1));

        let approve = RequestChange::Approve {
            credential_id: 1,
            credential_was_premium: false,
        };
        assert!(
            store
                .transition_request(request.id, RequestStatus::Pending, approve)
                .await
                .is_err()
        );
        let unchanged = store.request(request.id).await.unwrap();
        assert_eq!(unchanged.status, RequestStatus::Pending);
        assert_eq!(unchanged.credential_id, None);

        assert!(store.create_request(43, None).await.is_err());
        assert_eq!(store.requests().await.len(), 1);

        // Once the directory is back the same claim goes through
        std::fs::create_dir(&sub).unwrap();
        assert!(store.claim_if_free(1).await.unwrap());
        let next = store.create_request(43, None).await.unwrap();
        assert_eq!(next.id, request.id + 1);
    }
}
