//! Installation Store: cache-aside reads over the durable repository

use hg_common::{HookgateError, Installation, Result, TenantId};
use hg_store::{InstallationRepository, KvStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct InstallationStore {
    repository: Arc<dyn InstallationRepository>,
    cache: Arc<dyn KvStore>,
    ttl: Duration,
}

impl InstallationStore {
    pub fn new(
        repository: Arc<dyn InstallationRepository>,
        cache: Arc<dyn KvStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            repository,
            cache,
            ttl,
        }
    }

    fn cache_key(tenant_id: &TenantId) -> String {
        format!("hookgate:installation:{}", tenant_id)
    }

    /// Read an installation, preferring the cache.
    ///
    /// Cache failures never fail the read; the durable record is served and
    /// the failure logged.
    pub async fn get(&self, tenant_id: &TenantId) -> Result<Installation> {
        let key = Self::cache_key(tenant_id);

        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Installation>(&raw) {
                Ok(installation) => {
                    debug!(tenant_id = %tenant_id, "Installation cache hit");
                    return Ok(installation);
                }
                Err(e) => {
                    warn!(tenant_id = %tenant_id, error = %e, "Discarding unreadable cached installation");
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Installation cache read failed");
            }
        }

        let installation = self
            .repository
            .find(tenant_id)
            .await?
            .ok_or_else(|| HookgateError::InstallationNotFound(tenant_id.clone()))?;

        match serde_json::to_string(&installation) {
            Ok(raw) => {
                if let Err(e) = self.cache.put(&key, &raw, self.ttl).await {
                    warn!(tenant_id = %tenant_id, error = %e, "Failed to populate installation cache");
                }
            }
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Failed to encode installation for cache");
            }
        }

        Ok(installation)
    }

    /// Write durably, then invalidate the cached copy
    pub async fn upsert(&self, installation: &Installation) -> Result<()> {
        self.repository.upsert(installation).await?;
        self.invalidate(&installation.tenant_id).await;
        debug!(tenant_id = %installation.tenant_id, "Installation stored");
        Ok(())
    }

    /// Remove durably, then invalidate the cached copy. Returns true if a record existed.
    pub async fn delete(&self, tenant_id: &TenantId) -> Result<bool> {
        let removed = self.repository.delete(tenant_id).await?;
        self.invalidate(tenant_id).await;
        Ok(removed)
    }

    async fn invalidate(&self, tenant_id: &TenantId) {
        if let Err(e) = self.cache.delete(&Self::cache_key(tenant_id)).await {
            warn!(
                tenant_id = %tenant_id,
                error = %e,
                "Failed to invalidate installation cache; stale copy expires with its TTL"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hg_store::{MemoryInstallationRepository, MemoryKvStore, StoreError};

    /// Cache that fails every call
    struct BrokenCache;

    #[async_trait]
    impl KvStore for BrokenCache {
        async fn get(&self, _key: &str) -> hg_store::Result<Option<String>> {
            Err(StoreError::unavailable("cache down"))
        }
        async fn put(&self, _key: &str, _value: &str, _ttl: Duration) -> hg_store::Result<()> {
            Err(StoreError::unavailable("cache down"))
        }
        async fn put_if_absent(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Duration,
        ) -> hg_store::Result<bool> {
            Err(StoreError::unavailable("cache down"))
        }
        async fn take(&self, _key: &str) -> hg_store::Result<Option<String>> {
            Err(StoreError::unavailable("cache down"))
        }
        async fn delete(&self, _key: &str) -> hg_store::Result<bool> {
            Err(StoreError::unavailable("cache down"))
        }
        async fn compare_and_swap(
            &self,
            _key: &str,
            _expected: &str,
            _value: &str,
            _ttl: Duration,
        ) -> hg_store::Result<bool> {
            Err(StoreError::unavailable("cache down"))
        }
        async fn delete_if_eq(&self, _key: &str, _expected: &str) -> hg_store::Result<bool> {
            Err(StoreError::unavailable("cache down"))
        }
        fn name(&self) -> &str {
            "broken"
        }
    }

    fn store() -> (InstallationStore, Arc<MemoryInstallationRepository>, Arc<MemoryKvStore>) {
        let repo = Arc::new(MemoryInstallationRepository::new());
        let cache = Arc::new(MemoryKvStore::new());
        let store = InstallationStore::new(repo.clone(), cache.clone(), Duration::from_secs(300));
        (store, repo, cache)
    }

    fn installation(tenant: &str, token: &str) -> Installation {
        let mut inst = Installation::new(TenantId::new(tenant), token.into(), "commands,chat:write");
        inst.team_name = Some("Acme".to_string());
        inst.bot_user_id = Some("U123".to_string());
        inst
    }

    #[tokio::test]
    async fn test_upsert_then_get_round_trip() {
        let (store, _, _) = store();
        let inst = installation("T1", "xoxb-1");

        store.upsert(&inst).await.unwrap();
        let read = store.get(&TenantId::new("T1")).await.unwrap();
        assert_eq!(read, inst);
    }

    #[tokio::test]
    async fn test_get_populates_cache() {
        let (store, _, cache) = store();
        store.upsert(&installation("T1", "xoxb-1")).await.unwrap();
        assert!(cache.is_empty());

        store.get(&TenantId::new("T1")).await.unwrap();
        assert!(cache.get("hookgate:installation:T1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_upsert_invalidates_cache() {
        let (store, _, cache) = store();
        let tenant = TenantId::new("T1");
        store.upsert(&installation("T1", "xoxb-old")).await.unwrap();
        store.get(&tenant).await.unwrap();

        store.upsert(&installation("T1", "xoxb-new")).await.unwrap();
        assert!(cache.get("hookgate:installation:T1").await.unwrap().is_none());

        let read = store.get(&tenant).await.unwrap();
        assert_eq!(read.bot_token.expose_secret(), "xoxb-new");
    }

    #[tokio::test]
    async fn test_delete_removes_record_and_cache() {
        let (store, repo, cache) = store();
        let tenant = TenantId::new("T1");
        store.upsert(&installation("T1", "xoxb-1")).await.unwrap();
        store.get(&tenant).await.unwrap();

        assert!(store.delete(&tenant).await.unwrap());
        assert!(repo.is_empty());
        assert!(cache.get("hookgate:installation:T1").await.unwrap().is_none());
        assert!(matches!(
            store.get(&tenant).await,
            Err(HookgateError::InstallationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_not_found() {
        let (store, _, _) = store();
        let err = store.get(&TenantId::new("T404")).await.unwrap_err();
        assert!(matches!(err, HookgateError::InstallationNotFound(t) if t.as_str() == "T404"));
    }

    #[tokio::test]
    async fn test_cache_failure_does_not_fail_reads() {
        let repo = Arc::new(MemoryInstallationRepository::new());
        let store = InstallationStore::new(repo, Arc::new(BrokenCache), Duration::from_secs(300));
        let inst = installation("T1", "xoxb-1");

        store.upsert(&inst).await.unwrap();
        assert_eq!(store.get(&TenantId::new("T1")).await.unwrap(), inst);
    }

    #[tokio::test]
    async fn test_corrupt_cache_entry_falls_back() {
        let (store, _, cache) = store();
        store.upsert(&installation("T1", "xoxb-1")).await.unwrap();
        cache
            .put("hookgate:installation:T1", "not json", Duration::from_secs(60))
            .await
            .unwrap();

        let read = store.get(&TenantId::new("T1")).await.unwrap();
        assert_eq!(read.bot_token.expose_secret(), "xoxb-1");
    }
}
