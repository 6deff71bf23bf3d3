use async_trait::async_trait;
use dashmap::DashMap;
use hg_common::{Installation, TenantId};

use crate::Result;

/// Durable storage of tenant installations.
///
/// `upsert` keeps the original `installed_at` of an existing record and takes
/// every other field from the new value.
#[async_trait]
pub trait InstallationRepository: Send + Sync {
    async fn find(&self, tenant_id: &TenantId) -> Result<Option<Installation>>;
    async fn upsert(&self, installation: &Installation) -> Result<()>;
    /// Returns true if a record was removed
    async fn delete(&self, tenant_id: &TenantId) -> Result<bool>;
}

#[derive(Default)]
pub struct MemoryInstallationRepository {
    records: DashMap<TenantId, Installation>,
}

impl MemoryInstallationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl InstallationRepository for MemoryInstallationRepository {
    async fn find(&self, tenant_id: &TenantId) -> Result<Option<Installation>> {
        Ok(self.records.get(tenant_id).map(|r| r.value().clone()))
    }

    async fn upsert(&self, installation: &Installation) -> Result<()> {
        let mut record = installation.clone();
        self.records
            .entry(installation.tenant_id.clone())
            .and_modify(|existing| {
                record.installed_at = existing.installed_at;
                *existing = record.clone();
            })
            .or_insert_with(|| installation.clone());
        Ok(())
    }

    async fn delete(&self, tenant_id: &TenantId) -> Result<bool> {
        Ok(self.records.remove(tenant_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_upsert_and_find() {
        let repo = MemoryInstallationRepository::new();
        let tenant = TenantId::new("T1");
        let inst = Installation::new(tenant.clone(), "xoxb-1".into(), "commands");

        repo.upsert(&inst).await.unwrap();
        let found = repo.find(&tenant).await.unwrap().unwrap();
        assert_eq!(found, inst);
        assert!(repo.find(&TenantId::new("T2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_keeps_installed_at() {
        let repo = MemoryInstallationRepository::new();
        let tenant = TenantId::new("T1");
        let first = Installation::new(tenant.clone(), "xoxb-1".into(), "commands");
        repo.upsert(&first).await.unwrap();

        let mut second = Installation::new(tenant.clone(), "xoxb-2".into(), "commands,chat:write");
        second.installed_at = first.installed_at + Duration::hours(1);
        second.updated_at = second.installed_at;
        repo.upsert(&second).await.unwrap();

        let found = repo.find(&tenant).await.unwrap().unwrap();
        assert_eq!(found.bot_token.expose_secret(), "xoxb-2");
        assert_eq!(found.installed_at, first.installed_at);
        assert_eq!(found.updated_at, second.updated_at);
        assert!(found.has_scope("chat:write"));
    }

    #[tokio::test]
    async fn test_delete() {
        let repo = MemoryInstallationRepository::new();
        let tenant = TenantId::new("T1");
        repo.upsert(&Installation::new(tenant.clone(), "xoxb-1".into(), ""))
            .await
            .unwrap();

        assert!(repo.delete(&tenant).await.unwrap());
        assert!(!repo.delete(&tenant).await.unwrap());
        assert!(repo.is_empty());
    }
}
