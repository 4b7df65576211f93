//! 租户安装记录存储
//!
//! 编排器是安装记录的唯一写入方。存储按 (租户, 模块) 定位记录，
//! 创建/替换/删除都是原子的单次操作。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::installer::state::InstallationStatus;
use crate::module::version::SemanticVersion;
use crate::utils::Result;

/// 依赖版本快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyVersion {
    pub module_id: String,
    pub version: SemanticVersion,
    /// 是否为必需依赖
    pub required: bool,
}

/// 安装记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationRecord {
    pub id: String,
    pub module_id: String,
    pub tenant_id: String,
    pub version: SemanticVersion,
    pub status: InstallationStatus,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub configuration: HashMap<String, serde_json::Value>,
    pub dependency_versions: Vec<DependencyVersion>,
}

impl InstallationRecord {
    /// 是否以必需依赖的方式依赖 `module_id`
    pub fn requires(&self, module_id: &str) -> bool {
        self.dependency_versions
            .iter()
            .any(|d| d.required && d.module_id == module_id)
    }
}

/// 安装记录存储接口
#[async_trait]
pub trait InstallationStore: Send + Sync {
    /// 查询记录
    async fn get(&self, tenant_id: &str, module_id: &str) -> Result<Option<InstallationRecord>>;

    /// 创建或替换记录
    async fn put(&self, record: InstallationRecord) -> Result<()>;

    /// 删除记录，返回被删除的记录
    async fn delete(&self, tenant_id: &str, module_id: &str) -> Result<Option<InstallationRecord>>;

    /// 租户下的所有记录，按模块 ID 排序
    async fn list(&self, tenant_id: &str) -> Result<Vec<InstallationRecord>>;

    /// 读取模块持久化数据
    async fn get_data(&self, tenant_id: &str, module_id: &str) -> Result<Option<serde_json::Value>>;

    /// 写入模块持久化数据
    async fn put_data(&self, tenant_id: &str, module_id: &str, data: serde_json::Value) -> Result<()>;

    /// 清除模块持久化数据，返回是否存在数据
    async fn purge_data(&self, tenant_id: &str, module_id: &str) -> Result<bool>;
}

type StoreKey = (String, String);

fn key(tenant_id: &str, module_id: &str) -> StoreKey {
    (tenant_id.to_string(), module_id.to_string())
}

/// 内存存储
#[derive(Debug, Clone, Default)]
pub struct InMemoryInstallationStore {
    records: Arc<RwLock<HashMap<StoreKey, InstallationRecord>>>,
    data: Arc<RwLock<HashMap<StoreKey, serde_json::Value>>>,
}

impl InMemoryInstallationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录总数
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl InstallationStore for InMemoryInstallationStore {
    async fn get(&self, tenant_id: &str, module_id: &str) -> Result<Option<InstallationRecord>> {
        Ok(self.records.read().await.get(&key(tenant_id, module_id)).cloned())
    }

    async fn put(&self, record: InstallationRecord) -> Result<()> {
        let k = key(&record.tenant_id, &record.module_id);
        self.records.write().await.insert(k, record);
        Ok(())
    }

    async fn delete(&self, tenant_id: &str, module_id: &str) -> Result<Option<InstallationRecord>> {
        Ok(self.records.write().await.remove(&key(tenant_id, module_id)))
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<InstallationRecord>> {
        let records = self.records.read().await;
        let mut list: Vec<InstallationRecord> = records
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        Ok(list)
    }

    async fn get_data(&self, tenant_id: &str, module_id: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.data.read().await.get(&key(tenant_id, module_id)).cloned())
    }

    async fn put_data(&self, tenant_id: &str, module_id: &str, data: serde_json::Value) -> Result<()> {
        self.data.write().await.insert(key(tenant_id, module_id), data);
        Ok(())
    }

    async fn purge_data(&self, tenant_id: &str, module_id: &str) -> Result<bool> {
        Ok(self.data.write().await.remove(&key(tenant_id, module_id)).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tenant: &str, module: &str, version: &str) -> InstallationRecord {
        let now = Utc::now();
        InstallationRecord {
            id: format!("inst_{}", module),
            module_id: module.to_string(),
            tenant_id: tenant.to_string(),
            version: SemanticVersion::parse(version).unwrap(),
            status: InstallationStatus::Completed,
            installed_at: now,
            updated_at: now,
            configuration: HashMap::new(),
            dependency_versions: vec![DependencyVersion {
                module_id: "db".to_string(),
                version: SemanticVersion::parse("2.0.0").unwrap(),
                required: true,
            }],
        }
    }

    #[tokio::test]
    async fn test_put_get_replace_delete() {
        let store = InMemoryInstallationStore::new();
        store.put(record("t1", "auth", "1.0.0")).await.unwrap();
        store.put(record("t1", "auth", "2.0.0")).await.unwrap();

        let found = store.get("t1", "auth").await.unwrap().unwrap();
        assert_eq!(found.version.to_string(), "2.0.0");
        assert!(found.requires("db"));
        assert!(store.get("t2", "auth").await.unwrap().is_none());
        assert_eq!(store.len().await, 1);

        let removed = store.delete("t1", "auth").await.unwrap();
        assert!(removed.is_some());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_is_tenant_scoped() {
        let store = InMemoryInstallationStore::new();
        store.put(record("t1", "zeta", "1.0.0")).await.unwrap();
        store.put(record("t1", "alpha", "1.0.0")).await.unwrap();
        store.put(record("t2", "alpha", "1.0.0")).await.unwrap();

        let list = store.list("t1").await.unwrap();
        let ids: Vec<&str> = list.iter().map(|r| r.module_id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_module_data() {
        let store = InMemoryInstallationStore::new();
        store
            .put_data("t1", "auth", serde_json::json!({"users": 3}))
            .await
            .unwrap();

        assert!(store.get_data("t1", "auth").await.unwrap().is_some());
        assert!(store.purge_data("t1", "auth").await.unwrap());
        assert!(!store.purge_data("t1", "auth").await.unwrap());
    }
}
