//! 备份与恢复
//!
//! 每次安装尝试在第一个破坏性步骤之前调用一次 [`BackupManager::backup`]，
//! 保存模块文件、安装记录与模块数据。即使模块此前未安装也会生成一个空备份，
//! 恢复空备份等同于删除本次写入的文件和记录。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::installer::store::{InstallationRecord, InstallationStore};
use crate::installer::transport::{FileSnapshot, PackageTransport};
use crate::module::version::SemanticVersion;
use crate::utils::id::{prefixed_id, BACKUP_PREFIX};
use crate::utils::{CoreError, Result};

#[derive(Debug, Clone)]
struct Backup {
    info: BackupInfo,
    files: FileSnapshot,
    record: Option<InstallationRecord>,
    data: Option<serde_json::Value>,
}

/// 备份概要
#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub backup_ref: String,
    pub module_id: String,
    pub tenant_id: String,
    /// 备份时已安装的版本
    pub version: Option<SemanticVersion>,
    pub file_count: usize,
    pub created_at: DateTime<Utc>,
    /// 已恢复的次数
    pub restore_count: u32,
}

/// 备份管理器
pub struct BackupManager {
    transport: Arc<dyn PackageTransport>,
    store: Arc<dyn InstallationStore>,
    backups: RwLock<HashMap<String, Backup>>,
}

impl BackupManager {
    pub fn new(transport: Arc<dyn PackageTransport>, store: Arc<dyn InstallationStore>) -> Self {
        Self {
            transport,
            store,
            backups: RwLock::new(HashMap::new()),
        }
    }

    /// 创建备份，返回备份引用
    pub async fn backup(
        &self,
        module_id: &str,
        tenant_id: &str,
        version: Option<&SemanticVersion>,
    ) -> Result<String> {
        let files = self.transport.snapshot(module_id, tenant_id).await?;
        let record = self.store.get(tenant_id, module_id).await?;
        let data = self.store.get_data(tenant_id, module_id).await?;

        let backup_ref = prefixed_id(BACKUP_PREFIX);
        let info = BackupInfo {
            backup_ref: backup_ref.clone(),
            module_id: module_id.to_string(),
            tenant_id: tenant_id.to_string(),
            version: version.cloned().or_else(|| record.as_ref().map(|r| r.version.clone())),
            file_count: files.files.len(),
            created_at: Utc::now(),
            restore_count: 0,
        };
        debug!(
            backup_ref = %backup_ref,
            module_id,
            tenant_id,
            files = info.file_count,
            "备份已创建"
        );

        self.backups.write().await.insert(
            backup_ref.clone(),
            Backup {
                info,
                files,
                record,
                data,
            },
        );
        Ok(backup_ref)
    }

    /// 从备份恢复
    ///
    /// 幂等：同一备份可以重复恢复，结果相同。
    pub async fn restore(&self, backup_ref: &str) -> Result<()> {
        let backup = self
            .backups
            .read()
            .await
            .get(backup_ref)
            .cloned()
            .ok_or_else(|| CoreError::BackupNotFound(backup_ref.to_string()))?;
        let module_id = backup.info.module_id.as_str();
        let tenant_id = backup.info.tenant_id.as_str();

        self.transport.restore(module_id, tenant_id, &backup.files).await?;

        match backup.record {
            Some(record) => self.store.put(record).await?,
            None => {
                self.store.delete(tenant_id, module_id).await?;
            }
        }
        if let Some(data) = backup.data {
            self.store.put_data(tenant_id, module_id, data).await?;
        }

        if let Some(entry) = self.backups.write().await.get_mut(backup_ref) {
            entry.info.restore_count += 1;
        }
        info!(backup_ref, module_id, tenant_id, "备份已恢复");
        Ok(())
    }

    /// 丢弃备份
    pub async fn discard(&self, backup_ref: &str) -> bool {
        self.backups.write().await.remove(backup_ref).is_some()
    }

    /// 查询备份概要
    pub async fn get(&self, backup_ref: &str) -> Option<BackupInfo> {
        self.backups.read().await.get(backup_ref).map(|b| b.info.clone())
    }

    /// 当前保留的备份数量
    pub async fn count(&self) -> usize {
        self.backups.read().await.len()
    }
}
