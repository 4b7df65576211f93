//! 并发控制与步骤超时
//!
//! - [`KeyLockTable`] - 以 (模块, 租户) 为单位的互斥，冲突时立即失败而不排队
//! - [`with_step_timeout`] - 为单个步骤加超时

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::installer::state::InstallKey;
use crate::utils::{CoreError, Result};

/// 活动键表
#[derive(Debug, Clone, Default)]
pub struct KeyLockTable {
    active: Arc<Mutex<BTreeSet<InstallKey>>>,
}

impl KeyLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 尝试占用键
    ///
    /// 键已被占用时返回 [`CoreError::InstallationInProgress`]。
    pub fn try_acquire(&self, key: InstallKey) -> Result<KeyGuard> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.contains(&key) {
            debug!(key = %key, "键已被占用");
            return Err(CoreError::InstallationInProgress {
                module: key.module_id,
                tenant: key.tenant_id,
            });
        }
        active.insert(key.clone());
        Ok(KeyGuard {
            key,
            table: Arc::clone(&self.active),
        })
    }

    /// 按 (模块, 租户) 升序依次占用多个键
    ///
    /// 任何一个失败时已占用的键全部释放。
    pub fn try_acquire_all(&self, keys: impl IntoIterator<Item = InstallKey>) -> Result<Vec<KeyGuard>> {
        let ordered: BTreeSet<InstallKey> = keys.into_iter().collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for key in ordered {
            guards.push(self.try_acquire(key)?);
        }
        Ok(guards)
    }

    /// 键是否被占用
    pub fn is_held(&self, key: &InstallKey) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(key)
    }

    /// 当前被占用的键
    pub fn held_keys(&self) -> Vec<InstallKey> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// 键占用守卫，drop 时释放
#[derive(Debug)]
pub struct KeyGuard {
    key: InstallKey,
    table: Arc<Mutex<BTreeSet<InstallKey>>>,
}

impl KeyGuard {
    pub fn key(&self) -> &InstallKey {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        let mut active = self.table.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.key);
    }
}

/// 为步骤加超时
///
/// 超时返回 [`CoreError::Timeout`]，步骤本身的错误原样返回。
pub async fn with_step_timeout<F, T>(step: &str, limit: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => {
            warn!(step, timeout_ms = limit.as_millis() as u64, "步骤超时");
            Err(CoreError::Timeout {
                step: step.to_string(),
                timeout_ms: limit.as_millis() as u64,
            })
        }
    }
}
