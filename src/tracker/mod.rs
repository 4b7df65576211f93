//! 安装跟踪
//!
//! 跟踪器是历史记录与回滚记录的唯一写入方，维护：
//!
//! - 进行中安装的进度，按安装 ID 索引，完成后移入历史
//! - 只追加的安装历史
//! - 回滚记录，状态只能按 `pending → in_progress → completed|failed` 前进
//!
//! 每次变化都会在 [`EventBus`] 上发布对应的生命周期事件。

pub mod analytics;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::TrackerConfig;
use crate::events::{lifecycle_events, Event, EventBus};
use crate::installer::state::{InstallAction, InstallationProgress};
use crate::utils::id::{prefixed_id, HISTORY_PREFIX, ROLLBACK_PREFIX};
use crate::utils::{CacheStats, TtlCache};

pub use analytics::{
    ActionBreakdown, AnalyticsQuery, CommonIssue, InstallationAnalytics, TrendBucket,
};

// ============================================================================
// 历史记录
// ============================================================================

/// 历史条目状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Success,
    Failed,
    /// 主模块成功，但有可选依赖失败
    Partial,
    Cancelled,
}

/// 安装历史条目（只追加）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationHistoryEntry {
    pub id: String,
    /// 产生该条目的安装 ID
    pub installation_id: Option<String>,
    pub module_id: String,
    pub tenant_id: String,
    pub action: InstallAction,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub status: HistoryStatus,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub rollback_id: Option<String>,
    pub error: Option<String>,
}

/// 结束一次安装时提交给跟踪器的结果
#[derive(Debug, Clone)]
pub struct InstallationOutcome {
    pub status: HistoryStatus,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub rollback_id: Option<String>,
    pub error: Option<String>,
}

impl InstallationOutcome {
    pub fn success(from_version: Option<String>, to_version: Option<String>) -> Self {
        Self {
            status: HistoryStatus::Success,
            from_version,
            to_version,
            rollback_id: None,
            error: None,
        }
    }

    pub fn failed(
        from_version: Option<String>,
        to_version: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: HistoryStatus::Failed,
            from_version,
            to_version,
            rollback_id: None,
            error: Some(error.into()),
        }
    }

    pub fn with_status(mut self, status: HistoryStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_rollback(mut self, rollback_id: Option<String>) -> Self {
        self.rollback_id = rollback_id;
        self
    }
}

/// 历史查询过滤条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub action: Option<InstallAction>,
    pub status: Option<HistoryStatus>,
    /// 起始时间（含）
    pub since: Option<DateTime<Utc>>,
    /// 截止时间（不含）
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn action(mut self, action: InstallAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn status(mut self, status: HistoryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &InstallationHistoryEntry) -> bool {
        self.action.map_or(true, |a| a == entry.action)
            && self.status.map_or(true, |s| s == entry.status)
            && self.since.map_or(true, |t| entry.timestamp >= t)
            && self.until.map_or(true, |t| entry.timestamp < t)
    }
}

// ============================================================================
// 回滚记录
// ============================================================================

/// 回滚状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RollbackStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RollbackStatus::Completed | RollbackStatus::Failed)
    }

    pub fn can_transition_to(&self, next: RollbackStatus) -> bool {
        matches!(
            (self, next),
            (RollbackStatus::Pending, RollbackStatus::InProgress)
                | (RollbackStatus::Pending, RollbackStatus::Failed)
                | (RollbackStatus::InProgress, RollbackStatus::Completed)
                | (RollbackStatus::InProgress, RollbackStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackStatus::Pending => "pending",
            RollbackStatus::InProgress => "in_progress",
            RollbackStatus::Completed => "completed",
            RollbackStatus::Failed => "failed",
        }
    }
}

/// 回滚记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub rollback_id: String,
    pub installation_id: String,
    pub module_id: String,
    pub tenant_id: String,
    /// 失败尝试的目标版本
    pub from_version: Option<String>,
    /// 回滚后恢复到的版本，首次安装失败时为空
    pub to_version: Option<String>,
    pub reason: String,
    pub status: RollbackStatus,
    pub backup_ref: String,
    pub restore_ref: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// 开始回滚时提交的信息
#[derive(Debug, Clone)]
pub struct RollbackRequest {
    pub installation_id: String,
    pub module_id: String,
    pub tenant_id: String,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub reason: String,
    pub backup_ref: String,
}

/// 回滚查询过滤条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackFilter {
    pub module_id: Option<String>,
    pub tenant_id: Option<String>,
    pub status: Option<RollbackStatus>,
}

impl RollbackFilter {
    pub fn module(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn status(mut self, status: RollbackStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn matches(&self, record: &RollbackRecord) -> bool {
        self.module_id.as_ref().map_or(true, |m| *m == record.module_id)
            && self.tenant_id.as_ref().map_or(true, |t| *t == record.tenant_id)
            && self.status.map_or(true, |s| s == record.status)
    }
}

// ============================================================================
// 跟踪器
// ============================================================================

/// 安装跟踪器
pub struct InstallationTracker {
    config: TrackerConfig,
    progress: RwLock<HashMap<String, InstallationProgress>>,
    history: RwLock<Vec<InstallationHistoryEntry>>,
    /// 按创建顺序保存
    rollbacks: RwLock<Vec<RollbackRecord>>,
    analytics_cache: TtlCache<AnalyticsQuery, InstallationAnalytics>,
    events: EventBus,
}

impl InstallationTracker {
    pub fn new(config: TrackerConfig, events: EventBus) -> Self {
        let analytics_cache = TtlCache::new(
            config.analytics_cache_capacity,
            Duration::from_secs(config.analytics_cache_ttl_secs),
        );
        Self {
            config,
            progress: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            rollbacks: RwLock::new(Vec::new()),
            analytics_cache,
            events,
        }
    }

    /// 事件总线
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ==================== 进度 ====================

    /// 登记新的安装
    pub async fn start(&self, progress: &InstallationProgress) {
        self.progress
            .write()
            .await
            .insert(progress.installation_id.clone(), progress.clone());
        debug!(
            installation_id = %progress.installation_id,
            module_id = %progress.module_id,
            tenant_id = %progress.tenant_id,
            action = %progress.action,
            "安装已登记"
        );
        self.events
            .publish(Event::lifecycle(
                lifecycle_events::INSTALLATION_STARTED,
                progress_payload(progress),
            ))
            .await;
    }

    /// 记录进度更新
    ///
    /// 百分比被钳制为不小于已记录的值。未登记的安装 ID 被忽略。
    pub async fn record_progress(&self, update: &InstallationProgress) -> Option<InstallationProgress> {
        let stored = {
            let mut progress = self.progress.write().await;
            let entry = progress.get_mut(&update.installation_id)?;
            let percent = entry.percent.max(update.percent.min(100));
            *entry = update.clone();
            entry.percent = percent;
            entry.clone()
        };

        self.events
            .publish(Event::lifecycle(
                lifecycle_events::INSTALLATION_PROGRESS,
                progress_payload(&stored),
            ))
            .await;
        Some(stored)
    }

    /// 查询进度
    pub async fn get_progress(&self, installation_id: &str) -> Option<InstallationProgress> {
        self.progress.read().await.get(installation_id).cloned()
    }

    /// 租户下进行中的安装，按开始时间排序
    pub async fn active_installations(&self, tenant_id: &str) -> Vec<InstallationProgress> {
        let mut active: Vec<InstallationProgress> = self
            .progress
            .read()
            .await
            .values()
            .filter(|p| p.tenant_id == tenant_id && !p.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    /// 结束安装：移除进度并追加历史
    pub async fn finalize(
        &self,
        installation_id: &str,
        outcome: InstallationOutcome,
    ) -> Option<InstallationHistoryEntry> {
        let progress = self.progress.write().await.remove(installation_id)?;

        let entry = InstallationHistoryEntry {
            id: prefixed_id(HISTORY_PREFIX),
            installation_id: Some(installation_id.to_string()),
            module_id: progress.module_id.clone(),
            tenant_id: progress.tenant_id.clone(),
            action: progress.action,
            from_version: outcome.from_version,
            to_version: outcome.to_version,
            status: outcome.status,
            timestamp: Utc::now(),
            duration_ms: progress.elapsed_ms(),
            rollback_id: outcome.rollback_id,
            error: outcome.error,
        };
        self.append(entry.clone()).await;

        let event_type = match entry.status {
            HistoryStatus::Success | HistoryStatus::Partial => lifecycle_events::INSTALLATION_COMPLETED,
            HistoryStatus::Failed | HistoryStatus::Cancelled => lifecycle_events::INSTALLATION_FAILED,
        };
        info!(
            installation_id,
            module_id = %entry.module_id,
            tenant_id = %entry.tenant_id,
            action = %entry.action,
            status = ?entry.status,
            duration_ms = entry.duration_ms,
            "安装已结束"
        );
        self.events
            .publish(Event::lifecycle(
                event_type,
                json!({
                    "installation_id": installation_id,
                    "module_id": entry.module_id,
                    "tenant_id": entry.tenant_id,
                    "action": entry.action,
                    "status": entry.status,
                    "percent": progress.percent,
                    "from_version": entry.from_version,
                    "to_version": entry.to_version,
                    "rollback_id": entry.rollback_id,
                    "error": entry.error,
                    "duration_ms": entry.duration_ms,
                }),
            ))
            .await;
        Some(entry)
    }

    async fn append(&self, entry: InstallationHistoryEntry) {
        self.history.write().await.push(entry);
        self.analytics_cache.clear();
    }

    // ==================== 历史 ====================

    /// 查询 (模块, 租户) 的历史，最新的在前
    pub async fn get_history(
        &self,
        module_id: &str,
        tenant_id: &str,
        filter: &HistoryFilter,
    ) -> Vec<InstallationHistoryEntry> {
        let history = self.history.read().await;
        let matched = history
            .iter()
            .rev()
            .filter(|e| e.module_id == module_id && e.tenant_id == tenant_id && filter.matches(e))
            .skip(filter.offset);
        match filter.limit {
            Some(limit) => matched.take(limit).cloned().collect(),
            None => matched.cloned().collect(),
        }
    }

    /// 历史条目总数
    pub async fn history_len(&self) -> usize {
        self.history.read().await.len()
    }

    // ==================== 回滚 ====================

    /// 创建回滚记录，状态为 pending
    pub async fn begin_rollback(&self, request: RollbackRequest) -> RollbackRecord {
        let record = RollbackRecord {
            rollback_id: prefixed_id(ROLLBACK_PREFIX),
            installation_id: request.installation_id,
            module_id: request.module_id,
            tenant_id: request.tenant_id,
            from_version: request.from_version,
            to_version: request.to_version,
            reason: request.reason,
            status: RollbackStatus::Pending,
            backup_ref: request.backup_ref,
            restore_ref: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.rollbacks.write().await.push(record.clone());

        warn!(
            rollback_id = %record.rollback_id,
            installation_id = %record.installation_id,
            module_id = %record.module_id,
            tenant_id = %record.tenant_id,
            reason = %record.reason,
            "开始回滚"
        );
        self.events
            .publish(Event::lifecycle(
                lifecycle_events::ROLLBACK_STARTED,
                rollback_payload(&record),
            ))
            .await;
        record
    }

    /// 推进回滚状态
    ///
    /// 非法迁移被忽略并返回 `None`。进入终止状态时追加一条回滚历史。
    pub async fn update_rollback(
        &self,
        rollback_id: &str,
        status: RollbackStatus,
        restore_ref: Option<String>,
        error: Option<String>,
    ) -> Option<RollbackRecord> {
        let record = {
            let mut rollbacks = self.rollbacks.write().await;
            let record = rollbacks.iter_mut().find(|r| r.rollback_id == rollback_id)?;
            if !record.status.can_transition_to(status) {
                warn!(
                    rollback_id,
                    from = record.status.as_str(),
                    to = status.as_str(),
                    "忽略非法的回滚状态迁移"
                );
                return None;
            }
            record.status = status;
            if restore_ref.is_some() {
                record.restore_ref = restore_ref;
            }
            if error.is_some() {
                record.error = error;
            }
            if status.is_terminal() {
                record.completed_at = Some(Utc::now());
            }
            record.clone()
        };

        if status.is_terminal() {
            let duration_ms = record
                .completed_at
                .map(|end| (end - record.created_at).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            self.append(InstallationHistoryEntry {
                id: prefixed_id(HISTORY_PREFIX),
                installation_id: Some(record.installation_id.clone()),
                module_id: record.module_id.clone(),
                tenant_id: record.tenant_id.clone(),
                action: InstallAction::Rollback,
                from_version: record.from_version.clone(),
                to_version: record.to_version.clone(),
                status: if status == RollbackStatus::Completed {
                    HistoryStatus::Success
                } else {
                    HistoryStatus::Failed
                },
                timestamp: Utc::now(),
                duration_ms,
                rollback_id: Some(record.rollback_id.clone()),
                error: record.error.clone(),
            })
            .await;
        }

        match status {
            RollbackStatus::Completed => {
                info!(rollback_id, module_id = %record.module_id, "回滚完成");
                self.events
                    .publish(Event::lifecycle(
                        lifecycle_events::ROLLBACK_COMPLETED,
                        rollback_payload(&record),
                    ))
                    .await;
            }
            RollbackStatus::Failed => {
                warn!(
                    rollback_id,
                    module_id = %record.module_id,
                    tenant_id = %record.tenant_id,
                    error = record.error.as_deref().unwrap_or_default(),
                    "回滚记录标记为失败"
                );
                self.events
                    .publish(
                        Event::lifecycle(lifecycle_events::ROLLBACK_FAILED, rollback_payload(&record))
                            .with_metadata("alert", json!(true)),
                    )
                    .await;
            }
            _ => {}
        }
        Some(record)
    }

    /// 查询单条回滚记录
    pub async fn get_rollback(&self, rollback_id: &str) -> Option<RollbackRecord> {
        self.rollbacks
            .read()
            .await
            .iter()
            .find(|r| r.rollback_id == rollback_id)
            .cloned()
    }

    /// 查询回滚记录，最新的在前
    pub async fn get_rollbacks(&self, filter: &RollbackFilter) -> Vec<RollbackRecord> {
        self.rollbacks
            .read()
            .await
            .iter()
            .rev()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    // ==================== 统计 ====================

    /// 计算统计，结果按查询条件缓存
    pub async fn analytics(&self, query: &AnalyticsQuery) -> InstallationAnalytics {
        if let Some(cached) = self.analytics_cache.get(query) {
            return cached;
        }

        let computed = {
            let history = self.history.read().await;
            analytics::compute(
                &history,
                query,
                Utc::now(),
                self.config.trend_days,
                self.config.common_issue_limit,
            )
        };
        self.analytics_cache.put(query.clone(), computed.clone());
        computed
    }

    /// 统计缓存状态
    pub fn analytics_cache_stats(&self) -> CacheStats {
        self.analytics_cache.stats()
    }
}

impl Default for InstallationTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default(), EventBus::new())
    }
}

/// 共享的跟踪器
pub type SharedTracker = Arc<InstallationTracker>;

fn progress_payload(progress: &InstallationProgress) -> serde_json::Value {
    json!({
        "installation_id": progress.installation_id,
        "module_id": progress.module_id,
        "tenant_id": progress.tenant_id,
        "action": progress.action,
        "status": progress.status,
        "percent": progress.percent,
        "current_step": progress.current_step,
        "estimated_completion": progress.estimated_completion,
    })
}

fn rollback_payload(record: &RollbackRecord) -> serde_json::Value {
    json!({
        "rollback_id": record.rollback_id,
        "installation_id": record.installation_id,
        "module_id": record.module_id,
        "tenant_id": record.tenant_id,
        "from_version": record.from_version,
        "to_version": record.to_version,
        "status": record.status,
        "reason": record.reason,
        "error": record.error,
    })
}
