//! 事件总线
//!
//! 安装核心通过总线把生命周期事件推送给通知/分析协作方。
//!
//! - 按事件类型订阅，支持 `installation.*` 这样的通配符与数据字段过滤
//! - 单个订阅者的 panic 或超时不影响其他订阅者
//! - 发布方不等待订阅者处理完成（`publish`），也可以等待（`publish_sync`）

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::events::event::{matches_pattern, Event, EventFilter};
use crate::utils::{generate_id, CoreError, Result};

/// 默认订阅者处理超时时间（秒）
const DEFAULT_HANDLER_TIMEOUT_SECS: u64 = 5;

/// 事件回调函数类型
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

#[derive(Clone)]
struct SubscriptionEntry {
    subscription_id: String,
    subscriber_id: String,
    /// 订阅的事件类型（支持通配符）
    pattern: String,
    filter: Option<EventFilter>,
    callback: EventCallback,
    enabled: bool,
}

impl SubscriptionEntry {
    fn matches(&self, event: &Event) -> bool {
        self.enabled
            && matches_pattern(&self.pattern, &event.event_type)
            && self.filter.as_ref().map_or(true, |f| f.matches(event))
    }
}

/// 分发统计信息
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    pub total_dispatched: u64,
    pub successful: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub last_dispatch_at: Option<DateTime<Utc>>,
}

impl DispatchStats {
    fn record(&mut self, result: &DispatchResult) {
        self.total_dispatched += 1;
        self.last_dispatch_at = Some(Utc::now());
        match result {
            DispatchResult::Success => self.successful += 1,
            DispatchResult::Failed(_) => self.failed += 1,
            DispatchResult::Timeout => self.timeouts += 1,
        }
    }
}

/// 事件总线配置
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// 订阅者处理超时时间
    pub handler_timeout: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(DEFAULT_HANDLER_TIMEOUT_SECS),
        }
    }
}

/// 事件总线
#[derive(Clone)]
pub struct EventBus {
    /// 订阅 ID -> 订阅条目
    subscriptions: Arc<RwLock<HashMap<String, SubscriptionEntry>>>,
    stats: Arc<RwLock<DispatchStats>>,
    config: EventBusConfig,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    pub fn with_config(config: EventBusConfig) -> Self {
        debug!(timeout = ?config.handler_timeout, "创建事件总线");
        Self {
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(DispatchStats::default())),
            config,
        }
    }

    /// 订阅事件
    ///
    /// 返回订阅 ID，用于后续取消订阅。
    pub async fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        pattern: impl Into<String>,
        filter: Option<EventFilter>,
        callback: EventCallback,
    ) -> Result<String> {
        let entry = SubscriptionEntry {
            subscription_id: generate_id(),
            subscriber_id: subscriber_id.into(),
            pattern: pattern.into(),
            filter,
            callback,
            enabled: true,
        };
        let subscription_id = entry.subscription_id.clone();

        info!(
            subscription_id = %subscription_id,
            subscriber_id = %entry.subscriber_id,
            pattern = %entry.pattern,
            "事件订阅成功"
        );
        self.subscriptions
            .write()
            .await
            .insert(subscription_id.clone(), entry);
        Ok(subscription_id)
    }

    /// 取消订阅
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let removed = self.subscriptions.write().await.remove(subscription_id);
        match removed {
            Some(entry) => {
                info!(
                    subscription_id,
                    subscriber_id = %entry.subscriber_id,
                    "取消订阅成功"
                );
                Ok(())
            }
            None => Err(CoreError::SubscriptionNotFound(subscription_id.to_string())),
        }
    }

    /// 取消某个订阅者的所有订阅，返回取消的数量
    pub async fn unsubscribe_all(&self, subscriber_id: &str) -> usize {
        let mut subscriptions = self.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|_, entry| entry.subscriber_id != subscriber_id);
        before - subscriptions.len()
    }

    /// 启用或禁用订阅
    pub async fn set_subscription_enabled(&self, subscription_id: &str, enabled: bool) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        let entry = subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| CoreError::SubscriptionNotFound(subscription_id.to_string()))?;
        entry.enabled = enabled;
        debug!(subscription_id, enabled, "订阅状态已修改");
        Ok(())
    }

    /// 异步发布事件，不等待处理完成
    ///
    /// 返回匹配的订阅者数量。
    pub async fn publish(&self, event: Event) -> usize {
        let matching = self.find_matching(&event).await;
        trace!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            subscribers = matching.len(),
            "发布事件"
        );

        let count = matching.len();
        for entry in matching {
            let event = event.clone();
            let stats = Arc::clone(&self.stats);
            let limit = self.config.handler_timeout;
            tokio::spawn(async move {
                let result = invoke_with_timeout(entry.callback, event, limit).await;
                log_result(&entry.subscription_id, &result);
                stats.write().await.record(&result);
            });
        }
        count
    }

    /// 同步发布事件，等待所有订阅者处理完成
    ///
    /// 返回 `(成功数, 失败数, 超时数)`。
    pub async fn publish_sync(&self, event: Event) -> (usize, usize, usize) {
        let matching = self.find_matching(&event).await;
        if matching.is_empty() {
            return (0, 0, 0);
        }

        let limit = self.config.handler_timeout;
        let tasks = matching.into_iter().map(|entry| {
            let event = event.clone();
            async move {
                let result = invoke_with_timeout(entry.callback, event, limit).await;
                log_result(&entry.subscription_id, &result);
                result
            }
        });
        let results = futures::future::join_all(tasks).await;

        let mut counts = (0, 0, 0);
        let mut stats = self.stats.write().await;
        for result in &results {
            stats.record(result);
            match result {
                DispatchResult::Success => counts.0 += 1,
                DispatchResult::Failed(_) => counts.1 += 1,
                DispatchResult::Timeout => counts.2 += 1,
            }
        }
        counts
    }

    async fn find_matching(&self, event: &Event) -> Vec<SubscriptionEntry> {
        self.subscriptions
            .read()
            .await
            .values()
            .filter(|entry| entry.matches(event))
            .cloned()
            .collect()
    }

    /// 总订阅数量
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// 是否有订阅者会收到该类型的事件
    pub async fn has_subscribers(&self, event_type: &str) -> bool {
        self.subscriptions
            .read()
            .await
            .values()
            .any(|entry| entry.enabled && matches_pattern(&entry.pattern, event_type))
    }

    /// 分发统计
    pub async fn stats(&self) -> DispatchStats {
        self.stats.read().await.clone()
    }

    pub async fn reset_stats(&self) {
        *self.stats.write().await = DispatchStats::default();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
enum DispatchResult {
    Success,
    Failed(String),
    Timeout,
}

fn log_result(subscription_id: &str, result: &DispatchResult) {
    match result {
        DispatchResult::Success => trace!(subscription_id, "事件处理成功"),
        DispatchResult::Failed(e) => warn!(subscription_id, error = %e, "事件处理失败"),
        DispatchResult::Timeout => warn!(subscription_id, "事件处理超时"),
    }
}

/// 带超时的回调调用
///
/// 回调是同步函数，在阻塞线程池中执行并捕获 panic。超时后不再等待其结果。
async fn invoke_with_timeout(callback: EventCallback, event: Event, limit: Duration) -> DispatchResult {
    let result = timeout(limit, async move {
        tokio::task::spawn_blocking(move || {
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || callback(event)))
        })
        .await
    })
    .await;

    match result {
        Ok(Ok(Ok(()))) => DispatchResult::Success,
        Ok(Ok(Err(_))) => DispatchResult::Failed("回调函数 panic".to_string()),
        Ok(Err(e)) => DispatchResult::Failed(format!("任务执行失败: {}", e)),
        Err(_) => DispatchResult::Timeout,
    }
}
