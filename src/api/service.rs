//! InstallerService
//!
//! 安装核心的对外接口。把目录、存储、传输与钩子组装成一个服务，提供：
//!
//! - 依赖解析：生成安装计划
//! - 生命周期：安装、更新、卸载
//! - 跟踪查询：进度、历史、回滚记录、统计
//! - 事件订阅：生命周期事件
//!
//! # 示例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chips_installer::{InstallerService, InstallOptions};
//! use chips_installer::module::InMemoryCatalog;
//! use chips_installer::installer::InMemoryTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = Arc::new(InMemoryCatalog::new());
//!     catalog.add("auth", "1.0.0", &[])?;
//!
//!     let service = InstallerService::builder()
//!         .catalog(catalog)
//!         .transport(Arc::new(InMemoryTransport::new()))
//!         .build()?;
//!
//!     let result = service
//!         .install("auth", "tenant-a", None, &InstallOptions::default())
//!         .await;
//!     println!("安装结果: {}", result.success);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::core::InstallerConfig;
use crate::events::{EventBus, EventBusConfig, EventCallback, EventFilter};
use crate::installer::{
    InMemoryInstallationStore, InstallHooks, InstallOptions, InstallationOrchestrator,
    InstallationProgress, InstallationRecord, InstallationResult, InstallationStore, NoopHooks,
    PackageTransport, UninstallOptions, UninstallResult, UpdateOptions, UpdateResult,
};
use crate::module::{CachedCatalog, ModuleCatalog, ResolutionPlan, ResolveOptions};
use crate::tracker::{
    AnalyticsQuery, HistoryFilter, InstallationAnalytics, InstallationHistoryEntry,
    InstallationTracker, RollbackFilter, RollbackRecord,
};
use crate::utils::{CoreError, Result};

// ============================================================================
// 服务
// ============================================================================

/// 安装服务
pub struct InstallerService {
    orchestrator: InstallationOrchestrator,
    tracker: Arc<InstallationTracker>,
    events: EventBus,
    cached_catalog: Option<Arc<CachedCatalog>>,
}

impl InstallerService {
    /// 创建构建器
    pub fn builder() -> InstallerServiceBuilder {
        InstallerServiceBuilder::new()
    }

    /// 配置
    pub fn config(&self) -> &InstallerConfig {
        self.orchestrator.config()
    }

    /// 跟踪器
    pub fn tracker(&self) -> &Arc<InstallationTracker> {
        &self.tracker
    }

    /// 事件总线
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ==================== 依赖解析 ====================

    /// 解析模块的依赖
    ///
    /// 选项为 `None` 时使用配置中的默认值。冲突与循环记录在计划中，
    /// 只有模块或版本不存在时返回错误。
    pub async fn resolve(
        &self,
        module_id: &str,
        version: Option<&str>,
        options: Option<&ResolveOptions>,
    ) -> Result<ResolutionPlan> {
        self.orchestrator.resolve(module_id, version, options).await
    }

    /// 失效目录缓存中某个模块的条目
    ///
    /// 未启用缓存时无操作。
    pub fn invalidate_catalog(&self, module_id: &str) {
        if let Some(cached) = &self.cached_catalog {
            debug!(module_id, "目录缓存已失效");
            cached.invalidate(module_id);
        }
    }

    // ==================== 生命周期 ====================

    /// 安装模块
    pub async fn install(
        &self,
        module_id: &str,
        tenant_id: &str,
        version: Option<&str>,
        options: &InstallOptions,
    ) -> InstallationResult {
        self.orchestrator
            .install(module_id, tenant_id, version, options)
            .await
    }

    /// 更新模块
    pub async fn update(
        &self,
        module_id: &str,
        tenant_id: &str,
        target_version: &str,
        options: &UpdateOptions,
    ) -> UpdateResult {
        self.orchestrator
            .update(module_id, tenant_id, target_version, options)
            .await
    }

    /// 卸载模块
    pub async fn uninstall(
        &self,
        module_id: &str,
        tenant_id: &str,
        options: &UninstallOptions,
    ) -> UninstallResult {
        self.orchestrator.uninstall(module_id, tenant_id, options).await
    }

    // ==================== 查询 ====================

    /// 查询进行中安装的进度
    pub async fn get_progress(&self, installation_id: &str) -> Option<InstallationProgress> {
        self.tracker.get_progress(installation_id).await
    }

    /// 租户下进行中的安装
    pub async fn active_installations(&self, tenant_id: &str) -> Vec<InstallationProgress> {
        self.tracker.active_installations(tenant_id).await
    }

    /// 查询历史，最新的在前
    pub async fn get_history(
        &self,
        module_id: &str,
        tenant_id: &str,
        filter: &HistoryFilter,
    ) -> Vec<InstallationHistoryEntry> {
        self.tracker.get_history(module_id, tenant_id, filter).await
    }

    /// 查询回滚记录，最新的在前
    pub async fn get_rollbacks(&self, filter: &RollbackFilter) -> Vec<RollbackRecord> {
        self.tracker.get_rollbacks(filter).await
    }

    pub async fn get_rollback(&self, rollback_id: &str) -> Option<RollbackRecord> {
        self.tracker.get_rollback(rollback_id).await
    }

    /// 安装统计
    pub async fn analytics(&self, query: &AnalyticsQuery) -> InstallationAnalytics {
        self.tracker.analytics(query).await
    }

    /// 租户已安装的模块
    pub async fn installed_modules(&self, tenant_id: &str) -> Result<Vec<InstallationRecord>> {
        let mut records = self.orchestrator.store().list(tenant_id).await?;
        records.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        Ok(records)
    }

    // ==================== 事件 ====================

    /// 订阅生命周期事件
    ///
    /// `pattern` 支持精确类型、`*` 与 `installation.*` 形式的前缀通配。
    pub async fn subscribe(
        &self,
        subscriber_id: &str,
        pattern: &str,
        handler: EventCallback,
    ) -> Result<String> {
        self.events.subscribe(subscriber_id, pattern, None, handler).await
    }

    /// 订阅事件（带过滤器）
    pub async fn subscribe_with_filter(
        &self,
        subscriber_id: &str,
        pattern: &str,
        filter: EventFilter,
        handler: EventCallback,
    ) -> Result<String> {
        self.events
            .subscribe(subscriber_id, pattern, Some(filter), handler)
            .await
    }

    /// 取消订阅
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.events.unsubscribe(subscription_id).await
    }
}

// ============================================================================
// 构建器
// ============================================================================

/// 安装服务构建器
///
/// 目录与传输必须提供；存储默认为内存存储，钩子默认为空操作。
#[derive(Default)]
pub struct InstallerServiceBuilder {
    config: InstallerConfig,
    catalog: Option<Arc<dyn ModuleCatalog>>,
    store: Option<Arc<dyn InstallationStore>>,
    transport: Option<Arc<dyn PackageTransport>>,
    hooks: Option<Arc<dyn InstallHooks>>,
    event_config: EventBusConfig,
}

impl InstallerServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: InstallerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn ModuleCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn store(mut self, store: Arc<dyn InstallationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn PackageTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn InstallHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// 事件处理超时
    pub fn event_handler_timeout(mut self, timeout: Duration) -> Self {
        self.event_config.handler_timeout = timeout;
        self
    }

    /// 构建服务
    ///
    /// # 错误
    ///
    /// 缺少目录或传输、配置校验失败时返回错误。
    pub fn build(self) -> Result<InstallerService> {
        info!("初始化安装服务 v{}", crate::VERSION);

        let catalog = self
            .catalog
            .ok_or_else(|| CoreError::InitFailed("未提供模块目录".to_string()))?;
        let transport = self
            .transport
            .ok_or_else(|| CoreError::InitFailed("未提供制品传输".to_string()))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryInstallationStore::new()));
        let hooks = self.hooks.unwrap_or_else(|| Arc::new(NoopHooks));

        // 1. 目录缓存
        let resolver_config = &self.config.resolver;
        let (catalog, cached_catalog) = if resolver_config.catalog_cache_ttl_secs > 0 {
            let cached = Arc::new(CachedCatalog::new(
                catalog,
                resolver_config.catalog_cache_capacity,
                Duration::from_secs(resolver_config.catalog_cache_ttl_secs),
            ));
            let catalog: Arc<dyn ModuleCatalog> = cached.clone();
            (catalog, Some(cached))
        } else {
            (catalog, None)
        };
        debug!(cached = cached_catalog.is_some(), "模块目录初始化完成");

        // 2. 事件总线与跟踪器
        let events = EventBus::with_config(self.event_config);
        let tracker = Arc::new(InstallationTracker::new(
            self.config.tracker.clone(),
            events.clone(),
        ));
        debug!("跟踪器初始化完成");

        // 3. 编排器
        let orchestrator = InstallationOrchestrator::new(
            self.config,
            catalog,
            store,
            transport,
            hooks,
            Arc::clone(&tracker),
        )?;

        info!(
            system_version = %orchestrator.config().system_version,
            "安装服务初始化完成"
        );
        Ok(InstallerService {
            orchestrator,
            tracker,
            events,
            cached_catalog,
        })
    }
}
