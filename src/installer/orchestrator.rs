//! 安装编排器
//!
//! 驱动每个 (模块, 租户) 的安装、更新与卸载状态机：
//!
//! ```text
//! pending → validating → downloading → installing → configuring → [migrating] → testing → completed
//! ```
//!
//! - 下载与校验完成之前不修改任何状态，失败直接中止，调用方可以原样重试
//! - 第一个破坏性步骤之前创建备份，之后的任何失败（含超时）都从备份恢复
//! - 同一 (模块, 租户) 同时只允许一个操作，冲突立即返回 `InstallationInProgress`
//! - 公开操作从不返回 `Err`，失败体现在结果的 `errors` 中

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::InstallerConfig;
use crate::installer::backup::BackupManager;
use crate::installer::hooks::{HookContext, HookOutcome, InstallHooks};
use crate::installer::lock::{with_step_timeout, KeyGuard, KeyLockTable};
use crate::installer::state::{
    InstallAction, InstallKey, InstallOptions, InstallationProgress, InstallationResult,
    InstallationStatus, InstalledDependency, UninstallOptions, UninstallResult, UpdateOptions,
    UpdateResult,
};
use crate::installer::store::{DependencyVersion, InstallationRecord, InstallationStore};
use crate::installer::transport::{ArtifactRef, PackageTransport};
use crate::module::catalog::ModuleCatalog;
use crate::module::dependency::{DependencyResolver, ResolutionPlan, ResolveOptions, ResolvedStep};
use crate::module::metadata::ModuleVersionInfo;
use crate::module::version::{SemanticVersion, VersionConstraint};
use crate::tracker::{
    HistoryStatus, InstallationOutcome, InstallationTracker, RollbackRequest, RollbackStatus,
};
use crate::utils::id::{prefixed_id, INSTALLATION_PREFIX};
use crate::utils::{validate_identifier, CoreError, OperationError, Result};

// ============================================================================
// 内部类型
// ============================================================================

/// 一次操作尝试，持有进度并同步给跟踪器
struct Attempt {
    progress: InstallationProgress,
    tracker: Arc<InstallationTracker>,
    from_version: Option<String>,
    to_version: Option<String>,
}

impl Attempt {
    async fn start(
        tracker: &Arc<InstallationTracker>,
        installation_id: &str,
        module_id: &str,
        tenant_id: &str,
        action: InstallAction,
    ) -> Self {
        let progress = InstallationProgress::new(installation_id, module_id, tenant_id, action);
        tracker.start(&progress).await;
        Self {
            progress,
            tracker: Arc::clone(tracker),
            from_version: None,
            to_version: None,
        }
    }

    fn id(&self) -> &str {
        &self.progress.installation_id
    }

    fn module_id(&self) -> &str {
        &self.progress.module_id
    }

    fn tenant_id(&self) -> &str {
        &self.progress.tenant_id
    }

    async fn advance(&mut self, status: InstallationStatus) {
        if !self.progress.status.can_transition_to(status) {
            warn!(
                installation_id = %self.progress.installation_id,
                from = %self.progress.status,
                to = %status,
                "忽略非法状态迁移"
            );
            return;
        }
        debug!(
            installation_id = %self.progress.installation_id,
            module_id = %self.progress.module_id,
            status = %status,
            "状态迁移"
        );
        self.progress.advance(status, Utc::now());
        self.tracker.record_progress(&self.progress).await;
    }

    fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        debug!(installation_id = %self.progress.installation_id, warning = %warning, "警告");
        self.progress.warnings.push(warning);
    }

    async fn succeed(self, status: HistoryStatus) {
        let outcome = InstallationOutcome::success(self.from_version.clone(), self.to_version.clone())
            .with_status(status);
        self.tracker.finalize(&self.progress.installation_id, outcome).await;
    }

    async fn fail(mut self, failure: &StepFailure) {
        self.progress.error = Some(failure.error.to_string());
        if !self.progress.status.is_terminal() {
            self.advance(InstallationStatus::Failed).await;
        }
        let outcome = InstallationOutcome::failed(
            self.from_version.clone(),
            self.to_version.clone(),
            failure.error.to_string(),
        )
        .with_rollback(failure.rollback_id.clone());
        self.tracker.finalize(&self.progress.installation_id, outcome).await;
    }
}

/// 步骤失败
struct StepFailure {
    error: CoreError,
    /// 已执行的回滚
    rollback_id: Option<String>,
    /// 回滚本身失败
    rollback_error: Option<CoreError>,
}

impl StepFailure {
    fn errors(&self) -> Vec<OperationError> {
        let mut errors = vec![OperationError::from(&self.error)];
        if let Some(rollback_error) = &self.rollback_error {
            errors.push(OperationError::from(rollback_error));
        }
        errors
    }
}

impl From<CoreError> for StepFailure {
    fn from(error: CoreError) -> Self {
        Self {
            error,
            rollback_id: None,
            rollback_error: None,
        }
    }
}

/// 要落地的一个模块版本
struct Target<'a> {
    module_id: &'a str,
    tenant_id: &'a str,
    info: &'a ModuleVersionInfo,
    /// 当前已安装的记录
    previous: Option<&'a InstallationRecord>,
    configuration: HashMap<String, serde_json::Value>,
    dependency_versions: Vec<DependencyVersion>,
    /// 先移除当前版本的文件（数据保留）
    replace_existing: bool,
    /// 数据迁移：起始版本与跨越的破坏性变更
    migration: Option<(SemanticVersion, Vec<String>)>,
    skip_tests: bool,
}

/// 计划中依赖的落地方式
#[derive(Default)]
struct DependencySet {
    /// 需要新安装的依赖，按安装顺序
    to_install: Vec<ResolvedStep>,
    /// 每个依赖最终使用的版本
    versions: HashMap<String, SemanticVersion>,
    /// 本次新安装成功的依赖
    newly_installed: Vec<(String, SemanticVersion)>,
    /// 有可选依赖安装失败
    partial: bool,
}

impl DependencySet {
    fn is_new(&self, module_id: &str) -> bool {
        self.newly_installed.iter().any(|(m, _)| m == module_id)
    }

    /// `module_id` 的直接依赖及其版本
    fn direct_versions(&self, plan: &ResolutionPlan, module_id: &str) -> Vec<DependencyVersion> {
        plan.edges
            .iter()
            .filter(|e| e.from_module == module_id)
            .filter_map(|e| {
                self.versions.get(&e.to_module).map(|v| DependencyVersion {
                    module_id: e.to_module.clone(),
                    version: v.clone(),
                    required: e.kind.is_blocking(),
                })
            })
            .collect()
    }

    fn summary(&self, plan: &ResolutionPlan) -> Vec<InstalledDependency> {
        plan.dependencies()
            .filter_map(|step| {
                self.versions.get(&step.module_id).map(|v| InstalledDependency {
                    module_id: step.module_id.clone(),
                    version: v.to_string(),
                    newly_installed: self.is_new(&step.module_id),
                })
            })
            .collect()
    }
}

fn check_hook(step: &str, outcome: HookOutcome) -> Result<()> {
    if outcome.success {
        Ok(())
    } else {
        Err(CoreError::StepFailed {
            step: step.to_string(),
            reason: outcome.error.unwrap_or_else(|| "未知错误".to_string()),
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

// ============================================================================
// 编排器
// ============================================================================

/// 安装编排器
pub struct InstallationOrchestrator {
    config: InstallerConfig,
    system_version: SemanticVersion,
    catalog: Arc<dyn ModuleCatalog>,
    resolver: DependencyResolver,
    store: Arc<dyn InstallationStore>,
    transport: Arc<dyn PackageTransport>,
    hooks: Arc<dyn InstallHooks>,
    locks: KeyLockTable,
    backups: BackupManager,
    tracker: Arc<InstallationTracker>,
}

impl InstallationOrchestrator {
    /// 创建编排器
    ///
    /// # 错误
    ///
    /// 配置校验失败时返回错误。
    pub fn new(
        config: InstallerConfig,
        catalog: Arc<dyn ModuleCatalog>,
        store: Arc<dyn InstallationStore>,
        transport: Arc<dyn PackageTransport>,
        hooks: Arc<dyn InstallHooks>,
        tracker: Arc<InstallationTracker>,
    ) -> Result<Self> {
        config.validate()?;
        let system_version = config.parsed_system_version()?;
        Ok(Self {
            config,
            system_version,
            resolver: DependencyResolver::new(Arc::clone(&catalog)),
            catalog,
            backups: BackupManager::new(Arc::clone(&transport), Arc::clone(&store)),
            store,
            transport,
            hooks,
            locks: KeyLockTable::new(),
            tracker,
        })
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<InstallationTracker> {
        &self.tracker
    }

    pub fn store(&self) -> &Arc<dyn InstallationStore> {
        &self.store
    }

    /// 当前被占用的 (模块, 租户)
    pub fn busy_keys(&self) -> Vec<InstallKey> {
        self.locks.held_keys()
    }

    /// 解析依赖，选项缺省时使用配置中的默认值
    pub async fn resolve(
        &self,
        module_id: &str,
        version: Option<&str>,
        options: Option<&ResolveOptions>,
    ) -> Result<ResolutionPlan> {
        let defaults = ResolveOptions::from_config(&self.config.resolver);
        self.resolver
            .resolve(module_id, version, options.unwrap_or(&defaults))
            .await
    }

    // ==================== 安装 ====================

    /// 安装模块
    #[instrument(skip(self, options), fields(installation_id = tracing::field::Empty))]
    pub async fn install(
        &self,
        module_id: &str,
        tenant_id: &str,
        version: Option<&str>,
        options: &InstallOptions,
    ) -> InstallationResult {
        let started = Instant::now();
        let installation_id = prefixed_id(INSTALLATION_PREFIX);
        tracing::Span::current().record("installation_id", installation_id.as_str());
        let mut result = InstallationResult::new(&installation_id, module_id, tenant_id);

        let _guard = match self.acquire_root(module_id, tenant_id) {
            Ok(guard) => guard,
            Err(e) => {
                result.errors.push(e.into());
                result.duration_ms = elapsed_ms(started);
                return result;
            }
        };

        let mut attempt = Attempt::start(
            &self.tracker,
            &installation_id,
            module_id,
            tenant_id,
            InstallAction::Install,
        )
        .await;
        let outcome = self
            .run_install(&mut attempt, version, options, &mut result)
            .await;

        result.warnings = attempt.progress.warnings.clone();
        match outcome {
            Ok(status) => {
                result.success = true;
                info!(
                    module_id,
                    tenant_id,
                    version = result.installed_version.as_deref().unwrap_or_default(),
                    "模块安装完成"
                );
                attempt.succeed(status).await;
            }
            Err(failure) => {
                warn!(module_id, tenant_id, error = %failure.error, "模块安装失败");
                result.errors = failure.errors();
                result.rollback_ref = failure.rollback_id.clone();
                attempt.fail(&failure).await;
            }
        }
        result.duration_ms = elapsed_ms(started);
        result
    }

    async fn run_install(
        &self,
        attempt: &mut Attempt,
        version: Option<&str>,
        options: &InstallOptions,
        result: &mut InstallationResult,
    ) -> std::result::Result<HistoryStatus, StepFailure> {
        let module_id = attempt.module_id().to_string();
        let tenant_id = attempt.tenant_id().to_string();
        attempt.advance(InstallationStatus::Validating).await;

        let defaults = ResolveOptions::from_config(&self.config.resolver);
        let plan = self
            .plan(attempt, &module_id, version, options.resolve.as_ref().unwrap_or(&defaults))
            .await?;
        let existing = self.store.get(&tenant_id, &module_id).await?;
        attempt.from_version = existing.as_ref().map(|r| r.version.to_string());
        attempt.to_version = Some(plan.root_version.to_string());

        if let Some(record) = &existing {
            if record.version == plan.root_version && !options.force {
                attempt.warn(format!(
                    "模块 '{}' 已安装版本 {}，未做任何修改",
                    module_id, record.version
                ));
                result.installed_version = Some(record.version.to_string());
                attempt.advance(InstallationStatus::Completed).await;
                return Ok(HistoryStatus::Success);
            }
            if record.version != plan.root_version {
                attempt.warn(format!(
                    "模块 '{}' 已安装版本 {}，将替换为 {}",
                    module_id, record.version, plan.root_version
                ));
            }
        }

        let _dep_guards = self.acquire_dependencies(&plan, &tenant_id)?;
        let installed = self.store.list(&tenant_id).await?;
        let mut deps = self.prepare_dependencies(&plan, &installed)?;
        self.check_plan_compatibility(&module_id, &plan, &deps, &installed)?;

        self.install_dependencies(attempt, &plan, &mut deps, options.skip_tests)
            .await?;

        let target = Target {
            module_id: &module_id,
            tenant_id: &tenant_id,
            info: &plan.root_info,
            previous: existing.as_ref(),
            configuration: options.configuration.clone(),
            dependency_versions: deps.direct_versions(&plan, &module_id),
            replace_existing: existing.is_some(),
            migration: None,
            skip_tests: options.skip_tests,
        };
        match self.execute(attempt, &target).await {
            Ok(record) => {
                result.installed_version = Some(record.version.to_string());
                result.dependencies = deps.summary(&plan);
                Ok(if deps.partial {
                    HistoryStatus::Partial
                } else {
                    HistoryStatus::Success
                })
            }
            Err(failure) => {
                self.cleanup_dependencies(attempt, &deps).await;
                Err(failure)
            }
        }
    }

    // ==================== 更新 ====================

    /// 更新模块到目标版本
    #[instrument(skip(self, options), fields(installation_id = tracing::field::Empty))]
    pub async fn update(
        &self,
        module_id: &str,
        tenant_id: &str,
        target_version: &str,
        options: &UpdateOptions,
    ) -> UpdateResult {
        let started = Instant::now();
        let installation_id = prefixed_id(INSTALLATION_PREFIX);
        tracing::Span::current().record("installation_id", installation_id.as_str());
        let mut result = UpdateResult::new(&installation_id, module_id, tenant_id);

        let _guard = match self.acquire_root(module_id, tenant_id) {
            Ok(guard) => guard,
            Err(e) => {
                result.errors.push(e.into());
                result.duration_ms = elapsed_ms(started);
                return result;
            }
        };

        let mut attempt = Attempt::start(
            &self.tracker,
            &installation_id,
            module_id,
            tenant_id,
            InstallAction::Update,
        )
        .await;
        let outcome = self
            .run_update(&mut attempt, target_version, options, &mut result)
            .await;

        result.warnings = attempt.progress.warnings.clone();
        match outcome {
            Ok(status) => {
                result.success = true;
                info!(
                    module_id,
                    tenant_id,
                    from = result.from_version.as_deref().unwrap_or_default(),
                    to = result.to_version.as_deref().unwrap_or_default(),
                    "模块更新完成"
                );
                attempt.succeed(status).await;
            }
            Err(failure) => {
                warn!(module_id, tenant_id, error = %failure.error, "模块更新失败");
                result.errors = failure.errors();
                result.rollback_ref = failure.rollback_id.clone();
                attempt.fail(&failure).await;
            }
        }
        result.duration_ms = elapsed_ms(started);
        result
    }

    async fn run_update(
        &self,
        attempt: &mut Attempt,
        target_version: &str,
        options: &UpdateOptions,
        result: &mut UpdateResult,
    ) -> std::result::Result<HistoryStatus, StepFailure> {
        let module_id = attempt.module_id().to_string();
        let tenant_id = attempt.tenant_id().to_string();
        attempt.advance(InstallationStatus::Validating).await;

        let existing = self
            .store
            .get(&tenant_id, &module_id)
            .await?
            .ok_or_else(|| CoreError::ModuleNotInstalled {
                module: module_id.clone(),
                tenant: tenant_id.clone(),
            })?;
        attempt.from_version = Some(existing.version.to_string());
        result.from_version = attempt.from_version.clone();

        let defaults = ResolveOptions::from_config(&self.config.resolver);
        let plan = self
            .plan(
                attempt,
                &module_id,
                Some(target_version),
                options.resolve.as_ref().unwrap_or(&defaults),
            )
            .await?;
        let to = plan.root_version.clone();
        attempt.to_version = Some(to.to_string());
        result.to_version = attempt.to_version.clone();

        if to == existing.version {
            attempt.warn(format!("模块 '{}' 已是版本 {}，无需更新", module_id, to));
            attempt.advance(InstallationStatus::Completed).await;
            return Ok(HistoryStatus::Success);
        }
        if to < existing.version {
            attempt.warn(format!("模块 '{}' 将从 {} 降级到 {}", module_id, existing.version, to));
        }

        let breaking = self
            .breaking_changes_between(&module_id, &existing.version, &to)
            .await?;
        result.breaking_changes = breaking.clone();
        let migration = if breaking.is_empty() {
            None
        } else if options.skip_migration {
            attempt.warn(format!("跳过数据迁移，存在 {} 项破坏性变更", breaking.len()));
            None
        } else {
            Some((existing.version.clone(), breaking))
        };

        let _dep_guards = self.acquire_dependencies(&plan, &tenant_id)?;
        let installed = self.store.list(&tenant_id).await?;
        let mut deps = self.prepare_dependencies(&plan, &installed)?;
        self.check_plan_compatibility(&module_id, &plan, &deps, &installed)?;

        self.install_dependencies(attempt, &plan, &mut deps, options.skip_tests)
            .await?;

        let target = Target {
            module_id: &module_id,
            tenant_id: &tenant_id,
            info: &plan.root_info,
            previous: Some(&existing),
            configuration: options
                .configuration
                .clone()
                .unwrap_or_else(|| existing.configuration.clone()),
            dependency_versions: deps.direct_versions(&plan, &module_id),
            replace_existing: true,
            migration,
            skip_tests: options.skip_tests,
        };
        match self.execute(attempt, &target).await {
            Ok(_) => {
                result.dependencies = deps.summary(&plan);
                Ok(if deps.partial {
                    HistoryStatus::Partial
                } else {
                    HistoryStatus::Success
                })
            }
            Err(failure) => {
                self.cleanup_dependencies(attempt, &deps).await;
                Err(failure)
            }
        }
    }

    /// 两个版本之间（不含较低、含较高）声明的破坏性变更
    async fn breaking_changes_between(
        &self,
        module_id: &str,
        from: &SemanticVersion,
        to: &SemanticVersion,
    ) -> Result<Vec<String>> {
        let (low, high) = if from < to { (from, to) } else { (to, from) };
        let versions = self.catalog.get_versions(module_id).await?;
        Ok(versions
            .iter()
            .filter(|v| &v.version > low && &v.version <= high)
            .flat_map(|v| v.breaking_changes.iter().cloned())
            .collect())
    }

    // ==================== 卸载 ====================

    /// 卸载模块
    #[instrument(skip(self, options), fields(installation_id = tracing::field::Empty))]
    pub async fn uninstall(
        &self,
        module_id: &str,
        tenant_id: &str,
        options: &UninstallOptions,
    ) -> UninstallResult {
        let started = Instant::now();
        let installation_id = prefixed_id(INSTALLATION_PREFIX);
        tracing::Span::current().record("installation_id", installation_id.as_str());
        let mut result = UninstallResult::new(&installation_id, module_id, tenant_id);

        let _guard = match self.acquire_root(module_id, tenant_id) {
            Ok(guard) => guard,
            Err(e) => {
                result.errors.push(e.into());
                result.duration_ms = elapsed_ms(started);
                return result;
            }
        };

        let mut attempt = Attempt::start(
            &self.tracker,
            &installation_id,
            module_id,
            tenant_id,
            InstallAction::Uninstall,
        )
        .await;
        let outcome = self.run_uninstall(&mut attempt, options, &mut result).await;

        result.warnings = attempt.progress.warnings.clone();
        match outcome {
            Ok(()) => {
                result.success = true;
                info!(module_id, tenant_id, data_cleaned = result.data_cleaned, "模块卸载完成");
                attempt.succeed(HistoryStatus::Success).await;
            }
            Err(failure) => {
                warn!(module_id, tenant_id, error = %failure.error, "模块卸载失败");
                result.errors = failure.errors();
                result.rollback_ref = failure.rollback_id.clone();
                attempt.fail(&failure).await;
            }
        }
        result.duration_ms = elapsed_ms(started);
        result
    }

    async fn run_uninstall(
        &self,
        attempt: &mut Attempt,
        options: &UninstallOptions,
        result: &mut UninstallResult,
    ) -> std::result::Result<(), StepFailure> {
        let module_id = attempt.module_id().to_string();
        let tenant_id = attempt.tenant_id().to_string();
        attempt.advance(InstallationStatus::Validating).await;

        let existing = self
            .store
            .get(&tenant_id, &module_id)
            .await?
            .ok_or_else(|| CoreError::ModuleNotInstalled {
                module: module_id.clone(),
                tenant: tenant_id.clone(),
            })?;
        attempt.from_version = Some(existing.version.to_string());
        result.removed_version = attempt.from_version.clone();

        let dependents: Vec<String> = self
            .store
            .list(&tenant_id)
            .await?
            .into_iter()
            .filter(|r| r.module_id != module_id && r.requires(&module_id))
            .map(|r| r.module_id)
            .collect();
        if !dependents.is_empty() {
            if !options.force {
                return Err(CoreError::ModuleHasDependents {
                    module: module_id,
                    dependents,
                }
                .into());
            }
            attempt.warn(format!(
                "强制卸载，以下模块将失去必需依赖: {}",
                dependents.join(", ")
            ));
        }

        let backup_ref = self
            .backups
            .backup(&module_id, &tenant_id, Some(&existing.version))
            .await?;
        attempt.advance(InstallationStatus::Installing).await;

        let removal = async {
            with_step_timeout(
                "installing",
                self.config.timeouts.install(),
                self.transport.remove(&module_id, &tenant_id),
            )
            .await?;
            self.store.delete(&tenant_id, &module_id).await?;
            if options.cleanup_data {
                self.store.purge_data(&tenant_id, &module_id).await?;
            }
            Ok::<(), CoreError>(())
        }
        .await;

        match removal {
            Ok(()) => {
                self.backups.discard(&backup_ref).await;
                result.data_cleaned = options.cleanup_data;
                attempt.advance(InstallationStatus::Completed).await;
                Ok(())
            }
            Err(error) => Err(self
                .rollback(attempt, &backup_ref, Some(existing.version.to_string()), error)
                .await),
        }
    }

    // ==================== 公共步骤 ====================

    fn acquire_root(&self, module_id: &str, tenant_id: &str) -> Result<KeyGuard> {
        validate_identifier("module_id", module_id)?;
        validate_identifier("tenant_id", tenant_id)?;
        self.locks.try_acquire(InstallKey::new(module_id, tenant_id))
    }

    /// 占用计划中全部依赖的键，包括已安装的依赖
    ///
    /// 先占键再读取已安装集合，依赖在本次操作期间不会被并发卸载或更新。
    fn acquire_dependencies(&self, plan: &ResolutionPlan, tenant_id: &str) -> Result<Vec<KeyGuard>> {
        self.locks.try_acquire_all(
            plan.dependencies()
                .map(|step| InstallKey::new(step.module_id.as_str(), tenant_id)),
        )
    }

    /// 解析并拒绝不成功的计划
    async fn plan(
        &self,
        attempt: &mut Attempt,
        module_id: &str,
        version: Option<&str>,
        options: &ResolveOptions,
    ) -> Result<ResolutionPlan> {
        let plan = with_step_timeout(
            "validating",
            self.config.timeouts.validate(),
            self.resolver.resolve(module_id, version, options),
        )
        .await?;

        for warning in &plan.warnings {
            attempt.warn(warning.clone());
        }
        if plan.success {
            return Ok(plan);
        }

        let mut blocking = plan.blocking_conflicts();
        let first = blocking.next().map(|c| c.to_error()).unwrap_or_else(|| {
            CoreError::CircularDependency(
                plan.circular_chains
                    .first()
                    .map(|chain| chain.join(" -> "))
                    .unwrap_or_default(),
            )
        });
        for other in blocking {
            attempt.warn(other.description.clone());
        }
        Err(first)
    }

    /// 区分已安装与需要安装的依赖
    ///
    /// 已安装的依赖必须满足计划中指向它的所有约束，否则返回版本冲突。
    fn prepare_dependencies(
        &self,
        plan: &ResolutionPlan,
        installed: &[InstallationRecord],
    ) -> Result<DependencySet> {
        let mut deps = DependencySet::default();
        for step in plan.dependencies() {
            match installed.iter().find(|r| r.module_id == step.module_id) {
                Some(record) => {
                    for edge in plan.edges.iter().filter(|e| e.to_module == step.module_id) {
                        let constraint = VersionConstraint::parse(&edge.constraint)?;
                        if !constraint.satisfies(&record.version) {
                            return Err(CoreError::VersionConflict {
                                module: step.module_id.clone(),
                                requirements: vec![
                                    format!("已安装 {}", record.version),
                                    format!("{} 要求 {}", edge.from_module, edge.constraint),
                                ],
                            });
                        }
                    }
                    deps.versions
                        .insert(step.module_id.clone(), record.version.clone());
                }
                None => {
                    deps.versions.insert(step.module_id.clone(), step.version.clone());
                    deps.to_install.push(step.clone());
                }
            }
        }
        Ok(deps)
    }

    /// 检查根模块与待安装依赖的兼容性
    fn check_plan_compatibility(
        &self,
        root_module: &str,
        plan: &ResolutionPlan,
        deps: &DependencySet,
        installed: &[InstallationRecord],
    ) -> Result<()> {
        let planned = plan.module_order();
        std::iter::once((root_module, &plan.root_info))
            .chain(deps.to_install.iter().map(|s| (s.module_id.as_str(), &s.info)))
            .try_for_each(|(module_id, info)| {
                self.check_compatibility(module_id, info, installed, &planned)
            })
    }

    fn check_compatibility(
        &self,
        module_id: &str,
        info: &ModuleVersionInfo,
        installed: &[InstallationRecord],
        planned: &[&str],
    ) -> Result<()> {
        let compatibility = &info.compatibility;
        let incompatible = |reason: String| CoreError::CompatibilityError {
            module: module_id.to_string(),
            reason,
        };

        compatibility
            .check_system_version(&self.system_version)
            .map_err(incompatible)?;

        let present = |id: &str| {
            installed.iter().any(|r| r.module_id == id && r.module_id != module_id)
                || planned.iter().any(|p| *p == id && *p != module_id)
        };
        if let Some(conflicting) = compatibility
            .conflicting_modules
            .iter()
            .find(|m| present(m.as_str()))
        {
            return Err(incompatible(format!("与模块 '{}' 冲突", conflicting)));
        }
        if let Some(missing) = compatibility
            .required_modules
            .iter()
            .find(|m| !present(m.as_str()))
        {
            return Err(incompatible(format!("缺少必需模块 '{}'", missing)));
        }
        Ok(())
    }

    /// 按计划顺序安装依赖
    ///
    /// 必需依赖失败时清理本次新安装的依赖并返回失败；可选依赖失败只记录警告。
    async fn install_dependencies(
        &self,
        parent: &mut Attempt,
        plan: &ResolutionPlan,
        deps: &mut DependencySet,
        skip_tests: bool,
    ) -> std::result::Result<(), StepFailure> {
        let tenant_id = parent.tenant_id().to_string();
        let steps = deps.to_install.clone();

        for step in &steps {
            let installation_id = prefixed_id(INSTALLATION_PREFIX);
            let mut attempt = Attempt::start(
                &self.tracker,
                &installation_id,
                &step.module_id,
                &tenant_id,
                InstallAction::Install,
            )
            .await;
            attempt.to_version = Some(step.version.to_string());
            attempt.advance(InstallationStatus::Validating).await;

            let target = Target {
                module_id: &step.module_id,
                tenant_id: &tenant_id,
                info: &step.info,
                previous: None,
                configuration: HashMap::new(),
                dependency_versions: deps.direct_versions(plan, &step.module_id),
                replace_existing: false,
                migration: None,
                skip_tests,
            };

            match self.execute(&mut attempt, &target).await {
                Ok(_) => {
                    attempt.succeed(HistoryStatus::Success).await;
                    deps.newly_installed
                        .push((step.module_id.clone(), step.version.clone()));
                }
                Err(failure) => {
                    attempt.fail(&failure).await;
                    if step.required {
                        parent.warn(format!(
                            "必需依赖 '{}' 安装失败: {}",
                            step.module_id, failure.error
                        ));
                        self.cleanup_dependencies(parent, deps).await;
                        return Err(failure);
                    }
                    parent.warn(format!(
                        "可选依赖 '{}' 安装失败，已跳过: {}",
                        step.module_id, failure.error
                    ));
                    deps.versions.remove(&step.module_id);
                    deps.partial = true;
                }
            }
        }
        Ok(())
    }

    /// 倒序卸载本次新安装的依赖
    async fn cleanup_dependencies(&self, parent: &mut Attempt, deps: &DependencySet) {
        let tenant_id = parent.tenant_id().to_string();
        for (module_id, version) in deps.newly_installed.iter().rev() {
            let installation_id = prefixed_id(INSTALLATION_PREFIX);
            let mut attempt = Attempt::start(
                &self.tracker,
                &installation_id,
                module_id,
                &tenant_id,
                InstallAction::Uninstall,
            )
            .await;
            attempt.from_version = Some(version.to_string());
            attempt.advance(InstallationStatus::Validating).await;

            let removal = async {
                with_step_timeout(
                    "installing",
                    self.config.timeouts.install(),
                    self.transport.remove(module_id, &tenant_id),
                )
                .await?;
                self.store.delete(&tenant_id, module_id).await?;
                Ok::<(), CoreError>(())
            }
            .await;

            match removal {
                Ok(()) => {
                    attempt.advance(InstallationStatus::Completed).await;
                    attempt.succeed(HistoryStatus::Success).await;
                    parent.warn(format!("已清理本次安装的依赖 '{}'", module_id));
                }
                Err(error) => {
                    parent.warn(format!("清理依赖 '{}' 失败: {}", module_id, error));
                    attempt.fail(&StepFailure::from(error)).await;
                }
            }
        }
    }

    /// 下载、校验、备份并落地一个模块版本
    async fn execute(
        &self,
        attempt: &mut Attempt,
        target: &Target<'_>,
    ) -> std::result::Result<InstallationRecord, StepFailure> {
        let timeouts = &self.config.timeouts;
        attempt.advance(InstallationStatus::Downloading).await;

        let artifact = with_step_timeout(
            "downloading",
            timeouts.download(),
            self.transport.download(target.module_id, target.info),
        )
        .await?;
        if let Some(expected) = target.info.checksum.as_deref() {
            let verified = with_step_timeout(
                "downloading",
                timeouts.download(),
                self.transport.verify(&artifact, expected),
            )
            .await?;
            if !verified {
                return Err(CoreError::ChecksumMismatch {
                    module: target.module_id.to_string(),
                    expected: expected.to_string(),
                }
                .into());
            }
        }

        let backup_ref = self
            .backups
            .backup(
                target.module_id,
                target.tenant_id,
                target.previous.map(|r| &r.version),
            )
            .await?;

        match self.apply(attempt, target, &artifact).await {
            Ok(record) => {
                self.backups.discard(&backup_ref).await;
                Ok(record)
            }
            Err(error) => {
                let restore_version = target.previous.map(|r| r.version.to_string());
                Err(self.rollback(attempt, &backup_ref, restore_version, error).await)
            }
        }
    }

    /// 备份之后的破坏性步骤
    async fn apply(
        &self,
        attempt: &mut Attempt,
        target: &Target<'_>,
        artifact: &ArtifactRef,
    ) -> Result<InstallationRecord> {
        let timeouts = &self.config.timeouts;
        attempt.advance(InstallationStatus::Installing).await;

        if target.replace_existing {
            with_step_timeout(
                "installing",
                timeouts.install(),
                self.transport.remove(target.module_id, target.tenant_id),
            )
            .await?;
        }
        with_step_timeout(
            "installing",
            timeouts.install(),
            self.transport.install(artifact, target.tenant_id),
        )
        .await?;

        let ctx = HookContext {
            module_id: target.module_id.to_string(),
            tenant_id: target.tenant_id.to_string(),
            version: target.info.version.clone(),
            configuration: target.configuration.clone(),
        };

        attempt.advance(InstallationStatus::Configuring).await;
        let outcome = with_step_timeout("configuring", timeouts.configure(), async {
            Ok(self.hooks.configure(&ctx).await)
        })
        .await?;
        check_hook("configuring", outcome)?;

        if let Some((from, changes)) = &target.migration {
            attempt.advance(InstallationStatus::Migrating).await;
            let outcome = with_step_timeout("migrating", timeouts.migrate(), async {
                Ok(self.hooks.migrate_data(&ctx, from, changes).await)
            })
            .await?;
            check_hook("migrating", outcome)?;
        }

        if !target.skip_tests {
            attempt.advance(InstallationStatus::Testing).await;
            let outcome = with_step_timeout("testing", timeouts.test(), async {
                Ok(self.hooks.smoke_test(&ctx).await)
            })
            .await?;
            check_hook("testing", outcome)?;
        }

        let now = Utc::now();
        let record = InstallationRecord {
            id: target
                .previous
                .map(|r| r.id.clone())
                .unwrap_or_else(|| attempt.id().to_string()),
            module_id: target.module_id.to_string(),
            tenant_id: target.tenant_id.to_string(),
            version: target.info.version.clone(),
            status: InstallationStatus::Completed,
            installed_at: target.previous.map(|r| r.installed_at).unwrap_or(now),
            updated_at: now,
            configuration: target.configuration.clone(),
            dependency_versions: target.dependency_versions.clone(),
        };
        self.store.put(record.clone()).await?;
        attempt.advance(InstallationStatus::Completed).await;
        Ok(record)
    }

    /// 从备份恢复并记录回滚
    async fn rollback(
        &self,
        attempt: &mut Attempt,
        backup_ref: &str,
        restore_version: Option<String>,
        error: CoreError,
    ) -> StepFailure {
        warn!(
            installation_id = %attempt.id(),
            step = %attempt.progress.status,
            error = %error,
            "步骤失败，开始回滚"
        );
        attempt.progress.error = Some(error.to_string());
        attempt.advance(InstallationStatus::Failed).await;

        let record = self
            .tracker
            .begin_rollback(RollbackRequest {
                installation_id: attempt.id().to_string(),
                module_id: attempt.module_id().to_string(),
                tenant_id: attempt.tenant_id().to_string(),
                from_version: attempt.to_version.clone(),
                to_version: restore_version,
                reason: error.to_string(),
                backup_ref: backup_ref.to_string(),
            })
            .await;
        let rollback_id = record.rollback_id;
        self.tracker
            .update_rollback(&rollback_id, RollbackStatus::InProgress, None, None)
            .await;

        let restored = with_step_timeout(
            "rolling_back",
            self.config.timeouts.rollback(),
            self.backups.restore(backup_ref),
        )
        .await;

        match restored {
            Ok(()) => {
                self.tracker
                    .update_rollback(
                        &rollback_id,
                        RollbackStatus::Completed,
                        Some(backup_ref.to_string()),
                        None,
                    )
                    .await;
                self.backups.discard(backup_ref).await;
                attempt.advance(InstallationStatus::RolledBack).await;
                StepFailure {
                    error,
                    rollback_id: Some(rollback_id),
                    rollback_error: None,
                }
            }
            Err(restore_error) => {
                let reason = restore_error.to_string();
                error!(
                    alert = true,
                    rollback_id = %rollback_id,
                    installation_id = %attempt.id(),
                    module_id = %attempt.module_id(),
                    tenant_id = %attempt.tenant_id(),
                    backup_ref,
                    error = %reason,
                    "回滚失败，模块可能处于不一致状态"
                );
                self.tracker
                    .update_rollback(
                        &rollback_id,
                        RollbackStatus::Failed,
                        None,
                        Some(reason.clone()),
                    )
                    .await;
                StepFailure {
                    error,
                    rollback_id: Some(rollback_id.clone()),
                    rollback_error: Some(CoreError::RollbackFailed {
                        rollback_id,
                        reason,
                    }),
                }
            }
        }
    }
}
