//! 安装状态机与请求/结果类型

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::module::dependency::ResolveOptions;
use crate::utils::OperationError;

/// 安装状态
///
/// ```text
/// pending → validating → downloading → installing → configuring → [migrating] → testing → completed
///     任意状态 → failed → rolled_back
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationStatus {
    Pending,
    Validating,
    Downloading,
    Installing,
    Configuring,
    /// 数据迁移，仅在更新跨越破坏性变更时出现
    Migrating,
    Testing,
    Completed,
    Failed,
    RolledBack,
}

impl InstallationStatus {
    /// 进入该状态时的进度百分比
    ///
    /// `Failed` 与 `RolledBack` 保持上一状态的进度，返回 `None`。
    pub fn percent(&self) -> Option<u8> {
        match self {
            InstallationStatus::Pending => Some(0),
            InstallationStatus::Validating => Some(10),
            InstallationStatus::Downloading => Some(30),
            InstallationStatus::Installing => Some(55),
            InstallationStatus::Configuring => Some(75),
            InstallationStatus::Migrating => Some(82),
            InstallationStatus::Testing => Some(90),
            InstallationStatus::Completed => Some(100),
            InstallationStatus::Failed | InstallationStatus::RolledBack => None,
        }
    }

    /// 是否为终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstallationStatus::Completed | InstallationStatus::Failed | InstallationStatus::RolledBack
        )
    }

    /// 是否允许迁移到 `next`
    pub fn can_transition_to(&self, next: InstallationStatus) -> bool {
        use InstallationStatus::*;
        match (self, next) {
            (Failed, RolledBack) => true,
            (Completed | Failed | RolledBack, _) => false,
            (_, Failed) => true,
            (Pending, Validating)
            | (Validating, Downloading)
            | (Downloading, Installing)
            | (Installing, Configuring)
            | (Configuring, Migrating)
            | (Configuring, Testing)
            | (Migrating, Testing)
            | (Testing, Completed) => true,
            // 跳过冒烟测试
            (Configuring, Completed) | (Migrating, Completed) => true,
            // 卸载没有下载步骤；重复安装直接完成
            (Validating, Installing) | (Validating, Completed) | (Installing, Completed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstallationStatus::Pending => "pending",
            InstallationStatus::Validating => "validating",
            InstallationStatus::Downloading => "downloading",
            InstallationStatus::Installing => "installing",
            InstallationStatus::Configuring => "configuring",
            InstallationStatus::Migrating => "migrating",
            InstallationStatus::Testing => "testing",
            InstallationStatus::Completed => "completed",
            InstallationStatus::Failed => "failed",
            InstallationStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for InstallationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 生命周期操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallAction {
    Install,
    Update,
    Uninstall,
    Rollback,
}

impl InstallAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallAction::Install => "install",
            InstallAction::Update => "update",
            InstallAction::Uninstall => "uninstall",
            InstallAction::Rollback => "rollback",
        }
    }
}

impl fmt::Display for InstallAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 串行化单元：(模块, 租户)
///
/// 排序先比较模块 ID 再比较租户 ID，多把锁按此顺序获取。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstallKey {
    pub module_id: String,
    pub tenant_id: String,
}

impl InstallKey {
    pub fn new(module_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            tenant_id: tenant_id.into(),
        }
    }
}

impl fmt::Display for InstallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.module_id, self.tenant_id)
    }
}

/// 安装进度
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationProgress {
    pub installation_id: String,
    pub module_id: String,
    pub tenant_id: String,
    pub action: InstallAction,
    pub status: InstallationStatus,
    /// 0..=100，单调不减
    pub percent: u8,
    pub current_step: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

impl InstallationProgress {
    pub fn new(
        installation_id: impl Into<String>,
        module_id: impl Into<String>,
        tenant_id: impl Into<String>,
        action: InstallAction,
    ) -> Self {
        let now = Utc::now();
        Self {
            installation_id: installation_id.into(),
            module_id: module_id.into(),
            tenant_id: tenant_id.into(),
            action,
            status: InstallationStatus::Pending,
            percent: 0,
            current_step: Some(InstallationStatus::Pending.as_str().to_string()),
            started_at: now,
            updated_at: now,
            completed_at: None,
            estimated_completion: None,
            error: None,
            warnings: Vec::new(),
        }
    }

    /// 应用状态迁移
    ///
    /// 进度只增不减；终止状态清空当前步骤并记录完成时间。
    pub fn advance(&mut self, status: InstallationStatus, now: DateTime<Utc>) {
        self.status = status;
        if let Some(percent) = status.percent() {
            self.percent = self.percent.max(percent);
        }
        self.updated_at = now;
        if status.is_terminal() {
            self.current_step = None;
            self.completed_at = Some(now);
            self.estimated_completion = None;
        } else {
            self.current_step = Some(status.as_str().to_string());
            self.estimated_completion = self.estimate_completion(now);
        }
    }

    /// 按已用时间与当前进度线性估算完成时间
    fn estimate_completion(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.percent == 0 {
            return None;
        }
        let elapsed_ms = (now - self.started_at).num_milliseconds().max(0);
        let total_ms = elapsed_ms * 100 / i64::from(self.percent);
        Some(self.started_at + ChronoDuration::milliseconds(total_ms))
    }

    pub fn elapsed_ms(&self) -> u64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// 安装选项
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallOptions {
    /// 解析选项，缺省使用配置中的默认值
    #[serde(default)]
    pub resolve: Option<ResolveOptions>,
    /// 已安装同一版本时仍重新安装
    #[serde(default)]
    pub force: bool,
    /// 跳过冒烟测试
    #[serde(default)]
    pub skip_tests: bool,
    /// 租户配置
    #[serde(default)]
    pub configuration: HashMap<String, serde_json::Value>,
}

impl InstallOptions {
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_resolve(mut self, options: ResolveOptions) -> Self {
        self.resolve = Some(options);
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.configuration.insert(key.into(), value);
        self
    }
}

/// 更新选项
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateOptions {
    #[serde(default)]
    pub resolve: Option<ResolveOptions>,
    #[serde(default)]
    pub skip_tests: bool,
    /// 跳过数据迁移
    #[serde(default)]
    pub skip_migration: bool,
    /// 新配置，缺省沿用当前配置
    #[serde(default)]
    pub configuration: Option<HashMap<String, serde_json::Value>>,
}

/// 卸载选项
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UninstallOptions {
    /// 同时清除模块持久化数据
    #[serde(default)]
    pub cleanup_data: bool,
    /// 忽略依赖方检查
    #[serde(default)]
    pub force: bool,
}

/// 随安装一起落地的依赖
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledDependency {
    pub module_id: String,
    pub version: String,
    /// 本次请求新安装（而非已存在）
    pub newly_installed: bool,
}

/// 安装结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationResult {
    pub installation_id: String,
    pub module_id: String,
    pub tenant_id: String,
    pub success: bool,
    pub installed_version: Option<String>,
    pub dependencies: Vec<InstalledDependency>,
    pub warnings: Vec<String>,
    pub errors: Vec<OperationError>,
    pub rollback_ref: Option<String>,
    pub duration_ms: u64,
}

impl InstallationResult {
    pub(crate) fn new(installation_id: &str, module_id: &str, tenant_id: &str) -> Self {
        Self {
            installation_id: installation_id.to_string(),
            module_id: module_id.to_string(),
            tenant_id: tenant_id.to_string(),
            success: false,
            installed_version: None,
            dependencies: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            rollback_ref: None,
            duration_ms: 0,
        }
    }

    /// 第一个错误的错误码
    pub fn error_code(&self) -> Option<&str> {
        self.errors.first().map(|e| e.code.as_str())
    }
}

/// 更新结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateResult {
    pub installation_id: String,
    pub module_id: String,
    pub tenant_id: String,
    pub success: bool,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub breaking_changes: Vec<String>,
    pub dependencies: Vec<InstalledDependency>,
    pub warnings: Vec<String>,
    pub errors: Vec<OperationError>,
    pub rollback_ref: Option<String>,
    pub duration_ms: u64,
}

impl UpdateResult {
    pub(crate) fn new(installation_id: &str, module_id: &str, tenant_id: &str) -> Self {
        Self {
            installation_id: installation_id.to_string(),
            module_id: module_id.to_string(),
            tenant_id: tenant_id.to_string(),
            success: false,
            from_version: None,
            to_version: None,
            breaking_changes: Vec::new(),
            dependencies: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            rollback_ref: None,
            duration_ms: 0,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.errors.first().map(|e| e.code.as_str())
    }
}

/// 卸载结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UninstallResult {
    pub installation_id: String,
    pub module_id: String,
    pub tenant_id: String,
    pub success: bool,
    pub removed_version: Option<String>,
    pub data_cleaned: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<OperationError>,
    pub rollback_ref: Option<String>,
    pub duration_ms: u64,
}

impl UninstallResult {
    pub(crate) fn new(installation_id: &str, module_id: &str, tenant_id: &str) -> Self {
        Self {
            installation_id: installation_id.to_string(),
            module_id: module_id.to_string(),
            tenant_id: tenant_id.to_string(),
            success: false,
            removed_version: None,
            data_cleaned: false,
            warnings: Vec::new(),
            errors: Vec::new(),
            rollback_ref: None,
            duration_ms: 0,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.errors.first().map(|e| e.code.as_str())
    }
}
