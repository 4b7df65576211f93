//! 安装核心错误类型定义
//!
//! 本模块定义了依赖解析与安装生命周期中使用的所有错误类型。
//! 错误按照处理策略划分类别，编排器据此决定回滚还是直接中止。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 安装核心错误类型
#[derive(Error, Debug)]
pub enum CoreError {
    // ==================== 输入与校验错误 ====================

    /// 模块未找到
    #[error("模块未找到: '{0}'")]
    ModuleNotFound(String),

    /// 没有满足约束的版本
    #[error("模块 '{module}' 没有满足约束 '{constraint}' 的版本")]
    NoSatisfyingVersion {
        module: String,
        constraint: String,
    },

    /// 版本号格式无效
    #[error("无效的版本号: '{0}'")]
    InvalidVersion(String),

    /// 版本约束格式无效
    #[error("无效的版本约束: '{0}'")]
    InvalidConstraint(String),

    /// 兼容性检查失败
    #[error("模块 '{module}' 兼容性检查失败: {reason}")]
    CompatibilityError {
        module: String,
        reason: String,
    },

    /// 请求参数无效
    #[error("请求参数无效: {0}")]
    InvalidRequest(String),

    // ==================== 解析错误 ====================

    /// 版本冲突
    #[error("版本冲突: 模块 '{module}' 的版本要求冲突: {requirements:?}")]
    VersionConflict {
        module: String,
        requirements: Vec<String>,
    },

    /// 循环依赖
    #[error("检测到循环依赖: {0}")]
    CircularDependency(String),

    // ==================== 生命周期错误 ====================

    /// 同一 (模块, 租户) 已有安装任务进行中
    #[error("模块 '{module}' 在租户 '{tenant}' 下已有安装任务进行中")]
    InstallationInProgress {
        module: String,
        tenant: String,
    },

    /// 模块未安装
    #[error("模块 '{module}' 未安装在租户 '{tenant}' 下")]
    ModuleNotInstalled {
        module: String,
        tenant: String,
    },

    /// 模块被其他已安装模块依赖
    #[error("模块 '{module}' 被以下模块依赖，无法卸载: {dependents:?}")]
    ModuleHasDependents {
        module: String,
        dependents: Vec<String>,
    },

    /// 下载失败
    #[error("模块 '{module}' 下载失败: {reason}")]
    DownloadFailed {
        module: String,
        reason: String,
    },

    /// 校验和不匹配
    #[error("模块 '{module}' 校验和不匹配: 期望 {expected}")]
    ChecksumMismatch {
        module: String,
        expected: String,
    },

    /// 安装步骤失败
    #[error("步骤 '{step}' 失败: {reason}")]
    StepFailed {
        step: String,
        reason: String,
    },

    /// 步骤超时
    #[error("步骤 '{step}' 超时 ({timeout_ms} ms)")]
    Timeout {
        step: String,
        timeout_ms: u64,
    },

    // ==================== 回滚错误 ====================

    /// 回滚失败，需要人工介入
    #[error("回滚失败: '{rollback_id}' - {reason}")]
    RollbackFailed {
        rollback_id: String,
        reason: String,
    },

    /// 备份未找到
    #[error("备份未找到: '{0}'")]
    BackupNotFound(String),

    // ==================== 配置错误 ====================

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue {
        key: String,
        reason: String,
    },

    /// 订阅未找到
    #[error("订阅未找到: '{0}'")]
    SubscriptionNotFound(String),

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // ==================== 通用错误 ====================

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 安装核心操作结果类型别名
pub type Result<T> = std::result::Result<T, CoreError>;

/// 错误类别
///
/// 决定错误的处理方式：是否回滚、是否可以重试、是否需要告警。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 输入或校验错误，不修改任何状态
    Validation,
    /// 依赖解析错误，体现在解析计划中
    Resolution,
    /// 基础设施的瞬时错误
    Transient,
    /// 回滚失败
    Rollback,
    /// 并发冲突
    Concurrency,
    /// 内部错误
    Internal,
}

/// 错误码常量
pub mod error_code {
    // 解析错误 (RESOLVE-xxx)
    pub const MODULE_NOT_FOUND: &str = "RESOLVE-001";
    pub const NO_SATISFYING_VERSION: &str = "RESOLVE-002";
    pub const INVALID_VERSION: &str = "RESOLVE-003";
    pub const VERSION_CONFLICT: &str = "RESOLVE-004";
    pub const CIRCULAR_DEPENDENCY: &str = "RESOLVE-005";

    // 安装错误 (INSTALL-xxx)
    pub const COMPATIBILITY: &str = "INSTALL-001";
    pub const IN_PROGRESS: &str = "INSTALL-002";
    pub const DOWNLOAD_FAILED: &str = "INSTALL-003";
    pub const CHECKSUM_MISMATCH: &str = "INSTALL-004";
    pub const STEP_FAILED: &str = "INSTALL-005";
    pub const NOT_INSTALLED: &str = "INSTALL-006";
    pub const HAS_DEPENDENTS: &str = "INSTALL-007";

    // 回滚错误 (ROLLBACK-xxx)
    pub const ROLLBACK_FAILED: &str = "ROLLBACK-001";
    pub const BACKUP_NOT_FOUND: &str = "ROLLBACK-002";

    // 超时错误 (TIMEOUT-xxx)
    pub const TIMEOUT_STEP: &str = "TIMEOUT-001";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";

    // 请求错误
    pub const INVALID_REQUEST: &str = "REQUEST-001";

    // 兜底
    pub const INTERNAL: &str = "CORE-001";
}

impl CoreError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::ModuleNotFound(_) => error_code::MODULE_NOT_FOUND,
            CoreError::NoSatisfyingVersion { .. } => error_code::NO_SATISFYING_VERSION,
            CoreError::InvalidVersion(_) | CoreError::InvalidConstraint(_) => {
                error_code::INVALID_VERSION
            }
            CoreError::VersionConflict { .. } => error_code::VERSION_CONFLICT,
            CoreError::CircularDependency(_) => error_code::CIRCULAR_DEPENDENCY,
            CoreError::CompatibilityError { .. } => error_code::COMPATIBILITY,
            CoreError::InstallationInProgress { .. } => error_code::IN_PROGRESS,
            CoreError::DownloadFailed { .. } => error_code::DOWNLOAD_FAILED,
            CoreError::ChecksumMismatch { .. } => error_code::CHECKSUM_MISMATCH,
            CoreError::StepFailed { .. } => error_code::STEP_FAILED,
            CoreError::ModuleNotInstalled { .. } => error_code::NOT_INSTALLED,
            CoreError::ModuleHasDependents { .. } => error_code::HAS_DEPENDENTS,
            CoreError::RollbackFailed { .. } => error_code::ROLLBACK_FAILED,
            CoreError::BackupNotFound(_) => error_code::BACKUP_NOT_FOUND,
            CoreError::Timeout { .. } => error_code::TIMEOUT_STEP,
            CoreError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            CoreError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            CoreError::InvalidRequest(_) => error_code::INVALID_REQUEST,
            _ => error_code::INTERNAL,
        }
    }

    /// 获取错误类别
    pub fn category(&self) -> ErrorCategory {
        match self {
            CoreError::ModuleNotFound(_)
            | CoreError::NoSatisfyingVersion { .. }
            | CoreError::InvalidVersion(_)
            | CoreError::InvalidConstraint(_)
            | CoreError::CompatibilityError { .. }
            | CoreError::InvalidRequest(_)
            | CoreError::ModuleNotInstalled { .. }
            | CoreError::ModuleHasDependents { .. }
            | CoreError::ConfigLoadFailed(_)
            | CoreError::InvalidConfigValue { .. } => ErrorCategory::Validation,
            CoreError::VersionConflict { .. } | CoreError::CircularDependency(_) => {
                ErrorCategory::Resolution
            }
            CoreError::DownloadFailed { .. }
            | CoreError::ChecksumMismatch { .. }
            | CoreError::StepFailed { .. }
            | CoreError::Timeout { .. }
            | CoreError::Io(_) => ErrorCategory::Transient,
            CoreError::RollbackFailed { .. } | CoreError::BackupNotFound(_) => {
                ErrorCategory::Rollback
            }
            CoreError::InstallationInProgress { .. } => ErrorCategory::Concurrency,
            _ => ErrorCategory::Internal,
        }
    }

    /// 调用方是否可以安全地重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::Concurrency
        )
    }
}

/// 对外返回的结构化错误条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    /// 错误码
    pub code: String,
    /// 错误信息
    pub message: String,
}

impl OperationError {
    /// 创建新的错误条目
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&CoreError> for OperationError {
    fn from(err: &CoreError) -> Self {
        Self::new(err.error_code(), err.to_string())
    }
}

impl From<CoreError> for OperationError {
    fn from(err: CoreError) -> Self {
        Self::from(&err)
    }
}
