//! 安装生命周期
//!
//! - `state` - 状态机、选项与结果类型
//! - `store` - 安装记录存储
//! - `transport` - 制品下载与落地
//! - `hooks` - 配置、迁移与冒烟测试钩子
//! - `lock` - (模块, 租户) 互斥与步骤超时
//! - `backup` - 破坏性步骤之前的备份
//! - `orchestrator` - 安装、更新、卸载编排

pub mod backup;
pub mod hooks;
pub mod lock;
pub mod orchestrator;
pub mod state;
pub mod store;
pub mod transport;

pub use backup::{BackupInfo, BackupManager};
pub use hooks::{HookContext, HookOutcome, HookStage, InstallHooks, NoopHooks, ScriptedHooks};
pub use lock::{with_step_timeout, KeyGuard, KeyLockTable};
pub use orchestrator::InstallationOrchestrator;
pub use state::{
    InstallAction, InstallKey, InstallOptions, InstallationProgress, InstallationResult,
    InstallationStatus, InstalledDependency, UninstallOptions, UninstallResult, UpdateOptions,
    UpdateResult,
};
pub use store::{DependencyVersion, InMemoryInstallationStore, InstallationRecord, InstallationStore};
pub use transport::{
    ArtifactRef, FileSnapshot, FsPackageTransport, InMemoryTransport, PackageBundle,
    PackageTransport, TransportFault,
};
