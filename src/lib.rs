//! # Chips Installer - 薯片模块安装核心
//!
//! 薯片生态的模块依赖解析与安装生命周期核心，提供以下功能：
//!
//! - **依赖解析**: 语义化版本约束、传递依赖、冲突与循环检测、拓扑排序
//! - **安装编排**: 按 (模块, 租户) 安装、更新、卸载，失败自动回滚
//! - **安装跟踪**: 进度、历史、回滚记录与统计
//! - **生命周期事件**: 可订阅的安装事件
//! - **配置与日志**: 统一的配置加载与结构化日志
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chips_installer::{InstallerConfig, InstallerService, InstallOptions};
//! use chips_installer::installer::InMemoryTransport;
//! use chips_installer::module::InMemoryCatalog;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = Arc::new(InMemoryCatalog::new());
//!     catalog.add("app", "1.0.0", &[("db", "^1.0.0")])?;
//!     catalog.add("db", "1.2.0", &[])?;
//!
//!     let service = InstallerService::builder()
//!         .config(InstallerConfig::default())
//!         .catalog(catalog)
//!         .transport(Arc::new(InMemoryTransport::new()))
//!         .build()?;
//!
//!     let result = service
//!         .install("app", "tenant-a", None, &InstallOptions::default())
//!         .await;
//!     assert!(result.success);
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `module` - 版本、目录与依赖解析
//! - `installer` - 安装状态机与编排
//! - `tracker` - 进度、历史与回滚记录
//! - `events` - 生命周期事件总线
//! - `utils` - 工具函数和错误类型
//! - `core` - 配置
//! - `api` - 公共服务接口

#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod core;
pub mod events;
pub mod installer;
pub mod module;
pub mod tracker;
pub mod utils;

// 重导出常用类型，方便使用
pub use api::{InstallerService, InstallerServiceBuilder};

pub use crate::core::config::{
    InstallerConfig, InstallerConfigBuilder, LogConfig, ResolverConfig, TimeoutConfig,
    TrackerConfig,
};

pub use events::{lifecycle_events, Event, EventBus, EventCallback, EventFilter};

pub use installer::{
    InstallAction, InstallOptions, InstallationProgress, InstallationResult, InstallationStatus,
    UninstallOptions, UninstallResult, UpdateOptions, UpdateResult,
};

pub use module::{
    DependencyKind, ModuleCatalog, ResolutionPlan, ResolveOptions, SemanticVersion,
    VersionConstraint,
};

pub use tracker::{
    AnalyticsQuery, HistoryFilter, HistoryStatus, InstallationAnalytics, InstallationHistoryEntry,
    RollbackFilter, RollbackRecord, RollbackStatus,
};

pub use utils::logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
pub use utils::{error_code, generate_id, generate_uuid, CoreError, OperationError, Result};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
