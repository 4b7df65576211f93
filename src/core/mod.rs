//! 核心模块
//!
//! 包含安装核心的配置结构。

pub mod config;

pub use config::{
    InstallerConfig, InstallerConfigBuilder, LogConfig, ResolverConfig, TimeoutConfig,
    TrackerConfig,
};
