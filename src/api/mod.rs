//! API 模块
//!
//! 对外提供的服务接口。
//!
//! # 模块概览
//!
//! - `service`: InstallerService 主接口，组装目录、存储、传输与钩子

pub mod service;

// 重导出主要类型
pub use service::{InstallerService, InstallerServiceBuilder};
