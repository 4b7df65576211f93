//! 工具模块
//!
//! 包含错误类型、ID 生成、缓存与日志系统。

pub mod cache;
pub mod error;
pub mod id;
pub mod logger;

pub use cache::{CacheStats, TtlCache};
pub use error::{error_code, CoreError, ErrorCategory, OperationError, Result};
pub use id::{generate_id, generate_uuid, is_valid_id, prefixed_id, validate_identifier};
pub use logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
