//! 安装核心配置
//!
//! 定义依赖解析、步骤超时、安装跟踪与日志的配置结构和加载逻辑。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::module::version::SemanticVersion;
use crate::utils::{CoreError, Result};

/// 依赖解析配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// 最大递归深度
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// 目录查询缓存有效期（秒）
    #[serde(default = "default_catalog_cache_ttl")]
    pub catalog_cache_ttl_secs: u64,

    /// 目录查询缓存容量
    #[serde(default = "default_catalog_cache_capacity")]
    pub catalog_cache_capacity: usize,

    /// 严格冲突模式：自动取高版本时仍要求满足所有约束
    #[serde(default)]
    pub strict_conflicts: bool,
}

fn default_max_depth() -> usize {
    10
}

fn default_catalog_cache_ttl() -> u64 {
    60
}

fn default_catalog_cache_capacity() -> usize {
    256
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            catalog_cache_ttl_secs: default_catalog_cache_ttl(),
            catalog_cache_capacity: default_catalog_cache_capacity(),
            strict_conflicts: false,
        }
    }
}

/// 步骤超时配置（毫秒）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_validate_ms")]
    pub validate_ms: u64,
    #[serde(default = "default_download_ms")]
    pub download_ms: u64,
    #[serde(default = "default_install_ms")]
    pub install_ms: u64,
    #[serde(default = "default_configure_ms")]
    pub configure_ms: u64,
    #[serde(default = "default_test_ms")]
    pub test_ms: u64,
    #[serde(default = "default_migrate_ms")]
    pub migrate_ms: u64,
    #[serde(default = "default_rollback_ms")]
    pub rollback_ms: u64,
}

fn default_validate_ms() -> u64 {
    10_000
}

fn default_download_ms() -> u64 {
    120_000
}

fn default_install_ms() -> u64 {
    60_000
}

fn default_configure_ms() -> u64 {
    30_000
}

fn default_test_ms() -> u64 {
    30_000
}

fn default_migrate_ms() -> u64 {
    120_000
}

fn default_rollback_ms() -> u64 {
    60_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            validate_ms: default_validate_ms(),
            download_ms: default_download_ms(),
            install_ms: default_install_ms(),
            configure_ms: default_configure_ms(),
            test_ms: default_test_ms(),
            migrate_ms: default_migrate_ms(),
            rollback_ms: default_rollback_ms(),
        }
    }
}

impl TimeoutConfig {
    /// 所有步骤使用相同的超时
    pub fn uniform(ms: u64) -> Self {
        Self {
            validate_ms: ms,
            download_ms: ms,
            install_ms: ms,
            configure_ms: ms,
            test_ms: ms,
            migrate_ms: ms,
            rollback_ms: ms,
        }
    }

    pub fn validate(&self) -> Duration {
        Duration::from_millis(self.validate_ms)
    }

    pub fn download(&self) -> Duration {
        Duration::from_millis(self.download_ms)
    }

    pub fn install(&self) -> Duration {
        Duration::from_millis(self.install_ms)
    }

    pub fn configure(&self) -> Duration {
        Duration::from_millis(self.configure_ms)
    }

    pub fn test(&self) -> Duration {
        Duration::from_millis(self.test_ms)
    }

    pub fn migrate(&self) -> Duration {
        Duration::from_millis(self.migrate_ms)
    }

    pub fn rollback(&self) -> Duration {
        Duration::from_millis(self.rollback_ms)
    }

    fn entries(&self) -> [(&'static str, u64); 7] {
        [
            ("timeouts.validate_ms", self.validate_ms),
            ("timeouts.download_ms", self.download_ms),
            ("timeouts.install_ms", self.install_ms),
            ("timeouts.configure_ms", self.configure_ms),
            ("timeouts.test_ms", self.test_ms),
            ("timeouts.migrate_ms", self.migrate_ms),
            ("timeouts.rollback_ms", self.rollback_ms),
        ]
    }
}

/// 安装跟踪配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// 统计结果缓存有效期（秒）
    #[serde(default = "default_analytics_ttl")]
    pub analytics_cache_ttl_secs: u64,

    /// 统计结果缓存容量
    #[serde(default = "default_analytics_capacity")]
    pub analytics_cache_capacity: usize,

    /// 趋势统计的天数
    #[serde(default = "default_trend_days")]
    pub trend_days: u32,

    /// 常见问题的返回条数
    #[serde(default = "default_common_issue_limit")]
    pub common_issue_limit: usize,
}

fn default_analytics_ttl() -> u64 {
    30
}

fn default_analytics_capacity() -> usize {
    64
}

fn default_trend_days() -> u32 {
    7
}

fn default_common_issue_limit() -> usize {
    5
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            analytics_cache_ttl_secs: default_analytics_ttl(),
            analytics_cache_capacity: default_analytics_capacity(),
            trend_days: default_trend_days(),
            common_issue_limit: default_common_issue_limit(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// 保留日志文件数
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

fn default_max_files() -> usize {
    7
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
            max_files: default_max_files(),
        }
    }
}

/// 安装核心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 宿主系统版本，用于兼容性检查
    #[serde(default = "default_system_version")]
    pub system_version: String,

    /// 依赖解析配置
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// 步骤超时配置
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// 安装跟踪配置
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,
}

fn default_system_version() -> String {
    "1.0.0".to_string()
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            system_version: default_system_version(),
            resolver: ResolverConfig::default(),
            timeouts: TimeoutConfig::default(),
            tracker: TrackerConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl InstallerConfig {
    /// 创建配置构建器
    pub fn builder() -> InstallerConfigBuilder {
        InstallerConfigBuilder::new()
    }

    /// 从文件加载配置
    ///
    /// `.json` 后缀按 JSON 解析，其余按 YAML 解析。加载后立即校验。
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            CoreError::ConfigLoadFailed(format!("无法读取 {}: {}", path.display(), e))
        })?;

        let mut config: InstallerConfig =
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                serde_json::from_str(&content)?
            } else {
                serde_yaml::from_str(&content)?
            };

        config.config_path = Some(path);
        config.validate()?;
        Ok(config)
    }

    /// 解析后的系统版本
    pub fn parsed_system_version(&self) -> Result<SemanticVersion> {
        SemanticVersion::parse(&self.system_version)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if SemanticVersion::parse(&self.system_version).is_err() {
            return Err(CoreError::InvalidConfigValue {
                key: "system_version".to_string(),
                reason: format!("无效的版本号: {}", self.system_version),
            });
        }
        if self.resolver.max_depth == 0 {
            return Err(CoreError::InvalidConfigValue {
                key: "resolver.max_depth".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        if self.resolver.catalog_cache_capacity == 0 {
            return Err(CoreError::InvalidConfigValue {
                key: "resolver.catalog_cache_capacity".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        if self.tracker.analytics_cache_capacity == 0 {
            return Err(CoreError::InvalidConfigValue {
                key: "tracker.analytics_cache_capacity".to_string(),
                reason: "必须大于 0".to_string(),
            });
        }
        for (key, value) in self.timeouts.entries() {
            if value == 0 {
                return Err(CoreError::InvalidConfigValue {
                    key: key.to_string(),
                    reason: "超时必须大于 0".to_string(),
                });
            }
        }
        Ok(())
    }

    /// 合并另一个配置（只覆盖非默认值）
    pub fn merge(&mut self, other: InstallerConfig) {
        if other.system_version != default_system_version() {
            self.system_version = other.system_version;
        }
        if other.resolver.max_depth != default_max_depth() {
            self.resolver.max_depth = other.resolver.max_depth;
        }
        if other.resolver.catalog_cache_ttl_secs != default_catalog_cache_ttl() {
            self.resolver.catalog_cache_ttl_secs = other.resolver.catalog_cache_ttl_secs;
        }
        if other.resolver.strict_conflicts {
            self.resolver.strict_conflicts = true;
        }
        if other.tracker.trend_days != default_trend_days() {
            self.tracker.trend_days = other.tracker.trend_days;
        }
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.logging.json_format {
            self.logging.json_format = true;
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct InstallerConfigBuilder {
    config: InstallerConfig,
}

impl InstallerConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置宿主系统版本
    pub fn system_version(mut self, version: impl Into<String>) -> Self {
        self.config.system_version = version.into();
        self
    }

    /// 设置最大解析深度
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.config.resolver.max_depth = depth;
        self
    }

    /// 设置目录缓存有效期
    pub fn catalog_cache_ttl_secs(mut self, secs: u64) -> Self {
        self.config.resolver.catalog_cache_ttl_secs = secs;
        self
    }

    /// 启用严格冲突模式
    pub fn strict_conflicts(mut self) -> Self {
        self.config.resolver.strict_conflicts = true;
        self
    }

    /// 设置步骤超时
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    /// 设置统计缓存有效期
    pub fn analytics_cache_ttl_secs(mut self, secs: u64) -> Self {
        self.config.tracker.analytics_cache_ttl_secs = secs;
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 启用 JSON 格式日志
    pub fn json_logging(mut self) -> Self {
        self.config.logging.json_format = true;
        self
    }

    /// 构建配置
    pub fn build(self) -> InstallerConfig {
        self.config
    }
}
