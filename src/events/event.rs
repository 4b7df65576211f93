//! 生命周期事件数据结构

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::generate_uuid;

/// 发布方标识
pub const INSTALLER_SENDER: &str = "installer";

/// 生命周期事件类型
pub mod lifecycle_events {
    /// 安装/更新/卸载开始
    pub const INSTALLATION_STARTED: &str = "installation.started";
    /// 状态迁移
    pub const INSTALLATION_PROGRESS: &str = "installation.progress";
    /// 成功完成
    pub const INSTALLATION_COMPLETED: &str = "installation.completed";
    /// 失败（含已回滚）
    pub const INSTALLATION_FAILED: &str = "installation.failed";
    /// 回滚开始
    pub const ROLLBACK_STARTED: &str = "rollback.started";
    /// 回滚完成
    pub const ROLLBACK_COMPLETED: &str = "rollback.completed";
    /// 回滚失败，需要人工介入
    pub const ROLLBACK_FAILED: &str = "rollback.failed";
}

/// 事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// 事件唯一标识
    pub event_id: String,

    /// 事件类型（格式: category.name，如 installation.started）
    pub event_type: String,

    /// 发送方
    pub sender: String,

    /// 事件数据
    #[serde(default)]
    pub data: Value,

    /// 事件时间戳
    pub timestamp: DateTime<Utc>,

    /// 扩展元数据
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Event {
    /// 创建新事件
    pub fn new(event_type: impl Into<String>, sender: impl Into<String>, data: Value) -> Self {
        Self {
            event_id: generate_uuid(),
            event_type: event_type.into(),
            sender: sender.into(),
            data,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// 由安装核心发出的事件
    pub fn lifecycle(event_type: &str, data: Value) -> Self {
        Self::new(event_type, INSTALLER_SENDER, data)
    }

    /// 添加元数据
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// 事件数据中的字符串字段
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤（支持通配符 *）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    /// 数据字段过滤，字段值必须完全相等
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data_filters: HashMap<String, Value>,
}

impl EventFilter {
    /// 创建空过滤器（匹配所有）
    pub fn new() -> Self {
        Self::default()
    }

    /// 按事件类型过滤
    pub fn by_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            data_filters: HashMap::new(),
        }
    }

    /// 只接收某个模块的事件
    pub fn with_module(self, module_id: &str) -> Self {
        self.with_field("module_id", Value::String(module_id.to_string()))
    }

    /// 只接收某个租户的事件
    pub fn with_tenant(self, tenant_id: &str) -> Self {
        self.with_field("tenant_id", Value::String(tenant_id.to_string()))
    }

    /// 添加数据字段过滤
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data_filters.insert(key.into(), value);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref pattern) = self.event_type {
            if !matches_pattern(pattern, &event.event_type) {
                return false;
            }
        }

        self.data_filters
            .iter()
            .all(|(key, expected)| event.data.get(key) == Some(expected))
    }
}

/// 匹配事件类型模式
///
/// `*` 匹配所有类型，`prefix.*` 匹配 `prefix.` 下的所有类型。
pub fn matches_pattern(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix(".*") {
        return value.len() > prefix.len() + 1
            && value.starts_with(prefix)
            && value.as_bytes()[prefix.len()] == b'.';
    }

    pattern == value
}
