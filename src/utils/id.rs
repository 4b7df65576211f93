//! ID 生成与标识符校验
//!
//! - 10 位 62 进制 ID（0-9, a-z, A-Z），用于安装、回滚、备份等记录
//! - 带前缀的 ID，便于在日志中区分记录类型
//! - 模块 ID / 租户 ID 的格式校验

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use regex::Regex;

use crate::utils::{CoreError, Result};

/// 62 进制字符集
const BASE62_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// ID 长度
const ID_LENGTH: usize = 10;

/// 模块 ID / 租户 ID 允许的格式
const IDENTIFIER_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._@/-]{0,127}$";

/// 安装记录 ID 前缀
pub const INSTALLATION_PREFIX: &str = "inst";
/// 回滚记录 ID 前缀
pub const ROLLBACK_PREFIX: &str = "rb";
/// 备份引用前缀
pub const BACKUP_PREFIX: &str = "bk";
/// 历史记录 ID 前缀
pub const HISTORY_PREFIX: &str = "hist";

/// 生成 10 位 62 进制 ID
///
/// 使用时间戳与随机数组合。
///
/// # Example
///
/// ```
/// use chips_installer::utils::id::generate_id;
///
/// let id = generate_id();
/// assert_eq!(id.len(), 10);
/// ```
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let random: u64 = rng.gen();
    let mut value = timestamp ^ random;

    let mut result = String::with_capacity(ID_LENGTH);
    for _ in 0..ID_LENGTH {
        let index = (value % 62) as usize;
        result.push(BASE62_CHARS[index] as char);
        value /= 62;
    }

    result.chars().rev().collect()
}

/// 生成带前缀的 ID，例如 `inst_a1B2c3D4e5`
pub fn prefixed_id(prefix: &str) -> String {
    format!("{}_{}", prefix, generate_id())
}

/// 验证 ID 格式是否有效
///
/// ```
/// use chips_installer::utils::id::is_valid_id;
///
/// assert!(is_valid_id("a1B2c3D4e5"));
/// assert!(!is_valid_id("too-short"));
/// ```
pub fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LENGTH && id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// 生成 UUID v4 格式的 ID
///
/// 用于事件 ID 等需要全局唯一性的场景
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(IDENTIFIER_PATTERN).expect("标识符正则表达式有效"))
}

/// 校验模块 ID 或租户 ID
///
/// `kind` 仅用于错误信息，例如 "module_id"。
pub fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    if identifier_regex().is_match(value) {
        Ok(())
    } else {
        Err(CoreError::InvalidRequest(format!(
            "{} 格式无效: '{}'",
            kind, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_id_length() {
        let id = generate_id();
        assert_eq!(id.len(), ID_LENGTH);
        assert!(is_valid_id(&id));
    }

    #[test]
    fn test_generate_id_uniqueness() {
        let mut ids = HashSet::new();
        for _ in 0..1000 {
            assert!(ids.insert(generate_id()), "ID collision detected");
        }
    }

    #[test]
    fn test_prefixed_id() {
        let id = prefixed_id(ROLLBACK_PREFIX);
        assert!(id.starts_with("rb_"));
        assert_eq!(id.len(), 3 + ID_LENGTH);
    }

    #[test]
    fn test_is_valid_id() {
        assert!(is_valid_id("0000000000"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("a1B2c3D4e!"));
    }

    #[test]
    fn test_generate_uuid() {
        let uuid = generate_uuid();
        assert_eq!(uuid.len(), 36);
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("module_id", "auth-service").is_ok());
        assert!(validate_identifier("module_id", "@scope/widget").is_err());
        assert!(validate_identifier("tenant_id", "tenant.eu-1").is_ok());
        assert!(validate_identifier("tenant_id", "").is_err());
        assert!(validate_identifier("tenant_id", "bad tenant").is_err());
    }
}
