//! 模块元数据定义
//!
//! 目录返回的版本信息、兼容性约束与依赖边，以及模块清单文件 (`*.yaml`) 的结构。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::module::version::SemanticVersion;

/// 依赖类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// 必需依赖
    #[default]
    Required,
    /// 可选依赖
    Optional,
    /// 对等依赖，由宿主提供
    Peer,
    /// 开发依赖
    Dev,
}

impl DependencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyKind::Required => "required",
            DependencyKind::Optional => "optional",
            DependencyKind::Peer => "peer",
            DependencyKind::Dev => "dev",
        }
    }

    /// 解析失败是否阻断整个计划
    pub fn is_blocking(&self) -> bool {
        matches!(self, DependencyKind::Required)
    }
}

/// 兼容性约束
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compatibility {
    /// 最低宿主系统版本
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_system_version: Option<SemanticVersion>,

    /// 最高宿主系统版本
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_system_version: Option<SemanticVersion>,

    /// 租户下必须已存在（或随本次计划一起安装）的模块
    #[serde(default)]
    pub required_modules: Vec<String>,

    /// 不能与之共存的模块
    #[serde(default)]
    pub conflicting_modules: Vec<String>,
}

impl Compatibility {
    /// 检查宿主系统版本是否在范围内
    pub fn check_system_version(
        &self,
        system: &SemanticVersion,
    ) -> std::result::Result<(), String> {
        if let Some(min) = &self.min_system_version {
            if system < min {
                return Err(format!("系统版本 {} 低于最低要求 {}", system, min));
            }
        }
        if let Some(max) = &self.max_system_version {
            if system > max {
                return Err(format!("系统版本 {} 高于最高支持 {}", system, max));
            }
        }
        Ok(())
    }
}

/// 已发布版本的信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleVersionInfo {
    /// 版本号
    pub version: SemanticVersion,

    /// 发布时间
    #[serde(default = "Utc::now")]
    pub release_date: DateTime<Utc>,

    /// 破坏性变更说明
    #[serde(default)]
    pub breaking_changes: Vec<String>,

    /// 新特性说明
    #[serde(default)]
    pub new_features: Vec<String>,

    /// 兼容性约束
    #[serde(default)]
    pub compatibility: Compatibility,

    /// 下载引用，由传输层解释
    #[serde(default)]
    pub download_ref: String,

    /// 制品校验和（sha-256 十六进制）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// 制品大小（字节）
    #[serde(default)]
    pub size: u64,
}

impl ModuleVersionInfo {
    /// 创建仅含版本号的信息
    pub fn new(version: SemanticVersion) -> Self {
        Self {
            version,
            release_date: Utc::now(),
            breaking_changes: Vec::new(),
            new_features: Vec::new(),
            compatibility: Compatibility::default(),
            download_ref: String::new(),
            checksum: None,
            size: 0,
        }
    }

    pub fn with_breaking_change(mut self, change: impl Into<String>) -> Self {
        self.breaking_changes.push(change.into());
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_compatibility(mut self, compatibility: Compatibility) -> Self {
        self.compatibility = compatibility;
        self
    }

    pub fn has_breaking_changes(&self) -> bool {
        !self.breaking_changes.is_empty()
    }
}

/// 依赖边：`from_module` 依赖 `to_module`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from_module: String,
    pub to_module: String,
    /// 版本约束字符串，例如 `^1.2.0`
    pub constraint: String,
    pub kind: DependencyKind,
}

impl DependencyEdge {
    pub fn new(
        from_module: impl Into<String>,
        to_module: impl Into<String>,
        constraint: impl Into<String>,
        kind: DependencyKind,
    ) -> Self {
        Self {
            from_module: from_module.into(),
            to_module: to_module.into(),
            constraint: constraint.into(),
            kind,
        }
    }

    pub fn required(
        from_module: impl Into<String>,
        to_module: impl Into<String>,
        constraint: impl Into<String>,
    ) -> Self {
        Self::new(from_module, to_module, constraint, DependencyKind::Required)
    }
}

/// 清单中声明的依赖（不含依赖方）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredDependency {
    pub module_id: String,

    #[serde(default = "default_constraint")]
    pub version: String,

    #[serde(default)]
    pub kind: DependencyKind,
}

fn default_constraint() -> String {
    "*".to_string()
}

impl DeclaredDependency {
    pub fn into_edge(self, from_module: &str) -> DependencyEdge {
        DependencyEdge::new(from_module, self.module_id, self.version, self.kind)
    }
}

/// 清单中的单个版本
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestVersion {
    #[serde(flatten)]
    pub info: ModuleVersionInfo,

    #[serde(default)]
    pub dependencies: Vec<DeclaredDependency>,
}

/// 模块清单文件
///
/// ```yaml
/// id: auth
/// name: 认证服务
/// versions:
///   - version: 1.2.0
///     checksum: 9f86d0...
///     dependencies:
///       - module_id: crypto
///         version: ^2.0.0
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub versions: Vec<ManifestVersion>,
}

impl ModuleManifest {
    /// 校验清单
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.id.is_empty() {
            errors.push("模块 ID 不能为空".to_string());
        }
        if self.versions.is_empty() {
            errors.push(format!("模块 '{}' 没有任何版本", self.id));
        }

        let mut seen = std::collections::HashSet::new();
        for entry in &self.versions {
            if !seen.insert(entry.info.version.clone()) {
                errors.push(format!("版本 {} 重复声明", entry.info.version));
            }
            for dep in &entry.dependencies {
                if dep.module_id.is_empty() {
                    errors.push(format!("版本 {} 存在空的依赖 ID", entry.info.version));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> SemanticVersion {
        SemanticVersion::parse(s).unwrap()
    }

    #[test]
    fn test_dependency_kind_default() {
        assert_eq!(DependencyKind::default(), DependencyKind::Required);
        assert!(DependencyKind::Required.is_blocking());
        assert!(!DependencyKind::Optional.is_blocking());
    }

    #[test]
    fn test_system_version_bounds() {
        let compat = Compatibility {
            min_system_version: Some(v("1.2.0")),
            max_system_version: Some(v("2.0.0")),
            ..Default::default()
        };

        assert!(compat.check_system_version(&v("1.5.0")).is_ok());
        assert!(compat.check_system_version(&v("1.1.0")).is_err());
        assert!(compat.check_system_version(&v("2.0.1")).is_err());
    }

    #[test]
    fn test_parse_manifest_yaml() {
        let yaml = r#"
id: auth
name: Auth
versions:
  - version: 1.0.0
  - version: 1.1.0
    breaking_changes: ["token format"]
    dependencies:
      - module_id: crypto
        version: ^2.0.0
      - module_id: metrics
        kind: optional
"#;
        let manifest: ModuleManifest = serde_yaml::from_str(yaml).unwrap();
        assert!(manifest.validate().is_ok());
        assert_eq!(manifest.versions.len(), 2);

        let second = &manifest.versions[1];
        assert!(second.info.has_breaking_changes());
        assert_eq!(second.dependencies[0].version, "^2.0.0");
        assert_eq!(second.dependencies[1].version, "*");
        assert_eq!(second.dependencies[1].kind, DependencyKind::Optional);

        let edge = second.dependencies[0].clone().into_edge("auth");
        assert_eq!(edge.from_module, "auth");
        assert_eq!(edge.kind, DependencyKind::Required);
    }

    #[test]
    fn test_manifest_rejects_invalid_version() {
        let yaml = "id: auth\nversions:\n  - version: 1.0\n";
        assert!(serde_yaml::from_str::<ModuleManifest>(yaml).is_err());
    }

    #[test]
    fn test_manifest_duplicate_versions() {
        let manifest = ModuleManifest {
            id: "auth".to_string(),
            name: None,
            description: None,
            versions: vec![
                ManifestVersion {
                    info: ModuleVersionInfo::new(v("1.0.0")),
                    dependencies: vec![],
                },
                ManifestVersion {
                    info: ModuleVersionInfo::new(v("1.0.0")),
                    dependencies: vec![],
                },
            ],
        };
        let errors = manifest.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
    }
}
