//! 模块目录与依赖解析
//!
//! 包含依赖解析的核心组件：
//! - 语义化版本与版本约束
//! - 模块版本元数据与清单
//! - 模块目录接口及其内存、文件、缓存实现
//! - 依赖图与解析器

pub mod catalog;
pub mod dependency;
pub mod metadata;
pub mod version;

// 重导出常用类型
pub use catalog::{CachedCatalog, FileCatalog, InMemoryCatalog, ModuleCatalog};
pub use dependency::{
    Conflict, ConflictKind, DependencyGraph, DependencyResolver, ResolutionPlan, ResolveOptions,
    ResolvedStep,
};
pub use metadata::{
    Compatibility, DeclaredDependency, DependencyEdge, DependencyKind, ManifestVersion,
    ModuleManifest, ModuleVersionInfo,
};
pub use version::{satisfies, ConstraintOp, SemanticVersion, VersionConstraint};
