//! 模块目录
//!
//! 依赖解析器通过 [`ModuleCatalog`] 查询模块的已发布版本与依赖声明。
//!
//! - [`InMemoryCatalog`] - 内存目录，用于测试与嵌入
//! - [`FileCatalog`] - 从目录中的 `*.yaml` 清单加载
//! - [`CachedCatalog`] - 为任意目录增加带有效期的缓存

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::module::metadata::{
    DependencyEdge, DependencyKind, ModuleManifest, ModuleVersionInfo,
};
use crate::module::version::SemanticVersion;
use crate::utils::{CacheStats, CoreError, Result, TtlCache};

/// 模块目录接口
#[async_trait]
pub trait ModuleCatalog: Send + Sync {
    /// 获取模块的所有已发布版本
    ///
    /// 模块不存在时返回 [`CoreError::ModuleNotFound`]。
    async fn get_versions(&self, module_id: &str) -> Result<Vec<ModuleVersionInfo>>;

    /// 获取指定版本声明的依赖
    async fn get_dependencies(
        &self,
        module_id: &str,
        version: &SemanticVersion,
    ) -> Result<Vec<DependencyEdge>>;
}

#[derive(Debug, Clone)]
struct PublishedVersion {
    info: ModuleVersionInfo,
    dependencies: Vec<DependencyEdge>,
}

/// 内存目录
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    modules: RwLock<HashMap<String, Vec<PublishedVersion>>>,
    lookups: AtomicU64,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发布一个版本，同号版本会被替换
    pub fn publish(&self, module_id: &str, info: ModuleVersionInfo, dependencies: Vec<DependencyEdge>) {
        let mut modules = self.modules.write().unwrap_or_else(|e| e.into_inner());
        let versions = modules.entry(module_id.to_string()).or_default();
        versions.retain(|p| p.info.version != info.version);
        versions.push(PublishedVersion { info, dependencies });
        versions.sort_by(|a, b| a.info.version.cmp(&b.info.version));
    }

    /// 发布一个只含必需依赖的版本
    ///
    /// ```rust
    /// use chips_installer::module::catalog::InMemoryCatalog;
    ///
    /// let catalog = InMemoryCatalog::new();
    /// catalog.add("app", "1.0.0", &[("db", "^2.0.0")]).unwrap();
    /// catalog.add("db", "2.1.0", &[]).unwrap();
    /// ```
    pub fn add(&self, module_id: &str, version: &str, dependencies: &[(&str, &str)]) -> Result<()> {
        let deps: Vec<(&str, &str, DependencyKind)> = dependencies
            .iter()
            .map(|(id, constraint)| (*id, *constraint, DependencyKind::Required))
            .collect();
        self.add_with_kinds(module_id, version, &deps)
    }

    /// 发布一个带依赖类型的版本
    pub fn add_with_kinds(
        &self,
        module_id: &str,
        version: &str,
        dependencies: &[(&str, &str, DependencyKind)],
    ) -> Result<()> {
        let info = ModuleVersionInfo::new(SemanticVersion::parse(version)?);
        let edges = dependencies
            .iter()
            .map(|(id, constraint, kind)| DependencyEdge::new(module_id, *id, *constraint, *kind))
            .collect();
        self.publish(module_id, info, edges);
        Ok(())
    }

    /// 载入模块清单
    pub fn load_manifest(&self, manifest: ModuleManifest) {
        let module_id = manifest.id.clone();
        for entry in manifest.versions {
            let edges = entry
                .dependencies
                .into_iter()
                .map(|dep| dep.into_edge(&module_id))
                .collect();
            self.publish(&module_id, entry.info, edges);
        }
    }

    /// 移除模块
    pub fn remove_module(&self, module_id: &str) -> bool {
        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(module_id)
            .is_some()
    }

    /// 所有模块 ID
    pub fn module_ids(&self) -> Vec<String> {
        let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = modules.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.modules.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 目录被实际查询的次数
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    fn find_version(&self, module_id: &str, version: &SemanticVersion) -> Result<PublishedVersion> {
        let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
        let versions = modules
            .get(module_id)
            .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))?;
        versions
            .iter()
            .find(|p| &p.info.version == version)
            .cloned()
            .ok_or_else(|| CoreError::NoSatisfyingVersion {
                module: module_id.to_string(),
                constraint: format!("={}", version),
            })
    }
}

#[async_trait]
impl ModuleCatalog for InMemoryCatalog {
    async fn get_versions(&self, module_id: &str) -> Result<Vec<ModuleVersionInfo>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
        modules
            .get(module_id)
            .map(|versions| versions.iter().map(|p| p.info.clone()).collect())
            .ok_or_else(|| CoreError::ModuleNotFound(module_id.to_string()))
    }

    async fn get_dependencies(
        &self,
        module_id: &str,
        version: &SemanticVersion,
    ) -> Result<Vec<DependencyEdge>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self.find_version(module_id, version)?.dependencies)
    }
}

/// 基于清单目录的模块目录
///
/// 启动时扫描目录下的 `*.yaml` / `*.yml` 文件，每个文件是一个 [`ModuleManifest`]。
pub struct FileCatalog {
    root: PathBuf,
    inner: InMemoryCatalog,
}

impl FileCatalog {
    /// 从目录加载
    pub async fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let catalog = Self {
            root: root.into(),
            inner: InMemoryCatalog::new(),
        };
        catalog.reload().await?;
        Ok(catalog)
    }

    /// 清单目录
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 重新扫描清单目录
    ///
    /// 单个清单解析失败只记录警告，不影响其他清单。返回成功加载的模块数量。
    pub async fn reload(&self) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut loaded = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_manifest = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_manifest {
                continue;
            }

            match Self::read_manifest(&path).await {
                Ok(manifest) => loaded.push(manifest),
                Err(e) => warn!(path = %path.display(), error = %e, "跳过无效的模块清单"),
            }
        }

        for id in self.inner.module_ids() {
            self.inner.remove_module(&id);
        }
        let count = loaded.len();
        for manifest in loaded {
            debug!(module_id = %manifest.id, versions = manifest.versions.len(), "载入模块清单");
            self.inner.load_manifest(manifest);
        }

        info!(root = %self.root.display(), modules = count, "模块目录已加载");
        Ok(count)
    }

    async fn read_manifest(path: &Path) -> Result<ModuleManifest> {
        let content = tokio::fs::read_to_string(path).await?;
        let manifest: ModuleManifest = serde_yaml::from_str(&content)?;
        manifest.validate().map_err(|errors| {
            CoreError::InvalidRequest(format!("{}: {}", path.display(), errors.join("; ")))
        })?;
        Ok(manifest)
    }

    /// 所有模块 ID
    pub fn module_ids(&self) -> Vec<String> {
        self.inner.module_ids()
    }
}

#[async_trait]
impl ModuleCatalog for FileCatalog {
    async fn get_versions(&self, module_id: &str) -> Result<Vec<ModuleVersionInfo>> {
        self.inner.get_versions(module_id).await
    }

    async fn get_dependencies(
        &self,
        module_id: &str,
        version: &SemanticVersion,
    ) -> Result<Vec<DependencyEdge>> {
        self.inner.get_dependencies(module_id, version).await
    }
}

/// 带缓存的目录
///
/// 成功的查询结果按有效期缓存，错误不缓存。
pub struct CachedCatalog {
    inner: Arc<dyn ModuleCatalog>,
    versions: TtlCache<String, Vec<ModuleVersionInfo>>,
    dependencies: TtlCache<(String, SemanticVersion), Vec<DependencyEdge>>,
}

impl CachedCatalog {
    pub fn new(inner: Arc<dyn ModuleCatalog>, capacity: usize, ttl: Duration) -> Self {
        Self {
            inner,
            versions: TtlCache::new(capacity, ttl),
            dependencies: TtlCache::new(capacity, ttl),
        }
    }

    /// 失效某个模块的缓存
    pub fn invalidate(&self, module_id: &str) {
        self.versions.invalidate(&module_id.to_string());
        self.dependencies.invalidate_where(|(id, _)| id == module_id);
    }

    /// 清空缓存
    pub fn clear(&self) {
        self.versions.clear();
        self.dependencies.clear();
    }

    /// 版本查询缓存统计
    pub fn version_cache_stats(&self) -> CacheStats {
        self.versions.stats()
    }

    /// 依赖查询缓存统计
    pub fn dependency_cache_stats(&self) -> CacheStats {
        self.dependencies.stats()
    }
}

#[async_trait]
impl ModuleCatalog for CachedCatalog {
    async fn get_versions(&self, module_id: &str) -> Result<Vec<ModuleVersionInfo>> {
        let key = module_id.to_string();
        if let Some(versions) = self.versions.get(&key) {
            return Ok(versions);
        }
        let versions = self.inner.get_versions(module_id).await?;
        self.versions.put(key, versions.clone());
        Ok(versions)
    }

    async fn get_dependencies(
        &self,
        module_id: &str,
        version: &SemanticVersion,
    ) -> Result<Vec<DependencyEdge>> {
        let key = (module_id.to_string(), version.clone());
        if let Some(edges) = self.dependencies.get(&key) {
            return Ok(edges);
        }
        let edges = self.inner.get_dependencies(module_id, version).await?;
        self.dependencies.put(key, edges.clone());
        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn v(s: &str) -> SemanticVersion {
        SemanticVersion::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_catalog() {
        let catalog = InMemoryCatalog::new();
        catalog.add("app", "1.1.0", &[("db", "^2.0.0")]).unwrap();
        catalog.add("app", "1.0.0", &[]).unwrap();

        let versions = catalog.get_versions("app").await.unwrap();
        let listed: Vec<String> = versions.iter().map(|i| i.version.to_string()).collect();
        assert_eq!(listed, vec!["1.0.0", "1.1.0"]);

        let deps = catalog.get_dependencies("app", &v("1.1.0")).await.unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].to_module, "db");
        assert_eq!(deps[0].from_module, "app");
    }

    #[tokio::test]
    async fn test_in_memory_catalog_missing() {
        let catalog = InMemoryCatalog::new();
        assert!(matches!(
            catalog.get_versions("ghost").await,
            Err(CoreError::ModuleNotFound(_))
        ));

        catalog.add("app", "1.0.0", &[]).unwrap();
        assert!(matches!(
            catalog.get_dependencies("app", &v("9.0.0")).await,
            Err(CoreError::NoSatisfyingVersion { .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_replaces_same_version() {
        let catalog = InMemoryCatalog::new();
        catalog.add("app", "1.0.0", &[("db", "*")]).unwrap();
        catalog.add("app", "1.0.0", &[]).unwrap();

        assert_eq!(catalog.get_versions("app").await.unwrap().len(), 1);
        assert!(catalog.get_dependencies("app", &v("1.0.0")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cached_catalog_hits() {
        let inner = Arc::new(InMemoryCatalog::new());
        inner.add("app", "1.0.0", &[]).unwrap();
        let cached = CachedCatalog::new(inner.clone(), 16, Duration::from_secs(60));

        cached.get_versions("app").await.unwrap();
        cached.get_versions("app").await.unwrap();
        cached.get_dependencies("app", &v("1.0.0")).await.unwrap();
        cached.get_dependencies("app", &v("1.0.0")).await.unwrap();

        assert_eq!(inner.lookups(), 2);
        assert_eq!(cached.version_cache_stats().hits, 1);

        cached.invalidate("app");
        cached.get_versions("app").await.unwrap();
        assert_eq!(inner.lookups(), 3);
    }

    #[tokio::test]
    async fn test_cached_catalog_does_not_cache_errors() {
        let inner = Arc::new(InMemoryCatalog::new());
        let cached = CachedCatalog::new(inner.clone(), 16, Duration::from_secs(60));

        assert!(cached.get_versions("late").await.is_err());
        inner.add("late", "1.0.0", &[]).unwrap();
        assert!(cached.get_versions("late").await.is_ok());
    }

    #[tokio::test]
    async fn test_file_catalog() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(
            dir.path().join("app.yaml"),
            "id: app\nversions:\n  - version: 1.0.0\n    dependencies:\n      - module_id: db\n        version: ^2.0.0\n",
        )
        .await
        .unwrap();
        tokio::fs::write(dir.path().join("db.yml"), "id: db\nversions:\n  - version: 2.3.0\n")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("broken.yaml"), "id: broken\nversions: []\n")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), "ignored").await.unwrap();

        let catalog = FileCatalog::load(dir.path()).await.unwrap();
        assert_eq!(catalog.module_ids(), vec!["app", "db"]);

        let deps = catalog.get_dependencies("app", &v("1.0.0")).await.unwrap();
        assert_eq!(deps[0].constraint, "^2.0.0");
        assert!(catalog.get_versions("broken").await.is_err());
    }
}
