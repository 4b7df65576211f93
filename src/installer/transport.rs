//! 制品传输
//!
//! 下载、校验、解压与删除模块文件。备份管理器通过快照/恢复接口保存和还原租户下的模块文件。
//!
//! - [`InMemoryTransport`] - 内存实现，可注入故障
//! - [`FsPackageTransport`] - 文件系统实现，制品位于 `<root>/<module>/<version>.pkg`

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::module::metadata::ModuleVersionInfo;
use crate::module::version::SemanticVersion;
use crate::utils::{CoreError, Result};

/// 版本标记文件名
pub const VERSION_FILE: &str = "VERSION";

/// 计算 sha-256 十六进制摘要
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// 已下载的制品
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub module_id: String,
    pub version: SemanticVersion,
    /// 制品位置，由具体实现解释
    pub location: String,
    /// 下载内容的 sha-256
    pub checksum: String,
    pub size: u64,
}

/// 模块文件快照：相对路径 -> 内容
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub files: BTreeMap<String, Vec<u8>>,
}

impl FileSnapshot {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// 快照中记录的版本号
    pub fn version(&self) -> Option<String> {
        self.files
            .get(VERSION_FILE)
            .map(|bytes| String::from_utf8_lossy(bytes).trim().to_string())
    }
}

/// 制品传输接口
#[async_trait]
pub trait PackageTransport: Send + Sync {
    /// 下载制品
    async fn download(&self, module_id: &str, info: &ModuleVersionInfo) -> Result<ArtifactRef>;

    /// 校验制品是否与期望的校验和一致
    async fn verify(&self, artifact: &ArtifactRef, checksum: &str) -> Result<bool>;

    /// 解压制品到租户目录，替换已有文件
    async fn install(&self, artifact: &ArtifactRef, tenant_id: &str) -> Result<()>;

    /// 删除租户下的模块文件，不存在时视为成功
    async fn remove(&self, module_id: &str, tenant_id: &str) -> Result<()>;

    /// 读取租户下的模块文件
    async fn snapshot(&self, module_id: &str, tenant_id: &str) -> Result<FileSnapshot>;

    /// 用快照替换租户下的模块文件，空快照等同删除
    async fn restore(&self, module_id: &str, tenant_id: &str, snapshot: &FileSnapshot) -> Result<()>;
}

// ============================================================================
// 内存实现
// ============================================================================

/// 可注入的故障点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportFault {
    /// 下载失败
    Download,
    /// 下载内容被篡改，校验和不匹配
    Corrupt,
    /// 解压失败
    Install,
    /// 删除失败
    Remove,
    /// 恢复失败
    Restore,
}

/// 内存制品传输
#[derive(Default)]
pub struct InMemoryTransport {
    packages: RwLock<HashMap<(String, String), Vec<u8>>>,
    artifacts: RwLock<HashMap<String, Vec<u8>>>,
    installed: RwLock<HashMap<(String, String), FileSnapshot>>,
    faults: Mutex<HashMap<(TransportFault, String), usize>>,
    delay: Mutex<Option<Duration>>,
    downloads: AtomicU64,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn default_package(module_id: &str, version: &str) -> Vec<u8> {
        format!("{}@{}", module_id, version).into_bytes()
    }

    /// 注册制品内容，返回其校验和
    pub async fn add_package(&self, module_id: &str, version: &str, bytes: Vec<u8>) -> String {
        let checksum = sha256_hex(&bytes);
        self.packages
            .write()
            .await
            .insert((module_id.to_string(), version.to_string()), bytes);
        checksum
    }

    /// 制品的校验和（未注册时使用默认内容）
    pub async fn package_checksum(&self, module_id: &str, version: &str) -> String {
        let packages = self.packages.read().await;
        match packages.get(&(module_id.to_string(), version.to_string())) {
            Some(bytes) => sha256_hex(bytes),
            None => sha256_hex(&Self::default_package(module_id, version)),
        }
    }

    /// 注入故障，`times` 次后自动恢复
    pub fn inject_fault(&self, fault: TransportFault, module_id: &str, times: usize) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.insert((fault, module_id.to_string()), times);
    }

    /// 注入永久故障
    pub fn fail_always(&self, fault: TransportFault, module_id: &str) {
        self.inject_fault(fault, module_id, usize::MAX);
    }

    /// 清除所有故障
    pub fn clear_faults(&self) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// 设置下载延迟
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// 下载次数
    pub fn download_count(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    /// 租户下已安装文件中的版本号
    pub async fn installed_version(&self, tenant_id: &str, module_id: &str) -> Option<String> {
        self.installed
            .read()
            .await
            .get(&(tenant_id.to_string(), module_id.to_string()))
            .and_then(FileSnapshot::version)
    }

    fn take_fault(&self, fault: TransportFault, module_id: &str) -> bool {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        let key = (fault, module_id.to_string());
        match faults.get_mut(&key) {
            Some(remaining) if *remaining > 0 => {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl PackageTransport for InMemoryTransport {
    async fn download(&self, module_id: &str, info: &ModuleVersionInfo) -> Result<ArtifactRef> {
        self.downloads.fetch_add(1, Ordering::Relaxed);
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.take_fault(TransportFault::Download, module_id) {
            return Err(CoreError::DownloadFailed {
                module: module_id.to_string(),
                reason: "注入的下载故障".to_string(),
            });
        }

        let version = info.version.to_string();
        let mut bytes = {
            let packages = self.packages.read().await;
            packages
                .get(&(module_id.to_string(), version.clone()))
                .cloned()
                .unwrap_or_else(|| Self::default_package(module_id, &version))
        };
        if self.take_fault(TransportFault::Corrupt, module_id) {
            bytes.push(0xff);
        }

        let location = format!("mem://{}/{}", module_id, version);
        let artifact = ArtifactRef {
            module_id: module_id.to_string(),
            version: info.version.clone(),
            location: location.clone(),
            checksum: sha256_hex(&bytes),
            size: bytes.len() as u64,
        };
        self.artifacts.write().await.insert(location, bytes);
        Ok(artifact)
    }

    async fn verify(&self, artifact: &ArtifactRef, checksum: &str) -> Result<bool> {
        let artifacts = self.artifacts.read().await;
        let bytes = artifacts.get(&artifact.location).ok_or_else(|| CoreError::DownloadFailed {
            module: artifact.module_id.clone(),
            reason: format!("制品不存在: {}", artifact.location),
        })?;
        Ok(sha256_hex(bytes).eq_ignore_ascii_case(checksum))
    }

    async fn install(&self, artifact: &ArtifactRef, tenant_id: &str) -> Result<()> {
        if self.take_fault(TransportFault::Install, &artifact.module_id) {
            return Err(CoreError::StepFailed {
                step: "installing".to_string(),
                reason: "注入的解压故障".to_string(),
            });
        }

        let bytes = self
            .artifacts
            .read()
            .await
            .get(&artifact.location)
            .cloned()
            .ok_or_else(|| CoreError::StepFailed {
                step: "installing".to_string(),
                reason: format!("制品不存在: {}", artifact.location),
            })?;

        let mut snapshot = FileSnapshot::default();
        snapshot.files.insert("package.bin".to_string(), bytes);
        snapshot
            .files
            .insert(VERSION_FILE.to_string(), artifact.version.to_string().into_bytes());

        self.installed
            .write()
            .await
            .insert((tenant_id.to_string(), artifact.module_id.clone()), snapshot);
        Ok(())
    }

    async fn remove(&self, module_id: &str, tenant_id: &str) -> Result<()> {
        if self.take_fault(TransportFault::Remove, module_id) {
            return Err(CoreError::StepFailed {
                step: "removing".to_string(),
                reason: "注入的删除故障".to_string(),
            });
        }
        self.installed
            .write()
            .await
            .remove(&(tenant_id.to_string(), module_id.to_string()));
        Ok(())
    }

    async fn snapshot(&self, module_id: &str, tenant_id: &str) -> Result<FileSnapshot> {
        Ok(self
            .installed
            .read()
            .await
            .get(&(tenant_id.to_string(), module_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn restore(&self, module_id: &str, tenant_id: &str, snapshot: &FileSnapshot) -> Result<()> {
        if self.take_fault(TransportFault::Restore, module_id) {
            return Err(CoreError::StepFailed {
                step: "restoring".to_string(),
                reason: "注入的恢复故障".to_string(),
            });
        }
        let key = (tenant_id.to_string(), module_id.to_string());
        let mut installed = self.installed.write().await;
        if snapshot.is_empty() {
            installed.remove(&key);
        } else {
            installed.insert(key, snapshot.clone());
        }
        Ok(())
    }
}

// ============================================================================
// 文件系统实现
// ============================================================================

/// 制品包内容
///
/// `.pkg` 文件是一个 JSON 对象 `{"files": {"相对路径": "文本内容"}}`；
/// 无法按此格式解析的制品原样保存为 `package.bin`。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageBundle {
    pub files: BTreeMap<String, String>,
}

/// 文件系统制品传输
///
/// 制品位于 `<package_root>/<module>/<version>.pkg`，
/// 安装到 `<install_root>/<tenant>/<module>/`。
#[derive(Debug, Clone)]
pub struct FsPackageTransport {
    package_root: PathBuf,
    install_root: PathBuf,
}

impl FsPackageTransport {
    pub fn new(package_root: impl Into<PathBuf>, install_root: impl Into<PathBuf>) -> Self {
        Self {
            package_root: package_root.into(),
            install_root: install_root.into(),
        }
    }

    /// 模块在租户下的安装目录
    pub fn module_dir(&self, module_id: &str, tenant_id: &str) -> Result<PathBuf> {
        ensure_relative(tenant_id)?;
        ensure_relative(module_id)?;
        Ok(self.install_root.join(tenant_id).join(module_id))
    }

    fn package_path(&self, module_id: &str, version: &SemanticVersion) -> Result<PathBuf> {
        ensure_relative(module_id)?;
        Ok(self
            .package_root
            .join(module_id)
            .join(format!("{}.pkg", version)))
    }

    async fn write_files(dir: &Path, files: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        for (relative, content) in files {
            ensure_relative(relative)?;
            let target = dir.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, content).await?;
        }
        Ok(())
    }

    async fn remove_dir(dir: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 拒绝绝对路径与 `..`
fn ensure_relative(path: &str) -> Result<()> {
    let valid = !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidRequest(format!("非法路径: '{}'", path)))
    }
}

#[async_trait]
impl PackageTransport for FsPackageTransport {
    async fn download(&self, module_id: &str, info: &ModuleVersionInfo) -> Result<ArtifactRef> {
        let path = self.package_path(module_id, &info.version)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| CoreError::DownloadFailed {
            module: module_id.to_string(),
            reason: format!("{}: {}", path.display(), e),
        })?;
        debug!(module_id, path = %path.display(), size = bytes.len(), "制品已读取");

        Ok(ArtifactRef {
            module_id: module_id.to_string(),
            version: info.version.clone(),
            location: path.to_string_lossy().into_owned(),
            checksum: sha256_hex(&bytes),
            size: bytes.len() as u64,
        })
    }

    async fn verify(&self, artifact: &ArtifactRef, checksum: &str) -> Result<bool> {
        let bytes = tokio::fs::read(&artifact.location).await?;
        Ok(sha256_hex(&bytes).eq_ignore_ascii_case(checksum))
    }

    async fn install(&self, artifact: &ArtifactRef, tenant_id: &str) -> Result<()> {
        let dir = self.module_dir(&artifact.module_id, tenant_id)?;
        let bytes = tokio::fs::read(&artifact.location).await?;

        let mut files: BTreeMap<String, Vec<u8>> = match serde_json::from_slice::<PackageBundle>(&bytes) {
            Ok(bundle) => bundle
                .files
                .into_iter()
                .map(|(path, content)| (path, content.into_bytes()))
                .collect(),
            Err(_) => {
                warn!(location = %artifact.location, "制品不是 JSON 包，原样保存");
                BTreeMap::from([("package.bin".to_string(), bytes)])
            }
        };
        files.insert(
            VERSION_FILE.to_string(),
            artifact.version.to_string().into_bytes(),
        );

        Self::remove_dir(&dir).await?;
        Self::write_files(&dir, &files).await
    }

    async fn remove(&self, module_id: &str, tenant_id: &str) -> Result<()> {
        Self::remove_dir(&self.module_dir(module_id, tenant_id)?).await
    }

    async fn snapshot(&self, module_id: &str, tenant_id: &str) -> Result<FileSnapshot> {
        let dir = self.module_dir(module_id, tenant_id)?;
        let mut snapshot = FileSnapshot::default();
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(snapshot);
        }

        let mut pending = vec![dir.clone()];
        while let Some(current) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let relative = path
                    .strip_prefix(&dir)
                    .map_err(|e| CoreError::Internal(e.to_string()))?
                    .to_string_lossy()
                    .replace('\\', "/");
                snapshot.files.insert(relative, tokio::fs::read(&path).await?);
            }
        }
        Ok(snapshot)
    }

    async fn restore(&self, module_id: &str, tenant_id: &str, snapshot: &FileSnapshot) -> Result<()> {
        let dir = self.module_dir(module_id, tenant_id)?;
        Self::remove_dir(&dir).await?;
        if snapshot.is_empty() {
            return Ok(());
        }
        Self::write_files(&dir, &snapshot.files).await
    }
}
