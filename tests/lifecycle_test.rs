//! 安装生命周期集成测试
//!
//! 通过 InstallerService 测试安装、更新、卸载、回滚与并发互斥

use chips_installer::installer::{
    FsPackageTransport, HookStage, InMemoryInstallationStore, InMemoryTransport,
    InstallationStore, PackageBundle, ScriptedHooks, TransportFault,
};
use chips_installer::module::{DependencyKind, InMemoryCatalog, ModuleVersionInfo, SemanticVersion};
use chips_installer::{
    error_code, lifecycle_events, Event, HistoryFilter, HistoryStatus, InstallAction,
    InstallOptions, InstallerConfig, InstallerService, RollbackFilter, RollbackStatus,
    TimeoutConfig, UninstallOptions, UpdateOptions,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// 测试辅助结构
// ============================================================================

struct Harness {
    store: Arc<InMemoryInstallationStore>,
    transport: Arc<InMemoryTransport>,
    hooks: Arc<ScriptedHooks>,
    service: InstallerService,
}

impl Harness {
    fn new(catalog: InMemoryCatalog) -> Self {
        Self::with_config(catalog, InstallerConfig::default())
    }

    fn with_config(catalog: InMemoryCatalog, config: InstallerConfig) -> Self {
        let store = Arc::new(InMemoryInstallationStore::new());
        let transport = Arc::new(InMemoryTransport::new());
        let hooks = Arc::new(ScriptedHooks::new());
        let service = InstallerService::builder()
            .config(config)
            .catalog(Arc::new(catalog))
            .store(store.clone())
            .transport(transport.clone())
            .hooks(hooks.clone())
            .build()
            .unwrap();
        Self {
            store,
            transport,
            hooks,
            service,
        }
    }

    async fn installed_version(&self, tenant_id: &str, module_id: &str) -> Option<String> {
        self.store
            .get(tenant_id, module_id)
            .await
            .unwrap()
            .map(|r| r.version.to_string())
    }
}

fn auth_catalog() -> InMemoryCatalog {
    let catalog = InMemoryCatalog::new();
    catalog.add("auth", "1.0.0", &[]).unwrap();
    catalog.add("auth", "2.0.0", &[]).unwrap();
    catalog
}

// ============================================================================
// 回滚
// ============================================================================

/// 配置失败时恢复到之前的版本
#[tokio::test]
async fn test_configure_failure_restores_previous_version() {
    let h = Harness::new(auth_catalog());
    let options = InstallOptions::default();
    assert!(h.service.install("auth", "t1", Some("1.0.0"), &options).await.success);

    h.hooks
        .fail(HookStage::Configure, "auth", Some("2.0.0"), "配置写入失败");
    let result = h.service.install("auth", "t1", Some("2.0.0"), &options).await;

    assert!(!result.success);
    assert_eq!(h.installed_version("t1", "auth").await.as_deref(), Some("1.0.0"));
    assert_eq!(
        h.transport.installed_version("t1", "auth").await.as_deref(),
        Some("1.0.0")
    );

    let rollbacks = h
        .service
        .get_rollbacks(&RollbackFilter::default().module("auth"))
        .await;
    assert_eq!(rollbacks.len(), 1);
    assert_eq!(rollbacks[0].status, RollbackStatus::Completed);
    assert_eq!(Some(rollbacks[0].rollback_id.clone()), result.rollback_ref);
    assert_eq!(rollbacks[0].from_version.as_deref(), Some("2.0.0"));
    assert_eq!(rollbacks[0].to_version.as_deref(), Some("1.0.0"));

    let history = h
        .service
        .get_history("auth", "t1", &HistoryFilter::default())
        .await;
    let failed: Vec<_> = history
        .iter()
        .filter(|e| e.action == InstallAction::Install && e.status == HistoryStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].rollback_id, result.rollback_ref);
    assert!(history
        .iter()
        .any(|e| e.action == InstallAction::Rollback && e.status == HistoryStatus::Success));
}

/// 迁移超时触发回滚，数据保持原样
#[tokio::test]
async fn test_migration_timeout_rolls_back_update() {
    let catalog = InMemoryCatalog::new();
    catalog.add("auth", "1.0.0", &[]).unwrap();
    catalog.publish(
        "auth",
        ModuleVersionInfo::new(SemanticVersion::parse("2.0.0").unwrap())
            .with_breaking_change("会话格式变更"),
        Vec::new(),
    );
    let config = InstallerConfig::builder()
        .timeouts(TimeoutConfig {
            migrate_ms: 30,
            ..TimeoutConfig::default()
        })
        .build();
    let h = Harness::with_config(catalog, config);

    assert!(h
        .service
        .install("auth", "t1", Some("1.0.0"), &InstallOptions::default())
        .await
        .success);
    h.store
        .put_data("t1", "auth", serde_json::json!({"sessions": 3}))
        .await
        .unwrap();
    h.hooks
        .hang(HookStage::Migrate, "auth", Some("2.0.0"), Duration::from_millis(500));

    let result = h
        .service
        .update("auth", "t1", "2.0.0", &UpdateOptions::default())
        .await;

    assert!(!result.success);
    assert_eq!(result.errors[0].code, error_code::TIMEOUT_STEP);
    assert_eq!(result.breaking_changes, vec!["会话格式变更".to_string()]);
    assert!(result.rollback_ref.is_some());
    assert_eq!(h.installed_version("t1", "auth").await.as_deref(), Some("1.0.0"));
    assert_eq!(
        h.store.get_data("t1", "auth").await.unwrap(),
        Some(serde_json::json!({"sessions": 3}))
    );
}

/// 跳过迁移时不调用迁移钩子
#[tokio::test]
async fn test_update_skip_migration_warns() {
    let catalog = InMemoryCatalog::new();
    catalog.add("auth", "1.0.0", &[]).unwrap();
    catalog.publish(
        "auth",
        ModuleVersionInfo::new(SemanticVersion::parse("2.0.0").unwrap())
            .with_breaking_change("会话格式变更"),
        Vec::new(),
    );
    let h = Harness::new(catalog);
    assert!(h
        .service
        .install("auth", "t1", Some("1.0.0"), &InstallOptions::default())
        .await
        .success);

    let options = UpdateOptions {
        skip_migration: true,
        ..UpdateOptions::default()
    };
    let result = h.service.update("auth", "t1", "2.0.0", &options).await;

    assert!(result.success);
    assert!(!result.warnings.is_empty());
    assert_eq!(h.hooks.call_count(HookStage::Migrate, "auth"), 0);
}

// ============================================================================
// 重试与并发
// ============================================================================

/// 下载失败后直接重试即可成功
#[tokio::test]
async fn test_retry_after_clean_failure() {
    let h = Harness::new(auth_catalog());
    h.transport.inject_fault(TransportFault::Download, "auth", 1);

    let first = h
        .service
        .install("auth", "t1", Some("1.0.0"), &InstallOptions::default())
        .await;
    assert!(!first.success);
    assert_eq!(first.errors[0].code, error_code::DOWNLOAD_FAILED);
    assert!(first.rollback_ref.is_none());
    assert!(h.installed_version("t1", "auth").await.is_none());

    let second = h
        .service
        .install("auth", "t1", Some("1.0.0"), &InstallOptions::default())
        .await;
    assert!(second.success, "{:?}", second.errors);
    assert_eq!(h.installed_version("t1", "auth").await.as_deref(), Some("1.0.0"));
}

/// 校验和不匹配同样不需要清理
#[tokio::test]
async fn test_corrupt_download_rejected() {
    let catalog = InMemoryCatalog::new();
    let transport_checksum = {
        let reference = InMemoryTransport::new();
        reference.package_checksum("auth", "1.0.0").await
    };
    catalog.publish(
        "auth",
        ModuleVersionInfo::new(SemanticVersion::parse("1.0.0").unwrap())
            .with_checksum(transport_checksum),
        Vec::new(),
    );
    let h = Harness::new(catalog);
    h.transport.inject_fault(TransportFault::Corrupt, "auth", 1);

    let result = h
        .service
        .install("auth", "t1", None, &InstallOptions::default())
        .await;
    assert_eq!(result.error_code(), Some(error_code::CHECKSUM_MISMATCH));

    let retry = h
        .service
        .install("auth", "t1", None, &InstallOptions::default())
        .await;
    assert!(retry.success, "{:?}", retry.errors);
}

/// 同一 (模块, 租户) 的并发安装只有一个执行
#[tokio::test]
async fn test_concurrent_install_serialized() {
    let h = Harness::new(auth_catalog());
    h.transport.set_delay(Some(Duration::from_millis(100)));
    let options = InstallOptions::default();

    let (a, b) = tokio::join!(
        h.service.install("auth", "t1", None, &options),
        h.service.install("auth", "t1", None, &options),
    );

    let results = [a, b];
    let succeeded = results.iter().filter(|r| r.success).count();
    let in_progress = results
        .iter()
        .filter(|r| r.error_code() == Some(error_code::IN_PROGRESS))
        .count();
    assert_eq!(succeeded, 1);
    assert_eq!(in_progress, 1);
    assert_eq!(h.transport.download_count(), 1);
}

/// 不同租户互不阻塞
#[tokio::test]
async fn test_concurrent_install_different_tenants() {
    let h = Harness::new(auth_catalog());
    h.transport.set_delay(Some(Duration::from_millis(50)));
    let options = InstallOptions::default();

    let (a, b) = tokio::join!(
        h.service.install("auth", "t1", None, &options),
        h.service.install("auth", "t2", None, &options),
    );
    assert!(a.success);
    assert!(b.success);
}

// ============================================================================
// 依赖
// ============================================================================

/// 有依赖方时拒绝卸载，强制卸载给出警告
#[tokio::test]
async fn test_uninstall_refused_with_dependents() {
    let catalog = InMemoryCatalog::new();
    catalog.add("app", "1.0.0", &[("db", "^1.0.0")]).unwrap();
    catalog.add("db", "1.0.0", &[]).unwrap();
    let h = Harness::new(catalog);
    assert!(h
        .service
        .install("app", "t1", None, &InstallOptions::default())
        .await
        .success);

    let refused = h
        .service
        .uninstall("db", "t1", &UninstallOptions::default())
        .await;
    assert_eq!(refused.error_code(), Some(error_code::HAS_DEPENDENTS));
    assert_eq!(h.installed_version("t1", "db").await.as_deref(), Some("1.0.0"));

    let forced = h
        .service
        .uninstall(
            "db",
            "t1",
            &UninstallOptions {
                cleanup_data: false,
                force: true,
            },
        )
        .await;
    assert!(forced.success);
    assert!(forced.warnings.iter().any(|w| w.contains("app")));
    assert!(h.installed_version("t1", "db").await.is_none());
}

/// 依赖方安装进行中时，已安装的依赖不能被卸载
#[tokio::test]
async fn test_uninstall_blocked_while_dependent_installs() {
    let catalog = InMemoryCatalog::new();
    catalog.add("app", "1.0.0", &[("db", "^1.0.0")]).unwrap();
    catalog.add("db", "1.0.0", &[]).unwrap();
    let h = Harness::new(catalog);
    assert!(h
        .service
        .install("db", "t1", None, &InstallOptions::default())
        .await
        .success);
    h.hooks
        .hang(HookStage::Configure, "app", None, Duration::from_millis(300));

    let install_opts = InstallOptions::default();
    let (installed, removed) = tokio::join!(
        h.service.install("app", "t1", None, &install_opts),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            h.service
                .uninstall("db", "t1", &UninstallOptions::default())
                .await
        },
    );

    assert!(installed.success);
    assert!(!removed.success);
    assert_eq!(removed.error_code(), Some(error_code::IN_PROGRESS));
    assert_eq!(h.installed_version("t1", "db").await.as_deref(), Some("1.0.0"));
    assert_eq!(h.installed_version("t1", "app").await.as_deref(), Some("1.0.0"));

    // 依赖方落库后再卸载按依赖关系拒绝
    let refused = h
        .service
        .uninstall("db", "t1", &UninstallOptions::default())
        .await;
    assert_eq!(refused.error_code(), Some(error_code::HAS_DEPENDENTS));
}

/// 可选依赖失败时主模块仍安装成功
#[tokio::test]
async fn test_optional_dependency_failure_is_partial() {
    let catalog = InMemoryCatalog::new();
    catalog
        .add_with_kinds(
            "app",
            "1.0.0",
            &[
                ("db", "^1.0.0", DependencyKind::Required),
                ("metrics", "^1.0.0", DependencyKind::Optional),
            ],
        )
        .unwrap();
    catalog.add("db", "1.0.0", &[]).unwrap();
    catalog.add("metrics", "1.0.0", &[]).unwrap();
    let h = Harness::new(catalog);
    h.hooks.fail(HookStage::SmokeTest, "metrics", None, "探测失败");

    let options = InstallOptions::default().with_resolve(
        chips_installer::ResolveOptions::default().with_optional(),
    );
    let result = h.service.install("app", "t1", None, &options).await;

    assert!(result.success, "{:?}", result.errors);
    assert!(result.warnings.iter().any(|w| w.contains("metrics")));
    assert!(h.installed_version("t1", "metrics").await.is_none());
    let modules: Vec<&str> = result.dependencies.iter().map(|d| d.module_id.as_str()).collect();
    assert_eq!(modules, vec!["db"]);

    let history = h
        .service
        .get_history("app", "t1", &HistoryFilter::default())
        .await;
    assert_eq!(history[0].status, HistoryStatus::Partial);
}

/// 已安装的依赖版本不满足新模块的约束
#[tokio::test]
async fn test_installed_dependency_must_satisfy_constraint() {
    let catalog = InMemoryCatalog::new();
    catalog.add("db", "1.0.0", &[]).unwrap();
    catalog.add("db", "2.0.0", &[]).unwrap();
    catalog.add("app", "1.0.0", &[("db", "^2.0.0")]).unwrap();
    let h = Harness::new(catalog);
    assert!(h
        .service
        .install("db", "t1", Some("1.0.0"), &InstallOptions::default())
        .await
        .success);

    let result = h
        .service
        .install("app", "t1", None, &InstallOptions::default())
        .await;
    assert_eq!(result.error_code(), Some(error_code::VERSION_CONFLICT));
    assert!(h.installed_version("t1", "app").await.is_none());
}

/// 循环依赖的计划被拒绝
#[tokio::test]
async fn test_circular_plan_refused() {
    let catalog = InMemoryCatalog::new();
    catalog.add("a", "1.0.0", &[("b", "^1.0.0")]).unwrap();
    catalog.add("b", "1.0.0", &[("a", "^1.0.0")]).unwrap();
    let h = Harness::new(catalog);

    let result = h
        .service
        .install("a", "t1", None, &InstallOptions::default())
        .await;
    assert_eq!(result.error_code(), Some(error_code::CIRCULAR_DEPENDENCY));
    assert_eq!(h.transport.download_count(), 0);
}

// ============================================================================
// 进度事件
// ============================================================================

/// 安装经过所有步骤并发布进度事件
#[tokio::test]
async fn test_progress_events_cover_all_steps() {
    let h = Harness::new(auth_catalog());
    let seen: Arc<Mutex<Vec<(String, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    h.service
        .subscribe(
            "progress-ui",
            "installation.*",
            Arc::new(move |event: Event| {
                if event.event_type == lifecycle_events::INSTALLATION_PROGRESS {
                    let status = event.data_str("status").unwrap_or_default().to_string();
                    let percent = event.data["percent"].as_u64().unwrap_or_default();
                    sink.lock().unwrap().push((status, percent));
                }
            }),
        )
        .await
        .unwrap();

    let result = h
        .service
        .install("auth", "t1", None, &InstallOptions::default())
        .await;
    assert!(result.success);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let seen = seen.lock().unwrap();
    let statuses: HashSet<&str> = seen.iter().map(|(s, _)| s.as_str()).collect();
    for expected in ["validating", "downloading", "installing", "configuring", "testing", "completed"] {
        assert!(statuses.contains(expected), "缺少状态 {}", expected);
    }
    let completed = seen.iter().find(|(s, _)| s == "completed").unwrap();
    assert_eq!(completed.1, 100);
}

// ============================================================================
// 文件系统传输
// ============================================================================

/// 基于文件系统的安装与回滚
#[tokio::test]
async fn test_filesystem_install_and_rollback() {
    let packages = TempDir::new().unwrap();
    let installs = TempDir::new().unwrap();

    for (version, body) in [("1.0.0", "v1"), ("2.0.0", "v2")] {
        let bundle = PackageBundle {
            files: BTreeMap::from([("config/app.txt".to_string(), body.to_string())]),
        };
        let dir = packages.path().join("auth");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join(format!("{}.pkg", version)),
            serde_json::to_vec(&bundle).unwrap(),
        )
        .await
        .unwrap();
    }

    let hooks = Arc::new(ScriptedHooks::new());
    let service = InstallerService::builder()
        .catalog(Arc::new(auth_catalog()))
        .transport(Arc::new(FsPackageTransport::new(packages.path(), installs.path())))
        .hooks(hooks.clone())
        .build()
        .unwrap();

    let options = InstallOptions::default();
    assert!(service.install("auth", "t1", Some("1.0.0"), &options).await.success);
    let config_file = installs.path().join("t1").join("auth").join("config/app.txt");
    assert_eq!(tokio::fs::read_to_string(&config_file).await.unwrap(), "v1");

    hooks.fail(HookStage::SmokeTest, "auth", Some("2.0.0"), "探测失败");
    let result = service.install("auth", "t1", Some("2.0.0"), &options).await;
    assert!(!result.success);
    assert_eq!(tokio::fs::read_to_string(&config_file).await.unwrap(), "v1");

    let installed = service.installed_modules("t1").await.unwrap();
    assert_eq!(installed[0].version.to_string(), "1.0.0");
}
