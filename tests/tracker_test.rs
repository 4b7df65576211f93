//! 安装跟踪集成测试
//!
//! 通过真实的安装流程检查历史、回滚记录与统计

use chips_installer::installer::{HookStage, InMemoryTransport, ScriptedHooks, TransportFault};
use chips_installer::module::InMemoryCatalog;
use chips_installer::{
    AnalyticsQuery, HistoryFilter, HistoryStatus, InstallAction, InstallOptions,
    InstallerConfig, InstallerService, RollbackFilter, RollbackStatus, UninstallOptions,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;

struct Harness {
    transport: Arc<InMemoryTransport>,
    hooks: Arc<ScriptedHooks>,
    service: InstallerService,
}

fn harness() -> Harness {
    let catalog = InMemoryCatalog::new();
    for module in ["auth", "billing", "search"] {
        catalog.add(module, "1.0.0", &[]).unwrap();
        catalog.add(module, "1.1.0", &[]).unwrap();
    }
    let transport = Arc::new(InMemoryTransport::new());
    let hooks = Arc::new(ScriptedHooks::new());
    let service = InstallerService::builder()
        .config(InstallerConfig::default())
        .catalog(Arc::new(catalog))
        .transport(transport.clone())
        .hooks(hooks.clone())
        .build()
        .unwrap();
    Harness {
        transport,
        hooks,
        service,
    }
}

/// 历史按时间倒序，支持按操作与状态过滤、分页
#[tokio::test]
async fn test_history_reflects_lifecycle() {
    let h = harness();
    let options = InstallOptions::default();

    assert!(h.service.install("auth", "t1", Some("1.0.0"), &options).await.success);
    assert!(h
        .service
        .update("auth", "t1", "1.1.0", &Default::default())
        .await
        .success);
    assert!(h
        .service
        .uninstall("auth", "t1", &UninstallOptions::default())
        .await
        .success);

    let history = h
        .service
        .get_history("auth", "t1", &HistoryFilter::default())
        .await;
    let actions: Vec<InstallAction> = history.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![InstallAction::Uninstall, InstallAction::Update, InstallAction::Install]
    );
    assert_eq!(history[1].from_version.as_deref(), Some("1.0.0"));
    assert_eq!(history[1].to_version.as_deref(), Some("1.1.0"));
    assert_eq!(history[0].from_version.as_deref(), Some("1.1.0"));

    let updates = h
        .service
        .get_history(
            "auth",
            "t1",
            &HistoryFilter::default().action(InstallAction::Update),
        )
        .await;
    assert_eq!(updates.len(), 1);

    let page = h
        .service
        .get_history("auth", "t1", &HistoryFilter::default().page(1, 1))
        .await;
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].action, InstallAction::Update);

    let window = h
        .service
        .get_history(
            "auth",
            "t1",
            &HistoryFilter::default().between(
                Utc::now() - ChronoDuration::hours(1),
                Utc::now() + ChronoDuration::hours(1),
            ),
        )
        .await;
    assert_eq!(window.len(), 3);

    assert!(h
        .service
        .get_history("auth", "t2", &HistoryFilter::default())
        .await
        .is_empty());
}

/// 回滚记录可按模块、租户与状态查询
#[tokio::test]
async fn test_rollback_records_filtered() {
    let h = harness();
    let options = InstallOptions::default();

    h.hooks.fail(HookStage::Configure, "auth", None, "配置失败");
    h.hooks.fail(HookStage::SmokeTest, "billing", None, "探测失败");
    assert!(!h.service.install("auth", "t1", None, &options).await.success);
    assert!(!h.service.install("billing", "t2", None, &options).await.success);

    let all = h.service.get_rollbacks(&RollbackFilter::default()).await;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].module_id, "billing");
    assert!(all.iter().all(|r| r.status == RollbackStatus::Completed));
    assert!(all.iter().all(|r| r.completed_at.is_some()));

    let t1 = h
        .service
        .get_rollbacks(&RollbackFilter::default().tenant("t1"))
        .await;
    assert_eq!(t1.len(), 1);
    assert_eq!(t1[0].module_id, "auth");

    let failed = h
        .service
        .get_rollbacks(&RollbackFilter::default().status(RollbackStatus::Failed))
        .await;
    assert!(failed.is_empty());

    let record = h.service.get_rollback(&all[1].rollback_id).await.unwrap();
    assert_eq!(record.module_id, "auth");
}

/// 统计汇总成功率、操作分布与常见问题
#[tokio::test]
async fn test_analytics_summary() {
    let h = harness();
    let options = InstallOptions::default();

    assert!(h.service.install("auth", "t1", None, &options).await.success);
    assert!(h.service.install("search", "t1", None, &options).await.success);
    h.transport.inject_fault(TransportFault::Download, "billing", 2);
    assert!(!h.service.install("billing", "t1", None, &options).await.success);
    assert!(!h.service.install("billing", "t2", None, &options).await.success);

    let stats = h.service.analytics(&AnalyticsQuery::all()).await;
    assert_eq!(stats.total, 4);
    assert_eq!(stats.successful, 2);
    assert_eq!(stats.failed, 2);
    assert!((stats.success_rate - 0.5).abs() < 1e-9);
    assert_eq!(stats.by_action["install"].total, 4);
    assert_eq!(stats.common_issues.len(), 1);
    assert_eq!(stats.common_issues[0].count, 2);
    assert_eq!(stats.trend.last().unwrap().day, Utc::now().date_naive());
    assert_eq!(stats.trend.last().unwrap().counts.total, 4);

    let billing = h
        .service
        .analytics(&AnalyticsQuery::for_module("billing").for_tenant("t2"))
        .await;
    assert_eq!(billing.total, 1);
    assert_eq!(billing.success_rate, 0.0);
}

/// 统计缓存在新历史写入后失效
#[tokio::test]
async fn test_analytics_cache_refreshes() {
    let h = harness();
    let options = InstallOptions::default();
    assert!(h.service.install("auth", "t1", None, &options).await.success);

    let query = AnalyticsQuery::all();
    assert_eq!(h.service.analytics(&query).await.total, 1);
    assert_eq!(h.service.analytics(&query).await.total, 1);
    assert_eq!(h.service.tracker().analytics_cache_stats().hits, 1);

    assert!(h.service.install("search", "t1", None, &options).await.success);
    assert_eq!(h.service.analytics(&query).await.total, 2);
}

/// 回滚也记录在历史与统计中
#[tokio::test]
async fn test_rollback_counted_in_analytics() {
    let h = harness();
    h.hooks.fail(HookStage::Configure, "auth", None, "配置失败");
    assert!(!h
        .service
        .install("auth", "t1", None, &InstallOptions::default())
        .await
        .success);

    let stats = h.service.analytics(&AnalyticsQuery::all()).await;
    assert_eq!(stats.by_action["rollback"].successful, 1);
    assert_eq!(stats.by_action["install"].failed, 1);

    let history = h
        .service
        .get_history(
            "auth",
            "t1",
            &HistoryFilter::default().status(HistoryStatus::Failed),
        )
        .await;
    assert_eq!(history.len(), 1);
    assert!(history[0].rollback_id.is_some());
}
