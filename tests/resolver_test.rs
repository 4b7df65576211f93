//! 依赖解析集成测试
//!
//! 覆盖版本约束、循环检测、拓扑顺序与冲突处理

use chips_installer::module::{
    ConflictKind, DependencyKind, DependencyResolver, FileCatalog, InMemoryCatalog,
    ResolutionPlan, ResolveOptions, SemanticVersion, VersionConstraint,
};
use chips_installer::CoreError;
use std::sync::Arc;
use tempfile::TempDir;

fn resolver(catalog: InMemoryCatalog) -> DependencyResolver {
    DependencyResolver::new(Arc::new(catalog))
}

fn position(plan: &ResolutionPlan, module_id: &str) -> usize {
    plan.ordered_steps
        .iter()
        .position(|s| s.module_id == module_id)
        .unwrap_or_else(|| panic!("{} 不在计划中", module_id))
}

/// 拓扑顺序：每条保留的依赖边，被依赖方都排在依赖方之前
fn assert_topological(plan: &ResolutionPlan) {
    for edge in &plan.edges {
        assert!(
            position(plan, &edge.to_module) < position(plan, &edge.from_module),
            "{} 应排在 {} 之前",
            edge.to_module,
            edge.from_module
        );
    }
}

// ==================== 版本约束 ====================

#[test]
fn test_caret_and_tilde_semantics() {
    let check = |version: &str, constraint: &str| {
        VersionConstraint::parse(constraint)
            .unwrap()
            .satisfies(&SemanticVersion::parse(version).unwrap())
    };

    assert!(check("1.4.2", "^1.2.0"));
    assert!(!check("2.0.0", "^1.2.0"));
    assert!(check("0.2.3", "^0.2.0"));
    assert!(!check("0.3.0", "^0.2.0"));

    assert!(check("1.2.9", "~1.2.0"));
    assert!(!check("1.3.0", "~1.2.0"));
}

#[tokio::test]
async fn test_highest_satisfying_version_selected() {
    let catalog = InMemoryCatalog::new();
    catalog.add("app", "1.0.0", &[("db", "^1.2.0")]).unwrap();
    for v in ["1.1.0", "1.2.0", "1.4.2", "2.0.0"] {
        catalog.add("db", v, &[]).unwrap();
    }

    let plan = resolver(catalog)
        .resolve("app", None, &ResolveOptions::default())
        .await
        .unwrap();

    assert!(plan.success);
    assert_eq!(plan.step("db").unwrap().version.to_string(), "1.4.2");
}

#[tokio::test]
async fn test_latest_prefers_release_over_prerelease() {
    let catalog = InMemoryCatalog::new();
    catalog.add("app", "1.0.0", &[]).unwrap();
    catalog.add("app", "1.1.0", &[]).unwrap();
    catalog.add("app", "2.0.0-beta.1", &[]).unwrap();
    let resolver = resolver(catalog);

    for request in [None, Some("*"), Some("latest")] {
        let plan = resolver
            .resolve("app", request, &ResolveOptions::default())
            .await
            .unwrap();
        assert_eq!(plan.root_version.to_string(), "1.1.0");
    }
}

// ==================== 循环与顺序 ====================

#[tokio::test]
async fn test_cycle_detected_without_hanging() {
    let catalog = InMemoryCatalog::new();
    catalog.add("a", "1.0.0", &[("b", "^1.0.0")]).unwrap();
    catalog.add("b", "1.0.0", &[("c", "^1.0.0")]).unwrap();
    catalog.add("c", "1.0.0", &[("a", "^1.0.0")]).unwrap();
    let resolver = resolver(catalog);

    for depth in [1, 3, 100] {
        let plan = resolver
            .resolve("a", None, &ResolveOptions::default().max_depth(depth))
            .await
            .unwrap();
        if depth >= 3 {
            assert!(!plan.success);
            let chain = &plan.circular_chains[0];
            let mut rotated = chain.clone();
            let start = rotated.iter().position(|m| m == "a").unwrap();
            rotated.rotate_left(start);
            assert_eq!(rotated, vec!["a", "b", "c"]);
            assert!(plan
                .conflicts
                .iter()
                .any(|c| c.kind == ConflictKind::Circular));
        }
    }
}

#[tokio::test]
async fn test_topological_order_diamond() {
    let catalog = InMemoryCatalog::new();
    catalog
        .add("app", "1.0.0", &[("web", "^1.0.0"), ("worker", "^1.0.0")])
        .unwrap();
    catalog.add("web", "1.0.0", &[("db", "^1.0.0"), ("log", "^1.0.0")]).unwrap();
    catalog.add("worker", "1.0.0", &[("db", "^1.0.0")]).unwrap();
    catalog.add("db", "1.0.0", &[("log", "^1.0.0")]).unwrap();
    catalog.add("log", "1.0.0", &[]).unwrap();

    let plan = resolver(catalog)
        .resolve("app", None, &ResolveOptions::default())
        .await
        .unwrap();

    assert!(plan.success);
    assert_eq!(plan.ordered_steps.len(), 5);
    assert_eq!(plan.ordered_steps.last().unwrap().module_id, "app");
    assert_topological(&plan);

    let db = plan.step("db").unwrap();
    assert!(db.required_by.contains(&"web".to_string()));
    assert!(db.required_by.contains(&"worker".to_string()));
}

// ==================== 冲突 ====================

fn conflicting_catalog() -> InMemoryCatalog {
    let catalog = InMemoryCatalog::new();
    catalog.add("app", "1.0.0", &[("b", "^1.0.0"), ("c", "^1.0.0")]).unwrap();
    catalog.add("b", "1.0.0", &[("x", "=1.0.0")]).unwrap();
    catalog.add("c", "1.0.0", &[("x", "=2.0.0")]).unwrap();
    catalog.add("x", "1.0.0", &[]).unwrap();
    catalog.add("x", "2.0.0", &[]).unwrap();
    catalog
}

#[tokio::test]
async fn test_sibling_conflict_reported() {
    let plan = resolver(conflicting_catalog())
        .resolve("app", None, &ResolveOptions::default())
        .await
        .unwrap();

    assert!(!plan.success);
    let conflict = plan
        .conflicts
        .iter()
        .find(|c| c.kind == ConflictKind::Version)
        .unwrap();
    assert_eq!(conflict.module_id, "x");
    assert!(!conflict.resolved);
    assert!(matches!(conflict.to_error(), CoreError::VersionConflict { .. }));
}

#[tokio::test]
async fn test_sibling_conflict_resolved_to_higher() {
    let plan = resolver(conflicting_catalog())
        .resolve("app", None, &ResolveOptions::default().resolving_conflicts())
        .await
        .unwrap();

    assert!(plan.success);
    assert_eq!(plan.step("x").unwrap().version.to_string(), "2.0.0");
    assert!(!plan.warnings.is_empty());
    assert_topological(&plan);
}

#[tokio::test]
async fn test_strict_mode_blocks_silent_override() {
    let plan = resolver(conflicting_catalog())
        .resolve(
            "app",
            None,
            &ResolveOptions::default().resolving_conflicts().strict(),
        )
        .await
        .unwrap();

    assert!(!plan.success);
    assert!(plan.conflicts.iter().any(|c| c.is_blocking()));
}

#[tokio::test]
async fn test_optional_conflict_does_not_block() {
    let catalog = InMemoryCatalog::new();
    catalog
        .add_with_kinds(
            "app",
            "1.0.0",
            &[
                ("b", "^1.0.0", DependencyKind::Required),
                ("extra", "^1.0.0", DependencyKind::Optional),
            ],
        )
        .unwrap();
    catalog.add("b", "1.0.0", &[]).unwrap();

    let plan = resolver(catalog)
        .resolve("app", None, &ResolveOptions::default().with_optional())
        .await
        .unwrap();

    assert!(plan.success);
    assert!(plan.step("extra").is_none());
    assert_eq!(plan.warnings.len(), 1);
}

#[tokio::test]
async fn test_root_errors_are_returned() {
    let catalog = InMemoryCatalog::new();
    catalog.add("app", "1.0.0", &[]).unwrap();
    let resolver = resolver(catalog);

    let err = resolver
        .resolve("missing", None, &ResolveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ModuleNotFound(_)));

    let err = resolver
        .resolve("app", Some("^2.0.0"), &ResolveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NoSatisfyingVersion { .. }));
}

// ==================== 文件目录 ====================

#[tokio::test]
async fn test_resolve_from_manifest_directory() {
    let temp_dir = TempDir::new().unwrap();
    tokio::fs::write(
        temp_dir.path().join("app.yaml"),
        r#"
id: app
versions:
  - version: 1.0.0
    dependencies:
      - module_id: db
        version: ^1.0.0
"#,
    )
    .await
    .unwrap();
    tokio::fs::write(
        temp_dir.path().join("db.yaml"),
        r#"
id: db
versions:
  - version: 1.0.0
  - version: 1.3.0
"#,
    )
    .await
    .unwrap();

    let catalog = FileCatalog::load(temp_dir.path()).await.unwrap();
    let plan = DependencyResolver::new(Arc::new(catalog))
        .resolve("app", None, &ResolveOptions::default())
        .await
        .unwrap();

    assert!(plan.success);
    assert_eq!(plan.step("db").unwrap().version.to_string(), "1.3.0");
}
