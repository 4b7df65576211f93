//! 依赖解析性能基准测试
//!
//! 使用 Criterion 框架进行性能测试，包括：
//! - 版本约束匹配基准
//! - 分层目录上的依赖解析基准
//! - 带缓存目录的依赖解析基准

use chips_installer::module::{
    CachedCatalog, DependencyResolver, InMemoryCatalog, ModuleCatalog, ResolveOptions,
    SemanticVersion, VersionConstraint,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// 测试辅助
// ============================================================================

/// 构造分层目录：每层 `width` 个模块，每个模块依赖下一层的所有模块
fn layered_catalog(layers: usize, width: usize) -> InMemoryCatalog {
    let catalog = InMemoryCatalog::new();
    let name = |layer: usize, i: usize| format!("m{}_{}", layer, i);

    for layer in 0..layers {
        for i in 0..width {
            let deps: Vec<String> = if layer + 1 < layers {
                (0..width).map(|j| name(layer + 1, j)).collect()
            } else {
                Vec::new()
            };
            let edges: Vec<(&str, &str)> = deps.iter().map(|d| (d.as_str(), "^1.0.0")).collect();
            for version in ["1.0.0", "1.1.0", "1.2.3", "2.0.0"] {
                catalog.add(&name(layer, i), version, &edges).unwrap();
            }
        }
    }
    let top: Vec<String> = (0..width).map(|i| name(0, i)).collect();
    let edges: Vec<(&str, &str)> = top.iter().map(|d| (d.as_str(), "^1.0.0")).collect();
    catalog.add("root", "1.0.0", &edges).unwrap();
    catalog
}

// ============================================================================
// 基准
// ============================================================================

fn bench_constraint_matching(c: &mut Criterion) {
    let versions: Vec<SemanticVersion> = (0..100)
        .map(|i| SemanticVersion::parse(&format!("{}.{}.{}", i / 25, i % 25, i % 7)).unwrap())
        .collect();
    let mut group = c.benchmark_group("constraint");
    group.throughput(Throughput::Elements(versions.len() as u64));

    for raw in ["^1.2.0", "~2.3.0", ">=1.0.0", "*"] {
        let constraint = VersionConstraint::parse(raw).unwrap();
        group.bench_with_input(BenchmarkId::new("best_match", raw), &constraint, |b, c| {
            b.iter(|| black_box(c.best_match(versions.iter())))
        });
    }
    group.finish();
}

fn bench_resolve(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("resolve");

    for (layers, width) in [(3, 3), (5, 4), (8, 5)] {
        let catalog: Arc<dyn ModuleCatalog> = Arc::new(layered_catalog(layers, width));
        let resolver = DependencyResolver::new(catalog);
        let options = ResolveOptions::default().max_depth(layers + 2);

        group.bench_with_input(
            BenchmarkId::new("layered", format!("{}x{}", layers, width)),
            &(layers, width),
            |b, _| {
                b.to_async(&runtime).iter(|| async {
                    let plan = resolver.resolve("root", None, &options).await.unwrap();
                    black_box(plan.ordered_steps.len())
                })
            },
        );
    }
    group.finish();
}

fn bench_resolve_cached(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let inner: Arc<dyn ModuleCatalog> = Arc::new(layered_catalog(5, 4));
    let cached: Arc<dyn ModuleCatalog> =
        Arc::new(CachedCatalog::new(inner, 1024, Duration::from_secs(300)));
    let resolver = DependencyResolver::new(cached);
    let options = ResolveOptions::default();

    c.bench_function("resolve/cached_5x4", |b| {
        b.to_async(&runtime).iter(|| async {
            let plan = resolver.resolve("root", None, &options).await.unwrap();
            black_box(plan.success)
        })
    });
}

criterion_group!(
    benches,
    bench_constraint_matching,
    bench_resolve,
    bench_resolve_cached
);
criterion_main!(benches);
