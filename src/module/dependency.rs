//! 模块依赖管理
//!
//! 本模块提供模块依赖关系的图结构和解析器。
//!
//! # 主要组件
//!
//! - [`DependencyGraph`] - 依赖关系图，按插入顺序保持确定性
//! - [`DependencyResolver`] - 依赖解析器，生成 [`ResolutionPlan`]
//!
//! # 示例
//!
//! ```rust
//! use chips_installer::module::dependency::DependencyGraph;
//!
//! let mut graph = DependencyGraph::new();
//! graph.add_dependency("app", "service");
//! graph.add_dependency("service", "database");
//!
//! assert_eq!(graph.topological_sort().unwrap(), vec!["database", "service", "app"]);
//! assert!(!graph.has_cycle());
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::config::ResolverConfig;
use crate::module::catalog::ModuleCatalog;
use crate::module::metadata::{DependencyEdge, DependencyKind, ModuleVersionInfo};
use crate::module::version::{SemanticVersion, VersionConstraint};
use crate::utils::{validate_identifier, CoreError, Result};

// ============================================================================
// 依赖图
// ============================================================================

/// 模块依赖关系图
///
/// 节点按首次加入的顺序保存，拓扑排序在多个节点同时就绪时按该顺序输出。
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// 节点插入顺序
    nodes: Vec<String>,
    /// 正向边：模块 ID -> 该模块依赖的模块列表
    edges: HashMap<String, Vec<String>>,
    /// 反向边：模块 ID -> 依赖该模块的模块列表
    reverse_edges: HashMap<String, Vec<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl DependencyGraph {
    /// 创建一个空的依赖图
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加模块节点，已存在时忽略
    pub fn add_module(&mut self, module_id: &str) {
        if !self.edges.contains_key(module_id) {
            self.nodes.push(module_id.to_string());
            self.edges.insert(module_id.to_string(), Vec::new());
            self.reverse_edges.insert(module_id.to_string(), Vec::new());
        }
    }

    /// 添加依赖关系：`module_id` 依赖 `dependency_id`
    ///
    /// 不存在的模块会被自动添加。
    pub fn add_dependency(&mut self, module_id: &str, dependency_id: &str) {
        self.add_module(module_id);
        self.add_module(dependency_id);

        let deps = self.edges.entry(module_id.to_string()).or_default();
        if !deps.iter().any(|d| d == dependency_id) {
            deps.push(dependency_id.to_string());
        }

        let rev_deps = self.reverse_edges.entry(dependency_id.to_string()).or_default();
        if !rev_deps.iter().any(|d| d == module_id) {
            rev_deps.push(module_id.to_string());
        }
    }

    /// 移除依赖关系
    pub fn remove_dependency(&mut self, module_id: &str, dependency_id: &str) {
        if let Some(deps) = self.edges.get_mut(module_id) {
            deps.retain(|d| d != dependency_id);
        }
        if let Some(rev_deps) = self.reverse_edges.get_mut(dependency_id) {
            rev_deps.retain(|d| d != module_id);
        }
    }

    /// 是否存在依赖关系
    pub fn has_dependency(&self, module_id: &str, dependency_id: &str) -> bool {
        self.edges
            .get(module_id)
            .map(|deps| deps.iter().any(|d| d == dependency_id))
            .unwrap_or(false)
    }

    /// 获取模块的直接依赖列表
    pub fn get_dependencies(&self, module_id: &str) -> Vec<String> {
        self.edges.get(module_id).cloned().unwrap_or_default()
    }

    /// 获取依赖该模块的模块列表
    pub fn get_dependents(&self, module_id: &str) -> Vec<String> {
        self.reverse_edges.get(module_id).cloned().unwrap_or_default()
    }

    /// 查找循环依赖路径
    ///
    /// 返回环上的模块序列（不重复起点），例如 `a -> b -> c -> a` 返回 `[a, b, c]`。
    /// 使用显式栈，不受图深度影响。
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        for start in &self.nodes {
            if marks.contains_key(start.as_str()) {
                continue;
            }

            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            marks.insert(start.as_str(), Mark::Visiting);

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                let next = self
                    .edges
                    .get(node)
                    .and_then(|children| children.get(top.1))
                    .map(String::as_str);
                top.1 += 1;

                match next {
                    Some(child) => match marks.get(child).copied() {
                        Some(Mark::Visiting) => {
                            let pos = stack.iter().position(|(n, _)| *n == child)?;
                            return Some(stack[pos..].iter().map(|(n, _)| n.to_string()).collect());
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(child, Mark::Visiting);
                            stack.push((child, 0));
                        }
                    },
                    None => {
                        marks.insert(node, Mark::Done);
                        stack.pop();
                    }
                }
            }
        }

        None
    }

    /// 检测是否存在循环依赖
    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// 拓扑排序（Kahn 算法）
    ///
    /// 依赖在依赖方之前；多个节点同时就绪时按插入顺序输出。
    ///
    /// # 错误
    ///
    /// 存在循环依赖时返回 [`CoreError::CircularDependency`]。
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let index: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();

        // 入度 = 尚未输出的依赖数量
        let mut pending: Vec<usize> = self
            .nodes
            .iter()
            .map(|n| self.edges.get(n).map(Vec::len).unwrap_or(0))
            .collect();

        let mut ready: BTreeSet<usize> = pending
            .iter()
            .enumerate()
            .filter(|(_, &count)| count == 0)
            .map(|(i, _)| i)
            .collect();

        let mut result = Vec::with_capacity(self.nodes.len());

        while let Some(current) = ready.pop_first() {
            let node = &self.nodes[current];
            result.push(node.clone());

            for dependent in self.reverse_edges.get(node).into_iter().flatten() {
                if let Some(&i) = index.get(dependent.as_str()) {
                    pending[i] -= 1;
                    if pending[i] == 0 {
                        ready.insert(i);
                    }
                }
            }
        }

        if result.len() != self.nodes.len() {
            let detail = self
                .find_cycle()
                .map(|cycle| cycle.join(" -> "))
                .unwrap_or_else(|| "无法完成拓扑排序".to_string());
            return Err(CoreError::CircularDependency(detail));
        }

        Ok(result)
    }

    /// 检查图是否为空
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 获取图中模块数量
    pub fn module_count(&self) -> usize {
        self.nodes.len()
    }

    /// 检查是否包含指定模块
    pub fn contains_module(&self, module_id: &str) -> bool {
        self.edges.contains_key(module_id)
    }

    /// 按插入顺序获取所有模块 ID
    pub fn get_all_modules(&self) -> Vec<String> {
        self.nodes.clone()
    }
}

// ============================================================================
// 解析结果
// ============================================================================

/// 解析选项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveOptions {
    /// 包含可选依赖
    #[serde(default)]
    pub include_optional: bool,
    /// 包含开发依赖（仅根模块的开发依赖）
    #[serde(default)]
    pub include_dev: bool,
    /// 包含对等依赖
    #[serde(default)]
    pub include_peer: bool,
    /// 最大解析深度
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// 自动解决版本冲突（保留较高版本）
    #[serde(default)]
    pub resolve_conflicts: bool,
    /// 严格模式：自动保留的较高版本必须满足所有约束
    #[serde(default)]
    pub strict: bool,
}

fn default_max_depth() -> usize {
    10
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            include_optional: false,
            include_dev: false,
            include_peer: false,
            max_depth: default_max_depth(),
            resolve_conflicts: false,
            strict: false,
        }
    }
}

impl ResolveOptions {
    /// 从解析配置创建默认选项
    pub fn from_config(config: &ResolverConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            strict: config.strict_conflicts,
            ..Self::default()
        }
    }

    pub fn with_optional(mut self) -> Self {
        self.include_optional = true;
        self
    }

    pub fn with_peer(mut self) -> Self {
        self.include_peer = true;
        self
    }

    pub fn with_dev(mut self) -> Self {
        self.include_dev = true;
        self
    }

    pub fn resolving_conflicts(mut self) -> Self {
        self.resolve_conflicts = true;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// 该类型的依赖边是否参与解析
    fn includes(&self, kind: DependencyKind, from_root: bool) -> bool {
        match kind {
            DependencyKind::Required => true,
            DependencyKind::Optional => self.include_optional,
            DependencyKind::Peer => self.include_peer,
            DependencyKind::Dev => self.include_dev && from_root,
        }
    }
}

/// 冲突类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    /// 同一模块的版本要求不一致
    Version,
    /// 对等依赖版本不一致
    Peer,
    /// 循环依赖
    Circular,
    /// 依赖模块或满足约束的版本不存在
    Missing,
}

/// 解析冲突
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    /// 冲突涉及的模块
    pub module_id: String,
    /// 引发冲突的另一方
    pub conflicting_module: String,
    pub description: String,
    /// 相关的版本要求，形如 `app requires =1.0.0`
    #[serde(default)]
    pub requirements: Vec<String>,
    /// 是否位于必需依赖边上
    pub required: bool,
    /// 是否已被自动解决
    #[serde(default)]
    pub resolved: bool,
}

impl Conflict {
    /// 是否阻断计划
    pub fn is_blocking(&self) -> bool {
        self.required && !self.resolved
    }

    /// 转换为对应的错误
    pub fn to_error(&self) -> CoreError {
        match self.kind {
            ConflictKind::Version | ConflictKind::Peer => CoreError::VersionConflict {
                module: self.module_id.clone(),
                requirements: self.requirements.clone(),
            },
            ConflictKind::Circular => CoreError::CircularDependency(self.description.clone()),
            ConflictKind::Missing => CoreError::NoSatisfyingVersion {
                module: self.module_id.clone(),
                constraint: self.requirements.join(", "),
            },
        }
    }
}

/// 计划中的一个安装步骤
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedStep {
    pub module_id: String,
    pub version: SemanticVersion,
    pub info: ModuleVersionInfo,
    /// 距根模块的深度，根为 0
    pub depth: usize,
    /// 是否被某条必需依赖边引用（根模块为 true）
    pub required: bool,
    /// 直接依赖该模块的模块
    pub required_by: Vec<String>,
}

/// 依赖解析计划
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionPlan {
    pub root_module: String,
    pub root_version: SemanticVersion,
    pub root_info: ModuleVersionInfo,
    /// 安装顺序，依赖在前，根模块在最后
    pub ordered_steps: Vec<ResolvedStep>,
    /// 保留在计划中的依赖边
    pub edges: Vec<DependencyEdge>,
    pub conflicts: Vec<Conflict>,
    pub circular_chains: Vec<Vec<String>>,
    pub warnings: Vec<String>,
    pub success: bool,
}

impl ResolutionPlan {
    /// 根模块之外的步骤
    pub fn dependencies(&self) -> impl Iterator<Item = &ResolvedStep> {
        self.ordered_steps
            .iter()
            .filter(move |s| s.module_id != self.root_module)
    }

    /// 查找某个模块的步骤
    pub fn step(&self, module_id: &str) -> Option<&ResolvedStep> {
        self.ordered_steps.iter().find(|s| s.module_id == module_id)
    }

    /// 阻断计划的冲突
    pub fn blocking_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| c.is_blocking())
    }

    /// 安装顺序中的模块 ID
    pub fn module_order(&self) -> Vec<&str> {
        self.ordered_steps.iter().map(|s| s.module_id.as_str()).collect()
    }

    /// 模块在根模块的直接依赖中声明为必需
    pub fn direct_required_dependencies(&self) -> Vec<&DependencyEdge> {
        self.edges
            .iter()
            .filter(|e| e.from_module == self.root_module && e.kind.is_blocking())
            .collect()
    }
}

// ============================================================================
// 依赖解析器
// ============================================================================

/// 待处理的依赖边
struct WorkItem {
    edge: DependencyEdge,
    /// 目标模块的深度
    depth: usize,
    /// 从根模块到依赖方的路径
    path: Vec<String>,
}

struct Chosen {
    info: ModuleVersionInfo,
    depth: usize,
    required: bool,
    requirements: Vec<(String, VersionConstraint)>,
}

impl Chosen {
    fn version(&self) -> &SemanticVersion {
        &self.info.version
    }

    fn describe_requirements(&self) -> Vec<String> {
        self.requirements
            .iter()
            .map(|(from, c)| format!("{} requires {}", from, c))
            .collect()
    }
}

#[derive(Default)]
struct ResolutionState {
    root: String,
    chosen: HashMap<String, Chosen>,
    order: Vec<String>,
    edges: Vec<DependencyEdge>,
    conflicts: Vec<Conflict>,
    circular_chains: Vec<Vec<String>>,
    warnings: Vec<String>,
    aborted: bool,
}

impl ResolutionState {
    fn choose(&mut self, module_id: &str, info: ModuleVersionInfo, depth: usize, required: bool) {
        self.order.push(module_id.to_string());
        self.chosen.insert(
            module_id.to_string(),
            Chosen {
                info,
                depth,
                required,
                requirements: Vec::new(),
            },
        );
    }

    /// 丢弃模块旧版本声明的依赖边，并剪除因此不再被依赖的模块
    fn discard_dependencies_of(&mut self, module_id: &str, stack: &mut Vec<WorkItem>) {
        let mut pending = vec![module_id.to_string()];
        while let Some(from) = pending.pop() {
            stack.retain(|item| item.edge.from_module != from);
            let (dropped, kept): (Vec<DependencyEdge>, Vec<DependencyEdge>) =
                std::mem::take(&mut self.edges)
                    .into_iter()
                    .partition(|e| e.from_module == from);
            self.edges = kept;

            for edge in dropped {
                let target = edge.to_module;
                if target == self.root {
                    continue;
                }
                let mut incoming = self.edges.iter().filter(|e| e.to_module == target).peekable();
                if incoming.peek().is_none() {
                    if self.chosen.remove(&target).is_some() {
                        debug!(module_id = %target, from = %from, "剪除不再被依赖的模块");
                        self.order.retain(|m| *m != target);
                        pending.push(target);
                    }
                    continue;
                }
                let required = incoming.any(|e| e.kind.is_blocking());
                if let Some(chosen) = self.chosen.get_mut(&target) {
                    chosen.requirements.retain(|(f, _)| *f != from);
                    chosen.required = required;
                }
            }
        }
    }

    /// 依赖边无法解析：必需边记录冲突并终止，其余只记录警告
    fn fail_edge(&mut self, edge: &DependencyEdge, description: String) {
        if edge.kind.is_blocking() {
            warn!(
                module_id = %edge.to_module,
                from = %edge.from_module,
                "必需依赖无法解析: {}", description
            );
            self.conflicts.push(Conflict {
                kind: ConflictKind::Missing,
                module_id: edge.to_module.clone(),
                conflicting_module: edge.from_module.clone(),
                description,
                requirements: vec![format!("{} requires {}", edge.from_module, edge.constraint)],
                required: true,
                resolved: false,
            });
            self.aborted = true;
        } else {
            debug!(module_id = %edge.to_module, kind = edge.kind.as_str(), "跳过无法解析的依赖");
            self.warnings.push(format!(
                "{} 依赖 '{}' ({}) 已忽略: {}",
                edge.kind.as_str(),
                edge.to_module,
                edge.constraint,
                description
            ));
        }
    }
}

/// 依赖解析器
///
/// 贪心解析：每个模块选择满足约束的最高版本，冲突被记录而不做回溯搜索。
pub struct DependencyResolver {
    catalog: Arc<dyn ModuleCatalog>,
}

impl DependencyResolver {
    /// 创建新的依赖解析器
    pub fn new(catalog: Arc<dyn ModuleCatalog>) -> Self {
        Self { catalog }
    }

    /// 解析模块请求
    ///
    /// `version` 为空、`*` 或 `latest` 时选择最高的正式版本。
    ///
    /// # 错误
    ///
    /// 只有根模块本身的问题作为错误返回：
    /// - `CoreError::InvalidRequest` - 模块 ID 格式无效
    /// - `CoreError::InvalidConstraint` - 版本约束格式无效
    /// - `CoreError::ModuleNotFound` - 模块未找到
    /// - `CoreError::NoSatisfyingVersion` - 没有满足约束的版本
    ///
    /// 依赖上的冲突与循环记录在返回的计划中。
    #[instrument(skip(self, options))]
    pub async fn resolve(
        &self,
        module_id: &str,
        version: Option<&str>,
        options: &ResolveOptions,
    ) -> Result<ResolutionPlan> {
        validate_identifier("module_id", module_id)?;
        let constraint = VersionConstraint::parse(version.unwrap_or("*"))?;

        let versions = self.catalog.get_versions(module_id).await?;
        let root_info = Self::select(&versions, &constraint).ok_or_else(|| {
            CoreError::NoSatisfyingVersion {
                module: module_id.to_string(),
                constraint: constraint.to_string(),
            }
        })?;
        let root_version = root_info.version.clone();
        debug!(version = %root_version, "选定根模块版本");

        let mut state = ResolutionState {
            root: module_id.to_string(),
            ..Default::default()
        };
        state.choose(module_id, root_info.clone(), 0, true);

        let mut stack: Vec<WorkItem> = Vec::new();
        self.expand(module_id, &root_version, 1, vec![module_id.to_string()], options, &mut stack, &mut state)
            .await;

        while let Some(item) = stack.pop() {
            if state.aborted {
                break;
            }
            self.visit(item, options, &mut stack, &mut state).await;
        }

        let plan = Self::build_plan(module_id, root_version, root_info, state);
        info!(
            version = %plan.root_version,
            steps = plan.ordered_steps.len(),
            conflicts = plan.conflicts.len(),
            cycles = plan.circular_chains.len(),
            success = plan.success,
            "依赖解析完成"
        );
        Ok(plan)
    }

    fn select(versions: &[ModuleVersionInfo], constraint: &VersionConstraint) -> Option<ModuleVersionInfo> {
        let best = constraint.best_match(versions.iter().map(|i| &i.version))?;
        versions.iter().find(|i| &i.version == best).cloned()
    }

    /// 将模块版本声明的依赖压入工作栈
    #[allow(clippy::too_many_arguments)]
    async fn expand(
        &self,
        module_id: &str,
        version: &SemanticVersion,
        depth: usize,
        path: Vec<String>,
        options: &ResolveOptions,
        stack: &mut Vec<WorkItem>,
        state: &mut ResolutionState,
    ) {
        let edges = match self.catalog.get_dependencies(module_id, version).await {
            Ok(edges) => edges,
            Err(e) => {
                let edge = DependencyEdge::required(
                    path.iter().rev().nth(1).cloned().unwrap_or_default(),
                    module_id,
                    format!("={}", version),
                );
                state.fail_edge(&edge, format!("无法获取依赖声明: {}", e));
                return;
            }
        };

        let from_root = depth == 1;
        let included: Vec<DependencyEdge> = edges
            .into_iter()
            .filter(|e| options.includes(e.kind, from_root))
            .collect();

        // 逆序压栈，保证按声明顺序深度优先处理
        for edge in included.into_iter().rev() {
            stack.push(WorkItem {
                edge,
                depth,
                path: path.clone(),
            });
        }
    }

    async fn visit(
        &self,
        item: WorkItem,
        options: &ResolveOptions,
        stack: &mut Vec<WorkItem>,
        state: &mut ResolutionState,
    ) {
        let WorkItem { edge, depth, path } = item;
        let target = edge.to_module.clone();

        if let Some(pos) = path.iter().position(|m| *m == target) {
            let chain = path[pos..].to_vec();
            warn!(chain = ?chain, "检测到循环依赖");
            state.conflicts.push(Conflict {
                kind: ConflictKind::Circular,
                module_id: edge.from_module.clone(),
                conflicting_module: target,
                description: format!("{} -> {}", chain.join(" -> "), chain[0]),
                requirements: vec![format!("{} requires {}", edge.from_module, edge.constraint)],
                required: edge.kind.is_blocking(),
                resolved: false,
            });
            state.circular_chains.push(chain);
            return;
        }

        if depth > options.max_depth {
            warn!(module_id = %target, depth, "超过最大解析深度，跳过该分支");
            state.warnings.push(format!(
                "模块 '{}' 超过最大解析深度 {}，已跳过 (路径: {})",
                target,
                options.max_depth,
                path.join(" -> ")
            ));
            return;
        }

        let constraint = match VersionConstraint::parse(&edge.constraint) {
            Ok(c) => c,
            Err(e) => {
                state.fail_edge(&edge, e.to_string());
                return;
            }
        };

        if let Some(existing) = state.chosen.get_mut(&target) {
            if constraint.satisfies(existing.version()) {
                existing.required |= edge.kind.is_blocking();
                existing.requirements.push((edge.from_module.clone(), constraint));
                state.edges.push(edge);
                return;
            }
            self.reconcile(edge, constraint, depth, path, options, stack, state).await;
            return;
        }

        let versions = match self.catalog.get_versions(&target).await {
            Ok(versions) => versions,
            Err(e) => {
                state.fail_edge(&edge, e.to_string());
                return;
            }
        };
        let Some(info) = Self::select(&versions, &constraint) else {
            state.fail_edge(
                &edge,
                format!("没有满足约束 '{}' 的版本", constraint),
            );
            return;
        };

        let version = info.version.clone();
        debug!(module_id = %target, version = %version, depth, "选定依赖版本");
        state.choose(&target, info, depth, edge.kind.is_blocking());
        if let Some(chosen) = state.chosen.get_mut(&target) {
            chosen.requirements.push((edge.from_module.clone(), constraint));
        }
        state.edges.push(edge);

        let mut child_path = path;
        child_path.push(target.clone());
        self.expand(&target, &version, depth + 1, child_path, options, stack, state)
            .await;
    }

    /// 处理与已选版本不兼容的要求
    #[allow(clippy::too_many_arguments)]
    async fn reconcile(
        &self,
        edge: DependencyEdge,
        constraint: VersionConstraint,
        depth: usize,
        path: Vec<String>,
        options: &ResolveOptions,
        stack: &mut Vec<WorkItem>,
        state: &mut ResolutionState,
    ) {
        let target = edge.to_module.clone();

        let candidate = match self.catalog.get_versions(&target).await {
            Ok(versions) => Self::select(&versions, &constraint),
            Err(e) => {
                state.fail_edge(&edge, e.to_string());
                return;
            }
        };
        let Some(candidate) = candidate else {
            state.fail_edge(&edge, format!("没有满足约束 '{}' 的版本", constraint));
            return;
        };

        let Some(existing) = state.chosen.get_mut(&target) else {
            return;
        };

        let kind = if edge.kind == DependencyKind::Peer {
            ConflictKind::Peer
        } else {
            ConflictKind::Version
        };
        let mut requirements = existing.describe_requirements();
        requirements.push(format!("{} requires {}", edge.from_module, constraint));

        let required = existing.required || edge.kind.is_blocking();
        let previous = existing.version().clone();
        let description = format!(
            "模块 '{}' 已选定 {}，但 '{}' 要求 {} (可用 {})",
            target, previous, edge.from_module, constraint, candidate.version
        );

        if !options.resolve_conflicts {
            warn!(module_id = %target, requirements = ?requirements, "版本冲突");
            state.conflicts.push(Conflict {
                kind,
                module_id: target,
                conflicting_module: edge.from_module.clone(),
                description,
                requirements,
                required,
                resolved: false,
            });
            existing.requirements.push((edge.from_module.clone(), constraint));
            state.edges.push(edge);
            return;
        }

        let upgrade = candidate.version > previous;
        let kept = if upgrade {
            candidate.version.clone()
        } else {
            previous.clone()
        };
        let satisfies_all = existing.requirements.iter().all(|(_, c)| c.satisfies(&kept))
            && constraint.satisfies(&kept);
        let resolved = !options.strict || satisfies_all;

        state.warnings.push(format!(
            "模块 '{}' 版本冲突: 保留较高版本 {}，覆盖 {} 的要求",
            target,
            kept,
            if upgrade {
                existing
                    .requirements
                    .iter()
                    .map(|(from, c)| format!("'{}' ({})", from, c))
                    .collect::<Vec<_>>()
                    .join(", ")
            } else {
                format!("'{}' ({})", edge.from_module, constraint)
            }
        ));
        if resolved {
            info!(module_id = %target, version = %kept, "版本冲突已自动解决");
        } else {
            warn!(module_id = %target, version = %kept, "严格模式下版本冲突无法解决");
        }

        existing.required = required;
        existing.requirements.push((edge.from_module.clone(), constraint));
        if upgrade {
            existing.info = candidate;
        }
        let existing_depth = existing.depth;

        state.conflicts.push(Conflict {
            kind,
            module_id: target.clone(),
            conflicting_module: edge.from_module.clone(),
            description,
            requirements,
            required,
            resolved,
        });
        state.edges.push(edge);

        if upgrade {
            state.discard_dependencies_of(&target, stack);
            let mut child_path = path;
            child_path.push(target.clone());
            self.expand(
                &target,
                &kept,
                depth.max(existing_depth) + 1,
                child_path,
                options,
                stack,
                state,
            )
            .await;
        }
    }

    fn build_plan(
        root_module: &str,
        root_version: SemanticVersion,
        root_info: ModuleVersionInfo,
        mut state: ResolutionState,
    ) -> ResolutionPlan {
        let mut graph = DependencyGraph::new();
        for module_id in &state.order {
            graph.add_module(module_id);
        }
        for edge in &state.edges {
            graph.add_dependency(&edge.from_module, &edge.to_module);
        }

        // 解析阶段已拦截路径上的环，这里兜底处理残留的环
        let order = loop {
            match graph.topological_sort() {
                Ok(order) => break order,
                Err(_) => match graph.find_cycle() {
                    Some(cycle) => {
                        warn!(chain = ?cycle, "拓扑排序时发现残留的循环依赖");
                        let first = cycle[0].clone();
                        let last = cycle[cycle.len() - 1].clone();
                        graph.remove_dependency(&last, &first);
                        state.conflicts.push(Conflict {
                            kind: ConflictKind::Circular,
                            module_id: last.clone(),
                            conflicting_module: first.clone(),
                            description: format!("{} -> {}", cycle.join(" -> "), first),
                            requirements: Vec::new(),
                            required: true,
                            resolved: false,
                        });
                        state.circular_chains.push(cycle);
                    }
                    None => break graph.get_all_modules(),
                },
            }
        };

        let edges: Vec<DependencyEdge> = state
            .edges
            .into_iter()
            .filter(|e| graph.has_dependency(&e.from_module, &e.to_module))
            .collect();

        let ordered_steps = order
            .into_iter()
            .filter_map(|module_id| {
                let chosen = state.chosen.remove(&module_id)?;
                let required_by = graph.get_dependents(&module_id);
                Some(ResolvedStep {
                    version: chosen.info.version.clone(),
                    info: chosen.info,
                    depth: chosen.depth,
                    required: chosen.required,
                    required_by,
                    module_id,
                })
            })
            .collect();

        let success = !state.aborted && !state.conflicts.iter().any(Conflict::is_blocking);

        ResolutionPlan {
            root_module: root_module.to_string(),
            root_version,
            root_info,
            ordered_steps,
            edges,
            conflicts: state.conflicts,
            circular_chains: state.circular_chains,
            warnings: state.warnings,
            success,
        }
    }
}
