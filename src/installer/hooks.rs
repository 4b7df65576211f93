//! 配置、冒烟测试与数据迁移钩子

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::module::version::SemanticVersion;

/// 钩子执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl HookOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// 钩子上下文
#[derive(Debug, Clone)]
pub struct HookContext {
    pub module_id: String,
    pub tenant_id: String,
    pub version: SemanticVersion,
    pub configuration: HashMap<String, serde_json::Value>,
}

/// 安装钩子接口
#[async_trait]
pub trait InstallHooks: Send + Sync {
    /// 应用租户配置并注册模块
    async fn configure(&self, ctx: &HookContext) -> HookOutcome;

    /// 安装后的冒烟测试
    async fn smoke_test(&self, ctx: &HookContext) -> HookOutcome;

    /// 跨越破坏性变更时迁移数据
    async fn migrate_data(
        &self,
        ctx: &HookContext,
        from: &SemanticVersion,
        breaking_changes: &[String],
    ) -> HookOutcome;
}

/// 始终成功的钩子
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl InstallHooks for NoopHooks {
    async fn configure(&self, _ctx: &HookContext) -> HookOutcome {
        HookOutcome::ok()
    }

    async fn smoke_test(&self, _ctx: &HookContext) -> HookOutcome {
        HookOutcome::ok()
    }

    async fn migrate_data(
        &self,
        _ctx: &HookContext,
        _from: &SemanticVersion,
        _breaking_changes: &[String],
    ) -> HookOutcome {
        HookOutcome::ok()
    }
}

/// 钩子阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    Configure,
    SmokeTest,
    Migrate,
}

#[derive(Debug, Clone)]
enum Script {
    Fail(String),
    Hang(Duration),
}

/// 可编排的钩子
///
/// 按 (阶段, 模块, 版本) 预设失败或挂起，版本为 `None` 时匹配所有版本。
#[derive(Debug, Default)]
pub struct ScriptedHooks {
    scripts: Mutex<HashMap<(HookStage, String, Option<String>), Script>>,
    calls: Mutex<Vec<(HookStage, String, String)>>,
}

impl ScriptedHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预设失败
    pub fn fail(&self, stage: HookStage, module_id: &str, version: Option<&str>, error: &str) {
        self.set(stage, module_id, version, Script::Fail(error.to_string()));
    }

    /// 预设挂起，用于触发步骤超时
    pub fn hang(&self, stage: HookStage, module_id: &str, version: Option<&str>, duration: Duration) {
        self.set(stage, module_id, version, Script::Hang(duration));
    }

    /// 清除预设
    pub fn reset(&self) {
        self.scripts.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// 某阶段被调用的次数
    pub fn call_count(&self, stage: HookStage, module_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(s, m, _)| *s == stage && m == module_id)
            .count()
    }

    fn set(&self, stage: HookStage, module_id: &str, version: Option<&str>, script: Script) {
        self.scripts.lock().unwrap_or_else(|e| e.into_inner()).insert(
            (stage, module_id.to_string(), version.map(str::to_string)),
            script,
        );
    }

    async fn run(&self, stage: HookStage, ctx: &HookContext) -> HookOutcome {
        let script = {
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).push((
                stage,
                ctx.module_id.clone(),
                ctx.version.to_string(),
            ));
            let scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
            scripts
                .get(&(stage, ctx.module_id.clone(), Some(ctx.version.to_string())))
                .or_else(|| scripts.get(&(stage, ctx.module_id.clone(), None)))
                .cloned()
        };

        match script {
            Some(Script::Fail(error)) => HookOutcome::failed(error),
            Some(Script::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                HookOutcome::ok()
            }
            None => HookOutcome::ok(),
        }
    }
}

#[async_trait]
impl InstallHooks for ScriptedHooks {
    async fn configure(&self, ctx: &HookContext) -> HookOutcome {
        self.run(HookStage::Configure, ctx).await
    }

    async fn smoke_test(&self, ctx: &HookContext) -> HookOutcome {
        self.run(HookStage::SmokeTest, ctx).await
    }

    async fn migrate_data(
        &self,
        ctx: &HookContext,
        _from: &SemanticVersion,
        _breaking_changes: &[String],
    ) -> HookOutcome {
        self.run(HookStage::Migrate, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(module: &str, version: &str) -> HookContext {
        HookContext {
            module_id: module.to_string(),
            tenant_id: "t1".to_string(),
            version: SemanticVersion::parse(version).unwrap(),
            configuration: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_noop_hooks() {
        let hooks = NoopHooks;
        assert!(hooks.configure(&ctx("auth", "1.0.0")).await.success);
    }

    #[tokio::test]
    async fn test_scripted_failure_by_version() {
        let hooks = ScriptedHooks::new();
        hooks.fail(HookStage::Configure, "auth", Some("2.0.0"), "bad config");

        assert!(hooks.configure(&ctx("auth", "1.0.0")).await.success);
        let outcome = hooks.configure(&ctx("auth", "2.0.0")).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("bad config"));
        assert_eq!(hooks.call_count(HookStage::Configure, "auth"), 2);

        hooks.reset();
        assert!(hooks.configure(&ctx("auth", "2.0.0")).await.success);
    }

    #[tokio::test]
    async fn test_scripted_failure_any_version() {
        let hooks = ScriptedHooks::new();
        hooks.fail(HookStage::SmokeTest, "auth", None, "探测失败");
        assert!(!hooks.smoke_test(&ctx("auth", "3.1.0")).await.success);
        assert!(hooks.smoke_test(&ctx("db", "3.1.0")).await.success);
    }
}
