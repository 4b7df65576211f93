//! 安装统计
//!
//! 统计在读取时从内存中的历史日志计算，结果按查询条件缓存。

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::installer::state::InstallAction;
use crate::tracker::{HistoryStatus, InstallationHistoryEntry};

/// 统计查询条件，未设置的字段不参与过滤
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnalyticsQuery {
    pub module_id: Option<String>,
    pub tenant_id: Option<String>,
    pub action: Option<InstallAction>,
}

impl AnalyticsQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_module(module_id: impl Into<String>) -> Self {
        Self {
            module_id: Some(module_id.into()),
            ..Self::default()
        }
    }

    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn for_action(mut self, action: InstallAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn matches(&self, entry: &InstallationHistoryEntry) -> bool {
        self.module_id.as_ref().map_or(true, |m| *m == entry.module_id)
            && self.tenant_id.as_ref().map_or(true, |t| *t == entry.tenant_id)
            && self.action.map_or(true, |a| a == entry.action)
    }
}

/// 按结果状态的计数，各状态之和等于 `total`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionBreakdown {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    /// 主模块成功但有可选依赖失败
    pub partial: u64,
    pub cancelled: u64,
}

impl ActionBreakdown {
    fn record(&mut self, status: HistoryStatus) {
        self.total += 1;
        match status {
            HistoryStatus::Success => self.successful += 1,
            HistoryStatus::Failed => self.failed += 1,
            HistoryStatus::Partial => self.partial += 1,
            HistoryStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// 常见问题
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonIssue {
    pub message: String,
    pub count: u64,
}

/// 单日趋势
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendBucket {
    pub day: NaiveDate,
    #[serde(flatten)]
    pub counts: ActionBreakdown,
}

/// 安装统计结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationAnalytics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub partial: u64,
    pub cancelled: u64,
    /// `successful / total`，部分成功不计入；0.0..=1.0，无记录时为 0
    pub success_rate: f64,
    pub average_duration_ms: u64,
    /// 键为操作名（install / update / uninstall / rollback）
    pub by_action: BTreeMap<String, ActionBreakdown>,
    /// 按出现次数降序
    pub common_issues: Vec<CommonIssue>,
    /// 最近 N 天，从早到晚
    pub trend: Vec<TrendBucket>,
    pub computed_at: DateTime<Utc>,
}

/// 从历史条目计算统计
pub fn compute(
    entries: &[InstallationHistoryEntry],
    query: &AnalyticsQuery,
    now: DateTime<Utc>,
    trend_days: u32,
    issue_limit: usize,
) -> InstallationAnalytics {
    let matched: Vec<&InstallationHistoryEntry> = entries.iter().filter(|e| query.matches(e)).collect();

    let mut overall = ActionBreakdown::default();
    let mut by_action: BTreeMap<String, ActionBreakdown> = BTreeMap::new();
    for entry in &matched {
        overall.record(entry.status);
        by_action
            .entry(entry.action.as_str().to_string())
            .or_default()
            .record(entry.status);
    }
    let ActionBreakdown {
        total,
        successful,
        failed,
        partial,
        cancelled,
    } = overall;

    let success_rate = if total == 0 {
        0.0
    } else {
        successful as f64 / total as f64
    };
    let average_duration_ms = if total == 0 {
        0
    } else {
        matched.iter().map(|e| e.duration_ms).sum::<u64>() / total
    };

    InstallationAnalytics {
        total,
        successful,
        failed,
        partial,
        cancelled,
        success_rate,
        average_duration_ms,
        by_action,
        common_issues: common_issues(&matched, issue_limit),
        trend: trend(&matched, now, trend_days),
        computed_at: now,
    }
}

fn common_issues(entries: &[&InstallationHistoryEntry], limit: usize) -> Vec<CommonIssue> {
    let mut counts: HashMap<&str, u64> = HashMap::new();
    for entry in entries {
        if let Some(error) = entry.error.as_deref() {
            *counts.entry(error).or_insert(0) += 1;
        }
    }

    let mut issues: Vec<CommonIssue> = counts
        .into_iter()
        .map(|(message, count)| CommonIssue {
            message: message.to_string(),
            count,
        })
        .collect();
    issues.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
    issues.truncate(limit);
    issues
}

fn trend(entries: &[&InstallationHistoryEntry], now: DateTime<Utc>, days: u32) -> Vec<TrendBucket> {
    let today = now.date_naive();
    let mut buckets: Vec<TrendBucket> = (0..days)
        .rev()
        .map(|offset| TrendBucket {
            day: today - ChronoDuration::days(i64::from(offset)),
            counts: ActionBreakdown::default(),
        })
        .collect();

    for entry in entries {
        let day = entry.timestamp.date_naive();
        if let Some(bucket) = buckets.iter_mut().find(|b| b.day == day) {
            bucket.counts.record(entry.status);
        }
    }
    buckets
}
