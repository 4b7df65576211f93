//! 语义化版本
//!
//! 版本号解析、全序比较与范围约束判断。
//!
//! # 示例
//!
//! ```rust
//! use chips_installer::module::version::{SemanticVersion, VersionConstraint};
//!
//! let v = SemanticVersion::parse("1.4.2").unwrap();
//! let c = VersionConstraint::parse("^1.2.0").unwrap();
//! assert!(c.satisfies(&v));
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::utils::{CoreError, Result};

/// 语义化版本号
///
/// 严格遵循 `major.minor.patch[-prerelease][+build]` 语法。
/// 比较时忽略 build 元数据。
#[derive(Debug, Clone)]
pub struct SemanticVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
    pub build: Option<String>,
    raw: String,
}

impl SemanticVersion {
    /// 解析版本号
    ///
    /// 任何偏离语法的输入都返回 [`CoreError::InvalidVersion`]，不做容错修正。
    pub fn parse(input: &str) -> Result<Self> {
        let parsed = semver::Version::parse(input)
            .map_err(|e| CoreError::InvalidVersion(format!("{}: {}", input, e)))?;

        Ok(Self {
            major: parsed.major,
            minor: parsed.minor,
            patch: parsed.patch,
            prerelease: (!parsed.pre.is_empty()).then(|| parsed.pre.as_str().to_string()),
            build: (!parsed.build.is_empty()).then(|| parsed.build.as_str().to_string()),
            raw: input.to_string(),
        })
    }

    /// 由数字部分构造正式版本
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
            build: None,
            raw: format!("{}.{}.{}", major, minor, patch),
        }
    }

    /// 原始字符串
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// 是否为预发布版本
    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }

    /// 比较两个版本，返回 -1、0 或 1
    pub fn compare(&self, other: &SemanticVersion) -> i32 {
        match self.cmp(other) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    fn core(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }
}

impl Ord for SemanticVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.core().cmp(&other.core()).then_with(|| {
            match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                // 正式版高于同号预发布版
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            }
        })
    }
}

impl PartialOrd for SemanticVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SemanticVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SemanticVersion {}

impl Hash for SemanticVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.core().hash(state);
        self.prerelease.hash(state);
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for SemanticVersion {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for SemanticVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for SemanticVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        SemanticVersion::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// 约束运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintOp {
    /// `^`
    Caret,
    /// `~`
    Tilde,
    /// `>=`
    Gte,
    /// `<=`
    Lte,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `=`
    Eq,
    /// 无运算符，等同于 `=`
    Exact,
    /// `*` / `latest` / 空请求
    Any,
}

impl ConstraintOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            ConstraintOp::Caret => "^",
            ConstraintOp::Tilde => "~",
            ConstraintOp::Gte => ">=",
            ConstraintOp::Lte => "<=",
            ConstraintOp::Gt => ">",
            ConstraintOp::Lt => "<",
            ConstraintOp::Eq => "=",
            ConstraintOp::Exact => "",
            ConstraintOp::Any => "*",
        }
    }
}

/// 版本约束
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionConstraint {
    pub op: ConstraintOp,
    /// `Any` 时为 `None`
    pub version: Option<SemanticVersion>,
}

impl VersionConstraint {
    /// 任意版本
    pub fn any() -> Self {
        Self {
            op: ConstraintOp::Any,
            version: None,
        }
    }

    /// 精确版本
    pub fn exact(version: SemanticVersion) -> Self {
        Self {
            op: ConstraintOp::Exact,
            version: Some(version),
        }
    }

    /// 解析约束字符串
    ///
    /// 支持 `^1.2.0`、`~1.2.0`、`>=1.0.0`、`<=`、`>`、`<`、`=1.0.0`、`1.0.0`，
    /// 以及表示任意版本的 `*`、`latest` 和空串。
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() || trimmed == "*" || trimmed.eq_ignore_ascii_case("latest") {
            return Ok(Self::any());
        }

        // 双字符运算符必须先于单字符匹配
        const OPS: [(&str, ConstraintOp); 7] = [
            (">=", ConstraintOp::Gte),
            ("<=", ConstraintOp::Lte),
            ("^", ConstraintOp::Caret),
            ("~", ConstraintOp::Tilde),
            (">", ConstraintOp::Gt),
            ("<", ConstraintOp::Lt),
            ("=", ConstraintOp::Eq),
        ];

        let (op, rest) = OPS
            .iter()
            .find_map(|(prefix, op)| trimmed.strip_prefix(prefix).map(|rest| (*op, rest)))
            .unwrap_or((ConstraintOp::Exact, trimmed));

        let version = SemanticVersion::parse(rest.trim())
            .map_err(|_| CoreError::InvalidConstraint(input.to_string()))?;

        Ok(Self {
            op,
            version: Some(version),
        })
    }

    /// 判断候选版本是否满足约束
    pub fn satisfies(&self, candidate: &SemanticVersion) -> bool {
        let base = match (&self.op, &self.version) {
            (ConstraintOp::Any, _) | (_, None) => return true,
            (_, Some(v)) => v,
        };

        match self.op {
            ConstraintOp::Caret => {
                if candidate < base {
                    return false;
                }
                if base.major > 0 {
                    candidate.major == base.major
                } else if base.minor > 0 {
                    candidate.major == 0 && candidate.minor == base.minor
                } else {
                    candidate.core() == base.core()
                }
            }
            ConstraintOp::Tilde => {
                candidate >= base && candidate.major == base.major && candidate.minor == base.minor
            }
            ConstraintOp::Gte => candidate >= base,
            ConstraintOp::Lte => candidate <= base,
            ConstraintOp::Gt => candidate > base,
            ConstraintOp::Lt => candidate < base,
            ConstraintOp::Eq | ConstraintOp::Exact => candidate == base,
            ConstraintOp::Any => true,
        }
    }

    /// 约束本身是否指定了预发布版本
    pub fn names_prerelease(&self) -> bool {
        self.version
            .as_ref()
            .map(SemanticVersion::is_prerelease)
            .unwrap_or(false)
    }

    /// 是否为精确版本约束
    pub fn is_exact(&self) -> bool {
        matches!(self.op, ConstraintOp::Eq | ConstraintOp::Exact)
    }

    /// 从候选列表中选出满足约束的最高版本
    ///
    /// 约束未指定预发布版本时优先选择正式版，只有不存在满足约束的正式版才退而选择预发布版。
    pub fn best_match<'a, I>(&self, candidates: I) -> Option<&'a SemanticVersion>
    where
        I: IntoIterator<Item = &'a SemanticVersion>,
    {
        let matching: Vec<&SemanticVersion> =
            candidates.into_iter().filter(|v| self.satisfies(v)).collect();

        if !self.names_prerelease() {
            if let Some(best) = matching.iter().filter(|v| !v.is_prerelease()).max() {
                return Some(*best);
            }
        }
        matching.into_iter().max()
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}{}", self.op.symbol(), v),
            None => f.write_str("*"),
        }
    }
}

impl FromStr for VersionConstraint {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// 判断版本字符串是否满足约束字符串
pub fn satisfies(version: &str, constraint: &str) -> Result<bool> {
    let version = SemanticVersion::parse(version)?;
    let constraint = VersionConstraint::parse(constraint)?;
    Ok(constraint.satisfies(&version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn v(s: &str) -> SemanticVersion {
        SemanticVersion::parse(s).unwrap()
    }

    fn c(s: &str) -> VersionConstraint {
        VersionConstraint::parse(s).unwrap()
    }

    #[test]
    fn test_parse_full() {
        let version = v("1.2.3-beta.1+build.7");
        assert_eq!(version.major, 1);
        assert_eq!(version.minor, 2);
        assert_eq!(version.patch, 3);
        assert_eq!(version.prerelease.as_deref(), Some("beta.1"));
        assert_eq!(version.build.as_deref(), Some("build.7"));
        assert_eq!(version.as_str(), "1.2.3-beta.1+build.7");
    }

    #[test]
    fn test_parse_rejects_loose_input() {
        for input in ["1.2", "v1.2.3", "1.2.3.4", "", "a.b.c", " 1.2.3", "01.2.3"] {
            assert!(
                matches!(SemanticVersion::parse(input), Err(CoreError::InvalidVersion(_))),
                "should reject {:?}",
                input
            );
        }
    }

    #[test]
    fn test_raw_reparses_to_same_value() {
        let version = v("3.0.0-rc.2+sha.1");
        assert_eq!(SemanticVersion::parse(version.as_str()).unwrap(), version);
    }

    #[test]
    fn test_compare() {
        assert_eq!(v("1.0.0").compare(&v("2.0.0")), -1);
        assert_eq!(v("1.10.0").compare(&v("1.9.0")), 1);
        assert_eq!(v("1.0.0").compare(&v("1.0.0+other")), 0);
        assert_eq!(v("1.0.0-alpha").compare(&v("1.0.0")), -1);
        assert_eq!(v("1.0.0-alpha").compare(&v("1.0.0-beta")), -1);
    }

    #[test]
    fn test_caret() {
        assert!(c("^1.2.0").satisfies(&v("1.4.2")));
        assert!(!c("^1.2.0").satisfies(&v("2.0.0")));
        assert!(!c("^1.2.0").satisfies(&v("1.1.9")));
        assert!(c("^0.2.0").satisfies(&v("0.2.3")));
        assert!(!c("^0.2.0").satisfies(&v("0.3.0")));
        assert!(c("^0.0.3").satisfies(&v("0.0.3")));
        assert!(!c("^0.0.3").satisfies(&v("0.0.4")));
    }

    #[test]
    fn test_tilde() {
        assert!(c("~1.2.0").satisfies(&v("1.2.9")));
        assert!(!c("~1.2.0").satisfies(&v("1.3.0")));
        assert!(!c("~1.2.5").satisfies(&v("1.2.4")));
    }

    #[test]
    fn test_comparison_operators() {
        assert!(c(">=1.0.0").satisfies(&v("1.0.0")));
        assert!(!c(">1.0.0").satisfies(&v("1.0.0")));
        assert!(c("<=1.0.0").satisfies(&v("1.0.0")));
        assert!(c("<2.0.0").satisfies(&v("1.9.9")));
        assert!(c("=1.0.0").satisfies(&v("1.0.0")));
        assert!(c("1.0.0").satisfies(&v("1.0.0")));
        assert!(!c("1.0.0").satisfies(&v("1.0.1")));
    }

    #[test]
    fn test_any_constraint() {
        for input in ["*", "latest", "", "  "] {
            let constraint = c(input);
            assert_eq!(constraint.op, ConstraintOp::Any);
            assert!(constraint.satisfies(&v("9.9.9")));
        }
    }

    #[test]
    fn test_invalid_constraint() {
        assert!(matches!(
            VersionConstraint::parse("^1.x"),
            Err(CoreError::InvalidConstraint(_))
        ));
        assert!(VersionConstraint::parse("=>1.0.0").is_err());
    }

    #[test]
    fn test_best_match_prefers_release() {
        let versions = vec![v("1.0.0"), v("1.2.0"), v("1.3.0-beta.1"), v("2.0.0")];
        assert_eq!(c("^1.0.0").best_match(&versions).unwrap().as_str(), "1.2.0");
        assert_eq!(c("*").best_match(&versions).unwrap().as_str(), "2.0.0");
        assert_eq!(
            c(">=1.3.0-beta.1").best_match(&versions).unwrap().as_str(),
            "2.0.0"
        );
        assert!(c("^3.0.0").best_match(&versions).is_none());

        let only_pre = vec![v("0.1.0-alpha"), v("0.1.0-beta")];
        assert_eq!(c("*").best_match(&only_pre).unwrap().as_str(), "0.1.0-beta");
    }

    #[test]
    fn test_display_roundtrip() {
        assert_eq!(c("^1.2.0").to_string(), "^1.2.0");
        assert_eq!(c("1.2.0").to_string(), "1.2.0");
        assert_eq!(c("latest").to_string(), "*");
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&v("1.2.3-rc.1")).unwrap();
        assert_eq!(json, "\"1.2.3-rc.1\"");
        let back: SemanticVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v("1.2.3-rc.1"));
        assert!(serde_json::from_str::<SemanticVersion>("\"1.2\"").is_err());
    }

    fn arb_version() -> impl Strategy<Value = SemanticVersion> {
        (
            0u64..4,
            0u64..4,
            0u64..4,
            proptest::option::of(proptest::sample::select(vec!["alpha", "beta", "rc"])),
        )
            .prop_map(|(major, minor, patch, pre)| {
                let raw = match pre {
                    Some(p) => format!("{}.{}.{}-{}", major, minor, patch, p),
                    None => format!("{}.{}.{}", major, minor, patch),
                };
                SemanticVersion::parse(&raw).unwrap()
            })
    }

    proptest! {
        #[test]
        fn prop_compare_antisymmetric(a in arb_version(), b in arb_version()) {
            prop_assert_eq!(a.compare(&b), -b.compare(&a));
        }

        #[test]
        fn prop_compare_transitive(a in arb_version(), b in arb_version(), c in arb_version()) {
            if a.compare(&b) == 0 && b.compare(&c) == 0 {
                prop_assert_eq!(a.compare(&c), 0);
            }
            if a.compare(&b) < 0 && b.compare(&c) < 0 {
                prop_assert!(a.compare(&c) < 0);
            }
        }

        #[test]
        fn prop_exact_constraint_matches_only_equal(a in arb_version(), b in arb_version()) {
            let constraint = VersionConstraint::exact(a.clone());
            prop_assert_eq!(constraint.satisfies(&b), a == b);
        }
    }
}
