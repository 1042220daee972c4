//! Security policies for strategy selection and validation

use crate::limits::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Isolation strategy applied to one execution.
///
/// Every strategy runs in a separate OS process under the governor; they differ in how much
/// of the interpreter is exposed to the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Guarded builtins and an import allow-list inside the child interpreter
    Restricted,
    /// A single expression evaluated with guarded builtins
    ExpressionOnly,
    /// Full interpreter, OS limits only
    ProcessIsolated,
    /// Bare interpreter without site packages, only on explicit request
    Minimal,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::Restricted,
        StrategyKind::ExpressionOnly,
        StrategyKind::ProcessIsolated,
        StrategyKind::Minimal,
    ];

    /// Security ranking (lower is more confined)
    pub fn security_rank(self) -> u8 {
        match self {
            StrategyKind::ExpressionOnly => 0,
            StrategyKind::Restricted => 1,
            StrategyKind::ProcessIsolated => 2,
            StrategyKind::Minimal => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Restricted => "restricted",
            StrategyKind::ExpressionOnly => "expression_only",
            StrategyKind::ProcessIsolated => "process_isolated",
            StrategyKind::Minimal => "minimal",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "restricted" => Ok(StrategyKind::Restricted),
            "expression_only" | "expression" => Ok(StrategyKind::ExpressionOnly),
            "process_isolated" | "process" => Ok(StrategyKind::ProcessIsolated),
            "minimal" => Ok(StrategyKind::Minimal),
            other => Err(format!(
                "unknown strategy '{}'. Expected one of: restricted, expression_only, process_isolated, minimal",
                other
            )),
        }
    }
}

/// Global security policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Modules the payload may import
    #[serde(default = "default_allowed_imports")]
    pub allowed_imports: BTreeSet<String>,

    /// Modules that are always rejected
    #[serde(default = "default_denied_imports")]
    pub denied_imports: BTreeSet<String>,

    /// Modules that are rejected unless the request allows network access
    #[serde(default = "default_network_modules")]
    pub network_modules: BTreeSet<String>,

    /// Reject imports that are neither allowed nor denied
    #[serde(default)]
    pub enforce_allow_list: bool,

    /// Maximum accepted source size in bytes
    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: usize,

    /// Upper bound on reported violations
    #[serde(default = "default_max_violations")]
    pub max_violations: usize,

    /// When enabled, `Minimal` can never be selected
    #[serde(default = "default_true")]
    pub restricted_mode: bool,

    /// Hard ceiling that per-request limits are clamped to
    #[serde(default = "default_ceiling")]
    pub limit_ceiling: ResourceLimits,
}

fn names(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn default_allowed_imports() -> BTreeSet<String> {
    names(&[
        "math",
        "random",
        "datetime",
        "json",
        "collections",
        "itertools",
        "functools",
        "operator",
        "re",
        "string",
        "typing",
        "statistics",
        "decimal",
        "fractions",
        "heapq",
        "bisect",
        "dataclasses",
        "enum",
        "time",
    ])
}

fn default_denied_imports() -> BTreeSet<String> {
    names(&[
        "os",
        "sys",
        "subprocess",
        "multiprocessing",
        "threading",
        "ctypes",
        "cffi",
        "shutil",
        "pathlib",
        "signal",
        "importlib",
        "builtins",
        "inspect",
        "gc",
        "pty",
        "resource",
        "mmap",
        "pickle",
        "marshal",
        "code",
        "codeop",
        // interpreter-level aliases of the modules above
        "posix",
        "nt",
        "_posixsubprocess",
        "_thread",
        "_io",
        "_ctypes",
        "_signal",
        "_pickle",
        "_imp",
    ])
}

fn default_network_modules() -> BTreeSet<String> {
    names(&[
        "socket",
        "ssl",
        "urllib",
        "http",
        "requests",
        "ftplib",
        "smtplib",
        "poplib",
        "imaplib",
        "telnetlib",
        "xmlrpc",
        "asyncio",
        "selectors",
        "_socket",
        "_ssl",
    ])
}

fn default_max_code_bytes() -> usize {
    50_000
}

fn default_max_violations() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_ceiling() -> ResourceLimits {
    ResourceLimits::permissive()
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allowed_imports: default_allowed_imports(),
            denied_imports: default_denied_imports(),
            network_modules: default_network_modules(),
            enforce_allow_list: false,
            max_code_bytes: default_max_code_bytes(),
            max_violations: default_max_violations(),
            restricted_mode: true,
            limit_ceiling: default_ceiling(),
        }
    }
}

/// Outcome of checking one imported module name against the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportDecision {
    Allowed,
    /// Neither allowed nor denied; permitted unless the allow-list is enforced
    Unlisted,
    Denied,
    /// Network module while network access is off
    NetworkDenied,
}

impl SecurityPolicy {
    /// Allow-list extended with request-scoped names. Denied names never get in.
    pub fn effective_allow_list(&self, extra: &BTreeSet<String>) -> BTreeSet<String> {
        self.allowed_imports
            .iter()
            .chain(extra.iter())
            .filter(|name| !self.denied_imports.contains(*name))
            .cloned()
            .collect()
    }

    /// Classify an import by its root module name
    pub fn classify_import(
        &self,
        module: &str,
        allow_list: &BTreeSet<String>,
        network_allowed: bool,
    ) -> ImportDecision {
        let root = module.split('.').next().unwrap_or(module);

        if self.denied_imports.contains(root) {
            return ImportDecision::Denied;
        }

        if self.network_modules.contains(root) {
            return if network_allowed {
                ImportDecision::Allowed
            } else {
                ImportDecision::NetworkDenied
            };
        }

        if allow_list.contains(root) {
            ImportDecision::Allowed
        } else {
            ImportDecision::Unlisted
        }
    }

    /// Check whether `Minimal` may be honoured
    pub fn minimal_permitted(&self) -> bool {
        !self.restricted_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = SecurityPolicy::default();
        let allow = policy.effective_allow_list(&BTreeSet::new());

        assert_eq!(
            policy.classify_import("math", &allow, false),
            ImportDecision::Allowed
        );
        assert_eq!(
            policy.classify_import("os.path", &allow, false),
            ImportDecision::Denied
        );
        assert_eq!(
            policy.classify_import("numpy", &allow, false),
            ImportDecision::Unlisted
        );
        assert!(!policy.minimal_permitted());
    }

    #[test]
    fn test_network_modules_follow_request_flag() {
        let policy = SecurityPolicy::default();
        let allow = policy.effective_allow_list(&BTreeSet::new());

        assert_eq!(
            policy.classify_import("urllib.request", &allow, false),
            ImportDecision::NetworkDenied
        );
        assert_eq!(
            policy.classify_import("urllib.request", &allow, true),
            ImportDecision::Allowed
        );
    }

    #[test]
    fn test_request_cannot_allow_denied_module() {
        let policy = SecurityPolicy::default();
        let extra = names(&["numpy", "subprocess"]);
        let allow = policy.effective_allow_list(&extra);

        assert!(allow.contains("numpy"));
        assert!(!allow.contains("subprocess"));
    }

    #[test]
    fn test_low_level_aliases_are_denied() {
        let policy = SecurityPolicy::default();
        let allow = policy.effective_allow_list(&BTreeSet::new());

        for module in ["posix", "_posixsubprocess", "_thread", "_io", "_ctypes"] {
            assert_eq!(
                policy.classify_import(module, &allow, false),
                ImportDecision::Denied,
                "{}",
                module
            );
        }
        assert_eq!(
            policy.classify_import("_socket", &allow, false),
            ImportDecision::NetworkDenied
        );
    }

    #[test]
    fn test_security_ranking() {
        assert!(
            StrategyKind::ExpressionOnly.security_rank() < StrategyKind::Restricted.security_rank()
        );
        assert!(
            StrategyKind::Restricted.security_rank()
                < StrategyKind::ProcessIsolated.security_rank()
        );
        assert!(
            StrategyKind::ProcessIsolated.security_rank() < StrategyKind::Minimal.security_rank()
        );
    }

    #[test]
    fn test_strategy_round_trips_through_str() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.as_str().parse::<StrategyKind>().unwrap(), kind);
        }
        assert!("wasm".parse::<StrategyKind>().is_err());
    }
}
