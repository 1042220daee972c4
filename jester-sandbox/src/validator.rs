//! Static inspection of submitted code before anything is executed

use crate::analysis::{column_of, CodeShape, Location};
use crate::policy::{ImportDecision, SecurityPolicy, StrategyKind};
use crate::selector;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

/// Rule that produced a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationRule {
    CodeTooLarge,
    EmptyCode,
    DeniedImport,
    ImportNotAllowed,
    NetworkAccess,
    FilesystemAccess,
    ProcessControl,
    DynamicCode,
    Reflection,
}

impl ViolationRule {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationRule::CodeTooLarge => "code-too-large",
            ViolationRule::EmptyCode => "empty-code",
            ViolationRule::DeniedImport => "denied-import",
            ViolationRule::ImportNotAllowed => "import-not-allowed",
            ViolationRule::NetworkAccess => "network-access",
            ViolationRule::FilesystemAccess => "filesystem-access",
            ViolationRule::ProcessControl => "process-control",
            ViolationRule::DynamicCode => "dynamic-code",
            ViolationRule::Reflection => "reflection",
        }
    }
}

impl fmt::Display for ViolationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: ViolationRule,
    pub location: Location,
    pub detail: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}: {}", self.rule, self.location, self.detail)
    }
}

/// Result of static validation. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityVerdict {
    pub allowed: bool,
    pub violations: Vec<Violation>,
    pub suggested_strategy: StrategyKind,
    /// More violations existed than were reported
    pub truncated: bool,
}

impl SecurityVerdict {
    pub fn summary(&self) -> String {
        if self.allowed {
            return "no violations".to_string();
        }
        let mut text = self
            .violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        if self.truncated {
            text.push_str("; ...");
        }
        text
    }
}

struct Pattern {
    rule: ViolationRule,
    regex: Regex,
    /// Capture group holding the flagged token
    group: usize,
    what: &'static str,
}

/// Source patterns in priority order; the first rule to hit a position wins
fn patterns() -> &'static [Pattern] {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let table: &[(ViolationRule, &str, usize, &'static str)] = &[
            (
                ViolationRule::ProcessControl,
                r"\b(os\.(?:system|popen|fork|forkpty|kill|killpg|_exit|setuid|putenv|exec\w*|spawn\w*))\b",
                1,
                "process control through os",
            ),
            (ViolationRule::ProcessControl, r"\b(subprocess)\b", 1, "subprocess usage"),
            (
                ViolationRule::ProcessControl,
                r"\b((?:signal|multiprocessing|pty|posix|_posixsubprocess|_thread)\.)",
                1,
                "process control module",
            ),
            (ViolationRule::FilesystemAccess, r"\b(open)\s*\(", 1, "file access via open()"),
            (ViolationRule::FilesystemAccess, r"\b(os\.)", 1, "os module access"),
            (ViolationRule::FilesystemAccess, r"\b(pathlib)\b", 1, "pathlib usage"),
            (ViolationRule::FilesystemAccess, r"\b(shutil\.)", 1, "shutil usage"),
            (
                ViolationRule::DynamicCode,
                r"(?:^|[^.\w])((?:eval|exec|compile)\s*\()",
                1,
                "dynamic code evaluation",
            ),
            (ViolationRule::DynamicCode, r"(__import__)", 1, "dynamic import"),
            (ViolationRule::DynamicCode, r"\b(importlib)\b", 1, "dynamic import"),
            (
                ViolationRule::Reflection,
                r"(?:^|[^.\w])((?:getattr|setattr|delattr|globals|locals|vars)\s*\()",
                1,
                "reflective access",
            ),
            (
                ViolationRule::Reflection,
                r"(__(?:builtins|subclasses|globals|class|bases|mro|code|closure|loader|spec)__)",
                1,
                "introspection of interpreter internals",
            ),
            (ViolationRule::NetworkAccess, r"\b((?:socket|urllib|requests|http\.client|ssl)\.)", 1, "network access"),
        ];

        table
            .iter()
            .filter_map(|(rule, source, group, what)| {
                Regex::new(source).ok().map(|regex| Pattern {
                    rule: *rule,
                    regex,
                    group: *group,
                    what,
                })
            })
            .collect()
    })
}

/// Validator bound to one policy and one request's import/network allowances
pub struct SecurityValidator<'a> {
    policy: &'a SecurityPolicy,
    allow_list: BTreeSet<String>,
    network_allowed: bool,
}

impl<'a> SecurityValidator<'a> {
    pub fn new(policy: &'a SecurityPolicy) -> Self {
        Self {
            allow_list: policy.effective_allow_list(&BTreeSet::new()),
            policy,
            network_allowed: false,
        }
    }

    /// Extend the allow-list for this request (denied names stay denied)
    pub fn with_extra_imports(mut self, extra: &BTreeSet<String>) -> Self {
        self.allow_list = self.policy.effective_allow_list(extra);
        self
    }

    pub fn with_network(mut self, allowed: bool) -> Self {
        self.network_allowed = allowed;
        self
    }

    pub fn allow_list(&self) -> &BTreeSet<String> {
        &self.allow_list
    }

    /// Validate raw source
    pub fn validate(&self, code: &str) -> SecurityVerdict {
        if code.len() > self.policy.max_code_bytes {
            return self.reject_oversized(code);
        }
        let shape = CodeShape::analyze(code);
        self.validate_shape(code, &shape)
    }

    /// Validate source that has already been analysed
    pub fn validate_shape(&self, code: &str, shape: &CodeShape) -> SecurityVerdict {
        if code.len() > self.policy.max_code_bytes {
            return self.reject_oversized(code);
        }

        let limit = self.policy.max_violations.max(1);
        let mut violations = Vec::new();
        let mut truncated = false;

        if code.trim().is_empty() {
            violations.push(Violation {
                rule: ViolationRule::EmptyCode,
                location: Location::new(1, 1),
                detail: "no code to execute".to_string(),
            });
        }

        let mut import_findings: BTreeMap<usize, Vec<Violation>> = BTreeMap::new();
        for import in &shape.imports {
            let decision =
                self.policy
                    .classify_import(&import.module, &self.allow_list, self.network_allowed);
            let finding = match decision {
                ImportDecision::Allowed => None,
                ImportDecision::Unlisted if !self.policy.enforce_allow_list => None,
                ImportDecision::Unlisted => Some((
                    ViolationRule::ImportNotAllowed,
                    format!("module '{}' is not in the allow list", import.module),
                )),
                ImportDecision::Denied => Some((
                    ViolationRule::DeniedImport,
                    format!("module '{}' is denied", import.module),
                )),
                ImportDecision::NetworkDenied => Some((
                    ViolationRule::DeniedImport,
                    format!("network module '{}' requires network access", import.module),
                )),
            };
            if let Some((rule, detail)) = finding {
                import_findings
                    .entry(import.location.line)
                    .or_default()
                    .push(Violation {
                        rule,
                        location: import.location,
                        detail,
                    });
            }
        }

        'lines: for (line, text) in shape.lines() {
            let mut found = import_findings.remove(&line).unwrap_or_default();

            for pattern in patterns() {
                if pattern.rule == ViolationRule::NetworkAccess && self.network_allowed {
                    continue;
                }
                for caps in pattern.regex.captures_iter(text) {
                    let Some(token) = caps.get(pattern.group) else {
                        continue;
                    };
                    let location = Location::new(line, column_of(text, token.start()));
                    if found.iter().any(|v| v.location == location) {
                        continue;
                    }
                    found.push(Violation {
                        rule: pattern.rule,
                        location,
                        detail: format!(
                            "{}: `{}`",
                            pattern.what,
                            token.as_str().trim_end_matches(['(', ' '])
                        ),
                    });
                }
            }

            found.sort_by_key(|v| v.location);
            for violation in found {
                if violations.len() == limit {
                    truncated = true;
                    break 'lines;
                }
                violations.push(violation);
            }
        }

        let allowed = violations.is_empty();
        let within_allow_list = self.imports_within_allow_list(shape);
        SecurityVerdict {
            allowed,
            suggested_strategy: selector::rule_table(shape, allowed, within_allow_list).0,
            violations,
            truncated,
        }
    }

    /// True when every import resolves to the effective allow list
    pub fn imports_within_allow_list(&self, shape: &CodeShape) -> bool {
        shape.imports.iter().all(|import| {
            self.policy
                .classify_import(&import.module, &self.allow_list, self.network_allowed)
                == ImportDecision::Allowed
        })
    }

    fn reject_oversized(&self, code: &str) -> SecurityVerdict {
        SecurityVerdict {
            allowed: false,
            violations: vec![Violation {
                rule: ViolationRule::CodeTooLarge,
                location: Location::new(1, 1),
                detail: format!(
                    "code is {} bytes, limit is {}",
                    code.len(),
                    self.policy.max_code_bytes
                ),
            }],
            suggested_strategy: StrategyKind::ProcessIsolated,
            truncated: false,
        }
    }
}

/// Validate with the policy defaults: no extra imports, no network
pub fn validate(code: &str, policy: &SecurityPolicy) -> SecurityVerdict {
    SecurityValidator::new(policy).validate(code)
}
