//! Strategy selection from the verdict and the shape of the code

use crate::analysis::CodeShape;
use crate::policy::{ImportDecision, SecurityPolicy, StrategyKind};
use crate::validator::SecurityVerdict;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Strategy selection decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyDecision {
    /// Selected strategy
    pub strategy: StrategyKind,

    /// Whether a caller hint was overridden by policy
    pub is_override: bool,

    /// Reason for selection/override
    pub reason: String,
}

/// Rules 2-4 of the selection table. Shared with the validator's suggestion.
pub(crate) fn rule_table(
    shape: &CodeShape,
    no_violations: bool,
    imports_within_allow_list: bool,
) -> (StrategyKind, String) {
    if shape.single_expression {
        return (
            StrategyKind::ExpressionOnly,
            "single expression, evaluated with guarded builtins".to_string(),
        );
    }

    if no_violations && imports_within_allow_list && !shape.has_loops() && !shape.has_io() {
        return (
            StrategyKind::Restricted,
            "straight-line code within the import allow list".to_string(),
        );
    }

    let mut causes = Vec::new();
    if !imports_within_allow_list {
        causes.push("imports outside the allow list");
    }
    if shape.has_loops() {
        causes.push("loops");
    }
    if shape.has_io() {
        causes.push("I/O");
    }
    if !no_violations {
        causes.push("validator findings");
    }
    (
        StrategyKind::ProcessIsolated,
        format!("full interpreter under OS limits ({})", causes.join(", ")),
    )
}

/// Strategy selector with policy enforcement
pub struct StrategySelector<'a> {
    policy: &'a SecurityPolicy,
    allow_list: BTreeSet<String>,
    network_allowed: bool,
}

impl<'a> StrategySelector<'a> {
    pub fn new(policy: &'a SecurityPolicy) -> Self {
        Self {
            allow_list: policy.effective_allow_list(&BTreeSet::new()),
            policy,
            network_allowed: false,
        }
    }

    /// Use a request-scoped allow list
    pub fn with_allow_list(mut self, allow_list: BTreeSet<String>) -> Self {
        self.allow_list = allow_list;
        self
    }

    pub fn with_network(mut self, allowed: bool) -> Self {
        self.network_allowed = allowed;
        self
    }

    /// Pick a strategy. The first matching rule wins:
    /// `Minimal` on request when permitted, then `ExpressionOnly`, `Restricted`,
    /// and `ProcessIsolated` as the fallback.
    pub fn select(
        &self,
        shape: &CodeShape,
        verdict: &SecurityVerdict,
        hint: Option<StrategyKind>,
    ) -> StrategyDecision {
        if hint == Some(StrategyKind::Minimal) && self.policy.minimal_permitted() {
            return StrategyDecision {
                strategy: StrategyKind::Minimal,
                is_override: false,
                reason: "minimal interpreter requested and permitted".to_string(),
            };
        }

        let within_allow_list = shape.imports.iter().all(|import| {
            self.policy
                .classify_import(&import.module, &self.allow_list, self.network_allowed)
                == ImportDecision::Allowed
        });
        let (strategy, mut reason) =
            rule_table(shape, verdict.violations.is_empty(), within_allow_list);

        let is_override = matches!(hint, Some(requested) if requested != strategy);
        if let Some(requested) = hint.filter(|_| is_override) {
            reason = format!("requested {} not honoured; {}", requested, reason);
        }

        StrategyDecision {
            strategy,
            is_override,
            reason,
        }
    }

    /// Get policy reference
    pub fn policy(&self) -> &SecurityPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::SecurityValidator;

    fn decide(code: &str, policy: &SecurityPolicy, hint: Option<StrategyKind>) -> StrategyDecision {
        let shape = CodeShape::analyze(code);
        let verdict = SecurityValidator::new(policy).validate_shape(code, &shape);
        StrategySelector::new(policy).select(&shape, &verdict, hint)
    }

    #[test]
    fn test_expression_selects_expression_only() {
        let decision = decide("2 ** 10", &SecurityPolicy::default(), None);
        assert_eq!(decision.strategy, StrategyKind::ExpressionOnly);
        assert!(!decision.is_override);
    }

    #[test]
    fn test_straight_line_selects_restricted() {
        let code = "import math\nx = math.sqrt(16)\nprint(x)";
        let decision = decide(code, &SecurityPolicy::default(), None);
        assert_eq!(decision.strategy, StrategyKind::Restricted);
    }

    #[test]
    fn test_loops_io_and_unlisted_imports_select_process() {
        let policy = SecurityPolicy::default();
        for code in [
            "for i in range(3):\n    print(i)",
            "name = input()\nprint(name)",
            "import numpy\nprint(numpy.pi)",
        ] {
            assert_eq!(
                decide(code, &policy, None).strategy,
                StrategyKind::ProcessIsolated,
                "{}",
                code
            );
        }
    }

    #[test]
    fn test_minimal_requires_unrestricted_mode() {
        let code = "x = 1\nprint(x)";
        let mut policy = SecurityPolicy::default();

        let decision = decide(code, &policy, Some(StrategyKind::Minimal));
        assert_eq!(decision.strategy, StrategyKind::Restricted);
        assert!(decision.is_override);

        policy.restricted_mode = false;
        let decision = decide(code, &policy, Some(StrategyKind::Minimal));
        assert_eq!(decision.strategy, StrategyKind::Minimal);
    }

    #[test]
    fn test_request_allow_list_enables_restricted() {
        let policy = SecurityPolicy::default();
        let code = "import numpy\nprint(numpy.pi)";
        let shape = CodeShape::analyze(code);
        let verdict = SecurityValidator::new(&policy).validate_shape(code, &shape);
        let extra: BTreeSet<String> = ["numpy".to_string()].into_iter().collect();

        let decision = StrategySelector::new(&policy)
            .with_allow_list(policy.effective_allow_list(&extra))
            .select(&shape, &verdict, None);
        assert_eq!(decision.strategy, StrategyKind::Restricted);
    }
}
