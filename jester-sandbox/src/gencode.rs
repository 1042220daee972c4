//! Variant generation for races: the task model, the generator seam and the built-in sources

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::error::Result;
use crate::limits::ResourceLimits;

/// Identifier of the unmodified candidate
pub const ORIGINAL_VARIANT: &str = "original";

/// One candidate implementation of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub source_code: String,
    pub rationale: String,
    /// How likely the generator thinks this variant is an improvement, in `0.0..=1.0`
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl Variant {
    pub fn new(id: impl Into<String>, source_code: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_code: source_code.into(),
            rationale: rationale.into(),
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }
}

/// Logical task whose variants are raced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceTask {
    /// What the code is meant to do
    pub description: String,

    /// Starting implementation handed to generators
    pub code: String,

    /// Expected stdout; variants whose trimmed output differs are ineligible
    #[serde(default)]
    pub reference_output: Option<String>,

    #[serde(default)]
    pub limits: Option<ResourceLimits>,

    #[serde(default)]
    pub allowed_imports: BTreeSet<String>,
}

impl RaceTask {
    pub fn new(description: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            code: code.into(),
            reference_output: None,
            limits: None,
            allowed_imports: BTreeSet::new(),
        }
    }

    pub fn with_reference_output(mut self, expected: impl Into<String>) -> Self {
        self.reference_output = Some(expected.into());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = Some(limits);
        self
    }
}

/// Trait implemented by variant sources.
#[async_trait]
pub trait VariantGenerator: Send + Sync {
    /// Produce candidate implementations for the task, best guesses first.
    async fn generate(&self, task: &RaceTask) -> Result<Vec<Variant>>;
}

/// Generator that returns caller-supplied candidates.
#[derive(Debug, Clone, Default)]
pub struct StaticVariantGenerator {
    variants: Vec<Variant>,
}

impl StaticVariantGenerator {
    pub fn new(variants: Vec<Variant>) -> Self {
        Self { variants }
    }
}

#[async_trait]
impl VariantGenerator for StaticVariantGenerator {
    async fn generate(&self, _task: &RaceTask) -> Result<Vec<Variant>> {
        Ok(self.variants.clone())
    }
}

/// Generator that derives variants from the task code by source rewrites.
///
/// Always yields the original first, followed by each rewrite that changed the code and
/// differs from every variant already produced. Code no rewrite applies to yields only the
/// original, which is too few to race.
#[derive(Debug, Default)]
pub struct RewriteVariantGenerator;

#[async_trait]
impl VariantGenerator for RewriteVariantGenerator {
    async fn generate(&self, task: &RaceTask) -> Result<Vec<Variant>> {
        let rewrites: [(&str, fn(&str) -> String, &str, f64); 3] = [
            (
                "list_comprehension",
                rewrite_append_loop,
                "append loop replaced by a list comprehension",
                0.9,
            ),
            (
                "set_membership",
                rewrite_membership_lists,
                "literal list membership tests replaced by set lookups",
                0.85,
            ),
            (
                "generator_sum",
                rewrite_sum_of_list,
                "sum over a generator expression instead of a temporary list",
                0.8,
            ),
        ];

        let mut variants =
            vec![Variant::new(ORIGINAL_VARIANT, task.code.clone(), "code as submitted").with_confidence(0.8)];
        for (id, rewrite, rationale, confidence) in rewrites {
            let code = rewrite(&task.code);
            if variants.iter().all(|v| v.source_code != code) {
                variants.push(Variant::new(id, code, rationale).with_confidence(confidence));
            }
        }

        Ok(variants)
    }
}

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// `xs = []` / `for v in it:` / `xs.append(expr)` becomes `xs = [expr for v in it]`
fn rewrite_append_loop(code: &str) -> String {
    static LOOP: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(pattern) = cached(
        &LOOP,
        r"(?m)^([ \t]*)(\w+)[ \t]*=[ \t]*\[\][ \t]*\n[ \t]*for[ \t]+(\w+)[ \t]+in[ \t]+([^:\n]+):[ \t]*\n[ \t]+(\w+)\.append\((.+)\)[ \t]*$",
    ) else {
        return code.to_string();
    };

    pattern
        .replace_all(code, |caps: &Captures| {
            if caps[2] != caps[5] {
                return caps[0].to_string();
            }
            format!(
                "{}{} = [{} for {} in {}]",
                &caps[1],
                &caps[2],
                &caps[6],
                &caps[3],
                caps[4].trim_end()
            )
        })
        .into_owned()
}

/// `x in [a, b]` becomes `x in {a, b}`; iteration (`for x in [...]`) is left alone
fn rewrite_membership_lists(code: &str) -> String {
    static MEMBERSHIP: OnceLock<Option<Regex>> = OnceLock::new();
    static FOR_TARGET: OnceLock<Option<Regex>> = OnceLock::new();
    let (Some(membership), Some(for_target)) = (
        cached(&MEMBERSHIP, r"\bin[ \t]+\[([^\[\]\n]+)\]"),
        cached(&FOR_TARGET, r"\bfor[ \t]+[\w \t,()]+$"),
    ) else {
        return code.to_string();
    };

    code.split('\n')
        .map(|line| {
            membership
                .replace_all(line, |caps: &Captures| {
                    let whole = caps.get(0).map(|m| m.start()).unwrap_or(0);
                    if for_target.is_match(line[..whole].trim_end()) {
                        caps[0].to_string()
                    } else {
                        format!("in {{{}}}", &caps[1])
                    }
                })
                .into_owned()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `sum([expr for ...])` becomes `sum(expr for ...)`
fn rewrite_sum_of_list(code: &str) -> String {
    static SUM: OnceLock<Option<Regex>> = OnceLock::new();
    match cached(&SUM, r"\bsum\(\[([^\[\]]+\bfor\b[^\[\]]+)\]\)") {
        Some(pattern) => pattern.replace_all(code, "sum($1)").into_owned(),
        None => code.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_loop_rewrite() {
        let code = "result = []\nfor i in range(10):\n    result.append(i * i)\nprint(result)";
        assert_eq!(
            rewrite_append_loop(code),
            "result = [i * i for i in range(10)]\nprint(result)"
        );
    }

    #[test]
    fn test_append_to_other_list_is_untouched() {
        let code = "a = []\nfor i in x:\n    b.append(i)";
        assert_eq!(rewrite_append_loop(code), code);
    }

    #[test]
    fn test_membership_rewrite_skips_iteration() {
        let code = "for v in [3, 1, 2]:\n    if v in [1, 2]:\n        print(v)";
        assert_eq!(
            rewrite_membership_lists(code),
            "for v in [3, 1, 2]:\n    if v in {1, 2}:\n        print(v)"
        );
    }

    #[test]
    fn test_sum_rewrite() {
        assert_eq!(
            rewrite_sum_of_list("print(sum([i * i for i in range(5)]))"),
            "print(sum(i * i for i in range(5)))"
        );
    }

    #[tokio::test]
    async fn test_rewrite_generator_emits_distinct_variants() {
        let task = RaceTask::new(
            "sum of squares",
            "squares = []\nfor i in range(100):\n    squares.append(i * i)\nprint(sum(squares))",
        );
        let variants = RewriteVariantGenerator.generate(&task).await.unwrap();
        let ids: Vec<_> = variants.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["original", "list_comprehension"]);
        assert_eq!(variants[1].confidence, Some(0.9));
    }

    #[tokio::test]
    async fn test_code_without_rewrites_yields_only_original() {
        let variants = RewriteVariantGenerator
            .generate(&RaceTask::new("", "print(1)"))
            .await
            .unwrap();
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].id, ORIGINAL_VARIANT);
    }

    #[tokio::test]
    async fn test_static_generator() {
        let generator = StaticVariantGenerator::new(vec![
            Variant::new("a", "print(1)", ""),
            Variant::new("b", "print(2)", ""),
        ]);
        let variants = generator.generate(&RaceTask::new("", "")).await.unwrap();
        assert_eq!(variants.len(), 2);
    }
}
