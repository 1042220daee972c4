//! Hints derived from failed executions and scrubbing of host details from output

use crate::types::ExecutionStatus;
use regex::Regex;
use std::sync::OnceLock;

const MAX_SUGGESTIONS: usize = 3;

const ERROR_HINTS: &[(&str, &[&str])] = &[
    (
        "NameError",
        &[
            "Check for typos in variable names",
            "Ensure all variables are defined before use",
        ],
    ),
    (
        "IndentationError",
        &["Use consistent indentation (4 spaces recommended)"],
    ),
    (
        "SyntaxError",
        &[
            "Check syntax: parentheses, colons, and indentation",
            "Verify all strings are properly quoted",
        ],
    ),
    (
        "TypeError",
        &[
            "Check that operations match data types",
            "Verify function arguments are correct",
        ],
    ),
    (
        "IndexError",
        &[
            "Check list bounds before accessing",
            "Verify the container is not empty",
        ],
    ),
    (
        "KeyError",
        &[
            "Check dictionary keys exist before accessing",
            "Consider using .get() with a default value",
        ],
    ),
    ("ZeroDivisionError", &["Add checks to prevent division by zero"]),
    (
        "ImportError",
        &["Only modules on the allow list can be imported here"],
    ),
    (
        "MemoryError",
        &[
            "Reduce data size or use generators",
            "Consider processing data in chunks",
        ],
    ),
];

/// Up to three hints for a finished execution
pub fn suggestions(status: ExecutionStatus, stderr: &str, code: &str) -> Vec<String> {
    let mut hints: Vec<&str> = Vec::new();

    match status {
        ExecutionStatus::Success | ExecutionStatus::SecurityRejected => return Vec::new(),
        ExecutionStatus::Timeout => {
            hints.extend(["Optimize loops or reduce iteration count", "Check for infinite loops"]);
        }
        ExecutionStatus::ResourceExceeded if !stderr.contains("MemoryError") => {
            hints.push("Reduce CPU, memory or output use, or raise the limits");
        }
        _ => {
            // the last traceback line names the exception
            let last = stderr.lines().rev().find(|line| !line.trim().is_empty()).unwrap_or("");
            if let Some((_, found)) = ERROR_HINTS
                .iter()
                .find(|(name, _)| last.contains(name))
                .or_else(|| ERROR_HINTS.iter().find(|(name, _)| stderr.contains(name)))
            {
                hints.extend(found.iter());
            }
        }
    }

    let has_word = |word: &str| {
        code.split(|c: char| !c.is_alphanumeric() && c != '_')
            .any(|token| token == word)
    };
    if has_word("for") && has_word("while") {
        hints.push("Consider combining or optimizing nested loops");
    }

    hints
        .into_iter()
        .take(MAX_SUGGESTIONS)
        .map(str::to_string)
        .collect()
}

fn host_paths() -> Option<&'static Regex> {
    static PATHS: OnceLock<Option<Regex>> = OnceLock::new();
    PATHS
        .get_or_init(|| Regex::new(r"/(?:tmp|var/run|proc)/[A-Za-z0-9._-]+").ok())
        .as_ref()
}

/// Replaces host-identifying details in captured output
#[derive(Debug, Clone, Default)]
pub struct OutputSanitizer {
    home: Option<String>,
}

impl OutputSanitizer {
    /// Sanitizer for the current user's home directory
    pub fn new() -> Self {
        Self {
            home: dirs::home_dir()
                .map(|path| path.to_string_lossy().into_owned())
                .filter(|home| home.len() > 1),
        }
    }

    pub fn with_home(home: impl Into<String>) -> Self {
        Self {
            home: Some(home.into()).filter(|home| home.len() > 1),
        }
    }

    pub fn sanitize(&self, output: &str) -> String {
        let output = match &self.home {
            Some(home) => output.replace(home.as_str(), "~"),
            None => output.to_string(),
        };
        match host_paths() {
            Some(paths) => paths.replace_all(&output, "[REDACTED]").into_owned(),
            None => output,
        }
    }
}
