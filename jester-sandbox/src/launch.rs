//! Interpreter command lines for each strategy

use crate::policy::StrategyKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Builtins removed before payload code runs under a guarded strategy
pub const REMOVED_BUILTINS: &[&str] = &[
    "open",
    "eval",
    "exec",
    "compile",
    "input",
    "breakpoint",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
];

const MINIMAL_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

// argv[1] is the payload, argv[2] the comma-separated allow list.
const GUARD_PRELUDE: &str = r#"import builtins as _b, sys as _s
_src = _s.argv[1]
_allowed = frozenset(n for n in _s.argv[2].split(',') if n)
_real_import = _b.__import__
def _guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level != 0 or name.partition('.')[0] not in _allowed:
        raise ImportError("import of '%s' is not allowed" % name)
    return _real_import(name, globals, locals, fromlist, level)
_safe = dict(vars(_b))
for _n in (__REMOVED__):
    _safe.pop(_n, None)
_safe['__import__'] = _guarded_import
_s.argv = ['<sandbox>']
_scope = {'__builtins__': _safe, '__name__': '__main__'}
"#;

const EXEC_TAIL: &str = "exec(compile(_src, '<sandbox>', 'exec'), _scope)\n";

const EVAL_TAIL: &str = r#"_value = eval(compile(_src, '<sandbox>', 'eval'), _scope)
if _value is not None:
    print(repr(_value))
"#;

/// Program, arguments and environment for one child interpreter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Complete child environment; nothing is inherited
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    pub fn for_strategy(
        strategy: StrategyKind,
        code: &str,
        allow_list: &BTreeSet<String>,
        interpreter: &str,
    ) -> Self {
        // -I ignores PYTHON* variables; flags carry the bytecode, buffering and encoding settings
        let mut args = ["-I", "-B", "-u", "-X", "utf8"].map(String::from).to_vec();

        match strategy {
            StrategyKind::Minimal => {
                args.push("-S".to_string());
                args.extend(["-c".to_string(), code.to_string()]);
            }
            StrategyKind::ProcessIsolated => {
                args.extend(["-c".to_string(), code.to_string()]);
            }
            StrategyKind::Restricted => {
                args.extend(guarded(EXEC_TAIL, code, allow_list));
            }
            StrategyKind::ExpressionOnly => {
                args.extend(guarded(EVAL_TAIL, code, allow_list));
            }
        }

        Self {
            program: interpreter.to_string(),
            args,
            env: vec![("PATH".to_string(), MINIMAL_PATH.to_string())],
        }
    }

    /// Payload as passed to the interpreter
    pub fn payload(&self) -> Option<&str> {
        let at = self.args.iter().position(|a| a == "-c")?;
        let script = self.args.get(at + 1)?;
        if script.starts_with(GUARD_PRELUDE.lines().next().unwrap_or_default()) {
            self.args.get(at + 2).map(String::as_str)
        } else {
            Some(script.as_str())
        }
    }
}

fn guarded(tail: &str, code: &str, allow_list: &BTreeSet<String>) -> [String; 4] {
    let removed = REMOVED_BUILTINS
        .iter()
        .map(|name| format!("'{}'", name))
        .collect::<Vec<_>>()
        .join(", ");
    let script = format!("{}{}", GUARD_PRELUDE.replace("__REMOVED__", &removed), tail);
    let allowed = allow_list
        .iter()
        .filter(|name| !name.contains(','))
        .cloned()
        .collect::<Vec<_>>()
        .join(",");
    ["-c".to_string(), script, code.to_string(), allowed]
}
