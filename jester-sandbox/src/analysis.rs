//! Lexical inspection of Python source.
//!
//! This is a structural scan, not a parse: comments and string literal bodies are blanked
//! out (keeping line and column positions intact), physical lines are joined into logical
//! lines by bracket depth and backslash continuation, and each logical line is split into
//! statements on top-level `;`. The result is enough to find imports, loops, I/O calls and
//! to tell a lone expression apart from statements.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// 1-based source position
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl Location {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// An `import x` / `from x import y` occurrence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRef {
    /// Dotted module path as written
    pub module: String,
    pub location: Location,
}

impl ImportRef {
    pub fn root(&self) -> &str {
        self.module.split('.').next().unwrap_or(&self.module)
    }
}

const COMPOUND_KEYWORDS: &[&str] = &[
    "if", "elif", "else", "for", "while", "with", "try", "except", "finally", "def", "class",
    "async", "match", "case",
];

const SIMPLE_STATEMENT_KEYWORDS: &[&str] = &[
    "pass", "del", "return", "raise", "global", "nonlocal", "assert", "break", "continue",
    "import", "from", "yield",
];

/// Structural summary of a code sample
#[derive(Debug, Clone)]
pub struct CodeShape {
    stripped: String,
    pub imports: Vec<ImportRef>,
    pub loops: Vec<Location>,
    pub io: Vec<Location>,
    pub statements: usize,
    pub single_expression: bool,
}

#[derive(Debug)]
struct LogicalLine {
    line: usize,
    indent: usize,
    text: String,
}

fn io_pattern() -> Option<&'static Regex> {
    static IO: OnceLock<Option<Regex>> = OnceLock::new();
    IO.get_or_init(|| {
        Regex::new(r"\b(?:open|input|breakpoint)\s*\(|\bsys\.std(?:in|out|err)\b|\bio\.").ok()
    })
    .as_ref()
}

impl CodeShape {
    pub fn analyze(code: &str) -> Self {
        let stripped = strip_literals(code);
        let logical = logical_lines(&stripped);

        let mut imports = Vec::new();
        let mut loops = Vec::new();
        let mut statements = 0usize;
        let mut expression_candidate = true;

        for line in &logical {
            let location = Location::new(line.line, line.indent + 1);
            for segment in split_top_level(&line.text, ';') {
                let segment = segment.trim();
                if segment.is_empty() {
                    continue;
                }
                statements += 1;

                let first = first_word(segment).0;

                // `if x: import os` keeps its body on the header line
                let mut statement = segment;
                loop {
                    let (head, rest) = first_word(statement);
                    let (keyword, rest) = if head == "async" {
                        first_word(rest)
                    } else {
                        (head, rest)
                    };

                    if keyword == "for" || keyword == "while" {
                        loops.push(location);
                    }

                    match keyword {
                        "import" => imports.extend(parse_import_list(rest, location)),
                        "from" => imports.extend(parse_from_import(rest, location)),
                        _ => {}
                    }

                    if !COMPOUND_KEYWORDS.contains(&keyword) {
                        break;
                    }
                    match inline_suite(statement) {
                        Some(suite) => statement = suite,
                        None => break,
                    }
                }

                if segment.starts_with('@')
                    || COMPOUND_KEYWORDS.contains(&first)
                    || SIMPLE_STATEMENT_KEYWORDS.contains(&first)
                    || has_assignment(segment)
                    || has_bare_colon(segment)
                {
                    expression_candidate = false;
                }
            }
        }

        let io = match io_pattern() {
            Some(pattern) => stripped
                .split('\n')
                .enumerate()
                .flat_map(|(idx, text)| {
                    pattern
                        .find_iter(text)
                        .map(move |m| Location::new(idx + 1, column_of(text, m.start())))
                })
                .collect(),
            None => Vec::new(),
        };

        Self {
            stripped,
            imports,
            loops,
            io,
            statements,
            single_expression: expression_candidate && statements == 1,
        }
    }

    /// Physical lines with literals blanked, paired with their 1-based line number
    pub fn lines(&self) -> impl Iterator<Item = (usize, &str)> {
        self.stripped
            .split('\n')
            .enumerate()
            .map(|(idx, text)| (idx + 1, text))
    }

    pub fn has_imports(&self) -> bool {
        !self.imports.is_empty()
    }

    pub fn has_loops(&self) -> bool {
        !self.loops.is_empty()
    }

    pub fn has_io(&self) -> bool {
        !self.io.is_empty()
    }
}

/// 1-based character column for a byte offset within `line`
pub(crate) fn column_of(line: &str, byte_offset: usize) -> usize {
    line[..byte_offset].chars().count() + 1
}

fn first_word(segment: &str) -> (&str, &str) {
    let end = segment
        .char_indices()
        .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(segment.len());
    (&segment[..end], segment[end..].trim_start())
}

fn parse_import_list(rest: &str, location: Location) -> Vec<ImportRef> {
    rest.trim_matches(|c| c == '(' || c == ')' || c == ' ')
        .split(',')
        .filter_map(|item| item.split_whitespace().next())
        .map(|module| ImportRef {
            module: module.trim_matches(|c| c == '(' || c == ')').to_string(),
            location,
        })
        .filter(|import| !import.module.is_empty())
        .collect()
}

fn parse_from_import(rest: &str, location: Location) -> Vec<ImportRef> {
    let module = rest
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_start_matches('.');
    if module.is_empty() || module == "import" {
        // relative import of the current package
        return Vec::new();
    }
    vec![ImportRef {
        module: module.to_string(),
        location,
    }]
}

/// Blank out comments and string literal bodies, preserving positions and newlines.
/// Replacement fields of f-strings are kept since they are executable code.
fn strip_literals(code: &str) -> String {
    let chars: Vec<char> = code.chars().collect();
    let mut out = String::with_capacity(code.len());
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    out.push(' ');
                    i += 1;
                }
            }
            '\'' | '"' => {
                let formatted = string_prefix(&chars, i).contains(['f', 'F']);
                i = blank_string(&chars, i, formatted, &mut out);
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

fn string_prefix(chars: &[char], quote_at: usize) -> String {
    let mut start = quote_at;
    while start > 0 && (chars[start - 1].is_alphanumeric() || chars[start - 1] == '_') {
        start -= 1;
    }
    let word: String = chars[start..quote_at].iter().collect();
    if word.len() <= 2 && word.chars().all(|c| "rRbBfFuU".contains(c)) {
        word
    } else {
        String::new()
    }
}

fn blank_string(chars: &[char], start: usize, formatted: bool, out: &mut String) -> usize {
    let len = chars.len();
    let quote = chars[start];
    let triple = start + 2 < len && chars[start + 1] == quote && chars[start + 2] == quote;
    let quote_len = if triple { 3 } else { 1 };
    let closes = |i: usize| {
        chars[i] == quote && (!triple || (i + 2 < len && chars[i + 1] == quote && chars[i + 2] == quote))
    };
    let blank = |c: char| if c == '\n' { '\n' } else { ' ' };

    out.extend(std::iter::repeat(quote).take(quote_len));
    let mut i = start + quote_len;
    let mut field_depth = 0usize;

    while i < len {
        let c = chars[i];

        if field_depth > 0 {
            if c == quote && !triple {
                out.push(quote);
                return i + 1;
            }
            match c {
                '{' => field_depth += 1,
                '}' => field_depth -= 1,
                _ => {}
            }
            out.push(if field_depth == 0 { ' ' } else { c });
            i += 1;
            continue;
        }

        if c == '\\' {
            out.push(' ');
            i += 1;
            if i < len {
                out.push(blank(chars[i]));
                i += 1;
            }
            continue;
        }
        if c == '\n' && !triple {
            // unterminated single-quoted literal
            out.push('\n');
            return i + 1;
        }
        if closes(i) {
            out.extend(std::iter::repeat(quote).take(quote_len));
            return i + quote_len;
        }
        if formatted && c == '{' {
            if i + 1 < len && chars[i + 1] == '{' {
                out.push_str("  ");
                i += 2;
                continue;
            }
            field_depth = 1;
            out.push(' ');
            i += 1;
            continue;
        }

        out.push(blank(c));
        i += 1;
    }

    i
}

fn logical_lines(stripped: &str) -> Vec<LogicalLine> {
    let mut lines = Vec::new();
    let mut buffer = String::new();
    let mut start_line = 1;
    let mut indent = 0;
    let mut depth = 0i32;

    for (idx, physical) in stripped.split('\n').enumerate() {
        if buffer.is_empty() {
            start_line = idx + 1;
            indent = physical.chars().take_while(|c| c.is_whitespace()).count();
        }

        let trimmed = physical.trim_end();
        let continued = trimmed.ends_with('\\');
        buffer.push_str(trimmed.trim_end_matches('\\'));
        buffer.push(' ');

        for c in trimmed.chars() {
            match c {
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth = (depth - 1).max(0),
                _ => {}
            }
        }

        if depth == 0 && !continued {
            if !buffer.trim().is_empty() {
                lines.push(LogicalLine {
                    line: start_line,
                    indent,
                    text: std::mem::take(&mut buffer),
                });
            }
            buffer.clear();
        }
    }

    if !buffer.trim().is_empty() {
        lines.push(LogicalLine {
            line: start_line,
            indent,
            text: buffer,
        });
    }

    lines
}

fn split_top_level(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut last = 0;

    for (i, c) in text.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            c if c == separator && depth <= 0 => {
                parts.push(&text[last..i]);
                last = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[last..]);
    parts
}

/// Body following the header colon of a compound statement, when it sits on the same line
fn inline_suite(header: &str) -> Option<&str> {
    let mut depth = 0i32;
    let mut lambdas = 0usize;
    let mut word_start = None;

    for (i, c) in header.char_indices() {
        if c.is_alphanumeric() || c == '_' {
            word_start.get_or_insert(i);
            continue;
        }
        if let Some(start) = word_start.take() {
            if depth <= 0 && &header[start..i] == "lambda" {
                lambdas += 1;
            }
        }
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ':' if depth <= 0 && !header[i + 1..].starts_with('=') => {
                if lambdas > 0 {
                    lambdas -= 1;
                    continue;
                }
                let suite = header[i + 1..].trim();
                return (!suite.is_empty()).then_some(suite);
            }
            _ => {}
        }
    }
    None
}

/// `=` at bracket depth zero that is not a comparison or walrus
fn has_assignment(segment: &str) -> bool {
    let chars: Vec<char> = segment.chars().collect();
    let mut depth = 0i32;

    for i in 0..chars.len() {
        match chars[i] {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            '=' if depth <= 0 => {
                let prev = if i > 0 { chars[i - 1] } else { ' ' };
                let next = chars.get(i + 1).copied().unwrap_or(' ');
                if next == '=' || matches!(prev, '=' | '!' | ':') {
                    continue;
                }
                if prev == '<' || prev == '>' {
                    // `<<=` and `>>=` assign, `<=` and `>=` compare
                    if i > 1 && chars[i - 2] == prev {
                        return true;
                    }
                    continue;
                }
                return true;
            }
            _ => {}
        }
    }

    false
}

/// `:` at bracket depth zero outside a lambda, e.g. an annotation
fn has_bare_colon(segment: &str) -> bool {
    if segment.split(|c: char| !c.is_alphanumeric() && c != '_').any(|w| w == "lambda") {
        return false;
    }
    let mut depth = 0i32;
    let mut chars = segment.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ':' if depth <= 0 && chars.peek() != Some(&'=') => return true,
            _ => {}
        }
    }
    false
}
