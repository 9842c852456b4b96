//! Static screening of snippets before they run.
//!
//! Validation is a pure function of the source text. It runs in two
//! passes: a token scan that works even on code that does not parse, and
//! a structural pass over the syntax tree for constructs that only show
//! up once the code is parsed. Every finding is reported, not just the
//! first one.

use serde::Serialize;

use super::ast::{Block, Expr, ExprKind, Program, StmtKind};
use super::lexer::{tokenize, SyntaxError, Tok};
use super::parser;

/// Categories of constructs a snippet may not use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeniedConstruct {
    DynamicCode,
    FileSystem,
    ProcessControl,
    ModuleImport,
    ReflectiveAccess,
}

impl DeniedConstruct {
    pub fn as_str(self) -> &'static str {
        match self {
            DeniedConstruct::DynamicCode => "dynamic_code",
            DeniedConstruct::FileSystem => "file_system",
            DeniedConstruct::ProcessControl => "process_control",
            DeniedConstruct::ModuleImport => "module_import",
            DeniedConstruct::ReflectiveAccess => "reflective_access",
        }
    }
}

/// Names that may never be referenced, with the category they fall in.
/// Identifiers starting with `__` are always [`DeniedConstruct::ReflectiveAccess`].
pub const POLICY: &[(&str, DeniedConstruct)] = &[
    ("eval", DeniedConstruct::DynamicCode),
    ("exec", DeniedConstruct::DynamicCode),
    ("execfile", DeniedConstruct::DynamicCode),
    ("compile", DeniedConstruct::DynamicCode),
    ("open", DeniedConstruct::FileSystem),
    ("read_file", DeniedConstruct::FileSystem),
    ("write_file", DeniedConstruct::FileSystem),
    ("remove", DeniedConstruct::FileSystem),
    ("unlink", DeniedConstruct::FileSystem),
    ("rmdir", DeniedConstruct::FileSystem),
    ("mkdir", DeniedConstruct::FileSystem),
    ("listdir", DeniedConstruct::FileSystem),
    ("chdir", DeniedConstruct::FileSystem),
    ("system", DeniedConstruct::ProcessControl),
    ("popen", DeniedConstruct::ProcessControl),
    ("spawn", DeniedConstruct::ProcessControl),
    ("fork", DeniedConstruct::ProcessControl),
    ("kill", DeniedConstruct::ProcessControl),
    ("exit", DeniedConstruct::ProcessControl),
    ("quit", DeniedConstruct::ProcessControl),
    ("subprocess", DeniedConstruct::ProcessControl),
    ("os", DeniedConstruct::ProcessControl),
    ("sys", DeniedConstruct::ProcessControl),
    ("require", DeniedConstruct::ModuleImport),
    ("importlib", DeniedConstruct::ModuleImport),
    ("getattr", DeniedConstruct::ReflectiveAccess),
    ("setattr", DeniedConstruct::ReflectiveAccess),
    ("delattr", DeniedConstruct::ReflectiveAccess),
    ("globals", DeniedConstruct::ReflectiveAccess),
    ("locals", DeniedConstruct::ReflectiveAccess),
    ("vars", DeniedConstruct::ReflectiveAccess),
    ("breakpoint", DeniedConstruct::ReflectiveAccess),
];

/// One forbidden construct found in a snippet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub construct: DeniedConstruct,
    pub name: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl Violation {
    fn new(construct: DeniedConstruct, name: &str, line: u32, column: u32) -> Self {
        let message = match construct {
            DeniedConstruct::ModuleImport if name == "import" || name == "from" => {
                "module imports are not allowed".to_string()
            }
            _ => format!("use of `{name}` is not allowed ({})", construct.as_str()),
        };
        Self {
            construct,
            name: name.to_string(),
            line,
            column,
            message,
        }
    }
}

/// Why a snippet was refused before execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    Violations(Vec<Violation>),
    /// Clean with respect to the policy, but not valid code.
    Syntax(SyntaxError),
}

/// Policy category of a plain identifier, if it is denied.
pub fn check_name(name: &str) -> Option<DeniedConstruct> {
    if name.starts_with("__") {
        return Some(DeniedConstruct::ReflectiveAccess);
    }
    POLICY
        .iter()
        .find(|(denied, _)| *denied == name)
        .map(|(_, construct)| *construct)
}

/// Attribute names (after a `.`) are only checked for dunder access.
fn check_attribute(name: &str) -> Option<DeniedConstruct> {
    name.starts_with("__")
        .then_some(DeniedConstruct::ReflectiveAccess)
}

/// Lists every policy violation in `code`. An empty list means the code may
/// run as far as the policy is concerned.
pub fn validate(code: &str) -> Vec<Violation> {
    let mut violations = scan_tokens(code);
    if let Ok(program) = parser::parse(code) {
        check_block(&program.body, &mut violations);
    }
    violations.sort_by_key(|v| (v.line, v.column));
    violations
}

/// Validates and parses in one step, yielding the program to execute.
pub fn check(code: &str) -> Result<Program, Rejection> {
    let violations = validate(code);
    if !violations.is_empty() {
        return Err(Rejection::Violations(violations));
    }
    parser::parse(code).map_err(Rejection::Syntax)
}

// ── Token pass ───────────────────────────────────────────

fn scan_tokens(code: &str) -> Vec<Violation> {
    let tokens = match tokenize(code) {
        Ok(tokens) => tokens,
        // Unlexable input still gets a word-level scan.
        Err(_) => return scan_words(code),
    };

    let mut violations = Vec::new();
    let mut after_dot = false;
    for token in &tokens {
        match &token.tok {
            Tok::Ident(name) => {
                let denied = if after_dot {
                    check_attribute(name)
                } else {
                    check_name(name)
                };
                if let Some(construct) = denied {
                    violations.push(Violation::new(construct, name, token.line, token.column));
                }
            }
            Tok::Import => violations.push(Violation::new(
                DeniedConstruct::ModuleImport,
                "import",
                token.line,
                token.column,
            )),
            _ => {}
        }
        after_dot = token.tok == Tok::Dot;
    }
    violations
}

/// Fallback for text the lexer rejects: checks every identifier-shaped
/// word outside of obvious string quotes.
fn scan_words(code: &str) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (index, line) in code.lines().enumerate() {
        let mut word = String::new();
        let mut start = 0;
        let mut quote: Option<char> = None;
        let mut prev = ' ';
        for (column, c) in line.chars().chain(std::iter::once(' ')).enumerate() {
            if let Some(q) = quote {
                if c == q {
                    quote = None;
                }
                continue;
            }
            if c.is_ascii_alphanumeric() || c == '_' {
                if word.is_empty() {
                    start = column;
                }
                word.push(c);
                continue;
            }
            if !word.is_empty() {
                let denied = if word == "import" {
                    Some(DeniedConstruct::ModuleImport)
                } else if prev == '.' {
                    check_attribute(&word)
                } else {
                    check_name(&word)
                };
                if let Some(construct) = denied {
                    violations.push(Violation::new(
                        construct,
                        &word,
                        index as u32 + 1,
                        start as u32 + 1,
                    ));
                }
                word.clear();
            }
            if c == '"' || c == '\'' {
                quote = Some(c);
            }
            if c == '#' {
                break;
            }
            prev = if c.is_whitespace() { prev } else { c };
        }
    }
    violations
}

// ── Structural pass ──────────────────────────────────────

fn check_block(block: &Block, out: &mut Vec<Violation>) {
    for stmt in block {
        match &stmt.kind {
            StmtKind::Let { value, .. } | StmtKind::Expr(value) => check_expr(value, out),
            StmtKind::Assign { target, value, .. } => {
                check_expr(target, out);
                check_expr(value, out);
            }
            StmtKind::If {
                branches,
                otherwise,
            } => {
                for (cond, body) in branches {
                    check_expr(cond, out);
                    check_block(body, out);
                }
                if let Some(body) = otherwise {
                    check_block(body, out);
                }
            }
            StmtKind::While { cond, body } => {
                check_expr(cond, out);
                check_block(body, out);
            }
            StmtKind::For { iter, body, .. } => {
                check_expr(iter, out);
                check_block(body, out);
            }
            StmtKind::Return(Some(value)) => check_expr(value, out),
            StmtKind::FnDef(def) => check_block(&def.body, out),
            StmtKind::Try { body, handler, .. } => {
                check_block(body, out);
                check_block(handler, out);
            }
            StmtKind::Return(None)
            | StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Import { .. } => {}
        }
    }
}

fn check_expr(expr: &Expr, out: &mut Vec<Violation>) {
    match &expr.kind {
        ExprKind::Index { object, index } => {
            // `obj["__class__"]` is the same reflective access as `obj.__class__`.
            if let ExprKind::Str(key) = &index.kind {
                if let Some(construct) = check_attribute(key) {
                    out.push(Violation::new(construct, key, index.line, index.column));
                }
            }
            check_expr(object, out);
            check_expr(index, out);
        }
        ExprKind::List(items) => items.iter().for_each(|e| check_expr(e, out)),
        ExprKind::Map(entries) => entries.iter().for_each(|(_, e)| check_expr(e, out)),
        ExprKind::Comprehension {
            element,
            iter,
            cond,
            ..
        } => {
            check_expr(element, out);
            check_expr(iter, out);
            if let Some(cond) = cond {
                check_expr(cond, out);
            }
        }
        ExprKind::Unary { operand, .. } => check_expr(operand, out),
        ExprKind::Binary { lhs, rhs, .. } | ExprKind::Logical { lhs, rhs, .. } => {
            check_expr(lhs, out);
            check_expr(rhs, out);
        }
        ExprKind::Call { callee, args } => {
            check_expr(callee, out);
            args.iter().for_each(|e| check_expr(e, out));
        }
        ExprKind::Method { receiver, args, .. } => {
            check_expr(receiver, out);
            args.iter().for_each(|e| check_expr(e, out));
        }
        ExprKind::Field { object, .. } => check_expr(object, out),
        ExprKind::Null
        | ExprKind::Bool(_)
        | ExprKind::Int(_)
        | ExprKind::Float(_)
        | ExprKind::Str(_)
        | ExprKind::Ident(_) => {}
    }
}
