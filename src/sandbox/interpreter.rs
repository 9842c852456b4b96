//! Tree-walking evaluator for validated snippets.
//!
//! The interpreter runs on a dedicated worker thread. It cooperates with
//! the executor through [`RunContext`]: every statement, loop iteration and
//! call checks the shared cancel flag and the deadline, so a runaway
//! snippet stops promptly once its time is up. Capability calls are the
//! only point where the worker waits on async I/O; they are driven on the
//! executor's runtime and bounded by the remaining deadline.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::runtime::Handle;

use super::ast::{BinOp, Block, Expr, ExprKind, FnDef, Program, Stmt, StmtKind, UnaryOp};
use super::builtins;
use super::output::OutputCapture;
use super::value::Value;
use crate::capabilities::CapabilityHandle;

/// Longest list or map a snippet may build.
pub const MAX_COLLECTION_LEN: usize = 1_000_000;

/// Largest string a snippet may build, in bytes.
pub const MAX_STRING_BYTES: usize = 16 * 1024 * 1024;

/// Deepest nesting of lists and maps a snippet may build. Dropping,
/// cloning and rendering values recurse once per level.
pub const MAX_VALUE_DEPTH: usize = 128;

/// How many interpreter steps pass between two clock reads.
const CLOCK_CHECK_INTERVAL: u64 = 256;

/// Why a run stopped before completing normally.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Fault {
    /// Error raised by the snippet's own logic, including `fail()`.
    #[error("{message}")]
    Runtime { message: String, line: Option<u32> },

    /// A capability method reported an error.
    #[error("{service}.{method}() failed: {message}")]
    Capability {
        service: String,
        method: String,
        message: String,
        line: Option<u32>,
    },

    /// A resource guard tripped. Not catchable by the snippet.
    #[error("{message}")]
    Limit { message: String, line: Option<u32> },

    /// The deadline passed or the run was cancelled.
    #[error("execution deadline exceeded")]
    Deadline,
}

impl Fault {
    pub fn runtime(message: impl Into<String>) -> Self {
        Fault::Runtime {
            message: message.into(),
            line: None,
        }
    }

    pub fn limit(message: impl Into<String>) -> Self {
        Fault::Limit {
            message: message.into(),
            line: None,
        }
    }

    /// Source line the fault was raised on, if known.
    pub fn line(&self) -> Option<u32> {
        match self {
            Fault::Runtime { line, .. }
            | Fault::Capability { line, .. }
            | Fault::Limit { line, .. } => *line,
            Fault::Deadline => None,
        }
    }

    /// Attaches `at` unless a more precise line is already recorded.
    fn at(mut self, at: u32) -> Self {
        if let Fault::Runtime { line, .. }
        | Fault::Capability { line, .. }
        | Fault::Limit { line, .. } = &mut self
        {
            line.get_or_insert(at);
        }
        self
    }

    /// Whether `try`/`catch` may intercept this fault.
    fn catchable(&self) -> bool {
        matches!(self, Fault::Runtime { .. } | Fault::Capability { .. })
    }

    /// The error object bound by `catch e`.
    fn to_value(&self) -> Value {
        let kind = match self {
            Fault::Capability { .. } => "capability_failure",
            _ => "runtime_failure",
        };
        let mut map = BTreeMap::new();
        map.insert("kind".to_string(), Value::Str(kind.to_string()));
        map.insert("message".to_string(), Value::Str(self.to_string()));
        if let Some(line) = self.line() {
            map.insert("line".to_string(), Value::Int(i64::from(line)));
        }
        Value::Map(map)
    }
}

pub(crate) fn check_collection(len: usize) -> Result<()> {
    if len > MAX_COLLECTION_LEN {
        return Err(Fault::limit(format!(
            "collection exceeds {MAX_COLLECTION_LEN} elements"
        )));
    }
    Ok(())
}

pub(crate) fn check_string(len: usize) -> Result<()> {
    if len > MAX_STRING_BYTES {
        return Err(Fault::limit(format!(
            "string exceeds {MAX_STRING_BYTES} bytes"
        )));
    }
    Ok(())
}

/// Checks a value about to be stored `level` containers below a variable.
pub(crate) fn check_nesting(value: &Value, level: usize) -> Result<()> {
    if value.deeper_than(MAX_VALUE_DEPTH.saturating_sub(level)) {
        return Err(Fault::limit(format!(
            "values nest deeper than {MAX_VALUE_DEPTH} levels"
        )));
    }
    Ok(())
}

/// Everything a run shares with the executor that started it.
pub struct RunContext {
    pub output: Arc<OutputCapture>,
    pub cancel: Arc<AtomicBool>,
    pub deadline: Instant,
    /// Runtime that drives capability calls.
    pub runtime: Handle,
    pub max_call_depth: usize,
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Path segment of an assignable place such as `a.b[0]`.
enum Seg {
    Index(i64),
    Key(String),
}

/// List and map methods that modify their receiver in place.
const MUTATING_METHODS: &[&str] = &["append", "push", "extend", "insert", "pop", "clear"];

pub struct Interpreter<'a> {
    ctx: &'a RunContext,
    globals: HashMap<String, Value>,
    frames: Vec<HashMap<String, Value>>,
    steps: u64,
}

type Result<T> = std::result::Result<T, Fault>;

impl<'a> Interpreter<'a> {
    pub fn new(ctx: &'a RunContext, globals: HashMap<String, Value>) -> Self {
        Self {
            ctx,
            globals,
            frames: Vec::new(),
            steps: 0,
        }
    }

    /// Runs a program to completion. Returns the value of a top-level
    /// `return`, or `None` when the program ran off its end.
    pub fn run(mut self, program: &Program) -> Result<Option<Value>> {
        match self.exec_block(&program.body)? {
            Flow::Normal => Ok(None),
            Flow::Return(value) => Ok(Some(value)),
            Flow::Break | Flow::Continue => Err(Fault::runtime(
                "`break` or `continue` outside of a loop",
            )),
        }
    }

    fn tick(&mut self) -> Result<()> {
        self.steps = self.steps.wrapping_add(1);
        if self.ctx.cancel.load(Ordering::Relaxed) {
            return Err(Fault::Deadline);
        }
        if self.steps % CLOCK_CHECK_INTERVAL == 0 && Instant::now() >= self.ctx.deadline {
            return Err(Fault::Deadline);
        }
        Ok(())
    }

    // ── Scopes ──────────────────────────────────────────

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.frames
            .last()
            .and_then(|frame| frame.get(name))
            .or_else(|| self.globals.get(name))
    }

    fn scope_mut(&mut self) -> &mut HashMap<String, Value> {
        match self.frames.last_mut() {
            Some(frame) => frame,
            None => &mut self.globals,
        }
    }

    fn bind(&mut self, name: &str, value: Value) {
        self.scope_mut().insert(name.to_string(), value);
    }

    // ── Statements ──────────────────────────────────────

    fn exec_block(&mut self, block: &Block) -> Result<Flow> {
        for stmt in block {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow> {
        self.tick()?;
        self.exec_stmt_inner(stmt).map_err(|fault| fault.at(stmt.line))
    }

    fn exec_stmt_inner(&mut self, stmt: &Stmt) -> Result<Flow> {
        match &stmt.kind {
            StmtKind::Let { name, value } => {
                let value = self.eval(value)?;
                self.bind(name, value);
            }
            StmtKind::Assign { target, op, value } => {
                let rhs = self.eval(value)?;
                self.assign(target, *op, rhs)?;
            }
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::If {
                branches,
                otherwise,
            } => {
                for (cond, body) in branches {
                    if self.eval(cond)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                if let Some(body) = otherwise {
                    return self.exec_block(body);
                }
            }
            StmtKind::While { cond, body } => loop {
                self.tick()?;
                if !self.eval(cond)?.truthy() {
                    break;
                }
                match self.exec_block(body)? {
                    Flow::Break => break,
                    Flow::Normal | Flow::Continue => {}
                    flow @ Flow::Return(_) => return Ok(flow),
                }
            },
            StmtKind::For { var, iter, body } => {
                let items = iterate(self.eval(iter)?)?;
                for item in items {
                    self.tick()?;
                    self.bind(var, item);
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Normal | Flow::Continue => {}
                        flow @ Flow::Return(_) => return Ok(flow),
                    }
                }
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Null,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::FnDef(def) => {
                self.bind(&def.name, Value::Function(Arc::clone(def)));
            }
            StmtKind::Try {
                body,
                binding,
                handler,
            } => {
                return match self.exec_block(body) {
                    Err(fault) if fault.catchable() => {
                        if let Some(name) = binding {
                            self.bind(name, fault.to_value());
                        }
                        self.exec_block(handler)
                    }
                    other => other,
                };
            }
            StmtKind::Import { module } => {
                return Err(Fault::runtime(format!("cannot import `{module}`")));
            }
        }
        Ok(Flow::Normal)
    }

    fn assign(&mut self, target: &Expr, op: Option<BinOp>, rhs: Value) -> Result<()> {
        if let ExprKind::Ident(name) = &target.kind {
            let value = match op {
                None => rhs,
                Some(op) => {
                    let current = self.lookup(name).cloned().ok_or_else(|| undefined(name))?;
                    binary(op, current, rhs)?
                }
            };
            self.bind(name, value);
            return Ok(());
        }

        let (root, path) = self.place(target)?;
        let slot = self.slot_mut(&root, &path, op.is_none())?;
        let value = match op {
            None => rhs,
            Some(op) => binary(op, slot.clone(), rhs)?,
        };
        check_nesting(&value, path.len())?;
        *slot = value;
        Ok(())
    }

    /// Splits an assignable expression into its root variable and path.
    fn place(&mut self, expr: &Expr) -> Result<(String, Vec<Seg>)> {
        match &expr.kind {
            ExprKind::Ident(name) => Ok((name.clone(), Vec::new())),
            ExprKind::Index { object, index } => {
                let (root, mut path) = self.place(object)?;
                let seg = match self.eval(index)? {
                    Value::Int(i) => Seg::Index(i),
                    Value::Str(key) => Seg::Key(key),
                    other => {
                        return Err(Fault::runtime(format!(
                            "a {} cannot be used as an index",
                            other.type_name()
                        )))
                    }
                };
                path.push(seg);
                Ok((root, path))
            }
            ExprKind::Field { object, name } => {
                let (root, mut path) = self.place(object)?;
                path.push(Seg::Key(name.clone()));
                Ok((root, path))
            }
            _ => Err(Fault::runtime("cannot assign to this expression")),
        }
    }

    /// Resolves a place to a mutable slot. With `create`, a missing final
    /// map key is inserted.
    fn slot_mut(&mut self, root: &str, path: &[Seg], create: bool) -> Result<&mut Value> {
        let scope = match self.frames.last_mut() {
            Some(frame) if frame.contains_key(root) => frame,
            _ => &mut self.globals,
        };
        let mut slot = scope.get_mut(root).ok_or_else(|| undefined(root))?;
        for (i, seg) in path.iter().enumerate() {
            let last = i + 1 == path.len();
            slot = match (slot, seg) {
                (Value::List(items), Seg::Index(index)) => {
                    let at = list_index(*index, items.len())?;
                    &mut items[at]
                }
                (Value::Map(map), Seg::Key(key)) => {
                    if create && last && !map.contains_key(key) {
                        check_collection(map.len() + 1)?;
                        map.insert(key.clone(), Value::Null);
                    }
                    map.get_mut(key).ok_or_else(|| missing_key(key))?
                }
                (Value::List(_), Seg::Key(_)) => {
                    return Err(Fault::runtime("list indices must be integers"))
                }
                (Value::Map(_), Seg::Index(_)) => {
                    return Err(Fault::runtime("map keys must be strings"))
                }
                (other, _) => {
                    return Err(Fault::runtime(format!(
                        "cannot index into a {}",
                        other.type_name()
                    )))
                }
            };
        }
        Ok(slot)
    }

    // ── Expressions ─────────────────────────────────────

    fn eval(&mut self, expr: &Expr) -> Result<Value> {
        match &expr.kind {
            ExprKind::Null => Ok(Value::Null),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Int(n) => Ok(Value::Int(*n)),
            ExprKind::Float(n) => Ok(Value::Float(*n)),
            ExprKind::Str(s) => Ok(Value::Str(s.clone())),
            ExprKind::List(items) => {
                check_collection(items.len())?;
                let values = items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<Vec<_>>>()?;
                nested(Value::List(values))
            }
            ExprKind::Map(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let value = self.eval(value)?;
                    map.insert(key.clone(), value);
                }
                nested(Value::Map(map))
            }
            ExprKind::Comprehension {
                element,
                var,
                iter,
                cond,
            } => {
                let items = iterate(self.eval(iter)?)?;
                // The loop variable is scoped to the comprehension.
                let shadowed = self.scope_mut().remove(var);
                let result = self.comprehend(element, var, items, cond.as_deref());
                match shadowed {
                    Some(previous) => self.bind(var, previous),
                    None => {
                        self.scope_mut().remove(var);
                    }
                }
                nested(Value::List(result?))
            }
            ExprKind::Ident(name) => self.lookup(name).cloned().ok_or_else(|| undefined(name)),
            ExprKind::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::Neg => match value {
                        Value::Int(n) => n
                            .checked_neg()
                            .map(Value::Int)
                            .ok_or_else(|| Fault::runtime("integer overflow")),
                        Value::Float(n) => Ok(Value::Float(-n)),
                        other => Err(Fault::runtime(format!(
                            "cannot negate a {}",
                            other.type_name()
                        ))),
                    },
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let a = self.eval(lhs)?;
                let b = self.eval(rhs)?;
                binary(*op, a, b)
            }
            ExprKind::Logical { and, lhs, rhs } => {
                let left = self.eval(lhs)?;
                if left.truthy() == *and {
                    self.eval(rhs)
                } else {
                    Ok(left)
                }
            }
            ExprKind::Call { callee, args } => {
                let callee = match &callee.kind {
                    ExprKind::Ident(name) => {
                        self.lookup(name).cloned().ok_or_else(|| undefined(name))?
                    }
                    _ => self.eval(callee)?,
                };
                let args = self.eval_args(args)?;
                self.call_value(callee, args)
            }
            ExprKind::Method {
                receiver,
                name,
                args,
            } => self.call_method(receiver, name, args),
            ExprKind::Field { object, name } => {
                if let ExprKind::Ident(var) = &object.kind {
                    let object = self.lookup(var).ok_or_else(|| undefined(var))?;
                    return field(object, name);
                }
                let object = self.eval(object)?;
                field(&object, name)
            }
            ExprKind::Index { object, index } => {
                if let ExprKind::Ident(var) = &object.kind {
                    let index = self.eval(index)?;
                    let object = self.lookup(var).ok_or_else(|| undefined(var))?;
                    return index_value(object, &index);
                }
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                index_value(&object, &index)
            }
        }
    }

    fn comprehend(
        &mut self,
        element: &Expr,
        var: &str,
        items: Vec<Value>,
        cond: Option<&Expr>,
    ) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        for item in items {
            self.tick()?;
            self.bind(var, item);
            if let Some(cond) = cond {
                if !self.eval(cond)?.truthy() {
                    continue;
                }
            }
            out.push(self.eval(element)?);
            check_collection(out.len())?;
        }
        Ok(out)
    }

    fn eval_args(&mut self, args: &[Expr]) -> Result<Vec<Value>> {
        args.iter().map(|arg| self.eval(arg)).collect()
    }

    // ── Calls ───────────────────────────────────────────

    fn call_value(&mut self, callee: Value, args: Vec<Value>) -> Result<Value> {
        match callee {
            Value::Function(def) => self.call_function(&def, args),
            Value::Builtin(name) => self.call_builtin(name, args),
            Value::Capability(handle) => Err(Fault::runtime(format!(
                "capability `{0}` is not callable; call one of its methods, e.g. {0}.{1}(...)",
                handle.name(),
                handle
                    .descriptor()
                    .methods
                    .first()
                    .map_or("method", |m| m.name.as_str())
            ))),
            other => Err(Fault::runtime(format!(
                "a {} is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_function(&mut self, def: &FnDef, args: Vec<Value>) -> Result<Value> {
        if args.len() != def.params.len() {
            return Err(Fault::runtime(format!(
                "{}() takes {} argument(s), got {}",
                def.name,
                def.params.len(),
                args.len()
            )));
        }
        if self.frames.len() >= self.ctx.max_call_depth {
            return Err(Fault::limit(format!(
                "maximum call depth of {} exceeded",
                self.ctx.max_call_depth
            )));
        }
        self.tick()?;

        self.frames
            .push(def.params.iter().cloned().zip(args).collect());
        let result = self.exec_block(&def.body);
        self.frames.pop();

        match result? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(Value::Null),
            Flow::Break | Flow::Continue => Err(Fault::runtime(
                "`break` or `continue` outside of a loop",
            )),
        }
    }

    fn call_method(&mut self, receiver: &Expr, name: &str, args: &[Expr]) -> Result<Value> {
        let args = self.eval_args(args)?;

        if let ExprKind::Ident(var) = &receiver.kind {
            if let Some(Value::Capability(handle)) = self.lookup(var) {
                let handle = handle.clone();
                return self.call_capability(&handle, name, args);
            }
        }

        if MUTATING_METHODS.contains(&name)
            && matches!(
                receiver.kind,
                ExprKind::Ident(_) | ExprKind::Index { .. } | ExprKind::Field { .. }
            )
        {
            let (root, path) = self.place(receiver)?;
            let slot = self.slot_mut(&root, &path, false)?;
            return mutate(slot, path.len(), name, args);
        }

        match self.eval(receiver)? {
            Value::Capability(handle) => self.call_capability(&handle, name, args),
            mut value if MUTATING_METHODS.contains(&name) => mutate(&mut value, 0, name, args),
            value if builtins::is_method(name) => {
                let mut all = Vec::with_capacity(args.len() + 1);
                all.push(value);
                all.extend(args);
                self.call_builtin(name, all)
            }
            value => Err(Fault::runtime(format!(
                "a {} has no method `{name}`",
                value.type_name()
            ))),
        }
    }

    /// Builtins such as `enumerate` and `from_json` build new containers.
    fn call_builtin(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        nested(builtins::call(name, args, &self.ctx.output)?)
    }

    /// Runs one capability method on the executor's runtime, bounded by
    /// what is left of the deadline.
    fn call_capability(
        &mut self,
        handle: &CapabilityHandle,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.tick()?;
        let args = args
            .iter()
            .map(Value::to_json)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                Fault::runtime(format!(
                    "cannot pass argument to {}.{method}(): {e}",
                    handle.name()
                ))
            })?;
        let params = handle.bind_params(method, args).map_err(Fault::runtime)?;

        let remaining = self.ctx.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Fault::Deadline);
        }

        let mut task = {
            let handle = handle.clone();
            let method = method.to_string();
            self.ctx
                .runtime
                .spawn(async move { handle.call(&method, params).await })
        };
        let outcome = self
            .ctx
            .runtime
            .block_on(async { tokio::time::timeout(remaining, &mut task).await });

        let failure = |message: String| Fault::Capability {
            service: handle.name().to_string(),
            method: method.to_string(),
            message,
            line: None,
        };
        match outcome {
            Err(_elapsed) => {
                task.abort();
                Err(Fault::Deadline)
            }
            Ok(Err(join_error)) if join_error.is_panic() => {
                Err(failure("capability panicked".to_string()))
            }
            Ok(Err(_)) => Err(failure("capability call was cancelled".to_string())),
            Ok(Ok(Err(e))) => Err(failure(e.to_string())),
            Ok(Ok(Ok(json))) => nested(Value::from_json(json)),
        }
    }
}

// ── Value operations ─────────────────────────────────────

/// Passes a freshly built value through the nesting guard.
fn nested(value: Value) -> Result<Value> {
    check_nesting(&value, 0)?;
    Ok(value)
}

fn undefined(name: &str) -> Fault {
    Fault::runtime(format!("name `{name}` is not defined"))
}

fn missing_key(key: &str) -> Fault {
    Fault::runtime(format!("key {key:?} not found"))
}

fn iterate(value: Value) -> Result<Vec<Value>> {
    match value {
        Value::List(items) => Ok(items),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        Value::Map(map) => Ok(map.into_keys().map(Value::Str).collect()),
        other => Err(Fault::runtime(format!(
            "a {} is not iterable",
            other.type_name()
        ))),
    }
}

/// Maps a possibly negative index onto `0..len`.
fn list_index(index: i64, len: usize) -> Result<usize> {
    let resolved = if index < 0 {
        len.checked_sub(index.unsigned_abs() as usize)
    } else {
        Some(index as usize).filter(|i| *i < len)
    };
    resolved.ok_or_else(|| {
        Fault::runtime(format!("index {index} out of range (length {len})"))
    })
}

fn index_value(object: &Value, index: &Value) -> Result<Value> {
    match (object, index) {
        (Value::List(items), Value::Int(i)) => Ok(items[list_index(*i, items.len())?].clone()),
        (Value::Str(s), Value::Int(i)) => {
            let len = s.chars().count();
            let at = list_index(*i, len)?;
            Ok(Value::Str(s.chars().nth(at).map(String::from).unwrap_or_default()))
        }
        (Value::Map(map), Value::Str(key)) => map.get(key).cloned().ok_or_else(|| missing_key(key)),
        (Value::Map(_), other) => Err(Fault::runtime(format!(
            "map keys must be strings, got {}",
            other.type_name()
        ))),
        (Value::List(_) | Value::Str(_), other) => Err(Fault::runtime(format!(
            "indices must be integers, got {}",
            other.type_name()
        ))),
        (other, _) => Err(Fault::runtime(format!(
            "a {} cannot be indexed",
            other.type_name()
        ))),
    }
}

fn field(object: &Value, name: &str) -> Result<Value> {
    match object {
        Value::Map(map) => map.get(name).cloned().ok_or_else(|| missing_key(name)),
        Value::Capability(handle) => Err(Fault::runtime(format!(
            "`{0}.{name}` is a method; call it as {0}.{name}(...)",
            handle.name()
        ))),
        other => Err(Fault::runtime(format!(
            "a {} has no field `{name}`",
            other.type_name()
        ))),
    }
}

/// Applies an in-place list or map method. `level` is how many containers
/// `target` sits below its variable.
fn mutate(target: &mut Value, level: usize, method: &str, args: Vec<Value>) -> Result<Value> {
    let arg_count = args.len();
    let wrong_args = || Fault::runtime(format!("{method}() got {arg_count} argument(s)"));
    let mut args = args.into_iter();

    match target {
        Value::List(items) => match method {
            "append" | "push" => {
                let value = args.next().ok_or_else(wrong_args)?;
                check_collection(items.len() + 1)?;
                check_nesting(&value, level + 1)?;
                items.push(value);
                Ok(Value::Null)
            }
            "extend" => match args.next() {
                Some(Value::List(more)) => {
                    check_collection(items.len() + more.len())?;
                    for item in &more {
                        check_nesting(item, level + 1)?;
                    }
                    items.extend(more);
                    Ok(Value::Null)
                }
                _ => Err(Fault::runtime("extend() expects a list")),
            },
            "insert" => match (args.next(), args.next()) {
                (Some(Value::Int(at)), Some(value)) => {
                    check_collection(items.len() + 1)?;
                    check_nesting(&value, level + 1)?;
                    let len = items.len() as i64;
                    let at = if at < 0 { (len + at).max(0) } else { at.min(len) };
                    items.insert(at as usize, value);
                    Ok(Value::Null)
                }
                _ => Err(Fault::runtime("insert() expects an index and a value")),
            },
            "pop" => {
                let at = match args.next() {
                    None => items.len().checked_sub(1).ok_or_else(|| {
                        Fault::runtime("pop() from an empty list")
                    })?,
                    Some(Value::Int(i)) => list_index(i, items.len())?,
                    Some(_) => return Err(Fault::runtime("pop() index must be an int")),
                };
                Ok(items.remove(at))
            }
            "clear" => {
                items.clear();
                Ok(Value::Null)
            }
            _ => Err(Fault::runtime(format!("a list has no method `{method}`"))),
        },
        Value::Map(map) => match method {
            "pop" => match args.next() {
                Some(Value::Str(key)) => match map.remove(&key) {
                    Some(value) => Ok(value),
                    None => args.next().ok_or_else(|| missing_key(&key)),
                },
                _ => Err(Fault::runtime("pop() expects a string key")),
            },
            "clear" => {
                map.clear();
                Ok(Value::Null)
            }
            _ => Err(Fault::runtime(format!("a map has no method `{method}`"))),
        },
        other => Err(Fault::runtime(format!(
            "a {} has no method `{method}`",
            other.type_name()
        ))),
    }
}

fn type_mismatch(op: BinOp, a: &Value, b: &Value) -> Fault {
    Fault::runtime(format!(
        "unsupported operand types for {}: {} and {}",
        op.symbol(),
        a.type_name(),
        b.type_name()
    ))
}

fn overflow() -> Fault {
    Fault::runtime("integer overflow")
}

fn repeat<T: Clone>(items: &[T], times: i64, len_check: fn(usize) -> Result<()>) -> Result<Vec<T>> {
    if items.is_empty() || times <= 0 {
        return Ok(Vec::new());
    }
    let times = usize::try_from(times).unwrap_or(usize::MAX);
    len_check(items.len().saturating_mul(times))?;
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend_from_slice(items);
    }
    Ok(out)
}

fn binary(op: BinOp, a: Value, b: Value) -> Result<Value> {
    use Value::{Float, Int, List, Str};

    match op {
        BinOp::Eq => return Ok(Value::Bool(a == b)),
        BinOp::Ne => return Ok(Value::Bool(a != b)),
        BinOp::In => return builtins::contains(&b, &a).map(Value::Bool),
        BinOp::NotIn => return builtins::contains(&b, &a).map(|found| Value::Bool(!found)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = a.compare(&b).ok_or_else(|| {
                Fault::runtime(format!(
                    "cannot compare {} and {}",
                    a.type_name(),
                    b.type_name()
                ))
            })?;
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    match (op, a, b) {
        (BinOp::Add, Int(x), Int(y)) => x.checked_add(y).map(Int).ok_or_else(overflow),
        (BinOp::Sub, Int(x), Int(y)) => x.checked_sub(y).map(Int).ok_or_else(overflow),
        (BinOp::Mul, Int(x), Int(y)) => x.checked_mul(y).map(Int).ok_or_else(overflow),
        (BinOp::Mod, Int(x), Int(y)) => {
            if y == 0 {
                return Err(Fault::runtime("modulo by zero"));
            }
            let r = x.checked_rem(y).ok_or_else(overflow)?;
            // Result takes the sign of the divisor.
            Ok(Int(if r != 0 && (r < 0) != (y < 0) { r + y } else { r }))
        }
        (BinOp::Pow, Int(x), Int(y)) if y >= 0 => u32::try_from(y)
            .ok()
            .and_then(|y| x.checked_pow(y))
            .map(Int)
            .ok_or_else(overflow),

        (BinOp::Add, Str(x), Str(y)) => {
            check_string(x.len() + y.len())?;
            Ok(Str(x + &y))
        }
        (BinOp::Add, List(mut x), List(y)) => {
            check_collection(x.len() + y.len())?;
            x.extend(y);
            Ok(List(x))
        }
        (BinOp::Mul, Str(s), Int(n)) | (BinOp::Mul, Int(n), Str(s)) => {
            let bytes = repeat(s.as_bytes(), n, check_string)?;
            Ok(Str(String::from_utf8(bytes).unwrap_or_default()))
        }
        (BinOp::Mul, List(items), Int(n)) | (BinOp::Mul, Int(n), List(items)) => {
            Ok(List(repeat(&items, n, check_collection)?))
        }

        (op, a, b) => {
            let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
                return Err(type_mismatch(op, &a, &b));
            };
            let result = match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                BinOp::Div => {
                    if y == 0.0 {
                        return Err(Fault::runtime("division by zero"));
                    }
                    x / y
                }
                BinOp::Mod => {
                    if y == 0.0 {
                        return Err(Fault::runtime("modulo by zero"));
                    }
                    x - y * (x / y).floor()
                }
                BinOp::Pow => x.powf(y),
                _ => return Err(type_mismatch(op, &a, &b)),
            };
            Ok(Float(result))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::MockProvider;
    use crate::sandbox::parser::parse;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        runtime: tokio::runtime::Runtime,
        output: Arc<OutputCapture>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                runtime: tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .enable_all()
                    .build()
                    .unwrap(),
                output: Arc::new(OutputCapture::new(64 * 1024)),
            }
        }

        fn context(&self, timeout: Duration) -> RunContext {
            RunContext {
                output: self.output.clone(),
                cancel: Arc::new(AtomicBool::new(false)),
                deadline: Instant::now() + timeout,
                runtime: self.runtime.handle().clone(),
                max_call_depth: 64,
            }
        }

        fn run_with(&self, code: &str, globals: HashMap<String, Value>) -> Result<Option<Value>> {
            let program = parse(code).unwrap();
            let ctx = self.context(Duration::from_secs(5));
            Interpreter::new(&ctx, globals).run(&program)
        }

        fn run(&self, code: &str) -> Result<Option<Value>> {
            self.run_with(code, builtin_globals())
        }

        fn stdout(&self) -> String {
            self.output.stdout().text
        }
    }

    fn builtin_globals() -> HashMap<String, Value> {
        builtins::BUILTINS
            .iter()
            .map(|&name| (name.to_string(), Value::Builtin(name)))
            .collect()
    }

    fn returns(code: &str) -> Value {
        Harness::new().run(code).unwrap().unwrap()
    }

    fn fails(code: &str) -> Fault {
        Harness::new().run(code).unwrap_err()
    }

    // ── Core language ───────────────────────────────────

    #[test]
    fn test_print_and_return() {
        let h = Harness::new();
        let result = h.run("print('hi')\nreturn 41 + 1").unwrap();
        assert_eq!(result, Some(Value::Int(42)));
        assert_eq!(h.stdout(), "hi\n");
    }

    #[test]
    fn test_no_return_yields_none() {
        assert_eq!(Harness::new().run("let x = 1").unwrap(), None);
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(returns("return 7 / 2"), Value::Float(3.5));
        assert_eq!(returns("return -7 % 3"), Value::Int(2));
        assert_eq!(returns("return 2 ** 10"), Value::Int(1024));
        assert_eq!(returns("return 2 ** -1"), Value::Float(0.5));
        assert_eq!(returns("return 'ab' * 3"), Value::Str("ababab".into()));
        assert_eq!(returns("return [0] * 3"), Value::from_json(json!([0, 0, 0])));
        assert_eq!(returns("return 1 + 2.5"), Value::Float(3.5));
    }

    #[test]
    fn test_arithmetic_errors() {
        assert!(fails("return 1 / 0").to_string().contains("division by zero"));
        assert!(fails("return 9223372036854775807 + 1").to_string().contains("overflow"));
        assert!(fails("return 'a' + 1").to_string().contains("string and int"));
    }

    #[test]
    fn test_logical_short_circuit() {
        assert_eq!(returns("return null or 'default'"), Value::Str("default".into()));
        assert_eq!(returns("return 0 and undefined_name"), Value::Int(0));
        assert_eq!(returns("return not []"), Value::Bool(true));
    }

    #[test]
    fn test_control_flow() {
        let code = "
            let total = 0
            for i in range(10) {
                if i % 2 == 0 { continue }
                if i > 7 { break }
                total += i
            }
            let n = 0
            while true {
                n += 1
                if n == 3 { break }
            }
            return [total, n]";
        assert_eq!(returns(code), Value::from_json(json!([16, 3])));
    }

    #[test]
    fn test_functions_and_recursion() {
        let code = "
            fn fib(n) {
                if n < 2 { return n }
                return fib(n - 1) + fib(n - 2)
            }
            return fib(15)";
        assert_eq!(returns(code), Value::Int(610));
    }

    #[test]
    fn test_function_locals_do_not_leak() {
        let code = "
            let x = 'global'
            fn f() { x = 'local'; return x }
            return [f(), x]";
        assert_eq!(returns(code), Value::from_json(json!(["local", "global"])));
    }

    #[test]
    fn test_function_arity() {
        let err = fails("fn f(a) { return a }\nreturn f(1, 2)");
        assert!(err.to_string().contains("f() takes 1 argument(s), got 2"));
        assert_eq!(err.line(), Some(2));
    }

    #[test]
    fn test_call_depth_limit_is_not_catchable() {
        let code = "
            fn down(n) { return down(n + 1) }
            try { down(0) } catch e { return 'caught' }";
        let err = fails(code);
        assert!(matches!(err, Fault::Limit { .. }), "{err:?}");
    }

    #[test]
    fn test_collections_and_mutation() {
        let code = "
            let xs = [3, 1, 2]
            xs.append(4)
            xs[0] = 10
            let m = {name: 'a', tags: []}
            m.tags.push('x')
            m['count'] = len(xs)
            m.count += 1
            let last = xs.pop()
            return {xs: xs, m: m, last: last, neg: xs[-1]}";
        assert_eq!(
            returns(code),
            Value::from_json(json!({
                "xs": [10, 1, 2],
                "m": {"name": "a", "tags": ["x"], "count": 5},
                "last": 4,
                "neg": 2
            }))
        );
    }

    #[test]
    fn test_builtin_method_form() {
        assert_eq!(returns("return 'a,b'.split(',').join('-').upper()"), Value::Str("A-B".into()));
        assert_eq!(returns("let m = {a: 1}\nreturn m.keys()"), Value::from_json(json!(["a"])));
    }

    #[test]
    fn test_comprehension_scoping() {
        let code = "
            let x = 'kept'
            let squares = [x * x for x in range(5) if x % 2 == 0]
            return [squares, x]";
        assert_eq!(returns(code), Value::from_json(json!([[0, 4, 16], "kept"])));
    }

    #[test]
    fn test_membership() {
        assert_eq!(returns("return 2 in [1, 2]"), Value::Bool(true));
        assert_eq!(returns("return 'k' not in {k: 1}"), Value::Bool(false));
        assert_eq!(returns("return 'ell' in 'hello'"), Value::Bool(true));
    }

    #[test]
    fn test_index_errors() {
        assert!(fails("return [1][5]").to_string().contains("out of range"));
        assert!(fails("let m = {}\nreturn m.missing").to_string().contains("\"missing\" not found"));
        assert!(fails("return undefined_thing").to_string().contains("not defined"));
    }

    #[test]
    fn test_runtime_error_carries_line() {
        let err = fails("let a = 1\nlet b = 2\nfail('bad input')");
        assert_eq!(err, Fault::Runtime {
            message: "bad input".into(),
            line: Some(3)
        });
    }

    #[test]
    fn test_error_inside_function_reports_innermost_line() {
        let err = fails("fn f() {\n  return 1 / 0\n}\nf()");
        assert_eq!(err.line(), Some(2));
    }

    #[test]
    fn test_try_catch() {
        let code = "
            try {
                fail('oops')
            } catch e {
                return [e.kind, e.message, e.line]
            }";
        assert_eq!(returns(code), Value::from_json(json!(["runtime_failure", "oops", 3])));
    }

    #[test]
    fn test_try_without_error_skips_handler() {
        assert_eq!(returns("try { let x = 1 } catch { return 'no' }\nreturn 'yes'"), Value::Str("yes".into()));
    }

    #[test]
    fn test_break_outside_loop() {
        assert!(fails("break").to_string().contains("outside of a loop"));
    }

    #[test]
    fn test_string_limit() {
        let err = fails("let s = 'x' * 20000000");
        assert!(matches!(err, Fault::Limit { .. }));
    }

    #[test]
    fn test_collection_limit() {
        let err = fails("let xs = [1]\nwhile true { xs = xs + xs }");
        assert!(matches!(err, Fault::Limit { .. }), "{err:?}");
    }

    fn assert_nesting_limit(code: &str) {
        let err = fails(code);
        assert!(
            matches!(&err, Fault::Limit { message, .. } if message.contains("nest deeper")),
            "{code}: {err:?}"
        );
    }

    #[test]
    fn test_value_nesting_limit() {
        // `pop` moves without copying, so each step wraps in constant time.
        assert_nesting_limit(
            "let s = [[]]\nfor i in range(1000000) { s.append([s.pop()]) }",
        );
        assert_nesting_limit("let x = []\nwhile true { x = [x] }");
        assert_nesting_limit("let x = {}\nwhile true { x = {\"k\": x} }");
        assert_nesting_limit("let x = [1]\nwhile true { x = [v for v in [x]] }");
        assert_nesting_limit("let x = [1]\nwhile true { x = enumerate(x) }");
    }

    #[test]
    fn test_value_nesting_limit_on_stores_below_a_variable() {
        assert_nesting_limit("let m = {}\nwhile true { m.k = m }");
        assert_nesting_limit("let s = [[]]\nwhile true { s[0] = s }");
        assert_nesting_limit(
            "let s = [[]]\nwhile true { let inner = s[0]\ns[0] = []\ns[0].insert(0, inner) }",
        );
        assert_nesting_limit(
            "let s = [[]]\nwhile true { let inner = [s[0]]\ns[0] = []\ns[0].extend(inner) }",
        );
    }

    #[test]
    fn test_value_nesting_limit_is_not_catchable() {
        assert_nesting_limit("try { let x = []\nwhile true { x = [x] } } catch e { return 1 }");
    }

    #[test]
    fn test_nesting_within_limit() {
        let depth = returns(&format!(
            "let x = 1\nfor i in range({}) {{ x = [x] }}\nlet n = 0\nwhile type(x) == \"list\" {{ x = x[0]\nn += 1 }}\nreturn n",
            MAX_VALUE_DEPTH
        ));
        assert_eq!(depth, Value::Int(MAX_VALUE_DEPTH as i64));
    }

    // ── Deadline and cancellation ───────────────────────

    #[test]
    fn test_deadline_stops_infinite_loop() {
        let h = Harness::new();
        let program = parse("while true {}").unwrap();
        let ctx = h.context(Duration::from_millis(50));
        let started = Instant::now();
        let result = Interpreter::new(&ctx, HashMap::new()).run(&program);
        assert_eq!(result, Err(Fault::Deadline));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_cancel_flag_stops_run() {
        let h = Harness::new();
        let program = parse("let i = 0\nwhile true { i += 1 }").unwrap();
        let ctx = h.context(Duration::from_secs(60));
        ctx.cancel.store(true, Ordering::SeqCst);
        let result = Interpreter::new(&ctx, HashMap::new()).run(&program);
        assert_eq!(result, Err(Fault::Deadline));
    }

    #[test]
    fn test_deadline_is_not_catchable() {
        let h = Harness::new();
        let program = parse("try { while true {} } catch e { return 'caught' }").unwrap();
        let ctx = h.context(Duration::from_millis(20));
        let result = Interpreter::new(&ctx, HashMap::new()).run(&program);
        assert_eq!(result, Err(Fault::Deadline));
    }

    // ── Capabilities ────────────────────────────────────

    fn with_capability(provider: MockProvider) -> HashMap<String, Value> {
        let mut globals = builtin_globals();
        let handle = CapabilityHandle::new(Arc::new(provider));
        globals.insert(handle.name().to_string(), Value::Capability(handle));
        globals
    }

    #[test]
    fn test_capability_call() {
        let h = Harness::new();
        let result = h
            .run_with("return svc.add(2, 3) + svc.echo({value: 1})", with_capability(MockProvider::new("svc")))
            .unwrap();
        assert_eq!(result, Some(Value::Int(6)));
    }

    #[test]
    fn test_capability_result_is_data() {
        let h = Harness::new();
        let result = h
            .run_with("let xs = svc.list(2)\nreturn len(xs)", with_capability(MockProvider::new("svc")))
            .unwrap();
        assert_eq!(result, Some(Value::Int(2)));
    }

    #[test]
    fn test_capability_failure() {
        let h = Harness::new();
        let err = h
            .run_with("\nsvc.echo(1)", with_capability(MockProvider::failing("svc", "connection refused")))
            .unwrap_err();
        assert_eq!(
            err,
            Fault::Capability {
                service: "svc".into(),
                method: "echo".into(),
                message: "network error: connection refused".into(),
                line: Some(2),
            }
        );
    }

    #[test]
    fn test_capability_failure_is_catchable() {
        let h = Harness::new();
        let result = h
            .run_with(
                "try { svc.echo(1) } catch e { return e.kind }",
                with_capability(MockProvider::failing("svc", "down")),
            )
            .unwrap();
        assert_eq!(result, Some(Value::Str("capability_failure".into())));
    }

    #[test]
    fn test_capability_bad_arguments_are_runtime_errors() {
        let provider = MockProvider::new("svc");
        let calls = provider.calls.clone();
        let h = Harness::new();
        let err = h.run_with("svc.add(1)", with_capability(provider)).unwrap_err();
        assert!(matches!(err, Fault::Runtime { .. }));
        assert!(err.to_string().contains("missing required parameter `b`"));

        let err = h
            .run_with("svc.drop_tables()", with_capability(MockProvider::new("svc")))
            .unwrap_err();
        assert!(err.to_string().contains("no method `drop_tables`"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_capability_call_bounded_by_deadline() {
        let h = Harness::new();
        let program = parse("svc.echo(1)").unwrap();
        let ctx = h.context(Duration::from_millis(100));
        let globals = with_capability(MockProvider::slow("svc", Duration::from_secs(30)));
        let started = Instant::now();
        let result = Interpreter::new(&ctx, globals).run(&program);
        assert_eq!(result, Err(Fault::Deadline));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_capability_is_not_callable_directly() {
        let h = Harness::new();
        let err = h.run_with("svc()", with_capability(MockProvider::new("svc"))).unwrap_err();
        assert!(err.to_string().contains("svc.echo(...)"));
    }
}
