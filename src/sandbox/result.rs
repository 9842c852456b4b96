//! Structured report of one execution.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value as Json;

use super::interpreter::Fault;
use super::lexer::SyntaxError;
use super::namespace::NamespaceError;
use super::output::{OutputCapture, StreamSnapshot};
use super::validator::Violation;
use super::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    SecurityViolation,
    Timeout,
    RuntimeFailure,
    CapabilityFailure,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::SecurityViolation => "security_violation",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::RuntimeFailure => "runtime_failure",
            ExecutionStatus::CapabilityFailure => "capability_failure",
        }
    }
}

/// Finer-grained cause behind a non-success status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PolicyViolation,
    SyntaxError,
    RuntimeError,
    ResourceLimit,
    CapabilityError,
    UnknownCapability,
    InvalidVariable,
    Timeout,
    InternalError,
}

impl ErrorKind {
    pub fn status(self) -> ExecutionStatus {
        match self {
            ErrorKind::PolicyViolation => ExecutionStatus::SecurityViolation,
            ErrorKind::Timeout => ExecutionStatus::Timeout,
            ErrorKind::CapabilityError | ErrorKind::UnknownCapability => {
                ExecutionStatus::CapabilityFailure
            }
            ErrorKind::SyntaxError
            | ErrorKind::RuntimeError
            | ErrorKind::ResourceLimit
            | ErrorKind::InvalidVariable
            | ErrorKind::InternalError => ExecutionStatus::RuntimeFailure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

impl ExecutionError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
            violations: Vec::new(),
        }
    }

    fn at(mut self, line: Option<u32>) -> Self {
        self.line = line;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub id: String,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    /// Either stream lost bytes to the cap.
    pub truncated: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Bytes the snippet attempted to write, kept or not.
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub elapsed_ms: u64,
    /// RFC 3339 timestamp of when the request was accepted.
    pub started_at: String,
    pub return_value: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// How a run ended, before packaging.
#[derive(Debug)]
pub enum RawOutcome {
    /// The validator refused the code; nothing ran.
    Rejected(Vec<Violation>),
    Syntax(SyntaxError),
    /// The namespace could not be built; nothing ran.
    Setup(NamespaceError),
    Completed(Option<Value>),
    Faulted(Fault),
    TimedOut,
    /// The worker panicked or vanished.
    Crashed(String),
}

/// Identity and timing of one execution.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub id: String,
    pub started_at: String,
    pub elapsed: Duration,
}

pub fn package(info: RunInfo, outcome: RawOutcome, output: &OutputCapture) -> ExecutionResult {
    let (return_value, error) = match outcome {
        RawOutcome::Completed(value) => (value.as_ref().map(render), None),
        other => (None, Some(describe(other))),
    };
    let status = error
        .as_ref()
        .map_or(ExecutionStatus::Success, |e| e.kind.status());

    assemble(info, status, output.stdout(), output.stderr(), return_value, error)
}

fn assemble(
    info: RunInfo,
    status: ExecutionStatus,
    stdout: StreamSnapshot,
    stderr: StreamSnapshot,
    return_value: Option<Json>,
    error: Option<ExecutionError>,
) -> ExecutionResult {
    ExecutionResult {
        id: info.id,
        status,
        truncated: stdout.truncated || stderr.truncated,
        stdout_truncated: stdout.truncated,
        stderr_truncated: stderr.truncated,
        stdout_bytes: stdout.total_bytes,
        stderr_bytes: stderr.total_bytes,
        stdout: stdout.text,
        stderr: stderr.text,
        elapsed_ms: u64::try_from(info.elapsed.as_millis()).unwrap_or(u64::MAX),
        started_at: info.started_at,
        return_value,
        error,
    }
}

/// JSON form of a result value, or its rendering when it has none.
fn render(value: &Value) -> Json {
    value.to_json().unwrap_or_else(|_| Json::String(value.repr()))
}

fn describe(outcome: RawOutcome) -> ExecutionError {
    match outcome {
        RawOutcome::Rejected(violations) => {
            let message = match violations.as_slice() {
                [only] => only.message.clone(),
                many => format!("{} policy violations", many.len()),
            };
            let line = violations.first().map(|v| v.line);
            ExecutionError {
                violations,
                ..ExecutionError::new(ErrorKind::PolicyViolation, message).at(line)
            }
        }
        RawOutcome::Syntax(e) => {
            ExecutionError::new(ErrorKind::SyntaxError, e.to_string()).at(Some(e.line))
        }
        RawOutcome::Setup(e) => {
            let kind = match e {
                NamespaceError::UnknownCapability(_) => ErrorKind::UnknownCapability,
                NamespaceError::DeniedVariable { .. } => ErrorKind::PolicyViolation,
                NamespaceError::InvalidVariable(_)
                | NamespaceError::Shadowing(_)
                | NamespaceError::TooDeep(_) => ErrorKind::InvalidVariable,
            };
            ExecutionError::new(kind, e.to_string())
        }
        RawOutcome::Faulted(fault) => {
            let kind = match fault {
                Fault::Runtime { .. } => ErrorKind::RuntimeError,
                Fault::Capability { .. } => ErrorKind::CapabilityError,
                Fault::Limit { .. } => ErrorKind::ResourceLimit,
                Fault::Deadline => ErrorKind::Timeout,
            };
            ExecutionError::new(kind, fault.to_string()).at(fault.line())
        }
        RawOutcome::TimedOut => ExecutionError::new(ErrorKind::Timeout, Fault::Deadline.to_string()),
        RawOutcome::Crashed(detail) => {
            tracing::error!("sandbox worker crashed: {detail}");
            ExecutionError::new(ErrorKind::InternalError, "internal error")
        }
        RawOutcome::Completed(_) => ExecutionError::new(ErrorKind::InternalError, "internal error"),
    }
}
