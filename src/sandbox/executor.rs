//! Runs a validated program on its own worker thread under a deadline.
//!
//! The worker executes the interpreter; the async side only waits for it.
//! When the deadline passes the cancel flag is raised, which the
//! interpreter observes on its next step. A worker that still has not
//! stopped after the teardown grace is detached and its result discarded.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Map;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::ast::Program;
use super::interpreter::{Fault, Interpreter, RunContext};
use super::output::OutputCapture;
use super::result::RawOutcome;
use super::value::Value;

/// Deep recursion in the tree-walker needs more than the default 2 MiB.
const WORKER_STACK_BYTES: usize = 64 * 1024 * 1024;

/// One snippet submitted for execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub code: String,
    /// Clamped to the configured maximum; the default applies when unset.
    pub timeout: Option<Duration>,
    /// Per-stream output cap, clamped to the configured maximum.
    pub output_cap: Option<usize>,
    /// Pre-bound globals.
    pub variables: Map<String, serde_json::Value>,
    /// Services to bind; every registered one when unset.
    pub capabilities: Option<Vec<String>>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_output_cap(mut self, cap: usize) -> Self {
        self.output_cap = Some(cap);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_capabilities<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = Some(names.into_iter().map(Into::into).collect());
        self
    }
}

/// Bounds applied to one worker.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerLimits {
    pub deadline: Duration,
    pub grace: Duration,
    pub max_call_depth: usize,
}

/// Runs `program` on a fresh worker thread and waits for it within
/// `limits`. Must be called from within a tokio runtime: capability calls
/// made by the snippet are driven on it.
pub(crate) async fn run_isolated(
    id: &str,
    program: Program,
    globals: HashMap<String, Value>,
    output: Arc<OutputCapture>,
    limits: WorkerLimits,
) -> RawOutcome {
    let cancel = Arc::new(AtomicBool::new(false));
    let ctx = RunContext {
        output,
        cancel: Arc::clone(&cancel),
        deadline: Instant::now() + limits.deadline,
        runtime: Handle::current(),
        max_call_depth: limits.max_call_depth,
    };

    let (tx, mut rx) = oneshot::channel();
    let spawned = std::thread::Builder::new()
        .name(format!("sandbox-{id}"))
        .stack_size(WORKER_STACK_BYTES)
        .spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                Interpreter::new(&ctx, globals).run(&program)
            }));
            // The receiver is gone once the executor has given up on us.
            let _ = tx.send(outcome);
        });
    if let Err(e) = spawned {
        return RawOutcome::Crashed(format!("could not spawn worker: {e}"));
    }
    debug!("worker started (deadline {:?})", limits.deadline);

    match tokio::time::timeout(limits.deadline, &mut rx).await {
        Ok(Ok(Ok(Ok(value)))) => RawOutcome::Completed(value),
        Ok(Ok(Ok(Err(Fault::Deadline)))) => RawOutcome::TimedOut,
        Ok(Ok(Ok(Err(fault)))) => RawOutcome::Faulted(fault),
        Ok(Ok(Err(panic))) => RawOutcome::Crashed(panic_message(panic.as_ref())),
        Ok(Err(_)) => RawOutcome::Crashed("worker exited without reporting".into()),
        Err(_) => {
            cancel.store(true, Ordering::SeqCst);
            if tokio::time::timeout(limits.grace, &mut rx).await.is_err() {
                warn!(
                    "worker did not stop within {:?} of the deadline, detaching it",
                    limits.grace
                );
            }
            RawOutcome::TimedOut
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
