//! Sandboxed snippet execution.
//!
//! A snippet goes through four stages, each in its own module:
//!
//! 1. `validator` refuses denied constructs before anything runs
//! 2. `namespace` builds the names the snippet may see
//! 3. `executor` runs the interpreter on a worker thread under a deadline
//! 4. `result` packages whatever happened into an `ExecutionResult`
//!
//! The snippet language itself lives in `lexer`, `parser`, `ast`,
//! `interpreter`, `value` and `builtins`.

pub mod ast;
pub mod builtins;
pub mod executor;
pub mod interpreter;
pub mod lexer;
pub mod namespace;
pub mod output;
pub mod parser;
pub mod result;
pub mod validator;
pub mod value;

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::capabilities::{Catalog, CapabilityRegistry, DiscoveryError, Tier};
use crate::config::SandboxConfig;

pub use executor::ExecutionRequest;
pub use result::{ErrorKind, ExecutionError, ExecutionResult, ExecutionStatus};
pub use validator::{DeniedConstruct, Violation};

use executor::WorkerLimits;
use namespace::Namespace;
use output::OutputCapture;
use result::{RawOutcome, RunInfo};
use validator::Rejection;

/// Entry point for discovery and execution.
pub struct Sandbox {
    registry: Arc<CapabilityRegistry>,
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(registry: Arc<CapabilityRegistry>, config: SandboxConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// `query` is a tier (`basic`, `full`) or a service name.
    pub fn discover(&self, query: &str) -> Result<Catalog, DiscoveryError> {
        self.registry.discover(query)
    }

    pub fn discover_tier(&self, tier: Tier) -> Catalog {
        self.registry.discover_tier(tier)
    }

    pub fn quick_start(&self, service: &str) -> Result<String, DiscoveryError> {
        self.registry.quick_start(service)
    }

    /// Validates, runs and packages one snippet. Never fails: every outcome,
    /// including refusal and timeout, is reported in the result.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let id = Uuid::new_v4().to_string();
        let span = info_span!("execute", id = %id);
        self.execute_inner(id, request).instrument(span).await
    }

    async fn execute_inner(&self, id: String, request: ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let started_at = chrono::Utc::now().to_rfc3339();
        let limits = WorkerLimits {
            deadline: self.config.deadline(request.timeout),
            grace: self.config.teardown_grace(),
            max_call_depth: self.config.max_call_depth,
        };
        let output = Arc::new(OutputCapture::new(self.config.output_cap(request.output_cap)));
        info!(
            "Executing snippet ({} bytes, deadline {:?})",
            request.code.len(),
            limits.deadline
        );

        // Pin the registry for the whole run; a concurrent reconfigure
        // only affects later executions.
        let snapshot = self.registry.snapshot();

        // Lexing and parsing a large snippet is CPU work; keep it off the
        // async workers.
        let code = request.code;
        let checked = tokio::task::spawn_blocking(move || validator::check(&code)).await;

        let outcome = match checked {
            Err(join_error) => {
                warn!("Validation did not complete: {join_error}");
                RawOutcome::Crashed(join_error.to_string())
            }
            Ok(Err(Rejection::Violations(violations))) => {
                for v in &violations {
                    warn!("Rejected at {}:{}: {}", v.line, v.column, v.message);
                }
                RawOutcome::Rejected(violations)
            }
            Ok(Err(Rejection::Syntax(e))) => RawOutcome::Syntax(e),
            Ok(Ok(program)) => match Namespace::build(
                &snapshot,
                request.capabilities.as_deref(),
                request.variables,
            ) {
                Err(e) => RawOutcome::Setup(e),
                Ok(namespace) => {
                    debug!("Capabilities bound: {:?}", namespace.capability_names());
                    executor::run_isolated(
                        &id,
                        program,
                        namespace.into_globals(),
                        Arc::clone(&output),
                        limits,
                    )
                    .await
                }
            },
        };

        let info = RunInfo {
            id,
            started_at,
            elapsed: started.elapsed(),
        };
        let result = result::package(info, outcome, &output);
        info!(
            "Execution finished: {} in {}ms",
            result.status.as_str(),
            result.elapsed_ms
        );
        result
    }
}
