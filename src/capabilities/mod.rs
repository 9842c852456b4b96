//! Service capabilities that sandboxed snippets can call.
//!
//! A capability is one external service (web search, URL fetching, …)
//! exposed to snippets as a named handle with a fixed method surface.
//! Providers live in the [`CapabilityRegistry`]; each execution asks the
//! registry for fresh handles, so no connection state leaks between runs.

pub mod builtin;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

pub use registry::{Catalog, CapabilityRegistry, DiscoveryError, RegistryBuilder, RegistryError};

// ── Tiers ────────────────────────────────────────────────

/// Discovery verbosity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Service name, summary and method names.
    Basic,
    /// Complete method surface with parameters, descriptions and example.
    Full,
}

impl Tier {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "basic" => Some(Tier::Basic),
            "full" => Some(Tier::Full),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Basic => f.write_str("basic"),
            Tier::Full => f.write_str("full"),
        }
    }
}

// ── Descriptors ──────────────────────────────────────────

/// One parameter of a capability method.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    pub name: String,
    /// Informal type hint shown to the caller (`"string"`, `"int"`, …).
    #[serde(rename = "type")]
    pub type_hint: String,
    pub required: bool,
}

/// Signature of a capability method.
///
/// `params` and `description` are always present on a full descriptor and
/// stripped when rendering the basic tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodSignature {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<ParamSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl MethodSignature {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Some(Vec::new()),
            description: Some(description.into()),
        }
    }

    /// Appends a required parameter.
    pub fn param(self, name: &str, type_hint: &str) -> Self {
        self.push_param(name, type_hint, true)
    }

    /// Appends an optional parameter.
    pub fn optional(self, name: &str, type_hint: &str) -> Self {
        self.push_param(name, type_hint, false)
    }

    fn push_param(mut self, name: &str, type_hint: &str, required: bool) -> Self {
        self.params.get_or_insert_with(Vec::new).push(ParamSpec {
            name: name.to_string(),
            type_hint: type_hint.to_string(),
            required,
        });
        self
    }

    pub fn params(&self) -> &[ParamSpec] {
        self.params.as_deref().unwrap_or(&[])
    }
}

/// Documentation of one service capability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub summary: String,
    pub methods: Vec<MethodSignature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

impl CapabilityDescriptor {
    pub fn new(name: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            summary: summary.into(),
            methods: Vec::new(),
            example: None,
        }
    }

    pub fn method(mut self, method: MethodSignature) -> Self {
        self.methods.push(method);
        self
    }

    pub fn example(mut self, snippet: impl Into<String>) -> Self {
        self.example = Some(snippet.into());
        self
    }

    pub fn find_method(&self, name: &str) -> Option<&MethodSignature> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Renders the descriptor at the given tier.
    ///
    /// The basic rendering only ever removes fields from the full one.
    pub fn at_tier(&self, tier: Tier) -> CapabilityDescriptor {
        match tier {
            Tier::Full => self.clone(),
            Tier::Basic => CapabilityDescriptor {
                name: self.name.clone(),
                summary: self.summary.clone(),
                methods: self
                    .methods
                    .iter()
                    .map(|m| MethodSignature {
                        name: m.name.clone(),
                        params: None,
                        description: None,
                    })
                    .collect(),
                example: None,
            },
        }
    }
}

// ── Capability traits ────────────────────────────────────

/// Errors raised by a capability while serving a method call.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("unknown method `{0}`")]
    UnknownMethod(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("{service} API returned {status}: {body}")]
    Api {
        service: String,
        status: u16,
        body: String,
    },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for CapabilityError {
    fn from(e: reqwest::Error) -> Self {
        CapabilityError::Network(e.to_string())
    }
}

/// A live capability bound into one execution.
///
/// Methods either return data representable as JSON or a typed
/// [`CapabilityError`]. Credentials and connections stay behind this
/// trait and are never visible to the snippet.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn invoke(&self, method: &str, params: Value) -> Result<Value, CapabilityError>;
}

/// Factory registered in the catalog for one service.
pub trait CapabilityProvider: Send + Sync {
    /// Full-tier documentation of the service.
    fn descriptor(&self) -> &CapabilityDescriptor;

    /// Creates a fresh handle for one execution. Must not perform I/O.
    fn instantiate(&self) -> Arc<dyn Capability>;
}

// ── Handles ──────────────────────────────────────────────

/// A capability handle as seen from inside a sandbox run.
///
/// Pairs the live capability with its descriptor so that calls can be
/// checked against the declared method surface before anything is sent.
#[derive(Clone)]
pub struct CapabilityHandle {
    provider: Arc<dyn CapabilityProvider>,
    capability: Arc<dyn Capability>,
}

impl fmt::Debug for CapabilityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityHandle")
            .field("name", &self.name())
            .finish()
    }
}

impl CapabilityHandle {
    pub fn new(provider: Arc<dyn CapabilityProvider>) -> Self {
        let capability = provider.instantiate();
        Self {
            provider,
            capability,
        }
    }

    pub fn name(&self) -> &str {
        &self.provider.descriptor().name
    }

    pub fn descriptor(&self) -> &CapabilityDescriptor {
        self.provider.descriptor()
    }

    /// Builds the JSON parameter object for `method` from call arguments.
    ///
    /// A single object argument is passed through as the parameter object;
    /// otherwise positional arguments are matched with the declared
    /// parameter names. Errors here are mistakes in the calling snippet.
    pub fn bind_params(&self, method: &str, args: Vec<Value>) -> Result<Value, String> {
        let signature = self
            .descriptor()
            .find_method(method)
            .ok_or_else(|| format!("capability `{}` has no method `{method}`", self.name()))?;
        let params = signature.params();

        let object = match <[Value; 1]>::try_from(args) {
            Ok([Value::Object(map)]) => map,
            Ok([single]) => Self::zip_positional(signature, vec![single])?,
            Err(args) => Self::zip_positional(signature, args)?,
        };

        for spec in params.iter().filter(|p| p.required) {
            if object.get(&spec.name).map_or(true, Value::is_null) {
                return Err(format!(
                    "{}.{method}() missing required parameter `{}`",
                    self.name(),
                    spec.name
                ));
            }
        }

        Ok(Value::Object(object))
    }

    fn zip_positional(
        signature: &MethodSignature,
        args: Vec<Value>,
    ) -> Result<Map<String, Value>, String> {
        let params = signature.params();
        if args.len() > params.len() {
            return Err(format!(
                "{}() takes at most {} argument(s), got {}",
                signature.name,
                params.len(),
                args.len()
            ));
        }
        Ok(params
            .iter()
            .zip(args)
            .map(|(spec, arg)| (spec.name.clone(), arg))
            .collect())
    }

    /// Invokes a method on the underlying capability.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CapabilityError> {
        debug!("Capability call: {}.{method}", self.name());
        self.capability.invoke(method, params).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Instrumented capability used across the crate's tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Mock service whose calls are counted and whose behaviour is scripted.
    pub struct MockProvider {
        descriptor: CapabilityDescriptor,
        pub calls: Arc<AtomicUsize>,
        pub instances: Arc<AtomicUsize>,
        fail_with: Option<String>,
        delay: Option<std::time::Duration>,
    }

    impl MockProvider {
        pub fn new(name: &str) -> Self {
            Self {
                descriptor: CapabilityDescriptor::new(name, "Mock service for tests")
                    .method(
                        MethodSignature::new("echo", "Returns its parameters")
                            .param("value", "any"),
                    )
                    .method(
                        MethodSignature::new("add", "Adds two integers")
                            .param("a", "int")
                            .param("b", "int"),
                    )
                    .method(
                        MethodSignature::new("list", "Lists items")
                            .optional("limit", "int"),
                    )
                    .example(format!("return {name}.echo(\"hi\")")),
                calls: Arc::new(AtomicUsize::new(0)),
                instances: Arc::new(AtomicUsize::new(0)),
                fail_with: None,
                delay: None,
            }
        }

        /// Every call fails with a network error carrying `message`.
        pub fn failing(name: &str, message: &str) -> Self {
            Self {
                fail_with: Some(message.to_string()),
                ..Self::new(name)
            }
        }

        /// Every call sleeps for `delay` before answering.
        pub fn slow(name: &str, delay: std::time::Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::new(name)
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    struct MockCapability {
        calls: Arc<AtomicUsize>,
        fail_with: Option<String>,
        delay: Option<std::time::Duration>,
    }

    #[async_trait]
    impl Capability for MockCapability {
        async fn invoke(&self, method: &str, params: Value) -> Result<Value, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(ref message) = self.fail_with {
                return Err(CapabilityError::Network(message.clone()));
            }
            match method {
                "echo" => Ok(params["value"].clone()),
                "add" => {
                    let a = params["a"].as_i64().unwrap_or(0);
                    let b = params["b"].as_i64().unwrap_or(0);
                    Ok(Value::from(a + b))
                }
                "list" => {
                    let limit = params["limit"].as_u64().unwrap_or(3);
                    Ok(Value::Array((0..limit).map(Value::from).collect()))
                }
                other => Err(CapabilityError::UnknownMethod(other.to_string())),
            }
        }
    }

    impl CapabilityProvider for MockProvider {
        fn descriptor(&self) -> &CapabilityDescriptor {
            &self.descriptor
        }

        fn instantiate(&self) -> Arc<dyn Capability> {
            self.instances.fetch_add(1, Ordering::SeqCst);
            Arc::new(MockCapability {
                calls: Arc::clone(&self.calls),
                fail_with: self.fail_with.clone(),
                delay: self.delay,
            })
        }
    }
}
