//! Per-execution global namespace.
//!
//! Each run starts from a fresh namespace: the builtins, one new handle per
//! requested capability, and the caller's injected variables. Nothing is
//! shared with other runs.

use std::collections::HashMap;

use serde_json::Map;
use thiserror::Error;

use super::builtins;
use super::interpreter::{check_nesting, MAX_VALUE_DEPTH};
use super::lexer;
use super::validator::{self, DeniedConstruct};
use super::value::Value;
use crate::capabilities::registry::RegistrySnapshot;
use crate::capabilities::DiscoveryError;

#[derive(Debug, Error, PartialEq)]
pub enum NamespaceError {
    #[error(transparent)]
    UnknownCapability(#[from] DiscoveryError),

    #[error("injected variable `{0}` is not a valid identifier")]
    InvalidVariable(String),

    #[error("injected variable `{name}` is not allowed ({})", .construct.as_str())]
    DeniedVariable {
        name: String,
        construct: DeniedConstruct,
    },

    #[error("injected variable `{0}` would shadow a builtin or capability")]
    Shadowing(String),

    #[error("injected variable `{0}` nests deeper than {max} levels", max = MAX_VALUE_DEPTH)]
    TooDeep(String),
}

pub struct Namespace {
    bindings: HashMap<String, Value>,
}

impl Namespace {
    /// Builds the namespace for one run. `requested` restricts the
    /// capabilities bound into it; `None` binds every registered one.
    pub fn build(
        snapshot: &RegistrySnapshot,
        requested: Option<&[String]>,
        variables: Map<String, serde_json::Value>,
    ) -> Result<Self, NamespaceError> {
        let mut bindings: HashMap<String, Value> = builtins::BUILTINS
            .iter()
            .map(|&name| (name.to_string(), Value::Builtin(name)))
            .collect();

        for handle in snapshot.instantiate(requested)? {
            bindings.insert(handle.name().to_string(), Value::Capability(handle));
        }

        for (name, value) in variables {
            if !lexer::is_identifier(&name) {
                return Err(NamespaceError::InvalidVariable(name));
            }
            if let Some(construct) = validator::check_name(&name) {
                return Err(NamespaceError::DeniedVariable { name, construct });
            }
            if bindings.contains_key(&name) {
                return Err(NamespaceError::Shadowing(name));
            }
            let value = Value::from_json(value);
            if check_nesting(&value, 0).is_err() {
                return Err(NamespaceError::TooDeep(name));
            }
            bindings.insert(name, value);
        }

        Ok(Self { bindings })
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    /// Names of the capabilities bound into this namespace, sorted.
    pub fn capability_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .bindings
            .iter()
            .filter(|(_, v)| matches!(v, Value::Capability(_)))
            .map(|(k, _)| k.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn into_globals(self) -> HashMap<String, Value> {
        self.bindings
    }
}
