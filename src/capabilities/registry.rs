//! Capability catalog.
//!
//! The registry holds an immutable snapshot of every registered provider.
//! Discovery is a pure read over that snapshot. Reloading is done by
//! building a whole new snapshot and swapping it in with
//! [`CapabilityRegistry::reconfigure`]; executions that already hold the
//! previous snapshot keep using it until they finish.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use super::{CapabilityDescriptor, CapabilityHandle, CapabilityProvider, Tier};
use crate::sandbox::builtins;
use crate::sandbox::lexer;
use crate::sandbox::validator::{self, DeniedConstruct};

/// Errors raised while registering providers.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("capability `{0}` is already registered")]
    Duplicate(String),

    #[error("capability name `{0}` is not a valid identifier")]
    InvalidName(String),

    #[error("capability name `{0}` is reserved")]
    Reserved(String),

    /// Snippets naming it would be refused before they run.
    #[error("capability name `{name}` is denied by the sandbox policy ({})", .construct.as_str())]
    Denied {
        name: String,
        construct: DeniedConstruct,
    },
}

/// Errors raised by discovery lookups.
#[derive(Debug, Error, PartialEq)]
pub enum DiscoveryError {
    #[error("unknown capability `{0}`")]
    UnknownService(String),
}

/// A catalog rendered at one tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Catalog {
    pub tier: Tier,
    pub services: Vec<CapabilityDescriptor>,
}

// ── Builder ──────────────────────────────────────────────

/// Collects providers before they are frozen into a registry snapshot.
#[derive(Default)]
pub struct RegistryBuilder {
    providers: BTreeMap<String, Arc<dyn CapabilityProvider>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a provider under its descriptor name.
    pub fn register(&mut self, provider: Box<dyn CapabilityProvider>) -> Result<(), RegistryError> {
        let name = provider.descriptor().name.clone();

        if !lexer::is_identifier(&name) || name.starts_with("__") {
            return Err(RegistryError::InvalidName(name));
        }
        if Tier::parse(&name).is_some() || builtins::is_builtin(&name) {
            return Err(RegistryError::Reserved(name));
        }
        if let Some(construct) = validator::check_name(&name) {
            return Err(RegistryError::Denied { name, construct });
        }
        if self.providers.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        self.providers.insert(name, Arc::from(provider));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn build(self) -> CapabilityRegistry {
        CapabilityRegistry {
            current: RwLock::new(Arc::new(self.into_snapshot())),
        }
    }

    fn into_snapshot(self) -> RegistrySnapshot {
        RegistrySnapshot {
            providers: self.providers,
        }
    }
}

// ── Snapshot ─────────────────────────────────────────────

/// Frozen view of the catalog. Cheap to share across executions.
pub struct RegistrySnapshot {
    providers: BTreeMap<String, Arc<dyn CapabilityProvider>>,
}

impl RegistrySnapshot {
    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn catalog(&self, tier: Tier) -> Catalog {
        Catalog {
            tier,
            services: self
                .providers
                .values()
                .map(|p| p.descriptor().at_tier(tier))
                .collect(),
        }
    }

    pub fn describe(&self, service: &str) -> Result<Catalog, DiscoveryError> {
        let provider = self.provider(service)?;
        Ok(Catalog {
            tier: Tier::Full,
            services: vec![provider.descriptor().clone()],
        })
    }

    pub fn quick_start(&self, service: &str) -> Result<String, DiscoveryError> {
        let descriptor = self.provider(service)?.descriptor();
        Ok(descriptor.example.clone().unwrap_or_else(|| {
            // Every service gets a runnable snippet even without a curated one.
            let method = descriptor.methods.first().map_or("help", |m| m.name.as_str());
            format!("return {}.{method}()", descriptor.name)
        }))
    }

    /// Creates fresh handles for the requested services, or for all of them
    /// when `requested` is `None`.
    pub fn instantiate(
        &self,
        requested: Option<&[String]>,
    ) -> Result<Vec<CapabilityHandle>, DiscoveryError> {
        match requested {
            None => Ok(self
                .providers
                .values()
                .map(|p| CapabilityHandle::new(Arc::clone(p)))
                .collect()),
            Some(names) => {
                let mut handles: Vec<CapabilityHandle> = Vec::with_capacity(names.len());
                for name in names {
                    if handles.iter().any(|h| h.name() == name) {
                        continue;
                    }
                    let provider = self.provider(name)?;
                    handles.push(CapabilityHandle::new(Arc::clone(provider)));
                }
                Ok(handles)
            }
        }
    }

    fn provider(&self, service: &str) -> Result<&Arc<dyn CapabilityProvider>, DiscoveryError> {
        self.providers
            .get(service)
            .ok_or_else(|| DiscoveryError::UnknownService(service.to_string()))
    }
}

// ── Registry ─────────────────────────────────────────────

/// Process-wide capability catalog.
pub struct CapabilityRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl CapabilityRegistry {
    /// A registry with no capabilities.
    pub fn empty() -> Self {
        RegistryBuilder::new().build()
    }

    /// Returns the snapshot currently in effect.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    /// Resolves a discovery query: a tier keyword (`basic`, `full`) lists
    /// every service at that tier, anything else is a service name and
    /// returns its full descriptor.
    pub fn discover(&self, query: &str) -> Result<Catalog, DiscoveryError> {
        match Tier::parse(query) {
            Some(tier) => Ok(self.discover_tier(tier)),
            None => self.describe(query),
        }
    }

    pub fn discover_tier(&self, tier: Tier) -> Catalog {
        self.snapshot().catalog(tier)
    }

    pub fn describe(&self, service: &str) -> Result<Catalog, DiscoveryError> {
        self.snapshot().describe(service)
    }

    pub fn quick_start(&self, service: &str) -> Result<String, DiscoveryError> {
        self.snapshot().quick_start(service)
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().names()
    }

    pub fn len(&self) -> usize {
        self.current.read().providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically replaces the catalog with the providers in `builder`.
    pub fn reconfigure(&self, builder: RegistryBuilder) {
        let snapshot = Arc::new(builder.into_snapshot());
        info!("Capability catalog reconfigured: {} service(s)", snapshot.providers.len());
        *self.current.write() = snapshot;
    }
}
