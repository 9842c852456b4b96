//! Builtin capability: web search via multiple providers.
//!
//! Gives snippets access to current information from the web through a
//! single `search(query, limit?)` method, whatever backend is configured.
//!
//! Supported providers:
//! - **Tavily**: dedicated search API with structured results
//! - **Perplexity**: Sonar models with web-grounded chat completions

mod perplexity;
mod tavily;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::capabilities::{
    Capability, CapabilityDescriptor, CapabilityError, CapabilityProvider, MethodSignature,
};
use crate::config::WebSearchConfig;

use perplexity::PerplexityBackend;
use tavily::TavilyBackend;

// ── Normalized types (provider-agnostic) ─────────────────

/// A single search result, normalized across all providers.
#[derive(Debug, Serialize)]
pub(super) struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Aggregated search response from any provider.
#[derive(Debug, Serialize)]
pub(super) struct SearchResponse {
    /// A pre-built summary/answer (if the provider returns one).
    pub summary: Option<String>,
    /// Individual search results.
    pub results: Vec<SearchResult>,
}

/// Most results a single search may ask for.
pub(super) const MAX_LIMIT: usize = 20;

impl SearchResponse {
    fn truncate(mut self, limit: usize) -> Self {
        self.results.truncate(limit);
        self
    }
}

/// One search as requested by a snippet.
#[derive(Debug, Clone, Copy)]
pub(super) struct SearchQuery<'a> {
    pub text: &'a str,
    /// Already clamped to `1..=MAX_LIMIT`.
    pub limit: usize,
}

// ── SearchBackend trait ──────────────────────────────────

/// Abstraction over different web search backends.
///
/// Each backend normalizes its API response into a common
/// `SearchResponse` structure.
#[async_trait]
pub(super) trait SearchBackend: Send + Sync {
    async fn search(&self, query: SearchQuery<'_>) -> Result<SearchResponse, CapabilityError>;

    /// The provider name (e.g. `"tavily"`, `"perplexity"`).
    fn provider_name(&self) -> &str;
}

/// Sends a prepared JSON request and decodes the reply, mapping HTTP
/// failures to typed capability errors.
pub(super) async fn send_json<T: DeserializeOwned>(
    service: &str,
    request: reqwest::RequestBuilder,
) -> Result<T, CapabilityError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(api_error(service, status, body));
    }
    response
        .json()
        .await
        .map_err(|e| CapabilityError::Other(format!("{service} returned an unreadable reply: {e}")))
}

/// Maps a non-success HTTP reply to a typed capability error.
pub(super) fn api_error(service: &str, status: StatusCode, body: String) -> CapabilityError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        CapabilityError::Auth(format!("{service} rejected the API key ({status})"))
    } else {
        CapabilityError::Api {
            service: service.to_string(),
            status: status.as_u16(),
            body,
        }
    }
}

// ── Provider ─────────────────────────────────────────────

/// Catalog entry for the `web_search` capability.
pub struct WebSearchProvider {
    config: WebSearchConfig,
    descriptor: CapabilityDescriptor,
}

impl WebSearchProvider {
    /// Creates the provider from configuration.
    ///
    /// The `provider` field in `config` determines which backend is used:
    /// - `"tavily"`: Tavily Search API
    /// - `"perplexity"`: Perplexity Sonar API
    pub fn new(config: &WebSearchConfig) -> anyhow::Result<Self> {
        match config.provider.as_str() {
            "tavily" | "perplexity" => {}
            other => anyhow::bail!(
                "Unsupported web search provider: '{other}'. \
                 Supported: 'tavily', 'perplexity'."
            ),
        }

        Ok(Self {
            config: config.clone(),
            descriptor: Self::describe(),
        })
    }

    fn describe() -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "web_search",
            "Search the web for current information.",
        )
        .method(
            MethodSignature::new(
                "search",
                "Runs a web search and returns at most `limit` results (default from \
                 config, max 20) as {summary, results: [{title, url, snippet}]}; \
                 summary may be null when the provider has no direct answer.",
            )
            .param("query", "string")
            .optional("limit", "int"),
        )
        .example(
            "let found = web_search.search(\"rust 2024 edition release date\", 3)\n\
             for r in found.results {\n    print(r.title, r.url)\n}\n\
             return found.summary",
        )
    }

    fn backend(&self) -> Box<dyn SearchBackend> {
        match self.config.provider.as_str() {
            "perplexity" => Box::new(PerplexityBackend::new(
                &self.config.api_key,
                self.config.model.as_deref().unwrap_or("sonar"),
            )),
            _ => Box::new(TavilyBackend::new(&self.config.api_key)),
        }
    }
}

impl CapabilityProvider for WebSearchProvider {
    fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    fn instantiate(&self) -> Arc<dyn Capability> {
        Arc::new(WebSearch {
            backend: self.backend(),
            default_limit: usize::from(self.config.max_results),
        })
    }
}

// ── Capability ───────────────────────────────────────────

/// Live `web_search` handle for one execution.
pub struct WebSearch {
    backend: Box<dyn SearchBackend>,
    default_limit: usize,
}

#[async_trait]
impl Capability for WebSearch {
    async fn invoke(&self, method: &str, params: Value) -> Result<Value, CapabilityError> {
        if method != "search" {
            return Err(CapabilityError::UnknownMethod(method.to_string()));
        }

        let query = params["query"]
            .as_str()
            .ok_or_else(|| CapabilityError::InvalidParams("`query` must be a string".into()))?;

        let limit = match &params["limit"] {
            Value::Null => self.default_limit,
            value => value
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .filter(|&n| n > 0)
                .ok_or_else(|| {
                    CapabilityError::InvalidParams("`limit` must be a positive integer".into())
                })?,
        }
        .min(MAX_LIMIT);

        debug!(
            "Web search ({}, limit {limit}): {query}",
            self.backend.provider_name()
        );

        let response = self
            .backend
            .search(SearchQuery { text: query, limit })
            .await
            .map_err(|e| {
                warn!("Web search failed: {e}");
                e
            })?;

        serde_json::to_value(response.truncate(limit)).map_err(|e| CapabilityError::Other(e.to_string()))
    }
}
